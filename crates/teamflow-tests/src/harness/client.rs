use super::node::{TestNode, token_for};
use anyhow::{Context, Result, anyhow, bail};
use std::collections::VecDeque;
use std::time::Duration;
use teamflow::client::{RequestError, TeamflowClient};
use teamflow::protocol::{Event, Request, Response, SessionContext};
use teamflow_core::model::{
    Assignment, Capability, ChatMessage, CompositeTemplate, NewTemplateStep, Session,
    SessionStep, StepContent,
};

/// Convenience wrapper over `TeamflowClient` for integration tests.
///
/// Events that arrive while waiting for a response are buffered rather
/// than dropped, so tests can assert on them afterwards.
pub struct TestClient {
    inner: TeamflowClient,
    events: VecDeque<Event>,
}

impl TestClient {
    /// Connect to `node` and authenticate as `user`.
    pub async fn connect(node: &TestNode, user: &str) -> Result<Self> {
        let mut client = Self::connect_anonymous(node).await?;
        client
            .request(Request::Authenticate {
                token: token_for(user),
            })
            .await?;
        Ok(client)
    }

    /// Connect without authenticating.
    pub async fn connect_anonymous(node: &TestNode) -> Result<Self> {
        let inner = TeamflowClient::connect(&node.addr_string()).await?;
        Ok(Self {
            inner,
            events: VecDeque::new(),
        })
    }

    /// Send a request and return the raw Ok/Error response.
    pub async fn try_request(&mut self, req: Request) -> Result<Response> {
        self.inner.send(req).await?;
        loop {
            match self.inner.next_response().await? {
                Response::Event { event } => self.events.push_back(event),
                Response::Hello { .. } => continue,
                resp => return Ok(resp),
            }
        }
    }

    /// Send a request and return its data, turning `Error` into a `RequestError`.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        match self.try_request(req).await? {
            Response::Ok { data } => Ok(data),
            Response::Error { code, message } => Err(RequestError { code, message }.into()),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn request_as<T: serde::de::DeserializeOwned>(&mut self, req: Request) -> Result<T> {
        let data = self.request(req).await?.context("response carried no data")?;
        Ok(serde_json::from_value(data)?)
    }

    /// Wait up to `timeout` for the next change event.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<Event> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.inner.next_response())
                .await
                .ok()?
                .ok()?;
            if let Response::Event { event } = frame {
                return Some(event);
            }
        }
    }

    /// Events buffered so far, oldest first.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    // -- Typed helpers --

    pub async fn create_template(&mut self, name: &str, steps: &[&str]) -> Result<CompositeTemplate> {
        let steps = steps
            .iter()
            .map(|name| NewTemplateStep {
                content: StepContent {
                    name: name.to_string(),
                    ..StepContent::default()
                },
                ..NewTemplateStep::default()
            })
            .collect();
        self.request_as(Request::CreateTemplate {
            name: name.to_string(),
            steps,
        })
        .await
    }

    pub async fn create_session(&mut self, template_id: &str, name: &str) -> Result<Session> {
        self.request_as(Request::CreateSession {
            template_id: template_id.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn add_member(
        &mut self,
        session_id: &str,
        user_id: &str,
        capabilities: &[Capability],
    ) -> Result<()> {
        self.request(Request::AddMember {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            capabilities: capabilities.to_vec(),
            lane_color: None,
        })
        .await?;
        Ok(())
    }

    pub async fn assign(
        &mut self,
        session_id: &str,
        step_id: &str,
        assignee: &str,
        allow_delegation: bool,
    ) -> Result<Assignment> {
        self.request_as(Request::AssignStep {
            session_id: session_id.to_string(),
            step_id: step_id.to_string(),
            assignee_user_id: assignee.to_string(),
            allow_delegation,
            allow_delegation_to_everyone: false,
        })
        .await
    }

    pub async fn add_lane_delegate(&mut self, session_id: &str, owner: &str, delegate: &str) -> Result<()> {
        self.request(Request::AddLaneDelegate {
            session_id: session_id.to_string(),
            owner_user_id: owner.to_string(),
            delegate_user_id: delegate.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn subscribe(&mut self, session_id: &str, user_id: &str) -> Result<()> {
        self.request(Request::Subscribe {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn context(&mut self, session_id: &str) -> Result<SessionContext> {
        self.request_as(Request::SessionContext {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn complete(&mut self, session_step_id: &str) -> Result<SessionStep> {
        self.request_as(Request::CompleteStep {
            session_step_id: session_step_id.to_string(),
        })
        .await
    }

    pub async fn say(&mut self, session_id: &str, content: &str) -> Result<ChatMessage> {
        self.request_as(Request::SendMessage {
            session_id: session_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    pub async fn mark_read(&mut self, session_id: &str, message_ids: &[&str]) -> Result<usize> {
        let data = self
            .request(Request::MarkRead {
                session_id: session_id.to_string(),
                message_ids: message_ids.iter().map(|s| s.to_string()).collect(),
            })
            .await?;
        let Some(marked) = data.as_ref().and_then(|d| d.get("marked")).and_then(|m| m.as_u64())
        else {
            bail!("mark_read returned no count");
        };
        Ok(marked as usize)
    }
}
