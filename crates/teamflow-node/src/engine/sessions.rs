use super::{SessionEngine, load_snapshot, require, require_participant, require_text};
use crate::error::{EngineError, Result};
use std::collections::{HashMap, HashSet};
use teamflow::protocol::{
    ActiveLane, ChangeKind, MessageView, SessionContext, StepView, ViewerInfo,
};
use teamflow_core::model::{
    Capabilities, Capability, ChatMessage, CompositeTemplate, Member, MessageRead,
    NewTemplateStep, ProofState, Session, SessionStep, TemplateStep,
};
use teamflow_core::{AccessResolver, SessionSnapshot, now_ms};
use teamflow_store::{chat, new_id, sessions, steps, templates};

impl SessionEngine {
    /// Create a template owned by `actor`.
    pub async fn create_template(
        &self,
        actor: &str,
        name: &str,
        new_steps: Vec<NewTemplateStep>,
    ) -> Result<CompositeTemplate> {
        require_text("template name", name)?;
        if new_steps.is_empty() {
            return Err(EngineError::Validation(
                "a template needs at least one step".to_string(),
            ));
        }
        for step in &new_steps {
            require_text("step name", &step.content.name)?;
        }

        let template_id = new_id();
        let template = CompositeTemplate {
            id: template_id.clone(),
            owner_id: actor.to_string(),
            name: name.trim().to_string(),
            created_at_ms: now_ms(),
            steps: new_steps
                .into_iter()
                .enumerate()
                .map(|(i, step)| TemplateStep {
                    id: new_id(),
                    template_id: template_id.clone(),
                    position: i as u32,
                    content: step.content,
                    proof: step.proof,
                })
                .collect(),
        };

        let stored = template.clone();
        self.store
            .transaction(move |tx| -> Result<()> {
                templates::insert_template(tx, &stored)?;
                Ok(())
            })
            .await?;
        tracing::info!(template_id = %template.id, owner = actor, steps = template.steps.len(), "template created");
        Ok(template)
    }

    /// Launch a session from a template the actor owns.
    pub async fn create_session(&self, actor: &str, template_id: &str, name: &str) -> Result<Session> {
        require_text("session name", name)?;
        let actor = actor.to_string();
        let template_id = template_id.to_string();
        let name = name.trim().to_string();

        let session = self
            .store
            .transaction(move |tx| -> Result<Session> {
                let template = templates::get_template(tx, &template_id)?
                    .ok_or_else(|| EngineError::not_found("template", &template_id))?;
                if template.owner_id != actor {
                    return Err(EngineError::Forbidden(format!(
                        "{actor} does not own template {template_id}"
                    )));
                }

                let now = now_ms();
                let session = Session {
                    id: new_id(),
                    template_id: template.id.clone(),
                    owner_id: actor.clone(),
                    name,
                    created_at_ms: now,
                };
                sessions::insert_session(tx, &session)?;
                sessions::insert_member(
                    tx,
                    &Member {
                        session_id: session.id.clone(),
                        user_id: actor.clone(),
                        capabilities: Capabilities::all(),
                        lane_color: None,
                        added_at_ms: now,
                    },
                )?;
                for step in &template.steps {
                    steps::insert_session_step(
                        tx,
                        &SessionStep {
                            id: new_id(),
                            session_id: session.id.clone(),
                            step_id: step.id.clone(),
                            position: step.position,
                            is_completed: false,
                            completed_by: None,
                            completed_at_ms: None,
                            proof: ProofState::seeded(&step.proof),
                            overrides: Default::default(),
                        },
                    )?;
                }
                Ok(session)
            })
            .await?;

        tracing::info!(session_id = %session.id, template_id = %session.template_id, owner = %session.owner_id, "session created");
        Ok(session)
    }

    /// Delete a session and everything under it. Owner or canManageSharing.
    pub async fn delete_session(&self, actor: &str, session_id: &str) -> Result<()> {
        let actor_owned = actor.to_string();
        let sid = session_id.to_string();
        let blob_refs = self
            .store
            .transaction(move |tx| -> Result<Vec<String>> {
                let snapshot = load_snapshot(tx, &sid)?;
                require(&snapshot, &actor_owned, Capability::ManageSharing)?;
                let refs = steps::proof_file_refs(tx, &sid)?;
                sessions::delete_session(tx, &sid)?;
                Ok(refs)
            })
            .await?;

        tracing::info!(session_id, user_id = actor, "session deleted");
        self.notify(session_id, ChangeKind::SessionDeleted);
        self.bus.close_session(session_id);
        self.discard_blobs(blob_refs).await;
        Ok(())
    }

    /// Sessions `actor` owns or is a member of.
    pub async fn list_sessions(&self, actor: &str) -> Result<Vec<Session>> {
        let actor = actor.to_string();
        self.store
            .read(move |conn| -> Result<Vec<Session>> {
                Ok(sessions::list_sessions_for_user(conn, &actor)?)
            })
            .await
    }

    /// The resync view a client fetches after every change event.
    pub async fn session_context(&self, actor: &str, session_id: &str) -> Result<SessionContext> {
        let actor = actor.to_string();
        let sid = session_id.to_string();
        self.store
            .read(move |conn| -> Result<SessionContext> {
                let snapshot = load_snapshot(conn, &sid)?;
                require_participant(&snapshot, &actor)?;
                let template = templates::get_template(conn, &snapshot.session.template_id)?
                    .ok_or_else(|| {
                        EngineError::not_found("template", &snapshot.session.template_id)
                    })?;
                let messages = chat::list_messages(conn, &sid)?;
                let reads = chat::list_reads(conn, &sid)?;
                Ok(build_context(&actor, &snapshot, &template, messages, reads))
            })
            .await
    }
}

/// Assemble the per-viewer view of a session.
///
/// Step content and proof are withheld from steps the viewer cannot see,
/// unless the viewer edits steps or manages assignments.
pub fn build_context(
    viewer: &str,
    snapshot: &SessionSnapshot,
    template: &CompositeTemplate,
    messages: Vec<ChatMessage>,
    reads: Vec<MessageRead>,
) -> SessionContext {
    let resolver = AccessResolver::new(snapshot);
    let administers = snapshot.can(viewer, Capability::EditSteps)
        || snapshot.can(viewer, Capability::ManageAssignments);
    let template_steps: HashMap<&str, &TemplateStep> =
        template.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut step_views = Vec::with_capacity(snapshot.step_order.len());
    for step_id in &snapshot.step_order {
        let Some(step) = snapshot.step_for_template_step(step_id) else {
            continue;
        };
        let visible = resolver.is_visible(viewer, step_id);
        let mut seen = HashSet::new();
        let assignees = snapshot
            .assignments
            .iter()
            .filter(|a| &a.step_id == step_id)
            .filter(|a| seen.insert(a.assignee_user_id.as_str()))
            .map(|a| a.assignee_user_id.clone())
            .collect();
        let revealed = visible || administers;
        let content = template_steps
            .get(step_id.as_str())
            .filter(|_| revealed)
            .map(|ts| {
                let mut content = ts.content.clone();
                step.overrides.apply_to(&mut content);
                content
            });

        step_views.push(StepView {
            session_step_id: step.id.clone(),
            step_id: step_id.clone(),
            position: step.position,
            visible,
            can_complete: resolver.can_complete(viewer, step_id),
            is_completed: step.is_completed,
            completed_by: step.completed_by.clone(),
            completed_at_ms: step.completed_at_ms,
            assignees,
            content,
            proof: revealed.then(|| step.proof.clone()),
        });
    }

    let mut read_by: HashMap<String, Vec<String>> = HashMap::new();
    for read in reads {
        read_by.entry(read.message_id).or_default().push(read.user_id);
    }
    let messages = messages
        .into_iter()
        .map(|message| MessageView {
            read_by: read_by.remove(&message.id).unwrap_or_default(),
            message,
        })
        .collect();

    let viewer_info = ViewerInfo {
        user_id: viewer.to_string(),
        is_owner: snapshot.is_owner(viewer),
        capabilities: snapshot.capabilities(viewer).unwrap_or_default(),
        lane_cursor: resolver.lane_cursor(viewer).map(str::to_string),
        active_lanes: resolver
            .active_lanes(viewer)
            .into_iter()
            .map(|(assignee, step_id)| ActiveLane {
                assignee_user_id: assignee.to_string(),
                step_id: step_id.to_string(),
            })
            .collect(),
    };

    SessionContext {
        session: snapshot.session.clone(),
        template_name: template.name.clone(),
        viewer: viewer_info,
        members: snapshot.members.clone(),
        assignments: snapshot.assignments.clone(),
        lane_delegates: snapshot.lane_delegates.clone(),
        steps: step_views,
        messages,
    }
}
