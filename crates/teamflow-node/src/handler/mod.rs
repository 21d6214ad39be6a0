use crate::bus::{ConnId, RealtimeBus};
use crate::engine::SessionEngine;
use crate::error::EngineError;
use crate::identity::IdentityProvider;
use base64::Engine;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use teamflow::protocol::{AuthInfo, ErrorCode, Event, HealthStatus, Request, Response};
use teamflow_core::model::Capabilities;
use tokio::sync::mpsc;

/// Shared server state accessible by all client connections.
pub struct ServerState {
    pub engine: SessionEngine,
    pub identity: Arc<dyn IdentityProvider>,
    /// Capacity of each connection's outbound event queue.
    pub subscriber_queue: usize,
    next_conn: AtomicU64,
}

impl ServerState {
    pub fn new(
        engine: SessionEngine,
        identity: Arc<dyn IdentityProvider>,
        subscriber_queue: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            identity,
            subscriber_queue: subscriber_queue.max(1),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn bus(&self) -> &Arc<RealtimeBus> {
        self.engine.bus()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-connection state owned by the connection task.
pub struct ClientConn {
    pub id: ConnId,
    /// Set by a successful `Authenticate`.
    pub user_id: Option<String>,
    events: mpsc::Sender<Event>,
}

impl ClientConn {
    pub fn new(id: ConnId, events: mpsc::Sender<Event>) -> Self {
        Self {
            id,
            user_id: None,
            events,
        }
    }
}

/// Handle a single request from a client.
pub async fn handle_request(state: &Arc<ServerState>, conn: &mut ClientConn, req: Request) -> Response {
    match req {
        Request::Authenticate { token } => handle_authenticate(state, conn, &token),
        Request::Health => handle_health(state),
        req => match conn.user_id.clone() {
            Some(actor) => dispatch(state, conn.id, &actor, req).await,
            None => error_response(ErrorCode::Unauthenticated, "authenticate first"),
        },
    }
}

/// Requests that act as the authenticated user.
async fn dispatch(state: &Arc<ServerState>, conn_id: ConnId, actor: &str, req: Request) -> Response {
    let engine = &state.engine;
    match req {
        Request::Authenticate { .. } | Request::Health => {
            error_response(ErrorCode::InvalidRequest, "unexpected request")
        }

        // Realtime
        Request::Subscribe {
            session_id,
            user_id,
        } => respond_empty(
            engine
                .subscribe(conn_id, Some(actor), &session_id, &user_id)
                .await,
        ),
        Request::Unsubscribe { session_id } => {
            engine.unsubscribe(conn_id, &session_id);
            ok_response(None)
        }

        // Templates and sessions
        Request::CreateTemplate { name, steps } => {
            respond(engine.create_template(actor, &name, steps).await)
        }
        Request::CreateSession { template_id, name } => {
            respond(engine.create_session(actor, &template_id, &name).await)
        }
        Request::DeleteSession { session_id } => {
            respond_empty(engine.delete_session(actor, &session_id).await)
        }
        Request::ListSessions => respond(engine.list_sessions(actor).await),
        Request::SessionContext { session_id } => {
            respond(engine.session_context(actor, &session_id).await)
        }

        // Members
        Request::AddMember {
            session_id,
            user_id,
            capabilities,
            lane_color,
        } => respond(
            engine
                .add_member(
                    actor,
                    &session_id,
                    &user_id,
                    Capabilities::from_granted(&capabilities),
                    lane_color,
                )
                .await,
        ),
        Request::UpdateMember {
            session_id,
            user_id,
            patch,
        } => respond(engine.update_member(actor, &session_id, &user_id, patch).await),
        Request::RemoveMember {
            session_id,
            user_id,
        } => respond_empty(engine.remove_member(actor, &session_id, &user_id).await),

        // Assignments and delegation
        Request::AssignStep {
            session_id,
            step_id,
            assignee_user_id,
            allow_delegation,
            allow_delegation_to_everyone,
        } => respond(
            engine
                .assign_step(
                    actor,
                    &session_id,
                    &step_id,
                    &assignee_user_id,
                    allow_delegation,
                    allow_delegation_to_everyone,
                )
                .await,
        ),
        Request::UpdateAssignment {
            assignment_id,
            allow_delegation,
            allow_delegation_to_everyone,
        } => respond(
            engine
                .update_assignment(
                    actor,
                    &assignment_id,
                    allow_delegation,
                    allow_delegation_to_everyone,
                )
                .await,
        ),
        Request::RemoveAssignment { assignment_id } => {
            respond_empty(engine.remove_assignment(actor, &assignment_id).await)
        }
        Request::AddAssignmentDelegate {
            assignment_id,
            delegate_user_id,
        } => respond(
            engine
                .add_assignment_delegate(actor, &assignment_id, &delegate_user_id)
                .await,
        ),
        Request::RemoveAssignmentDelegate {
            assignment_id,
            delegate_user_id,
        } => respond(
            engine
                .remove_assignment_delegate(actor, &assignment_id, &delegate_user_id)
                .await,
        ),
        Request::AddLaneDelegate {
            session_id,
            owner_user_id,
            delegate_user_id,
        } => respond(
            engine
                .add_lane_delegate(actor, &session_id, &owner_user_id, &delegate_user_id)
                .await,
        ),
        Request::RemoveLaneDelegate {
            session_id,
            owner_user_id,
            delegate_user_id,
        } => respond_empty(
            engine
                .remove_lane_delegate(actor, &session_id, &owner_user_id, &delegate_user_id)
                .await,
        ),

        // Steps
        Request::CompleteStep { session_step_id } => {
            respond(engine.complete_step(actor, &session_step_id).await)
        }
        Request::EditStepContent {
            session_step_id,
            fields,
            target,
        } => respond(
            engine
                .edit_step_content(actor, &session_step_id, fields, target)
                .await,
        ),

        // Proof
        Request::SetProofConfig {
            session_step_id,
            required,
            instructions,
        } => respond(
            engine
                .set_proof_config(actor, &session_step_id, required, instructions)
                .await,
        ),
        Request::SubmitProof {
            session_step_id,
            content,
        } => respond(engine.submit_proof(actor, &session_step_id, &content).await),
        Request::UploadProof {
            session_step_id,
            file_name,
            data_b64,
        } => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(data_b64.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return error_response(
                        ErrorCode::Validation,
                        &format!("data_b64 is not valid base64: {e}"),
                    );
                }
            };
            respond(
                engine
                    .upload_proof(actor, &session_step_id, &file_name, bytes)
                    .await,
            )
        }
        Request::DeleteProof { session_step_id } => {
            respond(engine.delete_proof(actor, &session_step_id).await)
        }
        Request::ProofUrl { session_step_id } => {
            respond(engine.proof_url(actor, &session_step_id).await)
        }

        // Chat
        Request::SendMessage {
            session_id,
            content,
        } => respond(engine.send_message(actor, &session_id, &content).await),
        Request::MarkRead {
            session_id,
            message_ids,
        } => respond(engine.mark_read(actor, &session_id, message_ids).await),
        Request::DeleteMessage { message_id } => {
            respond_empty(engine.delete_message(actor, &message_id).await)
        }
    }
}

fn handle_authenticate(state: &Arc<ServerState>, conn: &mut ClientConn, token: &str) -> Response {
    let Some(user_id) = state.identity.resolve(token) else {
        tracing::warn!(conn = conn.id, "authentication rejected");
        return error_response(ErrorCode::Unauthenticated, "unknown token");
    };
    // Switching identity drops every subscription made as the previous user.
    if conn.user_id.as_deref().is_some_and(|u| u != user_id) {
        state.bus().disconnect(conn.id);
    }
    state.bus().register(conn.id, &user_id, conn.events.clone());
    tracing::info!(conn = conn.id, user_id = %user_id, "client authenticated");
    conn.user_id = Some(user_id.clone());
    respond(Ok::<_, EngineError>(AuthInfo { user_id }))
}

fn handle_health(state: &Arc<ServerState>) -> Response {
    let bus = state.bus();
    respond(Ok::<_, EngineError>(HealthStatus {
        healthy: true,
        connections: bus.connection_count(),
        subscribed_sessions: bus.session_count(),
    }))
}

/// Serialize an engine result into a response frame.
fn respond<T: Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => ok_response(Some(data)),
            Err(e) => {
                tracing::error!(err = %e, "failed to serialize response");
                error_response(ErrorCode::Internal, "failed to serialize response")
            }
        },
        Err(e) => engine_error(e),
    }
}

fn respond_empty(result: Result<(), EngineError>) -> Response {
    match result {
        Ok(()) => ok_response(None),
        Err(e) => engine_error(e),
    }
}

fn engine_error(e: EngineError) -> Response {
    let (code, message) = e.to_error_code();
    if code == ErrorCode::Internal {
        tracing::error!(err = %e, "request failed");
    } else {
        tracing::debug!(%code, %message, "request rejected");
    }
    error_response(code, &message)
}

pub fn ok_response(data: Option<serde_json::Value>) -> Response {
    Response::Ok { data }
}

pub fn error_response(code: ErrorCode, message: &str) -> Response {
    Response::Error {
        code,
        message: message.to_string(),
    }
}
