use serde::{Deserialize, Serialize};
use std::fmt;
use teamflow_core::model::{
    Assignment, Capability, ChatMessage, ContentPatch, ContentTarget, LaneDelegate, Member,
    MemberPatch, NewTemplateStep, ProofState, Session, StepContent,
};

/// Maximum size of a JSON-lines frame (8 MiB). Proof uploads travel
/// base64-encoded inside a single frame.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Machine-readable failure class carried by `Response::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Forbidden,
    Validation,
    ProofRequired,
    Conflict,
    Unauthenticated,
    /// The frame could not be parsed as a request.
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    /// HTTP-equivalent status for gateways fronting the server.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Forbidden => 403,
            ErrorCode::Validation | ErrorCode::ProofRequired | ErrorCode::InvalidRequest => 400,
            ErrorCode::Conflict => 409,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::Internal => 500,
        }
    }

    /// Process exit code used by the command-line client.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Validation | ErrorCode::ProofRequired | ErrorCode::InvalidRequest => 2,
            ErrorCode::Forbidden => 3,
            ErrorCode::NotFound => 4,
            ErrorCode::Conflict => 5,
            ErrorCode::Unauthenticated => 6,
            ErrorCode::Internal => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Validation => "validation",
            ErrorCode::ProofRequired => "proof_required",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from a client to the session server.
///
/// Every request except `Authenticate` and `Health` acts as the user bound
/// to the connection by a prior `Authenticate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Bind the connection to the user owning `token`.
    Authenticate { token: String },
    /// Liveness and registry counters.
    Health,

    // -- Realtime --
    /// Receive `SessionChanged` events for a session. `user_id` must match
    /// the authenticated identity.
    Subscribe { session_id: String, user_id: String },
    Unsubscribe { session_id: String },

    // -- Templates and sessions --
    CreateTemplate {
        name: String,
        steps: Vec<NewTemplateStep>,
    },
    CreateSession { template_id: String, name: String },
    DeleteSession { session_id: String },
    /// Sessions the caller owns or is a member of.
    ListSessions,
    /// Full resync view of one session, filtered for the caller.
    SessionContext { session_id: String },

    // -- Members --
    AddMember {
        session_id: String,
        user_id: String,
        #[serde(default)]
        capabilities: Vec<Capability>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lane_color: Option<String>,
    },
    UpdateMember {
        session_id: String,
        user_id: String,
        patch: MemberPatch,
    },
    RemoveMember { session_id: String, user_id: String },

    // -- Assignments and delegation --
    AssignStep {
        session_id: String,
        step_id: String,
        assignee_user_id: String,
        #[serde(default)]
        allow_delegation: bool,
        #[serde(default)]
        allow_delegation_to_everyone: bool,
    },
    UpdateAssignment {
        assignment_id: String,
        allow_delegation: bool,
        #[serde(default)]
        allow_delegation_to_everyone: bool,
    },
    RemoveAssignment { assignment_id: String },
    AddAssignmentDelegate {
        assignment_id: String,
        delegate_user_id: String,
    },
    RemoveAssignmentDelegate {
        assignment_id: String,
        delegate_user_id: String,
    },
    AddLaneDelegate {
        session_id: String,
        owner_user_id: String,
        delegate_user_id: String,
    },
    RemoveLaneDelegate {
        session_id: String,
        owner_user_id: String,
        delegate_user_id: String,
    },

    // -- Steps --
    CompleteStep { session_step_id: String },
    EditStepContent {
        session_step_id: String,
        fields: ContentPatch,
        #[serde(default)]
        target: ContentTarget,
    },

    // -- Proof --
    SetProofConfig {
        session_step_id: String,
        required: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
    SubmitProof {
        session_step_id: String,
        content: String,
    },
    /// Attach a file as proof. `data_b64` is standard base64.
    UploadProof {
        session_step_id: String,
        file_name: String,
        data_b64: String,
    },
    DeleteProof { session_step_id: String },
    /// Time-limited download URL for the step's proof file.
    ProofUrl { session_step_id: String },

    // -- Chat --
    SendMessage { session_id: String, content: String },
    MarkRead {
        session_id: String,
        message_ids: Vec<String>,
    },
    DeleteMessage { message_id: String },
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A frame sent from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Connection established.
    Hello { version: String },
    /// Request succeeded with optional data.
    Ok { data: Option<serde_json::Value> },
    /// Request failed.
    Error { code: ErrorCode, message: String },
    /// Pushed notification for a subscribed session.
    Event { event: Event },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// What part of a session changed. Clients treat every event as a signal to
/// refetch `SessionContext`; the kind only helps them decide what to redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    SessionDeleted,
    Members,
    Assignments,
    Delegates,
    StepCompleted,
    StepContent,
    Proof,
    Chat,
    ReadReceipts,
}

/// Asynchronous events pushed to subscribed connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A committed mutation touched the session.
    SessionChanged {
        session_id: String,
        change: ChangeKind,
    },
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Event::SessionChanged { session_id, .. } => session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Data types returned in Ok.data
// ---------------------------------------------------------------------------

/// Result of `Authenticate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user_id: String,
}

/// Health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub connections: usize,
    pub subscribed_sessions: usize,
}

/// Resync view of a session as seen by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session: Session,
    pub template_name: String,
    pub viewer: ViewerInfo,
    pub members: Vec<Member>,
    pub assignments: Vec<Assignment>,
    pub lane_delegates: Vec<LaneDelegate>,
    /// Every step in template order. Hidden steps carry no content or proof
    /// unless the viewer administers the session's steps.
    pub steps: Vec<StepView>,
    pub messages: Vec<MessageView>,
}

/// The caller's standing in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerInfo {
    pub user_id: String,
    pub is_owner: bool,
    pub capabilities: teamflow_core::model::Capabilities,
    /// Earliest incomplete step of the viewer's own lane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_cursor: Option<String>,
    /// Lanes whose cursor the viewer may act on right now.
    #[serde(default)]
    pub active_lanes: Vec<ActiveLane>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLane {
    pub assignee_user_id: String,
    pub step_id: String,
}

/// One session step as seen by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub session_step_id: String,
    pub step_id: String,
    pub position: u32,
    pub visible: bool,
    pub can_complete: bool,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    pub assignees: Vec<String>,
    /// Template content with session overrides applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<StepContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofState>,
}

/// A chat message with its read receipts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub read_by: Vec<String>,
}

/// Signed download link for a proof file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofUrl {
    pub url: String,
    pub file_name: Option<String>,
    pub expires_at_ms: u64,
}

/// Result of `MarkRead`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResult {
    pub marked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = Request::CompleteStep {
            session_step_id: "ss-1".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "complete_step");
        assert_eq!(json["session_step_id"], "ss-1");
    }

    #[test]
    fn edit_content_target_defaults_to_template() {
        let json = r#"{"type":"edit_step_content","session_step_id":"ss","fields":{"name":"New"}}"#;
        match serde_json::from_str::<Request>(json).unwrap() {
            Request::EditStepContent { fields, target, .. } => {
                assert_eq!(target, ContentTarget::Template);
                assert_eq!(fields.name.as_deref(), Some("New"));
                assert!(fields.description.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn add_member_capabilities_are_optional() {
        let json = r#"{"type":"add_member","session_id":"s","user_id":"bob"}"#;
        match serde_json::from_str::<Request>(json).unwrap() {
            Request::AddMember {
                capabilities,
                lane_color,
                ..
            } => {
                assert!(capabilities.is_empty());
                assert!(lane_color.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn error_frame_uses_snake_case_code() {
        let resp = Response::Error {
            code: ErrorCode::ProofRequired,
            message: "proof required".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""code":"proof_required""#));
        assert_eq!(ErrorCode::ProofRequired.to_string(), "proof_required");
    }

    #[test]
    fn event_frame_is_tagged_by_kind() {
        let resp = Response::Event {
            event: Event::SessionChanged {
                session_id: "s1".to_string(),
                change: ChangeKind::StepCompleted,
            },
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["kind"], "session_changed");
        assert_eq!(json["event"]["change"], "step_completed");
    }

    #[test]
    fn status_and_exit_codes() {
        assert_eq!(ErrorCode::NotFound.status(), 404);
        assert_eq!(ErrorCode::Forbidden.status(), 403);
        assert_eq!(ErrorCode::ProofRequired.status(), 400);
        assert_eq!(ErrorCode::Conflict.status(), 409);
        assert_eq!(ErrorCode::Unauthenticated.status(), 401);
        assert_eq!(ErrorCode::Internal.status(), 500);

        assert_eq!(ErrorCode::Forbidden.exit_code(), 3);
        assert_eq!(ErrorCode::NotFound.exit_code(), 4);
        assert_eq!(ErrorCode::Conflict.exit_code(), 5);
    }

    #[test]
    fn message_view_flattens_message() {
        let view = MessageView {
            message: ChatMessage {
                id: "m1".into(),
                session_id: "s1".into(),
                author_user_id: "alice".into(),
                content: "hi".into(),
                created_at_ms: 7,
            },
            read_by: vec!["bob".into()],
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "m1");
        assert_eq!(json["read_by"][0], "bob");
    }
}
