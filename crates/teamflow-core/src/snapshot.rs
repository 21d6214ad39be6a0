use crate::model::{Assignment, Capabilities, Capability, LaneDelegate, Member, Session, SessionStep};
use serde::{Deserialize, Serialize};

/// Everything the access resolver needs about one session, read at a single
/// point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    /// Template step ids in execution order.
    pub step_order: Vec<String>,
    pub steps: Vec<SessionStep>,
    pub members: Vec<Member>,
    pub assignments: Vec<Assignment>,
    pub lane_delegates: Vec<LaneDelegate>,
}

impl SessionSnapshot {
    pub fn is_owner(&self, user_id: &str) -> bool {
        self.session.owner_id == user_id
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Owner or member.
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.member(user_id).is_some()
    }

    /// Effective capabilities. The owner holds all of them regardless of the
    /// stored member row.
    pub fn capabilities(&self, user_id: &str) -> Option<Capabilities> {
        if self.is_owner(user_id) {
            return Some(Capabilities::all());
        }
        self.member(user_id).map(|m| m.capabilities)
    }

    pub fn can(&self, user_id: &str, cap: Capability) -> bool {
        self.capabilities(user_id).is_some_and(|c| c.has(cap))
    }

    pub fn session_step(&self, session_step_id: &str) -> Option<&SessionStep> {
        self.steps.iter().find(|s| s.id == session_step_id)
    }

    pub fn step_for_template_step(&self, step_id: &str) -> Option<&SessionStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn assignment(&self, assignment_id: &str) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == assignment_id)
    }

    pub fn lane_delegates_of(&self, owner_user_id: &str) -> impl Iterator<Item = &str> {
        self.lane_delegates
            .iter()
            .filter(move |d| d.owner_user_id == owner_user_id)
            .map(|d| d.delegate_user_id.as_str())
    }
}
