use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest chat message accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A single member capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EditSteps,
    ManageAssignments,
    ManageSharing,
    EditIntel,
    EditProof,
    Chat,
    LaneDelegation,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::EditSteps,
        Capability::ManageAssignments,
        Capability::ManageSharing,
        Capability::EditIntel,
        Capability::EditProof,
        Capability::Chat,
        Capability::LaneDelegation,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::EditSteps => "edit_steps",
            Capability::ManageAssignments => "manage_assignments",
            Capability::ManageSharing => "manage_sharing",
            Capability::EditIntel => "edit_intel",
            Capability::EditProof => "edit_proof",
            Capability::Chat => "chat",
            Capability::LaneDelegation => "lane_delegation",
        };
        f.write_str(name)
    }
}

/// The capability flags held by a session member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub can_edit_steps: bool,
    pub can_manage_assignments: bool,
    pub can_manage_sharing: bool,
    pub can_edit_intel: bool,
    pub can_edit_proof: bool,
    pub can_chat: bool,
    pub allow_lane_delegation: bool,
}

impl Capabilities {
    /// Every flag set. Session owners always hold this set.
    pub fn all() -> Self {
        Self {
            can_edit_steps: true,
            can_manage_assignments: true,
            can_manage_sharing: true,
            can_edit_intel: true,
            can_edit_proof: true,
            can_chat: true,
            allow_lane_delegation: true,
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        match cap {
            Capability::EditSteps => self.can_edit_steps,
            Capability::ManageAssignments => self.can_manage_assignments,
            Capability::ManageSharing => self.can_manage_sharing,
            Capability::EditIntel => self.can_edit_intel,
            Capability::EditProof => self.can_edit_proof,
            Capability::Chat => self.can_chat,
            Capability::LaneDelegation => self.allow_lane_delegation,
        }
    }

    pub fn set(&mut self, cap: Capability, value: bool) {
        let flag = match cap {
            Capability::EditSteps => &mut self.can_edit_steps,
            Capability::ManageAssignments => &mut self.can_manage_assignments,
            Capability::ManageSharing => &mut self.can_manage_sharing,
            Capability::EditIntel => &mut self.can_edit_intel,
            Capability::EditProof => &mut self.can_edit_proof,
            Capability::Chat => &mut self.can_chat,
            Capability::LaneDelegation => &mut self.allow_lane_delegation,
        };
        *flag = value;
    }

    /// Build a flag set from a list of granted capabilities.
    pub fn from_granted(granted: &[Capability]) -> Self {
        let mut caps = Self::default();
        for cap in granted {
            caps.set(*cap, true);
        }
        caps
    }
}

/// Changes applied by `update_member`. Grants are applied before revokes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revoke: Vec<Capability>,
    /// `Some("")` clears the lane colour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_color: Option<String>,
}

impl MemberPatch {
    pub fn is_empty(&self) -> bool {
        self.grant.is_empty() && self.revoke.is_empty() && self.lane_color.is_none()
    }

    pub fn apply(&self, member: &mut Member) {
        for cap in &self.grant {
            member.capabilities.set(*cap, true);
        }
        for cap in &self.revoke {
            member.capabilities.set(*cap, false);
        }
        if let Some(color) = &self.lane_color {
            member.lane_color = if color.is_empty() {
                None
            } else {
                Some(color.clone())
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Human-facing text of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepContent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub instructions: String,
}

/// A partial content edit. Also used for session-local overrides, where a
/// `None` field falls back to the template text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ContentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.objective.is_none()
            && self.instructions.is_none()
    }

    pub fn apply_to(&self, content: &mut StepContent) {
        if let Some(v) = &self.name {
            content.name = v.clone();
        }
        if let Some(v) = &self.description {
            content.description = v.clone();
        }
        if let Some(v) = &self.objective {
            content.objective = v.clone();
        }
        if let Some(v) = &self.instructions {
            content.instructions = v.clone();
        }
    }

    /// Fold `other` on top of `self`, keeping fields `other` leaves unset.
    pub fn merge(&mut self, other: &ContentPatch) {
        if other.name.is_some() {
            self.name = other.name.clone();
        }
        if other.description.is_some() {
            self.description = other.description.clone();
        }
        if other.objective.is_some() {
            self.objective = other.objective.clone();
        }
        if other.instructions.is_some() {
            self.instructions = other.instructions.clone();
        }
    }
}

/// Where `edit_step_content` writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTarget {
    /// The shared template step. Every session launched from the template sees it.
    #[default]
    Template,
    /// The session-local override only.
    Session,
}

/// Proof configuration carried by a template step and copied into sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofConfig {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub id: String,
    pub template_id: String,
    pub position: u32,
    pub content: StepContent,
    pub proof: ProofConfig,
}

/// The reusable ordered step sequence a session is launched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeTemplate {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at_ms: u64,
    pub steps: Vec<TemplateStep>,
}

impl CompositeTemplate {
    /// Template step ids in execution order.
    pub fn step_order(&self) -> Vec<String> {
        let mut steps: Vec<&TemplateStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.position);
        steps.into_iter().map(|s| s.id.clone()).collect()
    }
}

/// Input for one step of a new template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplateStep {
    #[serde(flatten)]
    pub content: StepContent,
    #[serde(default)]
    pub proof: ProofConfig,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub template_id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub session_id: String,
    pub user_id: String,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_color: Option<String>,
    pub added_at_ms: u64,
}

/// Binds one template step to one assignee within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub session_id: String,
    pub step_id: String,
    pub assignee_user_id: String,
    pub allow_delegation: bool,
    pub allow_delegation_to_everyone: bool,
    /// Explicit per-assignment delegates. Ignored while
    /// `allow_delegation_to_everyone` is set.
    #[serde(default)]
    pub delegates: Vec<String>,
}

impl Assignment {
    /// Normalize requested delegation flags: "everyone" implies delegation.
    pub fn delegation_flags(allow_delegation: bool, to_everyone: bool) -> (bool, bool) {
        (allow_delegation || to_everyone, to_everyone)
    }
}

/// Blanket stand-in rights over everything assigned to `owner_user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneDelegate {
    pub session_id: String,
    pub owner_user_id: String,
    pub delegate_user_id: String,
}

/// Proof configuration plus the current submission of a session step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofState {
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at_ms: Option<u64>,
}

impl ProofState {
    pub fn seeded(config: &ProofConfig) -> Self {
        Self {
            required: config.required,
            instructions: config.instructions.clone(),
            ..Self::default()
        }
    }

    /// True when text content or a stored file exists. Blank text does not count.
    pub fn is_submitted(&self) -> bool {
        let has_text = self
            .content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        has_text || self.file_ref.is_some()
    }

    pub fn is_satisfied(&self) -> bool {
        !self.required || self.is_submitted()
    }
}

/// Per-session progress record for one template step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStep {
    pub id: String,
    pub session_id: String,
    pub step_id: String,
    pub position: u32,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    pub proof: ProofState,
    #[serde(default, skip_serializing_if = "ContentPatch::is_empty")]
    pub overrides: ContentPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub author_user_id: String,
    pub content: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRead {
    pub message_id: String,
    pub user_id: String,
    pub read_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_and_has() {
        let mut caps = Capabilities::default();
        for cap in Capability::ALL {
            assert!(!caps.has(cap));
            caps.set(cap, true);
            assert!(caps.has(cap));
        }
        assert_eq!(caps, Capabilities::all());
    }

    #[test]
    fn member_patch_grant_then_revoke() {
        let mut member = Member {
            session_id: "s".into(),
            user_id: "u".into(),
            capabilities: Capabilities::from_granted(&[Capability::Chat]),
            lane_color: Some("#ff0000".into()),
            added_at_ms: 0,
        };
        let patch = MemberPatch {
            grant: vec![Capability::EditProof, Capability::Chat],
            revoke: vec![Capability::Chat],
            lane_color: Some(String::new()),
        };
        patch.apply(&mut member);
        assert!(member.capabilities.can_edit_proof);
        assert!(!member.capabilities.can_chat);
        assert!(member.lane_color.is_none());
    }

    #[test]
    fn everyone_implies_delegation() {
        assert_eq!(Assignment::delegation_flags(false, true), (true, true));
        assert_eq!(Assignment::delegation_flags(true, false), (true, false));
        assert_eq!(Assignment::delegation_flags(false, false), (false, false));
    }

    #[test]
    fn blank_proof_text_is_not_a_submission() {
        let mut proof = ProofState::seeded(&ProofConfig {
            required: true,
            instructions: None,
        });
        assert!(!proof.is_satisfied());
        proof.content = Some("   ".into());
        assert!(!proof.is_submitted());
        proof.file_ref = Some("blob-1".into());
        assert!(proof.is_satisfied());
    }

    #[test]
    fn content_patch_overlays_template_text() {
        let mut content = StepContent {
            name: "Deploy".into(),
            description: "ship it".into(),
            ..StepContent::default()
        };
        let mut patch = ContentPatch {
            name: Some("Deploy v2".into()),
            ..ContentPatch::default()
        };
        patch.merge(&ContentPatch {
            objective: Some("zero downtime".into()),
            ..ContentPatch::default()
        });
        patch.apply_to(&mut content);
        assert_eq!(content.name, "Deploy v2");
        assert_eq!(content.description, "ship it");
        assert_eq!(content.objective, "zero downtime");
    }

    #[test]
    fn template_step_order_follows_position() {
        let step = |id: &str, position| TemplateStep {
            id: id.into(),
            template_id: "t".into(),
            position,
            content: StepContent::default(),
            proof: ProofConfig::default(),
        };
        let template = CompositeTemplate {
            id: "t".into(),
            owner_id: "o".into(),
            name: "launch".into(),
            created_at_ms: 0,
            steps: vec![step("c", 2), step("a", 0), step("b", 1)],
        };
        assert_eq!(template.step_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn new_template_step_flattens_content() {
        let json = r#"{"name":"Review","objective":"two approvals","proof":{"required":true}}"#;
        let step: NewTemplateStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.content.name, "Review");
        assert_eq!(step.content.objective, "two approvals");
        assert!(step.proof.required);
    }
}
