use super::{SessionEngine, load_snapshot, require, require_text};
use crate::error::{EngineError, Result};
use teamflow::protocol::ChangeKind;
use teamflow_core::model::{Capabilities, Capability, Member, MemberPatch};
use teamflow_core::now_ms;
use teamflow_store::sessions;

impl SessionEngine {
    pub async fn add_member(
        &self,
        actor: &str,
        session_id: &str,
        user_id: &str,
        capabilities: Capabilities,
        lane_color: Option<String>,
    ) -> Result<Member> {
        require_text("user id", user_id)?;
        let actor = actor.to_string();
        let sid = session_id.to_string();
        let user = user_id.to_string();

        let member = self
            .store
            .transaction(move |tx| -> Result<Member> {
                let snapshot = load_snapshot(tx, &sid)?;
                require(&snapshot, &actor, Capability::ManageSharing)?;
                if snapshot.is_participant(&user) {
                    return Err(EngineError::Conflict(format!(
                        "{user} is already a member of session {sid}"
                    )));
                }
                let member = Member {
                    session_id: sid.clone(),
                    user_id: user.clone(),
                    capabilities,
                    lane_color: lane_color.filter(|c| !c.is_empty()),
                    added_at_ms: now_ms(),
                };
                sessions::insert_member(tx, &member)?;
                Ok(member)
            })
            .await?;

        tracing::info!(session_id, user_id, "member added");
        self.notify(session_id, ChangeKind::Members);
        Ok(member)
    }

    /// Toggle capability flags or the lane colour of an existing member.
    pub async fn update_member(
        &self,
        actor: &str,
        session_id: &str,
        user_id: &str,
        patch: MemberPatch,
    ) -> Result<Member> {
        if patch.is_empty() {
            return Err(EngineError::Validation("member update changes nothing".to_string()));
        }
        let actor = actor.to_string();
        let sid = session_id.to_string();
        let user = user_id.to_string();

        let member = self
            .store
            .transaction(move |tx| -> Result<Member> {
                let snapshot = load_snapshot(tx, &sid)?;
                require(&snapshot, &actor, Capability::ManageSharing)?;
                let mut member = snapshot
                    .member(&user)
                    .cloned()
                    .ok_or_else(|| EngineError::not_found("member", &user))?;
                patch.apply(&mut member);
                sessions::update_member(tx, &member)?;
                Ok(member)
            })
            .await?;

        tracing::info!(session_id, user_id, "member updated");
        self.notify(session_id, ChangeKind::Members);
        Ok(member)
    }

    /// Remove a member. Their assignments stay in place; their live
    /// subscriptions to the session are dropped.
    pub async fn remove_member(&self, actor: &str, session_id: &str, user_id: &str) -> Result<()> {
        let actor = actor.to_string();
        let sid = session_id.to_string();
        let user = user_id.to_string();

        self.store
            .transaction(move |tx| -> Result<()> {
                let snapshot = load_snapshot(tx, &sid)?;
                if snapshot.is_owner(&user) {
                    return Err(EngineError::Forbidden(
                        "the session owner cannot be removed".to_string(),
                    ));
                }
                require(&snapshot, &actor, Capability::ManageSharing)?;
                if !sessions::delete_member(tx, &sid, &user)? {
                    return Err(EngineError::not_found("member", &user));
                }
                Ok(())
            })
            .await?;

        tracing::info!(session_id, user_id, "member removed");
        self.notify(session_id, ChangeKind::Members);
        self.bus.evict_user(session_id, user_id);
        Ok(())
    }
}
