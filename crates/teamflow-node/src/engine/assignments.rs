use super::{SessionEngine, load_snapshot, require, require_participant};
use crate::error::{EngineError, Result};
use teamflow::protocol::ChangeKind;
use teamflow_core::SessionSnapshot;
use teamflow_core::model::{Assignment, Capability, LaneDelegate};
use teamflow_store::assignments as store;
use teamflow_store::new_id;
use teamflow_store::rusqlite::Connection;

impl SessionEngine {
    /// Bind a template step to an assignee. A second assignment of the same
    /// step to the same user is a conflict.
    pub async fn assign_step(
        &self,
        actor: &str,
        session_id: &str,
        step_id: &str,
        assignee: &str,
        allow_delegation: bool,
        allow_delegation_to_everyone: bool,
    ) -> Result<Assignment> {
        let actor = actor.to_string();
        let sid = session_id.to_string();
        let step_id = step_id.to_string();
        let assignee = assignee.to_string();

        let assignment = self
            .store
            .transaction(move |tx| -> Result<Assignment> {
                let snapshot = load_snapshot(tx, &sid)?;
                require(&snapshot, &actor, Capability::ManageAssignments)?;
                if !snapshot.step_order.contains(&step_id) {
                    return Err(EngineError::not_found("step", &step_id));
                }
                if !snapshot.is_participant(&assignee) {
                    return Err(EngineError::not_found("member", &assignee));
                }
                if store::find_assignment(tx, &sid, &step_id, &assignee)?.is_some() {
                    return Err(EngineError::Conflict(format!(
                        "step {step_id} is already assigned to {assignee}"
                    )));
                }
                let (allow, everyone) =
                    Assignment::delegation_flags(allow_delegation, allow_delegation_to_everyone);
                let assignment = Assignment {
                    id: new_id(),
                    session_id: sid.clone(),
                    step_id,
                    assignee_user_id: assignee,
                    allow_delegation: allow,
                    allow_delegation_to_everyone: everyone,
                    delegates: Vec::new(),
                };
                store::insert_assignment(tx, &assignment)?;
                Ok(assignment)
            })
            .await?;

        tracing::info!(
            session_id,
            assignment_id = %assignment.id,
            step_id = %assignment.step_id,
            assignee = %assignment.assignee_user_id,
            "step assigned"
        );
        self.notify(session_id, ChangeKind::Assignments);
        Ok(assignment)
    }

    /// Change delegation flags. Explicit delegates are kept even while
    /// "everyone" makes them irrelevant.
    pub async fn update_assignment(
        &self,
        actor: &str,
        assignment_id: &str,
        allow_delegation: bool,
        allow_delegation_to_everyone: bool,
    ) -> Result<Assignment> {
        let actor = actor.to_string();
        let id = assignment_id.to_string();

        let assignment = self
            .store
            .transaction(move |tx| -> Result<Assignment> {
                let (mut assignment, snapshot) = load_assignment(tx, &id)?;
                require(&snapshot, &actor, Capability::ManageAssignments)?;
                let (allow, everyone) =
                    Assignment::delegation_flags(allow_delegation, allow_delegation_to_everyone);
                store::update_assignment_flags(tx, &id, allow, everyone)?;
                assignment.allow_delegation = allow;
                assignment.allow_delegation_to_everyone = everyone;
                Ok(assignment)
            })
            .await?;

        tracing::info!(
            session_id = %assignment.session_id,
            assignment_id,
            allow_delegation = assignment.allow_delegation,
            everyone = assignment.allow_delegation_to_everyone,
            "assignment updated"
        );
        self.notify(&assignment.session_id, ChangeKind::Assignments);
        Ok(assignment)
    }

    pub async fn remove_assignment(&self, actor: &str, assignment_id: &str) -> Result<()> {
        let actor = actor.to_string();
        let id = assignment_id.to_string();

        let session_id = self
            .store
            .transaction(move |tx| -> Result<String> {
                let (assignment, snapshot) = load_assignment(tx, &id)?;
                require(&snapshot, &actor, Capability::ManageAssignments)?;
                store::delete_assignment(tx, &id)?;
                Ok(assignment.session_id)
            })
            .await?;

        tracing::info!(session_id = %session_id, assignment_id, "assignment removed");
        self.notify(&session_id, ChangeKind::Assignments);
        Ok(())
    }

    /// Add an explicit delegate. Adding one that already exists succeeds
    /// without a change event.
    pub async fn add_assignment_delegate(
        &self,
        actor: &str,
        assignment_id: &str,
        delegate: &str,
    ) -> Result<Assignment> {
        let actor = actor.to_string();
        let id = assignment_id.to_string();
        let delegate = delegate.to_string();

        let (assignment, added) = self
            .store
            .transaction(move |tx| -> Result<(Assignment, bool)> {
                let (mut assignment, snapshot) = load_assignment(tx, &id)?;
                require_assignment_admin(&snapshot, &actor, &assignment)?;
                check_delegate(&snapshot, &assignment.assignee_user_id, &delegate)?;
                let added = store::insert_assignment_delegate(tx, &id, &delegate)?;
                if added {
                    assignment.delegates.push(delegate);
                    assignment.delegates.sort();
                }
                Ok((assignment, added))
            })
            .await?;

        if added {
            tracing::info!(session_id = %assignment.session_id, assignment_id, "assignment delegate added");
            self.notify(&assignment.session_id, ChangeKind::Delegates);
        }
        Ok(assignment)
    }

    pub async fn remove_assignment_delegate(
        &self,
        actor: &str,
        assignment_id: &str,
        delegate: &str,
    ) -> Result<Assignment> {
        let actor = actor.to_string();
        let id = assignment_id.to_string();
        let delegate = delegate.to_string();

        let assignment = self
            .store
            .transaction(move |tx| -> Result<Assignment> {
                let (mut assignment, snapshot) = load_assignment(tx, &id)?;
                require_assignment_admin(&snapshot, &actor, &assignment)?;
                if !store::delete_assignment_delegate(tx, &id, &delegate)? {
                    return Err(EngineError::not_found("delegate", &delegate));
                }
                assignment.delegates.retain(|d| *d != delegate);
                Ok(assignment)
            })
            .await?;

        tracing::info!(session_id = %assignment.session_id, assignment_id, "assignment delegate removed");
        self.notify(&assignment.session_id, ChangeKind::Delegates);
        Ok(assignment)
    }

    /// Let `delegate` stand in for `owner_user` on any assignment that
    /// enables delegation without naming explicit delegates.
    pub async fn add_lane_delegate(
        &self,
        actor: &str,
        session_id: &str,
        owner_user: &str,
        delegate: &str,
    ) -> Result<LaneDelegate> {
        let actor = actor.to_string();
        let lane_delegate = LaneDelegate {
            session_id: session_id.to_string(),
            owner_user_id: owner_user.to_string(),
            delegate_user_id: delegate.to_string(),
        };
        let stored = lane_delegate.clone();

        let added = self
            .store
            .transaction(move |tx| -> Result<bool> {
                let snapshot = load_snapshot(tx, &stored.session_id)?;
                require_lane_admin(&snapshot, &actor, &stored.owner_user_id)?;
                check_delegate(&snapshot, &stored.owner_user_id, &stored.delegate_user_id)?;
                Ok(store::insert_lane_delegate(tx, &stored)?)
            })
            .await?;

        if added {
            tracing::info!(session_id, owner = owner_user, delegate, "lane delegate added");
            self.notify(session_id, ChangeKind::Delegates);
        }
        Ok(lane_delegate)
    }

    pub async fn remove_lane_delegate(
        &self,
        actor: &str,
        session_id: &str,
        owner_user: &str,
        delegate: &str,
    ) -> Result<()> {
        let actor = actor.to_string();
        let lane_delegate = LaneDelegate {
            session_id: session_id.to_string(),
            owner_user_id: owner_user.to_string(),
            delegate_user_id: delegate.to_string(),
        };

        self.store
            .transaction(move |tx| -> Result<()> {
                let snapshot = load_snapshot(tx, &lane_delegate.session_id)?;
                require_lane_admin(&snapshot, &actor, &lane_delegate.owner_user_id)?;
                if !store::delete_lane_delegate(tx, &lane_delegate)? {
                    return Err(EngineError::not_found(
                        "lane delegate",
                        &lane_delegate.delegate_user_id,
                    ));
                }
                Ok(())
            })
            .await?;

        tracing::info!(session_id, owner = owner_user, delegate, "lane delegate removed");
        self.notify(session_id, ChangeKind::Delegates);
        Ok(())
    }
}

fn load_assignment(conn: &Connection, assignment_id: &str) -> Result<(Assignment, SessionSnapshot)> {
    let assignment = store::get_assignment(conn, assignment_id)?
        .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
    let snapshot = load_snapshot(conn, &assignment.session_id)?;
    Ok((assignment, snapshot))
}

/// canManageAssignments, or the assignee managing their own assignment.
fn require_assignment_admin(
    snapshot: &SessionSnapshot,
    actor: &str,
    assignment: &Assignment,
) -> Result<()> {
    require_participant(snapshot, actor)?;
    if actor == assignment.assignee_user_id || snapshot.can(actor, Capability::ManageAssignments) {
        return Ok(());
    }
    Err(EngineError::Forbidden(format!(
        "{actor} may not change delegates of assignment {}",
        assignment.id
    )))
}

/// canManageAssignments, or the lane owner managing their own lane.
fn require_lane_admin(snapshot: &SessionSnapshot, actor: &str, owner_user: &str) -> Result<()> {
    require_participant(snapshot, actor)?;
    if !snapshot.is_participant(owner_user) {
        return Err(EngineError::not_found("member", owner_user));
    }
    if actor == owner_user || snapshot.can(actor, Capability::ManageAssignments) {
        return Ok(());
    }
    Err(EngineError::Forbidden(format!(
        "{actor} may not change delegates of {owner_user}'s lane"
    )))
}

fn check_delegate(snapshot: &SessionSnapshot, principal: &str, delegate: &str) -> Result<()> {
    if delegate == principal {
        return Err(EngineError::Validation(
            "a user cannot delegate to themself".to_string(),
        ));
    }
    if !snapshot.is_participant(delegate) {
        return Err(EngineError::Validation(format!(
            "delegate {delegate} is not a participant of session {}",
            snapshot.session.id
        )));
    }
    Ok(())
}
