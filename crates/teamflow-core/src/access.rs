//! Lane access resolution.
//!
//! A user's lane is the template-ordered list of steps they are assigned.
//! Only the first incomplete step of a lane (its cursor) is actionable, by
//! the assignee or by someone the assignment delegates to. Completed steps
//! stay visible to everyone but grant no rights.

use crate::model::{Assignment, SessionStep};
use crate::snapshot::SessionSnapshot;
use std::collections::{HashMap, HashSet};

/// Why a user may or may not complete a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionCheck {
    /// Allowed by the lane of `assignee` (the user themself, or the lane they stand in for).
    Allowed { assignee: String },
    AlreadyCompleted,
    ProofMissing,
    /// No assignment puts this step at the cursor of a lane the user may act on.
    NotOnActiveLane,
    UnknownStep,
}

impl CompletionCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CompletionCheck::Allowed { .. })
    }
}

/// Read-only view over a [`SessionSnapshot`] answering lane questions.
pub struct AccessResolver<'a> {
    snapshot: &'a SessionSnapshot,
    steps: HashMap<&'a str, &'a SessionStep>,
    /// assignee -> first incomplete assigned step
    cursors: HashMap<&'a str, &'a str>,
    /// step id -> assignments targeting it
    by_step: HashMap<&'a str, Vec<&'a Assignment>>,
}

impl<'a> AccessResolver<'a> {
    pub fn new(snapshot: &'a SessionSnapshot) -> Self {
        let steps: HashMap<&str, &SessionStep> = snapshot
            .steps
            .iter()
            .map(|s| (s.step_id.as_str(), s))
            .collect();

        let mut by_step: HashMap<&str, Vec<&Assignment>> = HashMap::new();
        for assignment in &snapshot.assignments {
            by_step
                .entry(assignment.step_id.as_str())
                .or_default()
                .push(assignment);
        }

        let mut cursors: HashMap<&str, &str> = HashMap::new();
        for step_id in &snapshot.step_order {
            let completed = steps.get(step_id.as_str()).is_some_and(|s| s.is_completed);
            if completed {
                continue;
            }
            if let Some(assignments) = by_step.get(step_id.as_str()) {
                for &a in assignments {
                    cursors
                        .entry(a.assignee_user_id.as_str())
                        .or_insert(step_id.as_str());
                }
            }
        }

        Self {
            snapshot,
            steps,
            cursors,
            by_step,
        }
    }

    pub fn snapshot(&self) -> &'a SessionSnapshot {
        self.snapshot
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.steps.get(step_id).is_some_and(|s| s.is_completed)
    }

    /// Steps assigned to `user_id`, in template order.
    pub fn lane(&self, user_id: &str) -> Vec<&'a str> {
        self.snapshot
            .step_order
            .iter()
            .map(String::as_str)
            .filter(|step_id| {
                self.assignments_for(step_id)
                    .any(|a| a.assignee_user_id == user_id)
            })
            .collect()
    }

    /// The earliest incomplete step in the user's lane.
    pub fn lane_cursor(&self, user_id: &str) -> Option<&'a str> {
        self.cursors.get(user_id).copied()
    }

    /// Whether `user_id` may stand in for the assignee of `assignment`.
    ///
    /// "Everyone" wins over any explicit list. An explicit list, when
    /// non-empty, replaces the assignee's lane delegates entirely.
    pub fn is_authorized_delegate(&self, assignment: &Assignment, user_id: &str) -> bool {
        if !assignment.allow_delegation {
            return false;
        }
        if assignment.allow_delegation_to_everyone {
            return true;
        }
        if !assignment.delegates.is_empty() {
            return assignment.delegates.iter().any(|d| d == user_id);
        }
        self.snapshot
            .lane_delegates_of(&assignment.assignee_user_id)
            .any(|d| d == user_id)
    }

    /// Assignments on `step_id` through which `user_id` may act right now.
    fn active_grants<'s>(
        &'s self,
        user_id: &'s str,
        step_id: &'s str,
    ) -> impl Iterator<Item = &'a Assignment> + 's {
        self.assignments_for(step_id).filter(move |a| {
            if self.lane_cursor(&a.assignee_user_id) != Some(step_id) {
                return false;
            }
            a.assignee_user_id == user_id || self.is_authorized_delegate(a, user_id)
        })
    }

    fn assignments_for<'s>(&'s self, step_id: &str) -> impl Iterator<Item = &'a Assignment> + 's {
        self.by_step
            .get(step_id)
            .into_iter()
            .flat_map(|v| v.iter().copied())
    }

    pub fn is_visible(&self, user_id: &str, step_id: &str) -> bool {
        if self.is_completed(step_id) {
            return true;
        }
        self.active_grants(user_id, step_id).next().is_some()
    }

    /// Steps `user_id` may view, in template order.
    pub fn visible_steps(&self, user_id: &str) -> Vec<&'a str> {
        self.snapshot
            .step_order
            .iter()
            .map(String::as_str)
            .filter(|step_id| self.is_visible(user_id, step_id))
            .collect()
    }

    /// Lanes (by assignee) whose cursor `user_id` may currently act on,
    /// paired with that cursor step.
    pub fn active_lanes(&self, user_id: &str) -> Vec<(&'a str, &'a str)> {
        let mut seen = HashSet::new();
        let mut lanes = Vec::new();
        for step_id in &self.snapshot.step_order {
            for a in self.active_grants(user_id, step_id) {
                if seen.insert(a.assignee_user_id.as_str()) {
                    lanes.push((a.assignee_user_id.as_str(), step_id.as_str()));
                }
            }
        }
        lanes
    }

    pub fn completion_check(&self, user_id: &str, step_id: &str) -> CompletionCheck {
        let Some(step) = self.steps.get(step_id) else {
            return CompletionCheck::UnknownStep;
        };
        if step.is_completed {
            return CompletionCheck::AlreadyCompleted;
        }
        if !step.proof.is_satisfied() {
            return CompletionCheck::ProofMissing;
        }
        // Prefer the user's own lane when both paths exist.
        let mut grants: Vec<&Assignment> = self.active_grants(user_id, step_id).collect();
        grants.sort_by_key(|a| a.assignee_user_id != user_id);
        match grants.first() {
            Some(a) => CompletionCheck::Allowed {
                assignee: a.assignee_user_id.clone(),
            },
            None => CompletionCheck::NotOnActiveLane,
        }
    }

    pub fn can_complete(&self, user_id: &str, step_id: &str) -> bool {
        self.completion_check(user_id, step_id).is_allowed()
    }
}
