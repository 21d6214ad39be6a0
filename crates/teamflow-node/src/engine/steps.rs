use super::{SessionEngine, load_snapshot, require, require_participant};
use crate::error::{EngineError, Result};
use teamflow::protocol::{self, ChangeKind};
use teamflow_core::model::{
    Capability, ContentPatch, ContentTarget, ProofState, SessionStep, StepContent,
};
use teamflow_core::{AccessResolver, CompletionCheck, SessionSnapshot, now_ms};
use teamflow_store::rusqlite::Connection;
use teamflow_store::{steps, templates};

impl SessionEngine {
    /// Mark a step complete on behalf of whichever lane lets `actor` do it.
    ///
    /// The verdict is recomputed from a fresh snapshot inside the write
    /// transaction, and the update itself only matches an incomplete row, so
    /// two racing completions produce one winner and one `Conflict`.
    pub async fn complete_step(&self, actor: &str, session_step_id: &str) -> Result<SessionStep> {
        let actor = actor.to_string();
        let ssid = session_step_id.to_string();

        let (step, assignee) = self
            .store
            .transaction(move |tx| -> Result<(SessionStep, String)> {
                let (snapshot, mut step) = load_step(tx, &ssid)?;
                require_participant(&snapshot, &actor)?;
                let assignee = match AccessResolver::new(&snapshot)
                    .completion_check(&actor, &step.step_id)
                {
                    CompletionCheck::UnknownStep => {
                        return Err(EngineError::not_found("step", &step.step_id));
                    }
                    CompletionCheck::AlreadyCompleted => {
                        return Err(EngineError::Conflict(format!(
                            "step {ssid} is already completed"
                        )));
                    }
                    CompletionCheck::ProofMissing => return Err(EngineError::ProofRequired),
                    CompletionCheck::NotOnActiveLane => {
                        return Err(EngineError::Forbidden(format!(
                            "step {ssid} is not on an active lane of {actor}"
                        )));
                    }
                    CompletionCheck::Allowed { assignee } => assignee,
                };

                let at = now_ms();
                if !steps::mark_completed(tx, &ssid, &actor, at)? {
                    return Err(EngineError::Conflict(format!(
                        "step {ssid} was completed concurrently"
                    )));
                }
                step.is_completed = true;
                step.completed_by = Some(actor);
                step.completed_at_ms = Some(at);
                Ok((step, assignee))
            })
            .await?;

        tracing::info!(
            session_id = %step.session_id,
            session_step_id,
            completed_by = ?step.completed_by,
            lane = %assignee,
            "step completed"
        );
        self.notify(&step.session_id, ChangeKind::StepCompleted);
        Ok(step)
    }

    /// Edit the text of a step and return the content this session now shows.
    ///
    /// `ContentTarget::Template` changes the shared template step, so every
    /// session launched from that template is notified.
    pub async fn edit_step_content(
        &self,
        actor: &str,
        session_step_id: &str,
        fields: ContentPatch,
        target: ContentTarget,
    ) -> Result<StepContent> {
        if fields.is_empty() {
            return Err(EngineError::Validation("no fields to edit".to_string()));
        }
        if fields.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(EngineError::Validation("step name must not be empty".to_string()));
        }
        let actor = actor.to_string();
        let ssid = session_step_id.to_string();

        let (content, affected) = self
            .store
            .transaction(move |tx| -> Result<(StepContent, Vec<String>)> {
                let (snapshot, mut step) = load_step(tx, &ssid)?;
                require(&snapshot, &actor, Capability::EditSteps)?;

                let affected = match target {
                    ContentTarget::Template => {
                        if !templates::update_template_step_content(tx, &step.step_id, &fields)? {
                            return Err(EngineError::not_found("step", &step.step_id));
                        }
                        templates::sessions_using_template(tx, &snapshot.session.template_id)?
                    }
                    ContentTarget::Session => {
                        step.overrides.merge(&fields);
                        steps::update_overrides(tx, &ssid, &step.overrides)?;
                        vec![snapshot.session.id.clone()]
                    }
                };

                let template_step = templates::get_template_step(tx, &step.step_id)?
                    .ok_or_else(|| EngineError::not_found("step", &step.step_id))?;
                let mut content = template_step.content;
                step.overrides.apply_to(&mut content);
                Ok((content, affected))
            })
            .await?;

        tracing::info!(session_step_id, ?target, sessions = affected.len(), "step content edited");
        for session_id in &affected {
            self.notify(session_id, ChangeKind::StepContent);
        }
        Ok(content)
    }

    pub async fn set_proof_config(
        &self,
        actor: &str,
        session_step_id: &str,
        required: bool,
        instructions: Option<String>,
    ) -> Result<ProofState> {
        let actor = actor.to_string();
        let ssid = session_step_id.to_string();

        let (session_id, proof) = self
            .store
            .transaction(move |tx| -> Result<(String, ProofState)> {
                let (snapshot, mut step) = load_step(tx, &ssid)?;
                require(&snapshot, &actor, Capability::EditProof)?;
                step.proof.required = required;
                step.proof.instructions = instructions.filter(|i| !i.trim().is_empty());
                steps::update_proof(tx, &ssid, &step.proof)?;
                Ok((step.session_id, step.proof))
            })
            .await?;

        tracing::info!(session_id = %session_id, session_step_id, required, "proof config set");
        self.notify(&session_id, ChangeKind::Proof);
        Ok(proof)
    }

    /// Store text proof. Any stored file is kept alongside it.
    pub async fn submit_proof(
        &self,
        actor: &str,
        session_step_id: &str,
        content: &str,
    ) -> Result<ProofState> {
        if content.trim().is_empty() {
            return Err(EngineError::Validation("proof content must not be empty".to_string()));
        }
        let actor = actor.to_string();
        let ssid = session_step_id.to_string();
        let content = content.to_string();

        let (session_id, proof) = self
            .store
            .transaction(move |tx| -> Result<(String, ProofState)> {
                let (snapshot, mut step) = load_step(tx, &ssid)?;
                require(&snapshot, &actor, Capability::EditProof)?;
                step.proof.content = Some(content);
                step.proof.submitted_by = Some(actor);
                step.proof.submitted_at_ms = Some(now_ms());
                steps::update_proof(tx, &ssid, &step.proof)?;
                Ok((step.session_id, step.proof))
            })
            .await?;

        tracing::info!(session_id = %session_id, session_step_id, "proof submitted");
        self.notify(&session_id, ChangeKind::Proof);
        Ok(proof)
    }

    /// Store a proof file. The blob is written before the transaction and
    /// removed again if the transaction fails; a replaced blob is removed
    /// after commit.
    pub async fn upload_proof(
        &self,
        actor: &str,
        session_step_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<ProofState> {
        if bytes.is_empty() {
            return Err(EngineError::Validation("proof file is empty".to_string()));
        }
        if bytes.len() > self.limits.max_proof_bytes {
            return Err(EngineError::Validation(format!(
                "proof file is {} bytes, the limit is {}",
                bytes.len(),
                self.limits.max_proof_bytes
            )));
        }
        let file_name = file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(EngineError::Validation("file name must not be empty".to_string()));
        }

        let reference = self.with_blobs(move |blobs| blobs.put(&bytes)).await?;

        let actor = actor.to_string();
        let ssid = session_step_id.to_string();
        let new_ref = reference.clone();
        let result = self
            .store
            .transaction(move |tx| -> Result<(String, ProofState, Option<String>)> {
                let (snapshot, mut step) = load_step(tx, &ssid)?;
                require(&snapshot, &actor, Capability::EditProof)?;
                let replaced = step.proof.file_ref.replace(new_ref);
                step.proof.file_name = Some(file_name);
                step.proof.submitted_by = Some(actor);
                step.proof.submitted_at_ms = Some(now_ms());
                steps::update_proof(tx, &ssid, &step.proof)?;
                Ok((step.session_id, step.proof, replaced))
            })
            .await;

        let (session_id, proof, replaced) = match result {
            Ok(out) => out,
            Err(e) => {
                self.discard_blobs(vec![reference]).await;
                return Err(e);
            }
        };

        tracing::info!(session_id = %session_id, session_step_id, reference = %reference, "proof file uploaded");
        self.notify(&session_id, ChangeKind::Proof);
        self.discard_blobs(replaced.into_iter().collect()).await;
        Ok(proof)
    }

    /// Clear submitted proof, text and file alike. Configuration stays.
    pub async fn delete_proof(&self, actor: &str, session_step_id: &str) -> Result<ProofState> {
        let actor = actor.to_string();
        let ssid = session_step_id.to_string();

        let (session_id, proof, old_ref) = self
            .store
            .transaction(move |tx| -> Result<(String, ProofState, Option<String>)> {
                let (snapshot, mut step) = load_step(tx, &ssid)?;
                require(&snapshot, &actor, Capability::EditProof)?;
                if step.proof.content.is_none() && step.proof.file_ref.is_none() {
                    return Err(EngineError::not_found("proof for step", &ssid));
                }
                let old_ref = step.proof.file_ref.take();
                step.proof.content = None;
                step.proof.file_name = None;
                step.proof.submitted_by = None;
                step.proof.submitted_at_ms = None;
                steps::update_proof(tx, &ssid, &step.proof)?;
                Ok((step.session_id, step.proof, old_ref))
            })
            .await?;

        tracing::info!(session_id = %session_id, session_step_id, "proof deleted");
        self.notify(&session_id, ChangeKind::Proof);
        self.discard_blobs(old_ref.into_iter().collect()).await;
        Ok(proof)
    }

    /// A time-limited download URL for the step's proof file.
    pub async fn proof_url(&self, actor: &str, session_step_id: &str) -> Result<protocol::ProofUrl> {
        let actor = actor.to_string();
        let ssid = session_step_id.to_string();

        let (reference, file_name) = self
            .store
            .read(move |conn| -> Result<(String, Option<String>)> {
                let (snapshot, step) = load_step(conn, &ssid)?;
                require_participant(&snapshot, &actor)?;
                let administers = snapshot.can(&actor, Capability::EditSteps)
                    || snapshot.can(&actor, Capability::ManageAssignments);
                if !administers && !AccessResolver::new(&snapshot).is_visible(&actor, &step.step_id)
                {
                    return Err(EngineError::Forbidden(format!(
                        "step {ssid} is not visible to {actor}"
                    )));
                }
                let reference = step
                    .proof
                    .file_ref
                    .ok_or_else(|| EngineError::not_found("proof file for step", &ssid))?;
                Ok((reference, step.proof.file_name))
            })
            .await?;

        let ttl = self.limits.proof_url_ttl;
        let signed = self.with_blobs(move |blobs| blobs.url(&reference, ttl)).await?;
        Ok(protocol::ProofUrl {
            url: signed.url,
            file_name,
            expires_at_ms: signed.expires_at_ms,
        })
    }
}

/// Resolve a session step id to its session snapshot and step row.
fn load_step(conn: &Connection, session_step_id: &str) -> Result<(SessionSnapshot, SessionStep)> {
    let session_id = steps::session_of_step(conn, session_step_id)?
        .ok_or_else(|| EngineError::not_found("session step", session_step_id))?;
    let snapshot = load_snapshot(conn, &session_id)?;
    let step = snapshot
        .session_step(session_step_id)
        .cloned()
        .ok_or_else(|| EngineError::not_found("session step", session_step_id))?;
    Ok((snapshot, step))
}
