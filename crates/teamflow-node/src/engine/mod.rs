//! Session engine.
//!
//! Every mutation follows the same shape: load a snapshot inside one store
//! transaction, authorize against it, write, commit, and only then tell the
//! bus. A rejected operation returns before commit, so it leaves nothing
//! behind and notifies nobody.

pub mod assignments;
pub mod chat;
pub mod members;
pub mod sessions;
pub mod steps;

use crate::blob::{BlobError, BlobStore};
use crate::bus::{ConnId, RealtimeBus};
use crate::error::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;
use teamflow::protocol::{ChangeKind, Event};
use teamflow_core::SessionSnapshot;
use teamflow_core::model::Capability;
use teamflow_store::rusqlite::Connection;
use teamflow_store::{SessionStore, StoreError};

/// Size and lifetime limits applied by the engine.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    pub max_proof_bytes: usize,
    pub proof_url_ttl: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_proof_bytes: 4 * 1024 * 1024,
            proof_url_ttl: Duration::from_secs(300),
        }
    }
}

/// Orchestrates session mutations. Cheap to clone.
#[derive(Clone)]
pub struct SessionEngine {
    store: SessionStore,
    bus: Arc<RealtimeBus>,
    blobs: Arc<dyn BlobStore>,
    limits: EngineLimits,
}

impl SessionEngine {
    pub fn new(
        store: SessionStore,
        bus: Arc<RealtimeBus>,
        blobs: Arc<dyn BlobStore>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            store,
            bus,
            blobs,
            limits,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn bus(&self) -> &Arc<RealtimeBus> {
        &self.bus
    }

    /// Register `conn` as a subscriber of `session_id`.
    ///
    /// `bound_user` is the identity the connection authenticated as;
    /// `claimed_user` is what the client asked to subscribe as. They must
    /// match, and the user must be the owner or a member.
    pub async fn subscribe(
        &self,
        conn: ConnId,
        bound_user: Option<&str>,
        session_id: &str,
        claimed_user: &str,
    ) -> Result<()> {
        let Some(bound_user) = bound_user else {
            return Err(EngineError::Unauthenticated);
        };
        if bound_user != claimed_user {
            tracing::warn!(conn, bound_user, claimed_user, "subscribe identity mismatch");
            return Err(EngineError::Forbidden(
                "claimed user does not match the authenticated identity".to_string(),
            ));
        }

        let sid = session_id.to_string();
        let user = bound_user.to_string();
        let (exists, participant) = self
            .store
            .read(move |conn| -> Result<(bool, bool)> {
                let exists = teamflow_store::sessions::get_session(conn, &sid)?.is_some();
                let participant =
                    exists && teamflow_store::sessions::is_participant(conn, &sid, &user)?;
                Ok((exists, participant))
            })
            .await?;
        if !exists {
            return Err(EngineError::not_found("session", session_id));
        }
        if !participant {
            return Err(EngineError::Forbidden(format!(
                "{bound_user} is not a participant of session {session_id}"
            )));
        }
        if !self.bus.subscribe(conn, session_id) {
            return Err(EngineError::Unauthenticated);
        }
        tracing::debug!(conn, session_id, user_id = bound_user, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, conn: ConnId, session_id: &str) {
        self.bus.unsubscribe(conn, session_id);
    }

    /// Tell subscribers that `session_id` changed. Call only after commit.
    fn notify(&self, session_id: &str, change: ChangeKind) {
        let delivered = self.bus.broadcast(
            session_id,
            Event::SessionChanged {
                session_id: session_id.to_string(),
                change,
            },
        );
        tracing::debug!(session_id, ?change, delivered, "session change broadcast");
    }

    /// Run a blob store call on a blocking thread.
    async fn with_blobs<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BlobStore) -> std::result::Result<T, BlobError> + Send + 'static,
    {
        let blobs = self.blobs.clone();
        let out = tokio::task::spawn_blocking(move || f(blobs.as_ref()))
            .await
            .map_err(|e| EngineError::Storage(StoreError::Task(e.to_string())))??;
        Ok(out)
    }

    /// Best-effort removal of blobs no longer referenced by any proof.
    async fn discard_blobs(&self, references: Vec<String>) {
        if references.is_empty() {
            return;
        }
        let result = self
            .with_blobs(move |blobs| {
                for reference in &references {
                    if let Err(e) = blobs.delete(reference) {
                        tracing::warn!(reference = %reference, err = %e, "failed to delete blob");
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(err = %e, "blob cleanup task failed");
        }
    }
}

// ---- Shared helpers for transaction closures ----

fn load_snapshot(conn: &Connection, session_id: &str) -> Result<SessionSnapshot> {
    teamflow_store::sessions::load_snapshot(conn, session_id)?
        .ok_or_else(|| EngineError::not_found("session", session_id))
}

fn require_participant(snapshot: &SessionSnapshot, actor: &str) -> Result<()> {
    if snapshot.is_participant(actor) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!(
            "{actor} is not a participant of session {}",
            snapshot.session.id
        )))
    }
}

fn require(snapshot: &SessionSnapshot, actor: &str, cap: Capability) -> Result<()> {
    require_participant(snapshot, actor)?;
    if snapshot.can(actor, cap) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!("{actor} lacks the {cap} capability")))
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
