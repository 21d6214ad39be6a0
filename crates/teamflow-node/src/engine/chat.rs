use super::{SessionEngine, load_snapshot, require, require_participant};
use crate::error::{EngineError, Result};
use teamflow::protocol::{ChangeKind, ReadResult};
use teamflow_core::model::{Capability, ChatMessage, MAX_MESSAGE_CHARS};
use teamflow_core::now_ms;
use teamflow_store::{chat, new_id};

impl SessionEngine {
    pub async fn send_message(
        &self,
        actor: &str,
        session_id: &str,
        content: &str,
    ) -> Result<ChatMessage> {
        if content.trim().is_empty() {
            return Err(EngineError::Validation("message must not be empty".to_string()));
        }
        let chars = content.chars().count();
        if chars > MAX_MESSAGE_CHARS {
            return Err(EngineError::Validation(format!(
                "message is {chars} characters, the limit is {MAX_MESSAGE_CHARS}"
            )));
        }
        let actor = actor.to_string();
        let sid = session_id.to_string();
        let content = content.to_string();

        let message = self
            .store
            .transaction(move |tx| -> Result<ChatMessage> {
                let snapshot = load_snapshot(tx, &sid)?;
                require(&snapshot, &actor, Capability::Chat)?;
                let message = ChatMessage {
                    id: new_id(),
                    session_id: sid,
                    author_user_id: actor,
                    content,
                    created_at_ms: now_ms(),
                };
                chat::insert_message(tx, &message)?;
                Ok(message)
            })
            .await?;

        tracing::info!(session_id, message_id = %message.id, author = %message.author_user_id, "message sent");
        self.notify(session_id, ChangeKind::Chat);
        Ok(message)
    }

    /// Record read receipts. Repeated reads and ids from other sessions are
    /// ignored; subscribers hear about it only when something new was stored.
    pub async fn mark_read(
        &self,
        actor: &str,
        session_id: &str,
        message_ids: Vec<String>,
    ) -> Result<ReadResult> {
        let reader = actor.to_string();
        let sid = session_id.to_string();

        let marked = self
            .store
            .transaction(move |tx| -> Result<usize> {
                let snapshot = load_snapshot(tx, &sid)?;
                require_participant(&snapshot, &reader)?;
                let at = now_ms();
                let mut marked = 0;
                for id in &message_ids {
                    if chat::mark_read(tx, &sid, id, &reader, at)? {
                        marked += 1;
                    }
                }
                Ok(marked)
            })
            .await?;

        if marked > 0 {
            tracing::debug!(session_id, user_id = actor, marked, "messages marked read");
            self.notify(session_id, ChangeKind::ReadReceipts);
        }
        Ok(ReadResult { marked })
    }

    /// Delete a message. Allowed to its author and the session owner.
    pub async fn delete_message(&self, actor: &str, message_id: &str) -> Result<()> {
        let actor = actor.to_string();
        let id = message_id.to_string();

        let session_id = self
            .store
            .transaction(move |tx| -> Result<String> {
                let message = chat::get_message(tx, &id)?
                    .ok_or_else(|| EngineError::not_found("message", &id))?;
                let snapshot = load_snapshot(tx, &message.session_id)?;
                require_participant(&snapshot, &actor)?;
                if message.author_user_id != actor && !snapshot.is_owner(&actor) {
                    return Err(EngineError::Forbidden(format!(
                        "{actor} may not delete message {id}"
                    )));
                }
                chat::delete_message(tx, &id)?;
                Ok(message.session_id)
            })
            .await?;

        tracing::info!(session_id = %session_id, message_id, "message deleted");
        self.notify(&session_id, ChangeKind::Chat);
        Ok(())
    }
}
