//! Durable session state.
//!
//! One SQLite connection guarded by a `std::sync::Mutex`. Every call runs on
//! a blocking thread via `spawn_blocking`, and every mutation runs inside a
//! single transaction so a failed operation leaves no partial writes.

pub mod assignments;
pub mod chat;
mod schema;
pub mod sessions;
pub mod steps;
pub mod templates;

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

pub use rusqlite;

const DB_FILE: &str = "teamflow.db";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Fresh random identifier for a stored row.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) `teamflow.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        tracing::info!(path = %db_path.display(), "session store opened");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL for concurrent readers; foreign keys drive session cascades.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    /// Run `f` inside one transaction on a blocking thread.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls it
    /// back. `E` is the caller's error type so domain checks can fail the
    /// transaction with domain errors.
    pub async fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let tx = conn.transaction().map_err(StoreError::from)?;
            let out = f(&tx)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(out)
        })
        .await
        .map_err(|e| E::from(StoreError::Task(e.to_string())))?
    }

    /// Run a read-only closure on a blocking thread.
    pub async fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&Connection) -> std::result::Result<T, E> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| E::from(StoreError::Task(e.to_string())))?
    }
}

/// Stored timestamps are signed 64-bit milliseconds.
pub(crate) fn to_sql_ms(ms: u64) -> i64 {
    ms as i64
}

pub(crate) fn from_sql_ms(ms: i64) -> u64 {
    ms.max(0) as u64
}

pub(crate) fn now_sql() -> i64 {
    to_sql_ms(teamflow_core::now_ms())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use teamflow_core::model::{
        CompositeTemplate, ProofConfig, Session, StepContent, TemplateStep,
    };

    pub fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    pub fn template(id: &str, owner: &str, steps: &[&str]) -> CompositeTemplate {
        CompositeTemplate {
            id: id.into(),
            owner_id: owner.into(),
            name: format!("template {id}"),
            created_at_ms: 1,
            steps: steps
                .iter()
                .enumerate()
                .map(|(i, s)| TemplateStep {
                    id: s.to_string(),
                    template_id: id.into(),
                    position: i as u32,
                    content: StepContent {
                        name: format!("step {s}"),
                        ..StepContent::default()
                    },
                    proof: ProofConfig::default(),
                })
                .collect(),
        }
    }

    pub fn session(id: &str, template_id: &str, owner: &str) -> Session {
        Session {
            id: id.into(),
            template_id: template_id.into(),
            owner_id: owner.into(),
            name: format!("session {id}"),
            created_at_ms: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Store(#[from] StoreError),
        #[error("rejected")]
        Rejected,
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let store = SessionStore::open_in_memory().unwrap();
        let result: std::result::Result<(), TestError> = store
            .transaction(|tx| {
                templates::insert_template(tx, &test_support::template("t1", "o", &["a"]))?;
                Err(TestError::Rejected)
            })
            .await;
        assert!(matches!(result, Err(TestError::Rejected)));

        let found = store
            .read(|conn| templates::get_template(conn, "t1"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn committed_transaction_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::open(dir.path()).unwrap();
            store
                .transaction(|tx| {
                    templates::insert_template(tx, &test_support::template("t1", "o", &["a"]))
                })
                .await
                .unwrap();
        }
        let store = SessionStore::open(dir.path()).unwrap();
        let found = store
            .read(|conn| templates::get_template(conn, "t1"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().steps.len(), 1);
    }
}
