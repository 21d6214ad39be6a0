use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use teamflow_node::config::{NodeConfig, UserEntry};
use teamflow_node::handler::ServerState;
use teamflow_node::identity::token_digest;
use teamflow_node::server;
use tokio::sync::oneshot;

/// A session server on an ephemeral port with a throwaway data directory.
pub struct TestNode {
    pub state: Arc<ServerState>,
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _data_dir: TempDir,
}

impl TestNode {
    /// Spawn a node that accepts `token_for(user)` for each of `users`.
    pub async fn spawn(users: &[&str]) -> Result<Self> {
        let data_dir = TempDir::new()?;
        let config = NodeConfig {
            listen: "127.0.0.1:0".to_string(),
            data_dir: data_dir.path().to_path_buf(),
            subscriber_queue: 16,
            url_signing_key: Some("746573742d6b6579".to_string()),
            users: users
                .iter()
                .map(|user| UserEntry {
                    user_id: user.to_string(),
                    token_sha256: token_digest(&token_for(user)),
                })
                .collect(),
            ..NodeConfig::default()
        };

        let state = server::build_state(&config)?;
        let listener = tokio::net::TcpListener::bind(&config.listen).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state_for_server = state.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = server::serve(state_for_server, listener) => {
                    if let Err(e) = result {
                        tracing::debug!(err = %e, "server stopped");
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("node shutdown signal received");
                }
            }
        });

        Ok(Self {
            state,
            addr,
            shutdown_tx: Some(shutdown_tx),
            _data_dir: data_dir,
        })
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The bearer token a test node accepts for `user`.
pub fn token_for(user: &str) -> String {
    format!("token-{user}")
}
