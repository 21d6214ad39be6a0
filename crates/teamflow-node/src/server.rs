use crate::blob::FsBlobStore;
use crate::bus::{ConnId, RealtimeBus};
use crate::config::NodeConfig;
use crate::engine::{EngineLimits, SessionEngine};
use crate::handler::{ClientConn, ServerState, error_response, handle_request};
use crate::identity::StaticTokens;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use teamflow::protocol::{ErrorCode, MAX_LINE_BYTES, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Open the store and blob directory under `config.data_dir` and wire up
/// the engine, bus and token table.
pub fn build_state(config: &NodeConfig) -> Result<Arc<ServerState>> {
    let store = teamflow_store::SessionStore::open(&config.data_dir)
        .with_context(|| format!("failed to open store in {}", config.data_dir.display()))?;
    let blobs = FsBlobStore::open(&config.blob_dir(), &config.blob_base_url, &config.signing_key()?)
        .context("failed to open blob directory")?;
    let tokens = StaticTokens::new(
        config
            .users
            .iter()
            .map(|u| (u.user_id.clone(), u.token_sha256.clone())),
    );
    if tokens.is_empty() {
        tracing::warn!("no users configured; every Authenticate will be rejected");
    }
    let limits = EngineLimits {
        max_proof_bytes: config.max_proof_bytes,
        proof_url_ttl: Duration::from_secs(config.proof_url_ttl_secs),
    };
    let engine = SessionEngine::new(store, Arc::new(RealtimeBus::new()), Arc::new(blobs), limits);
    Ok(ServerState::new(engine, Arc::new(tokens), config.subscriber_queue))
}

/// Accept client connections and process requests until the listener fails.
pub async fn serve(state: Arc<ServerState>, listener: TcpListener) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "session server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let conn_id = state.next_conn_id();
            tracing::debug!(conn = conn_id, %peer, "client connected");
            if let Err(e) = handle_client(&state, conn_id, stream).await {
                tracing::debug!(conn = conn_id, err = %e, "client disconnected");
            }
            state.bus().disconnect(conn_id);
        });
    }
}

async fn handle_client(state: &Arc<ServerState>, conn_id: ConnId, stream: TcpStream) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let hello = Response::Hello {
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    writer.send(serde_json::to_string(&hello)?).await?;

    // Events reach this queue once the connection authenticates and subscribes.
    let (event_tx, mut event_rx) = mpsc::channel(state.subscriber_queue);
    let mut conn = ClientConn::new(conn_id, event_tx);

    loop {
        tokio::select! {
            line = reader.next() => {
                let Some(line) = line else { break };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let resp = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => handle_request(state, &mut conn, req).await,
                    Err(e) => {
                        tracing::debug!(conn = conn_id, err = %e, "malformed request");
                        error_response(ErrorCode::InvalidRequest, &format!("invalid request: {e}"))
                    }
                };
                writer.send(serde_json::to_string(&resp)?).await?;
            }
            Some(event) = event_rx.recv() => {
                let resp = Response::Event { event };
                writer.send(serde_json::to_string(&resp)?).await?;
            }
        }
    }

    Ok(())
}
