use crate::protocol::{AuthInfo, ErrorCode, MAX_LINE_BYTES, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// A request the server answered with `Response::Error`.
///
/// Returned inside `anyhow::Error`; callers that care about the code
/// downcast to it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

/// Client for the teamflow session server.
pub struct TeamflowClient {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    version: String,
    user_id: Option<String>,
}

impl TeamflowClient {
    /// Connect to the server at `addr` and wait for its Hello.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true).ok();
        let (r, w) = stream.into_split();
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut client = Self {
            reader,
            writer,
            version: String::new(),
            user_id: None,
        };

        match client.next_response().await? {
            Response::Hello { version } => {
                client.version = version;
                Ok(client)
            }
            other => Err(anyhow!("expected Hello, got {other:?}")),
        }
    }

    /// Connect and authenticate in one step.
    pub async fn connect_as(addr: &str, token: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.authenticate(token).await?;
        Ok(client)
    }

    /// Server version from the Hello handshake.
    pub fn server_version(&self) -> &str {
        &self.version
    }

    /// The user bound by a successful `authenticate`.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Bind this connection to the user owning `token`.
    pub async fn authenticate(&mut self, token: &str) -> Result<String> {
        let data = self
            .request(Request::Authenticate {
                token: token.to_string(),
            })
            .await?
            .context("authenticate returned no data")?;
        let info: AuthInfo = serde_json::from_value(data)?;
        self.user_id = Some(info.user_id.clone());
        Ok(info.user_id)
    }

    /// Send a request to the server.
    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Read the next frame from the server.
    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("server disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send a request and wait for the Ok/Error response, skipping events.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Hello { .. } | Response::Event { .. } => continue,
                Response::Ok { data } => return Ok(data),
                Response::Error { code, message } => {
                    return Err(RequestError { code, message }.into());
                }
            }
        }
    }

    /// Send a request and decode its data as `T`.
    pub async fn request_as<T: serde::de::DeserializeOwned>(&mut self, req: Request) -> Result<T> {
        let data = self.request(req).await?.context("response carried no data")?;
        Ok(serde_json::from_value(data)?)
    }

    /// Split into independent reader and writer halves.
    ///
    /// Use this to poll for events in a `select!` loop while still sending
    /// requests. The reader yields every frame, events included.
    pub fn into_split(self) -> (TeamflowWriter, TeamflowReader) {
        (
            TeamflowWriter {
                writer: self.writer,
            },
            TeamflowReader {
                reader: self.reader,
            },
        )
    }
}

/// Write half of a split [`TeamflowClient`].
pub struct TeamflowWriter {
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl TeamflowWriter {
    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }
}

/// Read half of a split [`TeamflowClient`].
pub struct TeamflowReader {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
}

impl TeamflowReader {
    /// Read the next frame. Returns `None` if the server disconnected.
    pub async fn next(&mut self) -> Option<Result<Response>> {
        let line = self.reader.next().await?;
        Some(
            line.map_err(Into::into)
                .and_then(|l| serde_json::from_str(&l).map_err(Into::into)),
        )
    }
}

/// Error code of a failed request, if the failure came from the server.
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<RequestError>().map(|e| e.code)
}

/// Resolve the server address: `$TEAMFLOW_ADDR`, then the default.
pub fn default_addr() -> String {
    std::env::var("TEAMFLOW_ADDR").unwrap_or_else(|_| crate::DEFAULT_ADDR.to_string())
}
