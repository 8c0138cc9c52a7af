use crate::codec::{JsonLinesCodec, Record};
use crate::protocol::{Envelope, Event, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Client for the convoy daemon's Unix socket API.
///
/// Requests are tagged with an increasing `requestId`; replies are matched on
/// it. Events pushed while waiting for a reply are buffered and can be
/// drained with [`ConvoyClient::take_events`].
pub struct ConvoyClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, JsonLinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, JsonLinesCodec>,
    next_id: u64,
    events: VecDeque<Event>,
    account: Option<String>,
}

impl ConvoyClient {
    /// Connect to the daemon at the given socket path. The connection is not
    /// authenticated yet.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, JsonLinesCodec::new()),
            writer: FramedWrite::new(w, JsonLinesCodec::new()),
            next_id: 0,
            events: VecDeque::new(),
            account: None,
        })
    }

    /// Connect and authenticate as `account`.
    pub async fn connect_as(socket_path: &Path, account: &str, token: &str) -> Result<Self> {
        let mut client = Self::connect(socket_path).await?;
        client.authenticate(account, token).await?;
        Ok(client)
    }

    /// The account this connection is bound to, once authenticated.
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub async fn authenticate(&mut self, account: &str, token: &str) -> Result<()> {
        let resp = self
            .call(Request::Auth {
                account: account.to_string(),
                token: token.to_string(),
            })
            .await?;
        match resp {
            Response::AuthOk { account, .. } => {
                self.account = Some(account);
                Ok(())
            }
            Response::Error { code, error, .. } => bail!("auth rejected ({code}): {error}"),
            other => Err(anyhow!("expected auth_ok, got {other:?}")),
        }
    }

    /// Send a request with a fresh request id and return the id.
    pub async fn send(&mut self, req: Request) -> Result<String> {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);
        let value = Envelope::new(req).with_request_id(id.clone()).to_value()?;
        self.writer.send(value).await?;
        Ok(id)
    }

    /// Write an arbitrary JSON line. Useful for probing schema validation.
    pub async fn send_raw(&mut self, value: serde_json::Value) -> Result<()> {
        self.writer.send(value).await?;
        Ok(())
    }

    /// Read the next response or event from the daemon.
    pub async fn next_response(&mut self) -> Result<Response> {
        loop {
            let Some(record) = self.reader.next().await else {
                bail!("daemon disconnected");
            };
            match record? {
                Record::Json(value) => return Ok(serde_json::from_value(value)?),
                Record::Malformed(reason) => {
                    tracing::warn!(reason = %reason, "skipping malformed frame from daemon");
                }
            }
        }
    }

    /// Send a request and wait for the reply carrying its request id.
    pub async fn call(&mut self, req: Request) -> Result<Response> {
        let id = self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Event { event } => self.events.push_back(event),
                resp if resp.request_id() == Some(id.as_str()) => return Ok(resp),
                resp if resp.request_id().is_none() => return Ok(resp),
                other => {
                    tracing::debug!(?other, "dropping reply for another request");
                }
            }
        }
    }

    /// Send a request and return its data, turning error replies into `Err`.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        match self.call(req).await? {
            Response::Result { data, .. } => Ok(data),
            Response::Error { code, error, .. } => bail!("{code}: {error}"),
            Response::Pong { .. } => Ok(None),
            other => Err(anyhow!("unexpected reply {other:?}")),
        }
    }

    /// Events received so far while waiting for replies.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Wait for the next pushed event, returning buffered ones first.
    pub async fn next_event(&mut self) -> Result<Event> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            if let Response::Event { event } = self.next_response().await? {
                return Ok(event);
            }
        }
    }
}

/// Discover the default socket path.
///
/// Checks `$CONVOY_SOCKET` env, then falls back to
/// `$XDG_RUNTIME_DIR/convoy/convoy.sock` or `/tmp/convoy-$UID/convoy.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("CONVOY_SOCKET") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("convoy").join("convoy.sock");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/convoy-{uid}/convoy.sock"))
}
