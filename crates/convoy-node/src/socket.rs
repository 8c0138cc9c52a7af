use crate::handler::{NodeState, RequestContext, RoutedEvent, dispatch};
use crate::session::{Gate, Session};
use anyhow::{Context, Result};
use convoy::codec::{JsonLinesCodec, Record};
use convoy::protocol::{Envelope, ErrorCode, Response};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Records buffered between a connection's reader and its dispatch loop.
const RECORD_QUEUE: usize = 32;

/// Start the Unix socket server. Accepts connections until the daemon's
/// shutdown token fires.
pub async fn serve(state: Arc<NodeState>, socket_path: &Path) -> Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    // Remove stale socket
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }

    tracing::info!(path = %socket_path.display(), "Unix socket listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(state, stream).await {
                tracing::debug!(err = %e, "client disconnected");
            }
        });
    }
    tracing::info!("socket server stopped");
    Ok(())
}

enum Flow {
    Continue(Response),
    Close(Response),
}

async fn handle_client(state: Arc<NodeState>, stream: tokio::net::UnixStream) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut session = Session::new(state.next_connection_id());
    let cancel = state.shutdown.child_token();
    let idle_timeout = state.settings().await.idle_timeout;

    let (record_tx, record_rx) = mpsc::channel(RECORD_QUEUE);
    let reader = tokio::spawn(read_records(
        r,
        record_tx,
        idle_timeout,
        cancel.clone(),
        session.connection_id(),
    ));
    tracing::debug!(conn = session.connection_id(), "client connected");

    let result = run_connection(&state, &mut session, &cancel, record_rx, w).await;

    // Aborts any collaborator call still running for this connection.
    cancel.cancel();
    reader.abort();
    if let Some(account) = session.account() {
        state.close_session(account).await;
    }
    result
}

/// Read framed records into the queue. Ends the connection on EOF, read
/// error or idle timeout.
async fn read_records(
    r: OwnedReadHalf,
    tx: mpsc::Sender<Record>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
    conn: u64,
) {
    let mut reader = FramedRead::new(r, JsonLinesCodec::new());
    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::info!(conn, "closing idle connection");
                    break;
                }
            },
            None => reader.next().await,
        };
        match next {
            Some(Ok(record)) => {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(conn, err = %e, "read failed");
                break;
            }
            None => break,
        }
    }
    cancel.cancel();
}

async fn run_connection(
    state: &Arc<NodeState>,
    session: &mut Session,
    cancel: &CancellationToken,
    mut records: mpsc::Receiver<Record>,
    w: OwnedWriteHalf,
) -> Result<()> {
    let mut writer = FramedWrite::new(w, JsonLinesCodec::new());
    // Subscribed once the session is bound to an account.
    let mut events: Option<broadcast::Receiver<RoutedEvent>> = None;

    loop {
        tokio::select! {
            biased;

            record = records.recv() => {
                let Some(record) = record else { break };
                let flow = process_record(state, session, cancel, record).await;
                // Subscribe before auth_ok goes out so no event is missed.
                if events.is_none() && session.is_authenticated() {
                    events = Some(state.event_tx.subscribe());
                }
                match flow {
                    Flow::Continue(resp) => writer.send(resp).await?,
                    Flow::Close(resp) => {
                        writer.send(resp).await?;
                        break;
                    }
                }
            }
            event = next_event(&mut events) => match event {
                Ok(routed) => {
                    if session.account().is_some_and(|a| routed.is_for(a)) {
                        writer.send(Response::Event { event: routed.event }).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(conn = session.connection_id(), skipped = n, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<RoutedEvent>>,
) -> Result<RoutedEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn process_record(
    state: &Arc<NodeState>,
    session: &mut Session,
    cancel: &CancellationToken,
    record: Record,
) -> Flow {
    let value = match record {
        Record::Json(value) => value,
        Record::Malformed(reason) => {
            return Flow::Continue(protocol_error(state, session, None, reason).await);
        }
    };

    let envelope = match Envelope::from_value(value) {
        Ok(envelope) => envelope,
        Err(violation) => {
            return Flow::Continue(
                protocol_error(state, session, violation.request_id, violation.message).await,
            );
        }
    };
    let request_id = envelope.request_id;

    let settings = state.settings().await;
    match session.admit(envelope.request, &settings.accounts) {
        Gate::Reply(resp) => {
            if let Some(account) = session.account() {
                state.health.lock().await.mark_active(account);
            }
            Flow::Continue(resp.with_request_id(request_id))
        }
        Gate::Close(resp) => Flow::Close(resp.with_request_id(request_id)),
        Gate::Authenticated(account) => {
            state.open_session(&account).await;
            Flow::Continue(Response::AuthOk {
                request_id,
                account,
            })
        }
        Gate::Dispatch { account, request } => {
            let ctx = RequestContext::new(account, cancel.clone());
            Flow::Continue(
                dispatch(state, &ctx, request)
                    .await
                    .with_request_id(request_id),
            )
        }
    }
}

async fn protocol_error(
    state: &NodeState,
    session: &Session,
    request_id: Option<String>,
    message: String,
) -> Response {
    tracing::debug!(conn = session.connection_id(), reason = %message, "protocol error");
    if let Some(account) = session.account() {
        state.note_error(account).await;
    }
    Response::error(ErrorCode::ProtocolError, message).with_request_id(request_id)
}
