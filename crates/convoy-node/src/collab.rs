//! External collaborators: council, workflow engine, knowledge search,
//! session sharing, analytics and retrospectives.
//!
//! The daemon forwards the request's `params` verbatim and returns whatever
//! the collaborator answers. Every call is bounded by a deadline and by the
//! calling connection's cancellation token.

use async_trait::async_trait;
use convoy::codec::{JsonLinesCodec, Record};
use convoy::protocol::{ErrorCode, Request};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{service} did not answer within {timeout_ms} ms")]
    Timeout { service: String, timeout_ms: u128 },

    #[error("{0} is not available")]
    Unavailable(String),

    #[error("{service} failed: {message}")]
    Failed { service: String, message: String },

    #[error("request cancelled")]
    Cancelled,
}

impl CollaboratorError {
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        let code = match self {
            CollaboratorError::Timeout { .. } => ErrorCode::CollaboratorTimeout,
            CollaboratorError::Unavailable(_) => ErrorCode::CollaboratorUnavailable,
            CollaboratorError::Failed { .. } => ErrorCode::CollaboratorFailed,
            CollaboratorError::Cancelled => ErrorCode::Cancelled,
        };
        (code, self.to_string())
    }
}

#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CollaboratorError>;
}

/// Service and method a pass-through request is forwarded to.
pub fn route(request: &Request) -> Option<(&'static str, &'static str, Value)> {
    let (service, method, params) = match request {
        Request::CouncilAnalyze { params } => ("council", "analyze", params),
        Request::WorkflowTrigger { params } => ("workflow", "trigger", params),
        Request::WorkflowStatus { params } => ("workflow", "status", params),
        Request::SearchKnowledge { params } => ("knowledge", "search", params),
        Request::ShareSession { params } => ("sessions", "share", params),
        Request::JoinSession { params } => ("sessions", "join", params),
        Request::GetAnalytics { params } => ("analytics", "get", params),
        Request::RetroStart { params } => ("retro", "start", params),
        Request::RetroSubmit { params } => ("retro", "submit", params),
        Request::RetroSummary { params } => ("retro", "summary", params),
        _ => return None,
    };
    let params = match params {
        Value::Null => json!({}),
        other => other.clone(),
    };
    Some((service, method, params))
}

/// Collaborator reached over its own JSON-lines Unix socket. One connection
/// per call: `{"method", "params"}` out, `{"ok", "result" | "error"}` back.
pub struct SocketCollaborator {
    service: String,
    path: PathBuf,
}

impl SocketCollaborator {
    pub fn new(service: impl Into<String>, path: PathBuf) -> Self {
        Self {
            service: service.into(),
            path,
        }
    }

    fn failed(&self, message: impl Into<String>) -> CollaboratorError {
        CollaboratorError::Failed {
            service: self.service.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Collaborator for SocketCollaborator {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CollaboratorError> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            tracing::debug!(service = %self.service, err = %e, "collaborator connect failed");
            CollaboratorError::Unavailable(self.service.clone())
        })?;
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, JsonLinesCodec::new());
        let mut writer = FramedWrite::new(w, JsonLinesCodec::new());

        writer
            .send(json!({ "method": method, "params": params }))
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        let reply = match reader.next().await {
            Some(Ok(Record::Json(value))) => value,
            Some(Ok(Record::Malformed(reason))) => return Err(self.failed(reason)),
            Some(Err(e)) => return Err(self.failed(e.to_string())),
            None => return Err(self.failed("connection closed without a reply")),
        };

        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(reply.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("collaborator reported an error");
            Err(self.failed(message))
        }
    }
}

/// Collaborators by service name.
#[derive(Default)]
pub struct CollaboratorRegistry {
    services: HashMap<String, Arc<dyn Collaborator>>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: impl Into<String>, collaborator: Arc<dyn Collaborator>) {
        self.services.insert(service.into(), collaborator);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn Collaborator>> {
        self.services.get(service).cloned()
    }
}

/// Call `service`, giving up after `timeout` or when `cancel` fires.
pub async fn call_with_deadline(
    collaborator: Arc<dyn Collaborator>,
    service: &str,
    method: &str,
    params: Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value, CollaboratorError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CollaboratorError::Cancelled),
        result = tokio::time::timeout(timeout, collaborator.call(method, params)) => match result {
            Ok(inner) => inner,
            Err(_) => Err(CollaboratorError::Timeout {
                service: service.to_string(),
                timeout_ms: timeout.as_millis(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    struct Slow;

    #[async_trait]
    impl Collaborator for Slow {
        async fn call(&self, _method: &str, _params: Value) -> Result<Value, CollaboratorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    #[test]
    fn routes_pass_through_requests() {
        let (service, method, params) =
            route(&Request::RetroSubmit { params: Value::Null }).unwrap();
        assert_eq!((service, method), ("retro", "submit"));
        assert_eq!(params, json!({}));
        assert!(route(&Request::Ping).is_none());
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let cancel = CancellationToken::new();
        let err = call_with_deadline(
            Arc::new(Slow),
            "council",
            "analyze",
            json!({}),
            Duration::from_millis(20),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_error_code().0, ErrorCode::CollaboratorTimeout);
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = call_with_deadline(
            Arc::new(Slow),
            "council",
            "analyze",
            json!({}),
            Duration::from_secs(10),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CollaboratorError::Cancelled));
    }

    #[tokio::test]
    async fn socket_collaborator_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("council.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = FramedRead::new(r, JsonLinesCodec::new());
            let mut writer = FramedWrite::new(w, JsonLinesCodec::new());
            let Some(Ok(Record::Json(req))) = reader.next().await else {
                panic!("expected a request");
            };
            let reply = json!({"ok": true, "result": {"echo": req["params"], "method": req["method"]}});
            writer.send(reply).await.unwrap();
        });

        let collab = SocketCollaborator::new("council", path);
        let result = collab.call("analyze", json!({"q": 1})).await.unwrap();
        assert_eq!(result, json!({"echo": {"q": 1}, "method": "analyze"}));
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let collab = SocketCollaborator::new("retro", dir.path().join("absent.sock"));
        let err = collab.call("start", json!({})).await.unwrap_err();
        assert_eq!(err.to_error_code().0, ErrorCode::CollaboratorUnavailable);
    }
}
