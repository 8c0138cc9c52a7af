mod handoff;
mod health;
mod messaging;
mod passthrough;
mod sla;
mod tasks;
mod trust;
mod workspace;

use crate::collab::{Collaborator, CollaboratorRegistry, SocketCollaborator};
use crate::config::{NodeConfig, Settings};
use crate::session::SessionRegistry;
use anyhow::{Context, Result};
use convoy::protocol::{ErrorCode, Event, Request, Response};
use convoy_crypto::rate_limit::{Admission, RequestLimiter};
use convoy_fleet::FleetError;
use convoy_fleet::health::HealthMonitor;
use convoy_fleet::inbox::MessageStore;
use convoy_fleet::store::{JsonlTaskLog, TaskStore};
use convoy_fleet::trust::TrustLedger;
use convoy_fleet::work_session::WorkSessionTracker;
use convoy_git::HandoffWorkspace;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;

pub use convoy_crypto::time::now_ms;

/// Who a pushed event is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Account(String),
    Everyone,
}

#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub to: Recipient,
    pub event: Event,
}

impl RoutedEvent {
    pub fn is_for(&self, account: &str) -> bool {
        match &self.to {
            Recipient::Account(a) => a == account,
            Recipient::Everyone => true,
        }
    }
}

/// The authenticated caller of one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub account: String,
    /// Cancelled when the caller's connection goes away.
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(account: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            account: account.into(),
            cancel,
        }
    }
}

/// The durable stores a daemon runs on.
pub struct Stores {
    pub tasks: TaskStore,
    pub trust: TrustLedger,
    pub inbox: MessageStore,
}

impl Stores {
    pub fn load(state_dir: &Path, config: &NodeConfig) -> Result<Self> {
        let tasks = TaskStore::open(Box::new(JsonlTaskLog::new(state_dir)))
            .context("failed to load tasks")?;
        let trust = TrustLedger::load(state_dir, config.circuit_breaker.threshold)
            .context("failed to load trust ledger")?;
        let inbox = MessageStore::load(state_dir).context("failed to load messages")?;
        Ok(Self { tasks, trust, inbox })
    }

    pub fn in_memory(config: &NodeConfig) -> Self {
        Self {
            tasks: TaskStore::in_memory(),
            trust: TrustLedger::in_memory(config.circuit_breaker.threshold),
            inbox: MessageStore::in_memory(),
        }
    }
}

/// Shared daemon state. Each store sits behind its own lock; handlers take
/// them one at a time.
pub struct NodeState {
    settings: RwLock<Arc<Settings>>,
    pub health: Mutex<HealthMonitor>,
    pub tasks: Mutex<TaskStore>,
    pub work_sessions: Mutex<WorkSessionTracker>,
    pub trust: Mutex<TrustLedger>,
    pub inbox: Mutex<MessageStore>,
    pub limiter: Mutex<RequestLimiter>,
    pub sessions: Mutex<SessionRegistry>,
    pub workspaces: Mutex<HashMap<String, HandoffWorkspace>>,
    pub collaborators: RwLock<CollaboratorRegistry>,
    pub event_tx: broadcast::Sender<RoutedEvent>,
    pub shutdown: CancellationToken,
    next_connection_id: AtomicU64,
}

impl NodeState {
    pub fn new(config: &NodeConfig, stores: Stores) -> Result<Arc<Self>> {
        let settings = Settings::from_config(config)?;
        let (event_tx, _) = broadcast::channel(256);
        let mut collaborators = CollaboratorRegistry::new();
        register_endpoints(&mut collaborators, &settings);
        Ok(Arc::new(Self {
            health: Mutex::new(HealthMonitor::new(settings.health)),
            tasks: Mutex::new(stores.tasks),
            work_sessions: Mutex::new(WorkSessionTracker::new()),
            trust: Mutex::new(stores.trust),
            inbox: Mutex::new(stores.inbox),
            limiter: Mutex::new(RequestLimiter::new(
                settings.rate_limit.capacity,
                settings.rate_limit.per_second,
            )),
            sessions: Mutex::new(SessionRegistry::new()),
            workspaces: Mutex::new(HashMap::new()),
            collaborators: RwLock::new(collaborators),
            event_tx,
            shutdown: CancellationToken::new(),
            next_connection_id: AtomicU64::new(1),
            settings: RwLock::new(Arc::new(settings)),
        }))
    }

    /// Current settings. Requests already running keep the snapshot they took.
    pub async fn settings(&self) -> Arc<Settings> {
        self.settings.read().await.clone()
    }

    /// Swap in a reloaded configuration.
    pub async fn apply_config(&self, config: &NodeConfig) -> Result<()> {
        let settings = Settings::from_config(config)?;
        let previous = self.settings().await;

        self.health.lock().await.set_thresholds(settings.health);
        self.trust.lock().await.set_threshold(settings.breaker_threshold);
        if settings.rate_limit != previous.rate_limit {
            self.limiter
                .lock()
                .await
                .reconfigure(settings.rate_limit.capacity, settings.rate_limit.per_second);
        }
        register_endpoints(&mut *self.collaborators.write().await, &settings);

        let accounts = settings.accounts.names().len();
        *self.settings.write().await = Arc::new(settings);
        tracing::info!(accounts, "configuration applied");
        Ok(())
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn notify(&self, account: &str, event: Event) {
        // No receivers just means nobody is connected.
        let _ = self.event_tx.send(RoutedEvent {
            to: Recipient::Account(account.to_string()),
            event,
        });
    }

    pub fn notify_all(&self, event: Event) {
        let _ = self.event_tx.send(RoutedEvent {
            to: Recipient::Everyone,
            event,
        });
    }

    /// A connection authenticated as `account`.
    pub async fn open_session(&self, account: &str) {
        let count = self.sessions.lock().await.open(account);
        self.health.lock().await.mark_active(account);
        tracing::info!(account = %account, sessions = count, "session opened");
    }

    /// A connection of `account` closed. When it was the last one the
    /// account goes offline and its open work sessions end.
    pub async fn close_session(&self, account: &str) {
        let remaining = self.sessions.lock().await.close(account);
        if remaining > 0 {
            tracing::debug!(account = %account, remaining, "session closed");
            return;
        }
        self.health.lock().await.mark_disconnected(account);
        let ended = self
            .work_sessions
            .lock()
            .await
            .end_for_account(account, now_ms());
        tracing::info!(account = %account, ended_sessions = ended.len(), "account disconnected");
    }

    /// Count a protocol-level error against the caller's health.
    pub async fn note_error(&self, account: &str) {
        self.health.lock().await.record_error(account);
    }
}

fn register_endpoints(registry: &mut CollaboratorRegistry, settings: &Settings) {
    for (service, path) in &settings.collaborator_endpoints {
        let collaborator: Arc<dyn Collaborator> =
            Arc::new(SocketCollaborator::new(service.clone(), path.clone()));
        registry.register(service.clone(), collaborator);
    }
}

/// Run one authenticated request: rate limit, health bookkeeping, and the
/// handler itself with panics turned into `internal_error`.
pub async fn dispatch(state: &Arc<NodeState>, ctx: &RequestContext, req: Request) -> Response {
    let kind = req.kind();

    let admission = state.limiter.lock().await.check(&ctx.account);
    match admission {
        Admission::Throttled { retry_after } => {
            state.health.lock().await.record_rate_limit(&ctx.account);
            tracing::warn!(account = %ctx.account, kind, "rate limited");
            return error_response(
                ErrorCode::RateLimited,
                &format!("rate limit exceeded, retry in {} ms", retry_after.as_millis()),
            );
        }
        Admission::Allowed { recovered } => {
            let mut health = state.health.lock().await;
            health.mark_active(&ctx.account);
            if recovered {
                health.clear_rate_limit(&ctx.account);
            }
        }
    }

    let resp = match AssertUnwindSafe(handle_request(state, ctx, req))
        .catch_unwind()
        .await
    {
        Ok(resp) => resp,
        Err(_) => {
            tracing::error!(account = %ctx.account, kind, "handler panicked");
            error_response(ErrorCode::InternalError, "internal error")
        }
    };

    if matches!(
        resp.error_code(),
        Some(ErrorCode::InternalError | ErrorCode::CollaboratorTimeout)
    ) {
        state.note_error(&ctx.account).await;
    }
    resp
}

/// Route a request to its handler.
pub async fn handle_request(state: &Arc<NodeState>, ctx: &RequestContext, req: Request) -> Response {
    let me = ctx.account.as_str();
    match req {
        // Answered by the auth gate; kept for completeness of the match.
        Request::Auth { .. } => error_response(
            ErrorCode::AlreadyAuthenticated,
            "connection is already authenticated",
        ),
        Request::Ping => Response::Pong { request_id: None },

        Request::SendMessage { to, body } => {
            messaging::handle_send_message(state, me, &to, body).await
        }
        Request::ReadMessages {
            unread_only,
            limit,
            mark_read,
        } => messaging::handle_read_messages(state, me, unread_only, limit, mark_read).await,
        Request::CountUnread => messaging::handle_count_unread(state, me).await,
        Request::ListAccounts => messaging::handle_list_accounts(state).await,

        Request::CreateTask {
            title,
            fields,
            assignee,
        } => tasks::handle_create_task(state, me, title, fields, assignee).await,
        Request::GetTask { task_id } => tasks::handle_get_task(state, &task_id).await,
        Request::ListTasks { status, assignee } => {
            tasks::handle_list_tasks(state, status, assignee.as_deref()).await
        }
        Request::UpdateTaskStatus {
            task_id,
            status,
            expected_status,
            reason,
            justification,
        } => {
            tasks::handle_update_status(
                state,
                me,
                task_id,
                status,
                expected_status,
                reason,
                justification,
            )
            .await
        }
        Request::RecreateTask { task_id } => tasks::handle_recreate(state, me, &task_id).await,
        Request::ReportProgress {
            task_id,
            note,
            tokens_used,
            token_budget,
            context_used_pct,
            checkpoint,
            session_ended,
        } => {
            let report = convoy_fleet::work_session::ProgressReport {
                tokens_used,
                token_budget,
                context_used_pct,
                checkpoint,
                session_ended,
            };
            tasks::handle_report_progress(state, me, &task_id, note, report).await
        }

        Request::HandoffTask {
            to,
            task_id,
            title,
            fields,
        } => handoff::handle_handoff(state, me, &to, task_id, title, fields).await,
        Request::HandoffAccept { task_id } => handoff::handle_accept(state, me, &task_id).await,
        Request::ReauthorizeDelegation {
            task_id,
            max_depth,
            reason,
        } => handoff::handle_reauthorize(state, me, &task_id, max_depth, &reason).await,
        Request::SuggestAssignee { task_id, exclude } => {
            handoff::handle_suggest_assignee(state, me, task_id.as_deref(), &exclude).await
        }

        Request::SlaCheck => sla::handle_sla_check(state).await,
        Request::AdaptiveSlaCheck => sla::handle_adaptive_sla_check(state).await,
        Request::GetTrust { account } => trust::handle_get_trust(state, &account).await,
        Request::ReinstateAgent { account, reason } => {
            trust::handle_reinstate(state, me, &account, &reason).await
        }
        Request::CheckCircuitBreaker { account } => {
            trust::handle_check_circuit(state, &account).await
        }

        Request::GetHealth { account } => health::handle_get_health(state, &account).await,
        Request::FleetHealth { accounts } => health::handle_fleet_health(state, accounts).await,
        Request::ReportHealth {
            rate_limited,
            error,
            clear_errors,
        } => health::handle_report_health(state, me, rate_limited, error, clear_errors).await,

        Request::PrepareWorktreeForHandoff { task_id, repo_path } => {
            workspace::handle_prepare(state, &task_id, &repo_path).await
        }
        Request::GetWorkspaceStatus { task_id } => {
            workspace::handle_status(state, &task_id).await
        }
        Request::CleanupWorkspace { task_id } => workspace::handle_cleanup(state, &task_id).await,

        other => passthrough::handle_passthrough(state, ctx, &other).await,
    }
}

// ---- Shared helpers ----

pub fn ok_response(data: Option<serde_json::Value>) -> Response {
    Response::result(data)
}

pub fn error_response(code: ErrorCode, message: &str) -> Response {
    Response::error(code, message)
}

pub fn fleet_error(err: &FleetError) -> Response {
    let (code, message) = err.to_error_code();
    if code == ErrorCode::InternalError {
        tracing::error!(err = %err, "store failure");
    }
    Response::error(code, message)
}

/// Serialize handler output into a result response.
pub fn json_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => ok_response(Some(v)),
        Err(e) => {
            tracing::error!(err = %e, "failed to serialize response");
            error_response(ErrorCode::InternalError, "internal error")
        }
    }
}

/// `not_found` unless `account` is configured.
pub async fn require_account(state: &NodeState, account: &str) -> Result<(), Response> {
    if state.settings().await.accounts.contains(account) {
        Ok(())
    } else {
        Err(fleet_error(&FleetError::UnknownAccount(account.to_string())))
    }
}
