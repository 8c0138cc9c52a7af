use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Maximum size of a JSON-lines frame on the Unix socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Wire name of the request correlation field.
pub const REQUEST_ID_FIELD: &str = "requestId";

// ---------------------------------------------------------------------------
// Typed enums for wire format safety
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    ReadyForReview,
    Accepted,
    Rejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::ReadyForReview,
        TaskStatus::Accepted,
        TaskStatus::Rejected,
    ];

    /// Accepted and rejected tasks never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Accepted | TaskStatus::Rejected)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::ReadyForReview => write!(f, "ready_for_review"),
            TaskStatus::Accepted => write!(f, "accepted"),
            TaskStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

/// How much damage a wrong result can do. Ordered from least to most critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reversibility {
    Reversible,
    PartiallyReversible,
    Irreversible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verifiability {
    AutoTestable,
    NeedsReview,
    Subjective,
}

/// Outcome of the acceptance friction gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateDecision {
    AutoAccept,
    RequireAcceptance,
    RequireJustification,
    RequireElevatedReview,
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::AutoAccept => write!(f, "auto-accept"),
            GateDecision::RequireAcceptance => write!(f, "require-acceptance"),
            GateDecision::RequireJustification => write!(f, "require-justification"),
            GateDecision::RequireElevatedReview => write!(f, "require-elevated-review"),
        }
    }
}

/// Derived account health. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Action attached to an escalation.
///
/// Time-based escalations use `ping`, `reassign_suggestion` and `escalate`;
/// signal-based escalations use the remaining variants plus `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Ping,
    ReassignSuggestion,
    Escalate,
    SuggestReassign,
    AutoReassign,
    EscalateHuman,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveTrigger {
    TokenBurnRate,
    NoCheckpoint,
    ContextSaturation,
    SessionEndedIncomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSeverity {
    Elevated,
    Severe,
}

/// Error codes for structured error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolError,
    AuthRequired,
    AuthFailed,
    AlreadyAuthenticated,
    InvalidTransition,
    MissingReason,
    DepthExceeded,
    FrictionBlocked,
    NotFound,
    Forbidden,
    CircuitOpen,
    RateLimited,
    CollaboratorTimeout,
    CollaboratorUnavailable,
    CollaboratorFailed,
    Cancelled,
    WorkspaceError,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from an account process to the daemon over the Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    /// Authenticate the connection. Must be the first message.
    Auth { account: String, token: String },
    /// Liveness probe. Allowed before authentication.
    Ping,

    // -- Messaging --
    SendMessage { to: String, body: String },
    ReadMessages {
        #[serde(default)]
        unread_only: bool,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default = "default_true")]
        mark_read: bool,
    },
    CountUnread,
    ListAccounts,

    // -- Tasks --
    CreateTask {
        title: String,
        #[serde(flatten)]
        fields: TaskFields,
        #[serde(default)]
        assignee: Option<String>,
    },
    GetTask { task_id: String },
    ListTasks {
        #[serde(default)]
        status: Option<TaskStatus>,
        #[serde(default)]
        assignee: Option<String>,
    },
    UpdateTaskStatus {
        task_id: String,
        status: TaskStatus,
        #[serde(default)]
        expected_status: Option<TaskStatus>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        justification: Option<String>,
    },
    RecreateTask { task_id: String },
    ReportProgress {
        task_id: String,
        #[serde(default)]
        note: Option<String>,
        #[serde(default)]
        tokens_used: Option<u64>,
        #[serde(default)]
        token_budget: Option<u64>,
        #[serde(default)]
        context_used_pct: Option<f64>,
        #[serde(default)]
        checkpoint: bool,
        #[serde(default)]
        session_ended: bool,
    },

    // -- Handoff --
    /// Hand an existing task (`task_id`) or a new one (`title` + fields) to `to`.
    HandoffTask {
        to: String,
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(flatten)]
        fields: TaskFields,
    },
    HandoffAccept { task_id: String },
    ReauthorizeDelegation {
        task_id: String,
        max_depth: u32,
        reason: String,
    },
    SuggestAssignee {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },

    // -- SLA / trust --
    SlaCheck,
    AdaptiveSlaCheck,
    GetTrust { account: String },
    ReinstateAgent { account: String, reason: String },
    CheckCircuitBreaker { account: String },

    // -- Health --
    GetHealth { account: String },
    FleetHealth {
        #[serde(default)]
        accounts: Option<Vec<String>>,
    },
    ReportHealth {
        #[serde(default)]
        rate_limited: Option<bool>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        clear_errors: bool,
    },

    // -- Workspace --
    PrepareWorktreeForHandoff { task_id: String, repo_path: String },
    GetWorkspaceStatus { task_id: String },
    CleanupWorkspace { task_id: String },

    // -- Pass-through to external collaborators --
    CouncilAnalyze {
        #[serde(default)]
        params: Value,
    },
    WorkflowTrigger {
        #[serde(default)]
        params: Value,
    },
    WorkflowStatus {
        #[serde(default)]
        params: Value,
    },
    SearchKnowledge {
        #[serde(default)]
        params: Value,
    },
    ShareSession {
        #[serde(default)]
        params: Value,
    },
    JoinSession {
        #[serde(default)]
        params: Value,
    },
    GetAnalytics {
        #[serde(default)]
        params: Value,
    },
    RetroStart {
        #[serde(default)]
        params: Value,
    },
    RetroSubmit {
        #[serde(default)]
        params: Value,
    },
    RetroSummary {
        #[serde(default)]
        params: Value,
    },
}

/// Optional attributes shared by `create_task` and `handoff_task`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<Criticality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversibility: Option<Reversibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifiability: Option<Verifiability>,
    /// Acceptance criteria the delegatee is held to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
}

fn default_true() -> bool {
    true
}

fn non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(())
}

fn params_object(params: &Value) -> Result<(), String> {
    match params {
        Value::Null | Value::Object(_) => Ok(()),
        _ => Err("params must be an object".to_string()),
    }
}

impl Request {
    /// Wire name of the request type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Auth { .. } => "auth",
            Request::Ping => "ping",
            Request::SendMessage { .. } => "send_message",
            Request::ReadMessages { .. } => "read_messages",
            Request::CountUnread => "count_unread",
            Request::ListAccounts => "list_accounts",
            Request::CreateTask { .. } => "create_task",
            Request::GetTask { .. } => "get_task",
            Request::ListTasks { .. } => "list_tasks",
            Request::UpdateTaskStatus { .. } => "update_task_status",
            Request::RecreateTask { .. } => "recreate_task",
            Request::ReportProgress { .. } => "report_progress",
            Request::HandoffTask { .. } => "handoff_task",
            Request::HandoffAccept { .. } => "handoff_accept",
            Request::ReauthorizeDelegation { .. } => "reauthorize_delegation",
            Request::SuggestAssignee { .. } => "suggest_assignee",
            Request::SlaCheck => "sla_check",
            Request::AdaptiveSlaCheck => "adaptive_sla_check",
            Request::GetTrust { .. } => "get_trust",
            Request::ReinstateAgent { .. } => "reinstate_agent",
            Request::CheckCircuitBreaker { .. } => "check_circuit_breaker",
            Request::GetHealth { .. } => "get_health",
            Request::FleetHealth { .. } => "fleet_health",
            Request::ReportHealth { .. } => "report_health",
            Request::PrepareWorktreeForHandoff { .. } => "prepare_worktree_for_handoff",
            Request::GetWorkspaceStatus { .. } => "get_workspace_status",
            Request::CleanupWorkspace { .. } => "cleanup_workspace",
            Request::CouncilAnalyze { .. } => "council_analyze",
            Request::WorkflowTrigger { .. } => "workflow_trigger",
            Request::WorkflowStatus { .. } => "workflow_status",
            Request::SearchKnowledge { .. } => "search_knowledge",
            Request::ShareSession { .. } => "share_session",
            Request::JoinSession { .. } => "join_session",
            Request::GetAnalytics { .. } => "get_analytics",
            Request::RetroStart { .. } => "retro_start",
            Request::RetroSubmit { .. } => "retro_submit",
            Request::RetroSummary { .. } => "retro_summary",
        }
    }

    /// Range and emptiness checks that the type system does not cover.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Auth { account, token } => {
                non_empty("account", account)?;
                non_empty("token", token)
            }
            Request::SendMessage { to, body } => {
                non_empty("to", to)?;
                non_empty("body", body)
            }
            Request::ReadMessages { limit: Some(0), .. } => {
                Err("limit must be at least 1".to_string())
            }
            Request::CreateTask { title, .. } => non_empty("title", title),
            Request::GetTask { task_id }
            | Request::RecreateTask { task_id }
            | Request::HandoffAccept { task_id }
            | Request::GetWorkspaceStatus { task_id }
            | Request::CleanupWorkspace { task_id } => non_empty("taskId", task_id),
            Request::UpdateTaskStatus { task_id, .. } => non_empty("taskId", task_id),
            Request::ReportProgress {
                task_id,
                context_used_pct,
                ..
            } => {
                non_empty("taskId", task_id)?;
                match context_used_pct {
                    Some(pct) if !(0.0..=100.0).contains(pct) => {
                        Err("contextUsedPct must be within 0..=100".to_string())
                    }
                    _ => Ok(()),
                }
            }
            Request::HandoffTask {
                to, task_id, title, ..
            } => {
                non_empty("to", to)?;
                match (task_id, title) {
                    (Some(id), _) => non_empty("taskId", id),
                    (None, Some(title)) => non_empty("title", title),
                    (None, None) => Err("either taskId or title is required".to_string()),
                }
            }
            Request::ReauthorizeDelegation {
                task_id,
                max_depth,
                reason,
            } => {
                non_empty("taskId", task_id)?;
                non_empty("reason", reason)?;
                if *max_depth == 0 {
                    return Err("maxDepth must be at least 1".to_string());
                }
                Ok(())
            }
            Request::GetTrust { account }
            | Request::CheckCircuitBreaker { account }
            | Request::GetHealth { account } => non_empty("account", account),
            Request::ReinstateAgent { account, reason } => {
                non_empty("account", account)?;
                non_empty("reason", reason)
            }
            Request::PrepareWorktreeForHandoff { task_id, repo_path } => {
                non_empty("taskId", task_id)?;
                non_empty("repoPath", repo_path)
            }
            Request::CouncilAnalyze { params }
            | Request::WorkflowTrigger { params }
            | Request::WorkflowStatus { params }
            | Request::SearchKnowledge { params }
            | Request::ShareSession { params }
            | Request::JoinSession { params }
            | Request::GetAnalytics { params }
            | Request::RetroStart { params }
            | Request::RetroSubmit { params }
            | Request::RetroSummary { params } => params_object(params),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A validated request together with its correlation id.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request_id: Option<String>,
    pub request: Request,
}

/// A record that failed schema validation. Carries the request id when one
/// could be recovered so the error reply can still be correlated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub request_id: Option<String>,
    pub message: String,
}

impl Envelope {
    pub fn new(request: Request) -> Self {
        Self {
            request_id: None,
            request,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Validate a decoded JSON object against the request schema.
    pub fn from_value(mut value: Value) -> Result<Self, SchemaViolation> {
        let Some(map) = value.as_object_mut() else {
            return Err(SchemaViolation {
                request_id: None,
                message: "message must be a JSON object".to_string(),
            });
        };

        let request_id = match map.remove(REQUEST_ID_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(_) => {
                return Err(SchemaViolation {
                    request_id: None,
                    message: format!("{REQUEST_ID_FIELD} must be a string"),
                });
            }
        };

        if !map.get("type").is_some_and(Value::is_string) {
            return Err(SchemaViolation {
                request_id,
                message: "missing message type".to_string(),
            });
        }

        let request: Request = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                return Err(SchemaViolation {
                    request_id,
                    message: format!("invalid message: {e}"),
                });
            }
        };

        if let Err(message) = request.validate() {
            return Err(SchemaViolation {
                request_id,
                message,
            });
        }

        Ok(Self {
            request_id,
            request,
        })
    }

    /// Encode for the wire, inlining `requestId` next to `type`.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(&self.request)?;
        if let (Some(id), Some(map)) = (&self.request_id, value.as_object_mut()) {
            map.insert(REQUEST_ID_FIELD.to_string(), Value::String(id.clone()));
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response or pushed event sent from the daemon to an account process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Response {
    /// Authentication succeeded.
    AuthOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        account: String,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Request succeeded with optional data.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Request failed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        error: String,
    },
    /// Asynchronous event pushed to the account.
    Event { event: Event },
}

impl Response {
    pub fn result(data: Option<Value>) -> Self {
        Response::Result {
            request_id: None,
            data,
        }
    }

    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        Response::Error {
            request_id: None,
            code,
            error: error.into(),
        }
    }

    /// Tag the response with the originating request id.
    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        match &mut self {
            Response::AuthOk { request_id, .. }
            | Response::Pong { request_id }
            | Response::Result { request_id, .. }
            | Response::Error { request_id, .. } => *request_id = id,
            Response::Event { .. } => {}
        }
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Response::AuthOk { request_id, .. }
            | Response::Pong { request_id }
            | Response::Result { request_id, .. }
            | Response::Error { request_id, .. } => request_id.as_deref(),
            Response::Event { .. } => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Response::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Asynchronous events pushed to connected accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    NewMessage {
        message_id: String,
        from: String,
        preview: String,
    },
    TaskAssigned {
        task_id: String,
        title: String,
        from: String,
    },
    Escalation { escalation: Escalation },
    HealthChanged {
        account: String,
        from: Option<HealthStatus>,
        to: HealthStatus,
    },
}

// ---------------------------------------------------------------------------
// Data types returned in Result.data
// ---------------------------------------------------------------------------

/// Why a task was escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EscalationDetail {
    /// Time since the last update crossed a per-status threshold.
    Stale {
        status: TaskStatus,
        stale_for_ms: u64,
        threshold_ms: u64,
    },
    /// A live work-session signal fired.
    Trigger {
        trigger: AdaptiveTrigger,
        severity: TriggerSeverity,
        observed: f64,
        threshold: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub task_id: String,
    pub task_title: String,
    pub action: EscalationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub detail: EscalationDetail,
}

/// Health snapshot of one account, with the status derived at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub account: String,
    pub status: HealthStatus,
    pub connected: bool,
    pub last_activity_ms: Option<u64>,
    pub error_count: u32,
    pub rate_limited: bool,
    pub sla_violations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateHealth {
    pub healthy: usize,
    pub degraded: usize,
    pub critical: usize,
    pub overall: HealthStatus,
}

/// A configured account as returned by `list_accounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub name: String,
    pub status: HealthStatus,
    pub sessions: usize,
    pub open_tasks: usize,
}

/// A message as returned by `read_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub message_id: String,
    pub from: String,
    pub body: String,
    pub timestamp_ms: u64,
    pub read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustInfo {
    pub account: String,
    pub score: f64,
    pub accepted: u32,
    pub rejected: u32,
    pub consecutive_rejections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitInfo {
    pub account: String,
    pub open: bool,
    pub consecutive_rejections: u32,
    pub threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssigneeCandidate {
    pub account: String,
    pub status: HealthStatus,
    pub open_tasks: usize,
    pub trust: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub task_id: String,
    pub repo_root: String,
    pub worktree_path: String,
    pub branch: Option<String>,
    pub exists: bool,
    pub dirty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_extracts_request_id() {
        let env = Envelope::from_value(json!({
            "type": "get_task",
            "requestId": "r-7",
            "taskId": "t1"
        }))
        .unwrap();
        assert_eq!(env.request_id.as_deref(), Some("r-7"));
        assert!(matches!(env.request, Request::GetTask { ref task_id } if task_id == "t1"));
    }

    #[test]
    fn unknown_type_is_rejected_with_request_id() {
        let err = Envelope::from_value(json!({"type": "format_disk", "requestId": "r1"}))
            .unwrap_err();
        assert_eq!(err.request_id.as_deref(), Some("r1"));
        assert!(err.message.contains("invalid message"));
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = Envelope::from_value(json!({"account": "a"})).unwrap_err();
        assert_eq!(err.message, "missing message type");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = Envelope::from_value(json!({"type": "update_task_status", "taskId": "t"}))
            .unwrap_err();
        assert!(err.message.contains("status"), "{}", err.message);
    }

    #[test]
    fn out_of_range_context_is_rejected() {
        let err = Envelope::from_value(json!({
            "type": "report_progress",
            "taskId": "t",
            "contextUsedPct": 140.0
        }))
        .unwrap_err();
        assert!(err.message.contains("contextUsedPct"));
    }

    #[test]
    fn handoff_requires_task_or_title() {
        let err =
            Envelope::from_value(json!({"type": "handoff_task", "to": "bob"})).unwrap_err();
        assert!(err.message.contains("taskId or title"));

        let env = Envelope::from_value(json!({
            "type": "handoff_task",
            "to": "bob",
            "title": "fix flaky test",
            "criticality": "low",
            "verifiability": "auto-testable"
        }))
        .unwrap();
        match env.request {
            Request::HandoffTask { fields, .. } => {
                assert_eq!(fields.criticality, Some(Criticality::Low));
                assert_eq!(fields.verifiability, Some(Verifiability::AutoTestable));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unit_variants_accept_request_id() {
        let env = Envelope::from_value(json!({"type": "ping", "requestId": "p"})).unwrap();
        assert!(matches!(env.request, Request::Ping));
    }

    #[test]
    fn envelope_to_value_inlines_request_id() {
        let value = Envelope::new(Request::CountUnread)
            .with_request_id("r9")
            .to_value()
            .unwrap();
        assert_eq!(value, json!({"type": "count_unread", "requestId": "r9"}));
    }

    #[test]
    fn error_response_wire_shape() {
        let resp = Response::error(ErrorCode::InvalidTransition, "todo -> accepted")
            .with_request_id(Some("r2".to_string()));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "requestId": "r2",
                "code": "invalid_transition",
                "error": "todo -> accepted"
            })
        );
    }

    #[test]
    fn escalation_detail_wire_shape() {
        let esc = Escalation {
            task_id: "t1".to_string(),
            task_title: "ship it".to_string(),
            action: EscalationAction::ReassignSuggestion,
            assignee: None,
            detail: EscalationDetail::Stale {
                status: TaskStatus::InProgress,
                stale_for_ms: 10,
                threshold_ms: 5,
            },
        };
        let value = serde_json::to_value(&esc).unwrap();
        assert_eq!(value["action"], "reassign_suggestion");
        assert_eq!(value["detail"]["kind"], "stale");
        assert_eq!(value["detail"]["staleForMs"], 10);
        assert!(value.get("assignee").is_none());
    }

    #[test]
    fn error_code_display_matches_wire() {
        assert_eq!(ErrorCode::DepthExceeded.to_string(), "depth_exceeded");
        assert_eq!(GateDecision::RequireElevatedReview.to_string(), "require-elevated-review");
    }
}
