use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Live signals from the account currently working a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub task_id: String,
    pub account: String,
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at_ms: Option<u64>,
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_used_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressReport {
    pub tokens_used: Option<u64>,
    pub token_budget: Option<u64>,
    pub context_used_pct: Option<f64>,
    pub checkpoint: bool,
    pub session_ended: bool,
}

impl WorkSession {
    fn start(task_id: &str, account: &str, now_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            account: account.to_string(),
            started_at_ms: now_ms,
            last_checkpoint_at_ms: None,
            tokens_used: 0,
            token_budget: None,
            context_used_pct: None,
            ended_at_ms: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at_ms.is_some()
    }
}

/// One session per task: the most recent account reporting on it.
#[derive(Debug, Default)]
pub struct WorkSessionTracker {
    sessions: HashMap<String, WorkSession>,
}

impl WorkSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a progress report into the task's session. A report from a
    /// different account, or after the session ended, starts a new one.
    pub fn record(
        &mut self,
        task_id: &str,
        account: &str,
        report: &ProgressReport,
        now_ms: u64,
    ) -> &WorkSession {
        let session = match self.sessions.entry(task_id.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().account != account || e.get().is_ended() {
                    e.insert(WorkSession::start(task_id, account, now_ms));
                }
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(WorkSession::start(task_id, account, now_ms)),
        };
        if let Some(tokens) = report.tokens_used {
            session.tokens_used = tokens;
        }
        if report.token_budget.is_some() {
            session.token_budget = report.token_budget;
        }
        if report.context_used_pct.is_some() {
            session.context_used_pct = report.context_used_pct;
        }
        if report.checkpoint {
            session.last_checkpoint_at_ms = Some(now_ms);
        }
        if report.session_ended {
            session.ended_at_ms = Some(now_ms);
        }
        session
    }

    /// End every open session of `account`, returning the affected task ids.
    pub fn end_for_account(&mut self, account: &str, now_ms: u64) -> Vec<String> {
        let mut ended = Vec::new();
        for session in self.sessions.values_mut() {
            if session.account == account && !session.is_ended() {
                session.ended_at_ms = Some(now_ms);
                ended.push(session.task_id.clone());
            }
        }
        ended
    }

    pub fn get(&self, task_id: &str) -> Option<&WorkSession> {
        self.sessions.get(task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<WorkSession> {
        self.sessions.remove(task_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkSession> {
        self.sessions.values()
    }
}
