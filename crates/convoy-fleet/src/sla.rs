//! SLA escalation engine.
//!
//! Two independent passes produce escalations on demand:
//!
//! - the time-based pass compares how long each open task has gone without
//!   an update against per-status thresholds;
//! - the adaptive pass reads live work-session signals (token burn, gaps
//!   between checkpoints, context use, sessions that ended early).
//!
//! Both are pure: they take a snapshot and the current time and return a
//! list. Their outputs are not merged, so a task may appear in both.

use crate::task::Task;
use crate::work_session::WorkSession;
use convoy::protocol::{
    AdaptiveTrigger, Escalation, EscalationAction, EscalationDetail, TaskStatus, TriggerSeverity,
};
use serde::Deserialize;
use std::collections::HashMap;

const MINUTE_MS: u64 = 60 * 1000;

// ---------------------------------------------------------------------------
// Time-based
// ---------------------------------------------------------------------------

/// Staleness bands for one status, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaleThresholds {
    pub ping_mins: u64,
    pub reassign_mins: u64,
    pub escalate_mins: u64,
}

impl StaleThresholds {
    const fn hours(ping: u64, reassign: u64, escalate: u64) -> Self {
        Self {
            ping_mins: ping * 60,
            reassign_mins: reassign * 60,
            escalate_mins: escalate * 60,
        }
    }

    /// Highest band strictly exceeded by `stale_ms`.
    pub fn band(&self, stale_ms: u64) -> Option<(EscalationAction, u64)> {
        [
            (EscalationAction::Escalate, self.escalate_mins),
            (EscalationAction::ReassignSuggestion, self.reassign_mins),
            (EscalationAction::Ping, self.ping_mins),
        ]
        .into_iter()
        .map(|(action, mins)| (action, mins * MINUTE_MS))
        .find(|&(_, threshold_ms)| stale_ms > threshold_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlaThresholds {
    pub todo: StaleThresholds,
    pub in_progress: StaleThresholds,
    pub ready_for_review: StaleThresholds,
}

impl Default for SlaThresholds {
    fn default() -> Self {
        Self {
            todo: StaleThresholds::hours(4, 24, 72),
            in_progress: StaleThresholds {
                ping_mins: 30,
                reassign_mins: 2 * 60,
                escalate_mins: 8 * 60,
            },
            ready_for_review: StaleThresholds::hours(1, 8, 24),
        }
    }
}

impl SlaThresholds {
    pub fn for_status(&self, status: TaskStatus) -> Option<&StaleThresholds> {
        match status {
            TaskStatus::Todo => Some(&self.todo),
            TaskStatus::InProgress => Some(&self.in_progress),
            TaskStatus::ReadyForReview => Some(&self.ready_for_review),
            TaskStatus::Accepted | TaskStatus::Rejected => None,
        }
    }
}

/// One escalation per stale open task, at its highest exceeded band.
pub fn legacy_escalations<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    thresholds: &SlaThresholds,
    now_ms: u64,
) -> Vec<Escalation> {
    let mut out = Vec::new();
    for task in tasks {
        let Some(bands) = thresholds.for_status(task.status) else {
            continue;
        };
        let stale_for_ms = now_ms.saturating_sub(task.updated_at_ms);
        if let Some((action, threshold_ms)) = bands.band(stale_for_ms) {
            out.push(Escalation {
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                action,
                assignee: task.assignee.clone(),
                detail: EscalationDetail::Stale {
                    status: task.status,
                    stale_for_ms,
                    threshold_ms,
                },
            });
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Adaptive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityActions {
    pub elevated: EscalationAction,
    pub severe: EscalationAction,
}

impl SeverityActions {
    pub fn for_severity(&self, severity: TriggerSeverity) -> EscalationAction {
        match severity {
            TriggerSeverity::Elevated => self.elevated,
            TriggerSeverity::Severe => self.severe,
        }
    }
}

/// Which action each trigger maps to, per severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionTable {
    pub token_burn_rate: SeverityActions,
    pub no_checkpoint: SeverityActions,
    pub context_saturation: SeverityActions,
    pub session_ended_incomplete: SeverityActions,
}

impl Default for ActionTable {
    fn default() -> Self {
        Self {
            token_burn_rate: SeverityActions {
                elevated: EscalationAction::Ping,
                severe: EscalationAction::EscalateHuman,
            },
            no_checkpoint: SeverityActions {
                elevated: EscalationAction::Ping,
                severe: EscalationAction::SuggestReassign,
            },
            context_saturation: SeverityActions {
                elevated: EscalationAction::Ping,
                severe: EscalationAction::AutoReassign,
            },
            session_ended_incomplete: SeverityActions {
                elevated: EscalationAction::SuggestReassign,
                severe: EscalationAction::AutoReassign,
            },
        }
    }
}

impl ActionTable {
    pub fn lookup(&self, trigger: AdaptiveTrigger) -> &SeverityActions {
        match trigger {
            AdaptiveTrigger::TokenBurnRate => &self.token_burn_rate,
            AdaptiveTrigger::NoCheckpoint => &self.no_checkpoint,
            AdaptiveTrigger::ContextSaturation => &self.context_saturation,
            AdaptiveTrigger::SessionEndedIncomplete => &self.session_ended_incomplete,
        }
    }

    /// Only signal-based actions may appear in the table.
    pub fn validate(&self) -> Result<(), String> {
        for trigger in [
            AdaptiveTrigger::TokenBurnRate,
            AdaptiveTrigger::NoCheckpoint,
            AdaptiveTrigger::ContextSaturation,
            AdaptiveTrigger::SessionEndedIncomplete,
        ] {
            let actions = self.lookup(trigger);
            for action in [actions.elevated, actions.severe] {
                if matches!(
                    action,
                    EscalationAction::ReassignSuggestion | EscalationAction::Escalate
                ) {
                    return Err(format!(
                        "{trigger:?}: {action:?} is a time-based action"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveConfig {
    pub max_tokens_per_minute: f64,
    pub checkpoint_interval_mins: u64,
    pub context_warn_pct: f64,
    pub context_critical_pct: f64,
    pub actions: ActionTable,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: 5_000.0,
            checkpoint_interval_mins: 30,
            context_warn_pct: 80.0,
            context_critical_pct: 95.0,
            actions: ActionTable::default(),
        }
    }
}

struct Firing {
    trigger: AdaptiveTrigger,
    severity: TriggerSeverity,
    observed: f64,
    threshold: f64,
}

fn over(observed: f64, threshold: f64) -> Option<TriggerSeverity> {
    if threshold <= 0.0 || observed <= threshold {
        None
    } else if observed > 2.0 * threshold {
        Some(TriggerSeverity::Severe)
    } else {
        Some(TriggerSeverity::Elevated)
    }
}

fn token_burn(session: &WorkSession, cfg: &AdaptiveConfig, now_ms: u64) -> Option<Firing> {
    let end = session.ended_at_ms.unwrap_or(now_ms);
    let minutes = (end.saturating_sub(session.started_at_ms) as f64 / MINUTE_MS as f64).max(1.0);
    let rate = session.tokens_used as f64 / minutes;

    let by_rate = over(rate, cfg.max_tokens_per_minute).map(|severity| Firing {
        trigger: AdaptiveTrigger::TokenBurnRate,
        severity,
        observed: rate,
        threshold: cfg.max_tokens_per_minute,
    });
    let by_budget = session.token_budget.and_then(|budget| {
        let (used, budget) = (session.tokens_used as f64, budget as f64);
        over(used, budget).map(|severity| Firing {
            trigger: AdaptiveTrigger::TokenBurnRate,
            severity,
            observed: used,
            threshold: budget,
        })
    });

    match (by_rate, by_budget) {
        (Some(r), Some(b)) if b.severity > r.severity => Some(b),
        (Some(r), _) => Some(r),
        (None, b) => b,
    }
}

fn no_checkpoint(session: &WorkSession, cfg: &AdaptiveConfig, now_ms: u64) -> Option<Firing> {
    if session.is_ended() {
        return None;
    }
    let since = session.last_checkpoint_at_ms.unwrap_or(session.started_at_ms);
    let gap = now_ms.saturating_sub(since) as f64;
    let interval = (cfg.checkpoint_interval_mins * MINUTE_MS) as f64;
    over(gap, interval).map(|severity| Firing {
        trigger: AdaptiveTrigger::NoCheckpoint,
        severity,
        observed: gap,
        threshold: interval,
    })
}

fn context_saturation(session: &WorkSession, cfg: &AdaptiveConfig) -> Option<Firing> {
    let pct = session.context_used_pct?;
    let (severity, threshold) = if pct >= cfg.context_critical_pct {
        (TriggerSeverity::Severe, cfg.context_critical_pct)
    } else if pct >= cfg.context_warn_pct {
        (TriggerSeverity::Elevated, cfg.context_warn_pct)
    } else {
        return None;
    };
    Some(Firing {
        trigger: AdaptiveTrigger::ContextSaturation,
        severity,
        observed: pct,
        threshold,
    })
}

fn ended_incomplete(session: &WorkSession, now_ms: u64) -> Option<Firing> {
    let ended = session.ended_at_ms?;
    Some(Firing {
        trigger: AdaptiveTrigger::SessionEndedIncomplete,
        severity: TriggerSeverity::Severe,
        observed: now_ms.saturating_sub(ended) as f64,
        threshold: 0.0,
    })
}

/// Escalations from live session signals of open tasks. A session may fire
/// several triggers; each becomes its own escalation.
pub fn adaptive_escalations<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    sessions: impl IntoIterator<Item = &'a WorkSession>,
    cfg: &AdaptiveConfig,
    now_ms: u64,
) -> Vec<Escalation> {
    let open: HashMap<&str, &Task> = tasks
        .into_iter()
        .filter(|t| t.is_open())
        .map(|t| (t.id.as_str(), t))
        .collect();

    let mut sessions: Vec<&WorkSession> = sessions
        .into_iter()
        .filter(|s| open.contains_key(s.task_id.as_str()))
        .collect();
    sessions.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    let mut out = Vec::new();
    for session in sessions {
        let Some(task) = open.get(session.task_id.as_str()) else {
            continue;
        };
        let firings = [
            token_burn(session, cfg, now_ms),
            no_checkpoint(session, cfg, now_ms),
            context_saturation(session, cfg),
            ended_incomplete(session, now_ms),
        ];
        for f in firings.into_iter().flatten() {
            out.push(Escalation {
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                action: cfg.actions.lookup(f.trigger).for_severity(f.severity),
                assignee: Some(session.account.clone()),
                detail: EscalationDetail::Trigger {
                    trigger: f.trigger,
                    severity: f.severity,
                    observed: f.observed,
                    threshold: f.threshold,
                },
            });
        }
    }
    out
}

/// Escalations severe enough to count against the assignee's health.
pub fn counts_as_violation(action: EscalationAction) -> bool {
    !matches!(action, EscalationAction::Ping)
}
