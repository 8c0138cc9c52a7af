//! Background loops: the SLA sweep and the health watcher.

use crate::handler::{NodeState, now_ms};
use convoy::protocol::{Escalation, EscalationAction, Event, HealthStatus};
use convoy_fleet::sla::{adaptive_escalations, counts_as_violation, legacy_escalations};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Rate limit buckets idle longer than this are dropped on each sweep.
const LIMITER_IDLE: Duration = Duration::from_secs(600);

/// Periodic escalation sweep. An escalation is pushed once when it first
/// appears and again only after it has cleared and come back.
#[derive(Debug, Default)]
pub struct SlaSweeper {
    seen: HashSet<(String, EscalationAction)>,
}

impl SlaSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one sweep. Returns the escalations that were new this round.
    pub async fn sweep(&mut self, state: &Arc<NodeState>) -> Vec<Escalation> {
        let settings = state.settings().await;
        let now = now_ms();

        let (escalations, creators) = {
            let tasks = state.tasks.lock().await;
            let sessions = state.work_sessions.lock().await;
            let mut escalations = legacy_escalations(tasks.open_tasks(), &settings.sla, now);
            escalations.extend(adaptive_escalations(
                tasks.open_tasks(),
                sessions.iter(),
                &settings.adaptive,
                now,
            ));
            let creators: HashMap<String, String> = escalations
                .iter()
                .filter_map(|e| {
                    tasks
                        .get(&e.task_id)
                        .map(|t| (e.task_id.clone(), t.created_by.clone()))
                })
                .collect();
            (escalations, creators)
        };

        let current: HashSet<(String, EscalationAction)> = escalations
            .iter()
            .map(|e| (e.task_id.clone(), e.action))
            .collect();

        let mut fresh = Vec::new();
        for escalation in escalations {
            let key = (escalation.task_id.clone(), escalation.action);
            if !self.seen.insert(key) {
                continue;
            }
            tracing::warn!(
                task_id = %escalation.task_id,
                action = ?escalation.action,
                assignee = ?escalation.assignee,
                "SLA escalation"
            );

            if let Some(assignee) = escalation.assignee.as_deref() {
                if counts_as_violation(escalation.action) {
                    state.health.lock().await.record_sla_violation(assignee);
                }
                state.notify(
                    assignee,
                    Event::Escalation {
                        escalation: escalation.clone(),
                    },
                );
            }
            if let Some(creator) = creators.get(&escalation.task_id)
                && escalation.assignee.as_deref() != Some(creator.as_str())
            {
                state.notify(
                    creator,
                    Event::Escalation {
                        escalation: escalation.clone(),
                    },
                );
            }
            fresh.push(escalation);
        }
        self.seen.retain(|key| current.contains(key));

        state.limiter.lock().await.cleanup(LIMITER_IDLE);
        fresh
    }
}

/// Watches derived health statuses and broadcasts transitions.
#[derive(Debug, Default)]
pub struct HealthWatcher {
    last: Option<HashMap<String, HealthStatus>>,
}

impl HealthWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare current statuses to the previous poll. The first poll only
    /// records a baseline. Returns the number of changes broadcast.
    pub async fn poll(&mut self, state: &Arc<NodeState>) -> usize {
        let names = state.settings().await.accounts.names();
        let views = state.health.lock().await.get_statuses(&names);
        let current: HashMap<String, HealthStatus> =
            views.into_iter().map(|v| (v.account, v.status)).collect();

        let Some(previous) = self.last.replace(current.clone()) else {
            return 0;
        };

        let mut changed = 0;
        for name in &names {
            let Some(&to) = current.get(name) else {
                continue;
            };
            let from = previous.get(name).copied();
            if from == Some(to) {
                continue;
            }
            tracing::info!(account = %name, from = ?from, to = ?to, "health changed");
            state.notify_all(Event::HealthChanged {
                account: name.clone(),
                from,
                to,
            });
            changed += 1;
        }
        changed
    }
}

/// Spawn the sweep and watch loops. Intervals are re-read from the current
/// settings before every wait so reloads apply without a restart.
pub fn spawn(state: Arc<NodeState>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let sla = {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sweeper = SlaSweeper::new();
            loop {
                let wait = state.settings().await.sla_sweep_interval;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let fresh = sweeper.sweep(&state).await;
                if !fresh.is_empty() {
                    tracing::debug!(escalations = fresh.len(), "SLA sweep finished");
                }
            }
        })
    };

    let health = tokio::spawn(async move {
        let mut watcher = HealthWatcher::new();
        loop {
            watcher.poll(&state).await;
            let wait = state.settings().await.health_watch_interval;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    });

    vec![sla, health]
}
