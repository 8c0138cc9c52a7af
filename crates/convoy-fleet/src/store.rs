//! Canonical task records.
//!
//! All mutation goes through [`TaskStore`]. Each mutating operation works on
//! a clone of the stored task, persists the clone, and only then swaps it
//! into memory, so a failed write leaves both copies as they were.

use crate::delegation::{
    DelegationChain, HopCheck, ReauthorizationPolicy, ReauthorizationRequest,
};
use crate::error::FleetError;
use crate::friction::{admit_acceptance, evaluate_gate};
use crate::task::{Task, TaskEvent, is_legal_transition};
use anyhow::{Context, Result};
use convoy::protocol::{GateDecision, TaskFields, TaskStatus};
use convoy_crypto::time::now_ms;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const TASKS_FILE: &str = "tasks.jsonl";

// ---------------------------------------------------------------------------
// Persistence backends
// ---------------------------------------------------------------------------

/// Where task snapshots are written.
pub trait TaskPersistence: Send {
    /// Load the latest snapshot of every task, in creation order.
    fn load(&mut self) -> Result<Vec<Task>>;
    /// Durably record the new state of `tasks`, all or nothing.
    fn save(&mut self, tasks: &[&Task]) -> Result<()>;
}

/// Append-only JSONL log of task snapshots; the last line for an id wins.
pub struct JsonlTaskLog {
    path: PathBuf,
}

impl JsonlTaskLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(TASKS_FILE),
        }
    }

    fn rewrite(&self, tasks: &[Task]) -> Result<()> {
        let mut buf = Vec::new();
        for task in tasks {
            serde_json::to_writer(&mut buf, task)?;
            buf.push(b'\n');
        }
        crate::state_dir::write_atomic(&self.path, &buf)
    }
}

impl TaskPersistence for JsonlTaskLog {
    fn load(&mut self) -> Result<Vec<Task>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, Task> = HashMap::new();
        let mut lines = 0usize;
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            lines += 1;
            let task: Task = serde_json::from_str(line)
                .with_context(|| format!("invalid task record at line {}", n + 1))?;
            if !latest.contains_key(&task.id) {
                order.push(task.id.clone());
            }
            latest.insert(task.id.clone(), task);
        }
        let tasks: Vec<Task> = order
            .iter()
            .filter_map(|id| latest.remove(id))
            .collect();

        if lines > tasks.len() * 2 {
            tracing::debug!(lines, tasks = tasks.len(), "compacting task log");
            self.rewrite(&tasks)?;
        }
        Ok(tasks)
    }

    fn save(&mut self, tasks: &[&Task]) -> Result<()> {
        let mut buf = Vec::new();
        for task in tasks {
            serde_json::to_writer(&mut buf, task)?;
            buf.push(b'\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(&buf)?;
        Ok(())
    }
}

/// Keeps the latest snapshot of each task in memory. Used for `--ephemeral`
/// and in tests.
#[derive(Default)]
pub struct MemoryTaskLog {
    latest: HashMap<String, Task>,
    order: Vec<String>,
    fail: Arc<AtomicBool>,
}

impl MemoryTaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A switch that makes every subsequent `save` fail while set.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail)
    }
}

impl TaskPersistence for MemoryTaskLog {
    fn load(&mut self) -> Result<Vec<Task>> {
        Ok(self
            .order
            .iter()
            .filter_map(|id| self.latest.get(id).cloned())
            .collect())
    }

    fn save(&mut self, tasks: &[&Task]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("task log unavailable");
        }
        for task in tasks {
            if self.latest.insert(task.id.clone(), (*task).clone()).is_none() {
                self.order.push(task.id.clone());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub created_by: String,
    pub assignee: Option<String>,
    pub fields: TaskFields,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub task_id: String,
    pub actor: String,
    pub to: TaskStatus,
    pub expected: Option<TaskStatus>,
    pub reason: Option<String>,
    pub justification: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub task: Task,
    pub from: TaskStatus,
    /// Set for transitions into `accepted`.
    pub gate: Option<GateDecision>,
}

pub struct TaskStore {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    log: Box<dyn TaskPersistence>,
}

impl TaskStore {
    /// Open a store over a persistence backend, loading what it holds.
    pub fn open(mut log: Box<dyn TaskPersistence>) -> Result<Self> {
        let loaded = log.load()?;
        let order = loaded.iter().map(|t| t.id.clone()).collect();
        let tasks = loaded.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self { tasks, order, log })
    }

    pub fn in_memory() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            log: Box::new(MemoryTaskLog::new()),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    fn require(&self, task_id: &str) -> Result<&Task, FleetError> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| FleetError::TaskNotFound(task_id.to_string()))
    }

    /// Tasks in creation order, optionally filtered.
    pub fn list(&self, status: Option<TaskStatus>, assignee: Option<&str>) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .filter(|t| assignee.is_none_or(|a| t.assignee.as_deref() == Some(a)))
            .collect()
    }

    /// Non-terminal tasks, in creation order.
    pub fn open_tasks(&self) -> impl Iterator<Item = &Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_open())
    }

    pub fn open_count_for(&self, account: &str) -> usize {
        self.open_tasks()
            .filter(|t| t.assignee.as_deref() == Some(account))
            .count()
    }

    /// Persist then publish. On error nothing changes.
    fn commit(&mut self, task: Task) -> Result<Task, FleetError> {
        self.log
            .save(&[&task])
            .with_context(|| format!("failed to persist task {}", task.id))?;
        self.publish(task.clone());
        Ok(task)
    }

    fn publish(&mut self, task: Task) {
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn create(&mut self, new: NewTask) -> Result<Task, FleetError> {
        self.create_at(new, now_ms())
    }

    fn create_at(&mut self, new: NewTask, now: u64) -> Result<Task, FleetError> {
        let owner = new.assignee.as_deref().unwrap_or(&new.created_by);
        let mut task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            status: TaskStatus::Todo,
            assignee: new.assignee.clone(),
            created_by: new.created_by.clone(),
            created_at_ms: now,
            updated_at_ms: now,
            fields: new.fields,
            delegation: DelegationChain::rooted(owner),
            handoff_pending: false,
            recreated_from: None,
            history: Vec::new(),
        };
        task.record(
            &new.created_by,
            TaskEvent::Created {
                assignee: new.assignee,
            },
            now,
        );
        let task = self.commit(task)?;
        tracing::debug!(task_id = %task.id, created_by = %task.created_by, "task created");
        Ok(task)
    }

    /// Apply a status change. The expected-status check, the edge check, the
    /// friction gate and the write all happen under the caller's `&mut`
    /// borrow, so two racing requests cannot both pass.
    pub fn transition(&mut self, req: TransitionRequest) -> Result<TransitionOutcome, FleetError> {
        self.transition_at(req, now_ms())
    }

    fn transition_at(
        &mut self,
        req: TransitionRequest,
        now: u64,
    ) -> Result<TransitionOutcome, FleetError> {
        let current = self.require(&req.task_id)?;
        let from = current.status;

        if req.expected.is_some_and(|e| e != from) || !is_legal_transition(from, req.to) {
            return Err(FleetError::InvalidTransition { from, to: req.to });
        }

        let reason = req
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        if req.to == TaskStatus::Rejected && reason.is_none() {
            return Err(FleetError::MissingReason);
        }

        let (gate, justification) = if req.to == TaskStatus::Accepted {
            let decision = evaluate_gate(&current.fields);
            let justification = admit_acceptance(decision, req.justification.as_deref())?;
            (Some(decision), justification)
        } else {
            (None, None)
        };

        let mut task = current.clone();
        task.status = req.to;
        task.record(
            &req.actor,
            TaskEvent::StatusChanged {
                from,
                to: req.to,
                reason,
                justification,
                gate,
            },
            now,
        );
        let task = self.commit(task)?;
        tracing::info!(task_id = %task.id, %from, to = %req.to, actor = %req.actor, "task status changed");
        Ok(TransitionOutcome { task, from, gate })
    }

    /// Create a fresh `todo` task from a rejected one, linking both.
    pub fn recreate(&mut self, task_id: &str, actor: &str) -> Result<Task, FleetError> {
        let now = now_ms();
        let original = self.require(task_id)?;
        if original.status != TaskStatus::Rejected {
            return Err(FleetError::InvalidTransition {
                from: original.status,
                to: TaskStatus::Todo,
            });
        }
        if let Some(existing) = original.recreated_as() {
            return Err(FleetError::Forbidden(format!(
                "task {task_id} was already recreated as {existing}"
            )));
        }

        let fields = original.fields.clone();
        let title = original.title.clone();
        let mut updated_original = original.clone();

        let mut fresh = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            status: TaskStatus::Todo,
            assignee: None,
            created_by: actor.to_string(),
            created_at_ms: now,
            updated_at_ms: now,
            fields,
            delegation: DelegationChain::rooted(actor),
            handoff_pending: false,
            recreated_from: Some(task_id.to_string()),
            history: Vec::new(),
        };
        fresh.record(actor, TaskEvent::Created { assignee: None }, now);
        fresh.record(
            actor,
            TaskEvent::RecreatedFrom {
                original_task_id: task_id.to_string(),
            },
            now,
        );
        updated_original.record(
            actor,
            TaskEvent::Recreated {
                new_task_id: fresh.id.clone(),
            },
            now,
        );

        // Both records go out in one write so the link can never be half made.
        self.log
            .save(&[&fresh, &updated_original])
            .with_context(|| format!("failed to persist recreation of task {task_id}"))?;
        self.publish(updated_original);
        self.publish(fresh.clone());
        tracing::info!(task_id = %task_id, new_task_id = %fresh.id, "rejected task recreated");
        Ok(fresh)
    }

    /// Record a progress note. Counts as an update for staleness.
    pub fn record_progress(
        &mut self,
        task_id: &str,
        actor: &str,
        note: Option<String>,
    ) -> Result<Task, FleetError> {
        let current = self.require(task_id)?;
        if !current.is_open() {
            return Err(FleetError::Forbidden(format!(
                "task {task_id} is {}",
                current.status
            )));
        }
        let mut task = current.clone();
        task.record(actor, TaskEvent::Progress { note }, now_ms());
        self.commit(task)
    }

    /// Hand a task from `from` to `to`, enforcing the depth limit. Only the
    /// current assignee or the creator may hand a task on. A hop over the
    /// limit is written to the chain and history before the error is returned.
    pub fn handoff(
        &mut self,
        task_id: &str,
        from: &str,
        to: &str,
        max_depth: u32,
    ) -> Result<Task, FleetError> {
        let now = now_ms();
        let current = self.require(task_id)?;
        if !current.is_open() {
            return Err(FleetError::Forbidden(format!(
                "task {task_id} is {}",
                current.status
            )));
        }
        if current.assignee.as_deref() != Some(from) && current.created_by != from {
            return Err(FleetError::Forbidden(format!(
                "{from} may not hand off task {task_id}"
            )));
        }
        if let Some(pending) = current.delegation.pending() {
            return Err(FleetError::DepthExceeded(format!(
                "{}; hop to {} awaits re-authorization",
                pending.reason, pending.to
            )));
        }
        if current.assignee.as_deref() == Some(to) {
            return Err(FleetError::Forbidden(format!(
                "task {task_id} is already assigned to {to}"
            )));
        }

        let mut task = current.clone();
        match task.delegation.extend(from, to, max_depth, now) {
            HopCheck::Allowed { depth } => {
                task.assignee = Some(to.to_string());
                task.handoff_pending = true;
                task.record(
                    from,
                    TaskEvent::Handoff {
                        from: from.to_string(),
                        to: to.to_string(),
                        depth,
                    },
                    now,
                );
                let task = self.commit(task)?;
                tracing::info!(task_id = %task_id, from = %from, to = %to, depth, "task handed off");
                Ok(task)
            }
            HopCheck::Blocked { depth, reason } => {
                task.record(
                    from,
                    TaskEvent::DelegationBlocked {
                        to: to.to_string(),
                        depth,
                        max_depth,
                        reason: reason.clone(),
                    },
                    now,
                );
                self.commit(task)?;
                tracing::warn!(task_id = %task_id, from = %from, to = %to, depth, max_depth, "delegation blocked");
                Err(FleetError::DepthExceeded(reason))
            }
        }
    }

    /// The assignee acknowledges a pending handoff.
    pub fn accept_handoff(&mut self, task_id: &str, account: &str) -> Result<Task, FleetError> {
        let current = self.require(task_id)?;
        if current.assignee.as_deref() != Some(account) || !current.handoff_pending {
            return Err(FleetError::Forbidden(format!(
                "no pending handoff of task {task_id} to {account}"
            )));
        }
        let mut task = current.clone();
        task.handoff_pending = false;
        task.record(account, TaskEvent::HandoffAccepted, now_ms());
        self.commit(task)
    }

    /// Complete the task's pending blocked hop under a raised limit, if the
    /// policy allows it.
    pub fn reauthorize(
        &mut self,
        task_id: &str,
        account: &str,
        max_depth: u32,
        reason: &str,
        policy: &dyn ReauthorizationPolicy,
    ) -> Result<Task, FleetError> {
        let now = now_ms();
        let current = self.require(task_id)?;
        let Some(pending) = current.delegation.pending() else {
            return Err(FleetError::NoPendingDelegation(task_id.to_string()));
        };

        policy
            .authorize(&ReauthorizationRequest {
                account,
                task_id,
                pending,
                requested_max_depth: max_depth,
                reason,
            })
            .map_err(FleetError::Forbidden)?;

        if pending.depth >= max_depth {
            return Err(FleetError::DepthExceeded(format!(
                "Depth {} exceeds max {max_depth}",
                pending.depth
            )));
        }

        let mut task = current.clone();
        let Some(hop) = task
            .delegation
            .complete_pending(account, max_depth, reason, now)
        else {
            return Err(FleetError::NoPendingDelegation(task_id.to_string()));
        };
        task.assignee = Some(hop.to.clone());
        task.handoff_pending = true;
        task.record(
            account,
            TaskEvent::Reauthorized {
                to: hop.to.clone(),
                max_depth,
                reason: reason.to_string(),
            },
            now,
        );
        let task = self.commit(task)?;
        tracing::warn!(task_id = %task_id, by = %account, to = %hop.to, max_depth, "delegation re-authorized");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::{AllowList, DenyAll};
    use convoy::protocol::{Criticality, Reversibility, Verifiability};

    fn new_task(title: &str, fields: TaskFields) -> NewTask {
        NewTask {
            title: title.to_string(),
            created_by: "alice".to_string(),
            assignee: None,
            fields,
        }
    }

    fn move_to(store: &mut TaskStore, id: &str, to: TaskStatus) -> Result<TransitionOutcome, FleetError> {
        store.transition(TransitionRequest {
            task_id: id.to_string(),
            actor: "alice".to_string(),
            to,
            expected: None,
            reason: None,
            justification: None,
        })
    }

    fn ready_for_review(store: &mut TaskStore, fields: TaskFields) -> String {
        let id = store.create(new_task("review me", fields)).unwrap().id;
        move_to(store, &id, TaskStatus::InProgress).unwrap();
        move_to(store, &id, TaskStatus::ReadyForReview).unwrap();
        id
    }

    #[test]
    fn illegal_edges_leave_task_unchanged() {
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                if is_legal_transition(from, to) {
                    continue;
                }
                let mut store = TaskStore::in_memory();
                let id = store.create(new_task("t", TaskFields::default())).unwrap().id;
                // walk to `from` along legal edges
                let path: &[TaskStatus] = match from {
                    TaskStatus::Todo => &[],
                    TaskStatus::InProgress => &[TaskStatus::InProgress],
                    TaskStatus::ReadyForReview => {
                        &[TaskStatus::InProgress, TaskStatus::ReadyForReview]
                    }
                    TaskStatus::Accepted => &[
                        TaskStatus::InProgress,
                        TaskStatus::ReadyForReview,
                        TaskStatus::Accepted,
                    ],
                    TaskStatus::Rejected => &[],
                };
                for &step in path {
                    move_to(&mut store, &id, step).unwrap();
                }
                if from == TaskStatus::Rejected {
                    move_to(&mut store, &id, TaskStatus::InProgress).unwrap();
                    move_to(&mut store, &id, TaskStatus::ReadyForReview).unwrap();
                    store
                        .transition(TransitionRequest {
                            task_id: id.clone(),
                            actor: "alice".into(),
                            to: TaskStatus::Rejected,
                            expected: None,
                            reason: Some("nope".into()),
                            justification: None,
                        })
                        .unwrap();
                }
                let before = store.get(&id).unwrap().clone();
                let err = move_to(&mut store, &id, to).unwrap_err();
                assert!(
                    matches!(err, FleetError::InvalidTransition { .. }),
                    "{from} -> {to}: {err}"
                );
                assert_eq!(store.get(&id).unwrap(), &before);
            }
        }
    }

    #[test]
    fn rejection_requires_reason_and_records_it() {
        let mut store = TaskStore::in_memory();
        let id = ready_for_review(&mut store, TaskFields::default());

        let err = move_to(&mut store, &id, TaskStatus::Rejected).unwrap_err();
        assert!(matches!(err, FleetError::MissingReason));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::ReadyForReview);

        store
            .transition(TransitionRequest {
                task_id: id.clone(),
                actor: "bob".into(),
                to: TaskStatus::Rejected,
                expected: Some(TaskStatus::ReadyForReview),
                reason: Some("tests fail on CI".into()),
                justification: None,
            })
            .unwrap();
        assert_eq!(
            store.get(&id).unwrap().rejection_reason(),
            Some("tests fail on CI")
        );
    }

    #[test]
    fn expected_status_mismatch_is_invalid_transition() {
        let mut store = TaskStore::in_memory();
        let id = store.create(new_task("t", TaskFields::default())).unwrap().id;
        let req = TransitionRequest {
            task_id: id.clone(),
            actor: "a".into(),
            to: TaskStatus::InProgress,
            expected: Some(TaskStatus::Todo),
            reason: None,
            justification: None,
        };
        store.transition(req.clone()).unwrap();
        match store.transition(req).unwrap_err() {
            FleetError::InvalidTransition { from, .. } => assert_eq!(from, TaskStatus::InProgress),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn auto_accept_records_gate() {
        let mut store = TaskStore::in_memory();
        let id = ready_for_review(
            &mut store,
            TaskFields {
                criticality: Some(Criticality::Low),
                verifiability: Some(Verifiability::AutoTestable),
                ..Default::default()
            },
        );
        let outcome = move_to(&mut store, &id, TaskStatus::Accepted).unwrap();
        assert_eq!(outcome.gate, Some(GateDecision::AutoAccept));
        assert!(matches!(
            outcome.task.history.last().unwrap().event,
            TaskEvent::StatusChanged { gate: Some(GateDecision::AutoAccept), .. }
        ));
    }

    #[test]
    fn elevated_review_blocks_acceptance() {
        let mut store = TaskStore::in_memory();
        let id = ready_for_review(
            &mut store,
            TaskFields {
                criticality: Some(Criticality::Critical),
                reversibility: Some(Reversibility::Irreversible),
                ..Default::default()
            },
        );
        let err = move_to(&mut store, &id, TaskStatus::Accepted).unwrap_err();
        assert!(matches!(
            err,
            FleetError::FrictionBlocked { decision: GateDecision::RequireElevatedReview, .. }
        ));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::ReadyForReview);
    }

    #[test]
    fn justification_follow_up_accepts() {
        let mut store = TaskStore::in_memory();
        let id = ready_for_review(
            &mut store,
            TaskFields {
                verifiability: Some(Verifiability::Subjective),
                ..Default::default()
            },
        );
        assert!(move_to(&mut store, &id, TaskStatus::Accepted).is_err());

        let outcome = store
            .transition(TransitionRequest {
                task_id: id.clone(),
                actor: "alice".into(),
                to: TaskStatus::Accepted,
                expected: Some(TaskStatus::ReadyForReview),
                reason: None,
                justification: Some("copy reads well".into()),
            })
            .unwrap();
        assert_eq!(outcome.task.status, TaskStatus::Accepted);
        assert!(matches!(
            &outcome.task.history.last().unwrap().event,
            TaskEvent::StatusChanged { justification: Some(j), .. } if j == "copy reads well"
        ));
    }

    #[test]
    fn persistence_failure_leaves_task_unchanged() {
        let log = MemoryTaskLog::new();
        let switch = log.failure_switch();
        let mut store = TaskStore::open(Box::new(log)).unwrap();
        let id = store.create(new_task("t", TaskFields::default())).unwrap().id;

        switch.store(true, Ordering::SeqCst);
        let err = move_to(&mut store, &id, TaskStatus::InProgress).unwrap_err();
        assert!(matches!(err, FleetError::Storage(_)));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Todo);

        switch.store(false, Ordering::SeqCst);
        move_to(&mut store, &id, TaskStatus::InProgress).unwrap();
    }

    /// Fails every save once `ok` runs out.
    struct FailAfter {
        inner: MemoryTaskLog,
        ok: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl TaskPersistence for FailAfter {
        fn load(&mut self) -> Result<Vec<Task>> {
            self.inner.load()
        }

        fn save(&mut self, tasks: &[&Task]) -> Result<()> {
            if self.ok.load(Ordering::SeqCst) == 0 {
                anyhow::bail!("disk full");
            }
            self.ok.fetch_sub(1, Ordering::SeqCst);
            self.inner.save(tasks)
        }
    }

    #[test]
    fn failed_recreate_can_be_retried_once() {
        // create, in_progress, ready_for_review, rejected
        let ok = Arc::new(std::sync::atomic::AtomicUsize::new(4));
        let log = FailAfter {
            inner: MemoryTaskLog::new(),
            ok: Arc::clone(&ok),
        };
        let mut store = TaskStore::open(Box::new(log)).unwrap();
        let id = ready_for_review(&mut store, TaskFields::default());
        store
            .transition(TransitionRequest {
                task_id: id.clone(),
                actor: "alice".into(),
                to: TaskStatus::Rejected,
                expected: None,
                reason: Some("flaky".into()),
                justification: None,
            })
            .unwrap();

        let err = store.recreate(&id, "alice").unwrap_err();
        assert!(matches!(err, FleetError::Storage(_)));
        assert!(store.get(&id).unwrap().recreated_as().is_none());
        assert!(store.list(Some(TaskStatus::Todo), None).is_empty());

        ok.store(usize::MAX, Ordering::SeqCst);
        let fresh = store.recreate(&id, "alice").unwrap();
        assert!(matches!(
            store.recreate(&id, "alice"),
            Err(FleetError::Forbidden(_))
        ));
        let todo: Vec<_> = store
            .list(Some(TaskStatus::Todo), None)
            .iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(todo, vec![fresh.id]);
    }

    #[test]
    fn memory_log_keeps_one_snapshot_per_task() {
        let mut log = MemoryTaskLog::new();
        let mut task = TaskStore::in_memory()
            .create(new_task("t", TaskFields::default()))
            .unwrap();
        log.save(&[&task]).unwrap();
        task.status = TaskStatus::InProgress;
        log.save(&[&task]).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TaskStatus::InProgress);
        assert_eq!(log.latest.len(), 1);
    }

    #[test]
    fn jsonl_log_reloads_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = TaskStore::open(Box::new(JsonlTaskLog::new(dir.path()))).unwrap();
            let id = store.create(new_task("persist", TaskFields::default())).unwrap().id;
            store.create(new_task("second", TaskFields::default())).unwrap();
            move_to(&mut store, &id, TaskStatus::InProgress).unwrap();
            id
        };
        let store = TaskStore::open(Box::new(JsonlTaskLog::new(dir.path()))).unwrap();
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::InProgress);
        let titles: Vec<_> = store.list(None, None).iter().map(|t| t.title.clone()).collect();
        assert_eq!(titles, vec!["persist", "second"]);
    }

    #[test]
    fn jsonl_log_compacts_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TaskStore::open(Box::new(JsonlTaskLog::new(dir.path()))).unwrap();
            let id = store.create(new_task("t", TaskFields::default())).unwrap().id;
            move_to(&mut store, &id, TaskStatus::InProgress).unwrap();
            move_to(&mut store, &id, TaskStatus::ReadyForReview).unwrap();
        }
        TaskStore::open(Box::new(JsonlTaskLog::new(dir.path()))).unwrap();
        let data = std::fs::read_to_string(dir.path().join(TASKS_FILE)).unwrap();
        assert_eq!(data.lines().count(), 1);
    }

    #[test]
    fn recreate_links_both_ways() {
        let mut store = TaskStore::in_memory();
        let id = ready_for_review(
            &mut store,
            TaskFields {
                tags: vec!["infra".into()],
                contract: Some("all green".into()),
                ..Default::default()
            },
        );
        assert!(store.recreate(&id, "alice").is_err());

        store
            .transition(TransitionRequest {
                task_id: id.clone(),
                actor: "alice".into(),
                to: TaskStatus::Rejected,
                expected: None,
                reason: Some("flaky".into()),
                justification: None,
            })
            .unwrap();
        let fresh = store.recreate(&id, "alice").unwrap();
        assert_eq!(fresh.status, TaskStatus::Todo);
        assert_eq!(fresh.fields.tags, vec!["infra".to_string()]);
        assert_eq!(fresh.recreated_from.as_deref(), Some(id.as_str()));
        assert_eq!(store.get(&id).unwrap().recreated_as(), Some(fresh.id.as_str()));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Rejected);
        assert!(matches!(store.recreate(&id, "alice"), Err(FleetError::Forbidden(_))));
    }

    #[test]
    fn handoff_chain_blocks_at_max_depth() {
        let mut store = TaskStore::in_memory();
        let id = store.create(new_task("deep", TaskFields::default())).unwrap().id;
        store.handoff(&id, "alice", "bob", 3).unwrap();
        store.handoff(&id, "bob", "carol", 3).unwrap();

        let err = store.handoff(&id, "carol", "dave", 3).unwrap_err();
        assert!(matches!(err, FleetError::DepthExceeded(ref r) if r == "Depth 3 exceeds max 3"));

        let task = store.get(&id).unwrap();
        assert_eq!(task.assignee.as_deref(), Some("carol"));
        assert_eq!(task.delegation.hops().len(), 4);
        assert!(matches!(
            task.history.last().unwrap().event,
            TaskEvent::DelegationBlocked { depth: 3, .. }
        ));

        // further handoffs fail until re-authorized
        assert!(matches!(
            store.handoff(&id, "carol", "erin", 3),
            Err(FleetError::DepthExceeded(_))
        ));
    }

    #[test]
    fn reauthorize_completes_exactly_the_blocked_hop() {
        let mut store = TaskStore::in_memory();
        let id = store.create(new_task("deep", TaskFields::default())).unwrap().id;
        store.handoff(&id, "alice", "bob", 1).unwrap_err();

        assert!(matches!(
            store.reauthorize(&id, "alice", 2, "hotfix", &DenyAll),
            Err(FleetError::Forbidden(_))
        ));

        let policy = AllowList::new(["alice".to_string()], 4);
        assert!(matches!(
            store.reauthorize(&id, "alice", 1, "hotfix", &policy),
            Err(FleetError::DepthExceeded(_))
        ));
        let task = store.reauthorize(&id, "alice", 2, "hotfix", &policy).unwrap();
        assert_eq!(task.assignee.as_deref(), Some("bob"));
        assert!(task.delegation.pending().is_none());

        // the configured maximum applies again to the next hop
        assert!(matches!(
            store.handoff(&id, "bob", "carol", 1),
            Err(FleetError::DepthExceeded(_))
        ));
        assert!(matches!(
            store.reauthorize("missing", "alice", 2, "x", &policy),
            Err(FleetError::TaskNotFound(_))
        ));
    }

    #[test]
    fn handoff_needs_assignee_or_creator() {
        let mut store = TaskStore::in_memory();
        let id = store.create(new_task("t", TaskFields::default())).unwrap().id;
        assert!(matches!(
            store.handoff(&id, "mallory", "bob", 3),
            Err(FleetError::Forbidden(_))
        ));
        assert_eq!(store.get(&id).unwrap().delegation.hops().len(), 1);

        store.handoff(&id, "alice", "bob", 3).unwrap();
        store.handoff(&id, "bob", "carol", 3).unwrap();
        // the creator keeps the right after passing the task on
        store.handoff(&id, "alice", "dave", 4).unwrap();
        assert!(store.handoff(&id, "bob", "erin", 5).is_err());
    }

    #[test]
    fn accept_handoff_only_by_assignee() {
        let mut store = TaskStore::in_memory();
        let id = store.create(new_task("t", TaskFields::default())).unwrap().id;
        store.handoff(&id, "alice", "bob", 3).unwrap();
        assert!(store.accept_handoff(&id, "carol").is_err());
        let task = store.accept_handoff(&id, "bob").unwrap();
        assert!(!task.handoff_pending);
        assert!(store.accept_handoff(&id, "bob").is_err());
    }

    #[test]
    fn list_filters() {
        let mut store = TaskStore::in_memory();
        let a = store.create(new_task("a", TaskFields::default())).unwrap().id;
        store
            .create(NewTask {
                assignee: Some("bob".into()),
                ..new_task("b", TaskFields::default())
            })
            .unwrap();
        move_to(&mut store, &a, TaskStatus::InProgress).unwrap();

        assert_eq!(store.list(Some(TaskStatus::Todo), None).len(), 1);
        assert_eq!(store.list(None, Some("bob")).len(), 1);
        assert_eq!(store.open_count_for("bob"), 1);
    }
}
