use super::{NodeState, error_response, fleet_error, json_response, require_account};
use convoy::protocol::{AssigneeCandidate, ErrorCode, Event, Response, TaskFields};
use convoy_fleet::FleetError;
use convoy_fleet::store::NewTask;
use convoy_fleet::task::Task;
use std::sync::Arc;

fn assigned(state: &NodeState, task: &Task, from: &str) {
    if let Some(assignee) = task.assignee.as_deref() {
        state.notify(
            assignee,
            Event::TaskAssigned {
                task_id: task.id.clone(),
                title: task.title.clone(),
                from: from.to_string(),
            },
        );
    }
}

/// Hand an existing task, or a new one built from `title` and `fields`, to `to`.
pub async fn handle_handoff(
    state: &Arc<NodeState>,
    me: &str,
    to: &str,
    task_id: Option<String>,
    title: Option<String>,
    fields: TaskFields,
) -> Response {
    if let Err(resp) = require_account(state, to).await {
        return resp;
    }
    if state.trust.lock().await.is_open(to) {
        tracing::warn!(from = %me, to = %to, "handoff refused, circuit open");
        return fleet_error(&FleetError::CircuitOpen(to.to_string()));
    }

    let max_depth = state.settings().await.max_depth;
    let mut tasks = state.tasks.lock().await;

    let task_id = match (task_id, title) {
        (Some(id), _) => id,
        (None, Some(title)) => match tasks.create(NewTask {
            title,
            created_by: me.to_string(),
            assignee: None,
            fields,
        }) {
            Ok(task) => task.id,
            Err(e) => return fleet_error(&e),
        },
        (None, None) => {
            return error_response(ErrorCode::ProtocolError, "either taskId or title is required");
        }
    };

    let result = tasks.handoff(&task_id, me, to, max_depth);
    drop(tasks);
    match result {
        Ok(task) => {
            assigned(state, &task, me);
            json_response(&task)
        }
        Err(e) => fleet_error(&e),
    }
}

pub async fn handle_accept(state: &Arc<NodeState>, me: &str, task_id: &str) -> Response {
    match state.tasks.lock().await.accept_handoff(task_id, me) {
        Ok(task) => json_response(&task),
        Err(e) => fleet_error(&e),
    }
}

pub async fn handle_reauthorize(
    state: &Arc<NodeState>,
    me: &str,
    task_id: &str,
    max_depth: u32,
    reason: &str,
) -> Response {
    let policy = state.settings().await.policy.clone();
    let result = state
        .tasks
        .lock()
        .await
        .reauthorize(task_id, me, max_depth, reason, policy.as_ref());
    match result {
        Ok(task) => {
            assigned(state, &task, me);
            json_response(&task)
        }
        Err(e) => {
            tracing::warn!(account = %me, task_id = %task_id, err = %e, "re-authorization refused");
            fleet_error(&e)
        }
    }
}

/// Rank configured accounts as handoff targets: healthiest first, then the
/// least loaded, then the most trusted. Accounts with an open circuit are
/// left out.
pub async fn handle_suggest_assignee(
    state: &Arc<NodeState>,
    me: &str,
    task_id: Option<&str>,
    exclude: &[String],
) -> Response {
    let names = state.settings().await.accounts.names();

    let (current, open_counts): (Option<String>, Vec<usize>) = {
        let tasks = state.tasks.lock().await;
        let current = match task_id {
            Some(id) => match tasks.get(id) {
                Some(task) => task.assignee.clone(),
                None => return fleet_error(&FleetError::TaskNotFound(id.to_string())),
            },
            None => None,
        };
        (current, names.iter().map(|n| tasks.open_count_for(n)).collect())
    };
    let statuses = state.health.lock().await.get_statuses(&names);
    let trust = state.trust.lock().await;

    let mut candidates: Vec<AssigneeCandidate> = names
        .iter()
        .zip(statuses)
        .zip(open_counts)
        .filter(|((name, _), _)| {
            name.as_str() != me
                && current.as_deref() != Some(name.as_str())
                && !exclude.contains(name)
                && !trust.is_open(name)
        })
        .map(|((name, view), open_tasks)| AssigneeCandidate {
            account: name.clone(),
            status: view.status,
            open_tasks,
            trust: trust.score(name),
        })
        .collect();
    drop(trust);

    candidates.sort_by(|a, b| {
        a.status
            .cmp(&b.status)
            .then(a.open_tasks.cmp(&b.open_tasks))
            .then(b.trust.total_cmp(&a.trust))
            .then(a.account.cmp(&b.account))
    });
    json_response(&candidates)
}
