use super::{NodeState, fleet_error, json_response, now_ms, require_account};
use convoy::protocol::{Event, GateDecision, Response, TaskFields, TaskStatus};
use convoy_fleet::store::{NewTask, TransitionRequest};
use convoy_fleet::task::Task;
use convoy_fleet::work_session::ProgressReport;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusChange<'a> {
    task: &'a Task,
    from: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    gate: Option<GateDecision>,
}

pub async fn handle_create_task(
    state: &Arc<NodeState>,
    me: &str,
    title: String,
    fields: TaskFields,
    assignee: Option<String>,
) -> Response {
    if let Some(assignee) = &assignee
        && let Err(resp) = require_account(state, assignee).await
    {
        return resp;
    }

    let created = state.tasks.lock().await.create(NewTask {
        title,
        created_by: me.to_string(),
        assignee,
        fields,
    });
    let task = match created {
        Ok(task) => task,
        Err(e) => return fleet_error(&e),
    };

    if let Some(assignee) = task.assignee.as_deref().filter(|a| *a != me) {
        state.notify(
            assignee,
            Event::TaskAssigned {
                task_id: task.id.clone(),
                title: task.title.clone(),
                from: me.to_string(),
            },
        );
    }
    json_response(&task)
}

pub async fn handle_get_task(state: &Arc<NodeState>, task_id: &str) -> Response {
    let tasks = state.tasks.lock().await;
    match tasks.get(task_id) {
        Some(task) => json_response(task),
        None => fleet_error(&convoy_fleet::FleetError::TaskNotFound(task_id.to_string())),
    }
}

pub async fn handle_list_tasks(
    state: &Arc<NodeState>,
    status: Option<TaskStatus>,
    assignee: Option<&str>,
) -> Response {
    let tasks = state.tasks.lock().await;
    json_response(&tasks.list(status, assignee))
}

pub async fn handle_update_status(
    state: &Arc<NodeState>,
    me: &str,
    task_id: String,
    to: TaskStatus,
    expected: Option<TaskStatus>,
    reason: Option<String>,
    justification: Option<String>,
) -> Response {
    let result = state.tasks.lock().await.transition(TransitionRequest {
        task_id,
        actor: me.to_string(),
        to,
        expected,
        reason,
        justification,
    });
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!(account = %me, err = %e, "status change refused");
            return fleet_error(&e);
        }
    };

    if to.is_terminal() {
        state.work_sessions.lock().await.remove(&outcome.task.id);
        if let Some(assignee) = outcome.task.assignee.as_deref() {
            record_review(state, assignee, to == TaskStatus::Accepted).await;
        }
    }

    json_response(&StatusChange {
        task: &outcome.task,
        from: outcome.from,
        gate: outcome.gate,
    })
}

/// Feed a review outcome into the assignee's trust record.
async fn record_review(state: &Arc<NodeState>, assignee: &str, accepted: bool) {
    match state
        .trust
        .lock()
        .await
        .record_outcome(assignee, accepted, now_ms())
    {
        Ok(true) => tracing::warn!(account = %assignee, "handoffs to account suspended"),
        Ok(false) => {}
        Err(e) => tracing::error!(account = %assignee, err = %e, "failed to record review outcome"),
    }
}

pub async fn handle_recreate(state: &Arc<NodeState>, me: &str, task_id: &str) -> Response {
    let task = match state.tasks.lock().await.recreate(task_id, me) {
        Ok(task) => task,
        Err(e) => return fleet_error(&e),
    };
    if let Some(assignee) = task.assignee.as_deref().filter(|a| *a != me) {
        state.notify(
            assignee,
            Event::TaskAssigned {
                task_id: task.id.clone(),
                title: task.title.clone(),
                from: me.to_string(),
            },
        );
    }
    json_response(&task)
}

pub async fn handle_report_progress(
    state: &Arc<NodeState>,
    me: &str,
    task_id: &str,
    note: Option<String>,
    report: ProgressReport,
) -> Response {
    if let Err(e) = state.tasks.lock().await.record_progress(task_id, me, note) {
        return fleet_error(&e);
    }
    let mut sessions = state.work_sessions.lock().await;
    let session = sessions.record(task_id, me, &report, now_ms());
    json_response(session)
}
