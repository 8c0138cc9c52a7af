use super::{NodeState, error_response, fleet_error, json_response};
use convoy::protocol::{ErrorCode, Response, WorkspaceInfo};
use convoy_fleet::FleetError;
use convoy_git::{HandoffWorkspace, WorkspaceStatus};
use std::path::PathBuf;
use std::sync::Arc;

fn info(task_id: &str, ws: &HandoffWorkspace, status: &WorkspaceStatus) -> WorkspaceInfo {
    WorkspaceInfo {
        task_id: task_id.to_string(),
        repo_root: ws.repo_root.display().to_string(),
        worktree_path: ws.worktree_path.display().to_string(),
        branch: status.head.clone().or_else(|| Some(ws.branch.clone())),
        exists: status.exists,
        dirty: status.dirty,
    }
}

/// Run blocking git work off the async workers.
async fn run_git<T, F>(f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!(err = %format!("{e:#}"), "git operation failed");
            Err(error_response(ErrorCode::WorkspaceError, &format!("{e:#}")))
        }
        Err(e) => {
            tracing::error!(err = %e, "git task panicked");
            Err(error_response(ErrorCode::InternalError, "internal error"))
        }
    }
}

async fn known_workspace(state: &NodeState, task_id: &str) -> Result<HandoffWorkspace, Response> {
    state
        .workspaces
        .lock()
        .await
        .get(task_id)
        .cloned()
        .ok_or_else(|| {
            error_response(
                ErrorCode::NotFound,
                &format!("no workspace prepared for task {task_id}"),
            )
        })
}

/// Create or reuse the handoff worktree for a task.
pub async fn handle_prepare(state: &Arc<NodeState>, task_id: &str, repo_path: &str) -> Response {
    if state.tasks.lock().await.get(task_id).is_none() {
        return fleet_error(&FleetError::TaskNotFound(task_id.to_string()));
    }

    let repo_path = PathBuf::from(repo_path);
    let id = task_id.to_string();
    let prepared = run_git(move || {
        let ws = convoy_git::prepare_handoff_worktree(&repo_path, &id)?;
        let status = convoy_git::workspace_status(&ws.worktree_path)?;
        Ok((ws, status))
    })
    .await;
    let (ws, status) = match prepared {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    tracing::info!(task_id = %task_id, path = %ws.worktree_path.display(), "handoff worktree ready");
    let data = info(task_id, &ws, &status);
    state
        .workspaces
        .lock()
        .await
        .insert(task_id.to_string(), ws);
    json_response(&data)
}

pub async fn handle_status(state: &Arc<NodeState>, task_id: &str) -> Response {
    let ws = match known_workspace(state, task_id).await {
        Ok(ws) => ws,
        Err(resp) => return resp,
    };
    let path = ws.worktree_path.clone();
    match run_git(move || convoy_git::workspace_status(&path)).await {
        Ok(status) => json_response(&info(task_id, &ws, &status)),
        Err(resp) => resp,
    }
}

/// Remove a task's worktree. Refused while it has uncommitted changes.
pub async fn handle_cleanup(state: &Arc<NodeState>, task_id: &str) -> Response {
    let ws = match known_workspace(state, task_id).await {
        Ok(ws) => ws,
        Err(resp) => return resp,
    };
    let (root, path) = (ws.repo_root.clone(), ws.worktree_path.clone());
    if let Err(resp) = run_git(move || convoy_git::remove_handoff_worktree(&root, &path)).await {
        return resp;
    }
    state.workspaces.lock().await.remove(task_id);
    tracing::info!(task_id = %task_id, "handoff worktree removed");
    json_response(&info(
        task_id,
        &ws,
        &WorkspaceStatus {
            exists: false,
            dirty: false,
            head: None,
        },
    ))
}
