use super::{NodeState, json_response, now_ms};
use convoy::protocol::Response;
use convoy_fleet::sla::{adaptive_escalations, legacy_escalations};
use std::sync::Arc;

/// Time-based escalations for every open task.
pub async fn handle_sla_check(state: &Arc<NodeState>) -> Response {
    let thresholds = state.settings().await.sla;
    let tasks = state.tasks.lock().await;
    let escalations = legacy_escalations(tasks.open_tasks(), &thresholds, now_ms());
    json_response(&escalations)
}

/// Escalations from live work-session signals.
pub async fn handle_adaptive_sla_check(state: &Arc<NodeState>) -> Response {
    let settings = state.settings().await;
    let tasks = state.tasks.lock().await;
    let sessions = state.work_sessions.lock().await;
    let escalations = adaptive_escalations(
        tasks.open_tasks(),
        sessions.iter(),
        &settings.adaptive,
        now_ms(),
    );
    json_response(&escalations)
}
