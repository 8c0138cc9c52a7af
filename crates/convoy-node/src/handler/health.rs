use super::{NodeState, json_response, ok_response, require_account};
use convoy::protocol::{AggregateHealth, HealthView, Response};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FleetHealth {
    accounts: Vec<HealthView>,
    aggregate: AggregateHealth,
}

/// `null` data for a configured account that has never connected.
pub async fn handle_get_health(state: &Arc<NodeState>, account: &str) -> Response {
    if let Err(resp) = require_account(state, account).await {
        return resp;
    }
    match state.health.lock().await.get_health(account) {
        Some(view) => json_response(&view),
        None => ok_response(None),
    }
}

pub async fn handle_fleet_health(
    state: &Arc<NodeState>,
    accounts: Option<Vec<String>>,
) -> Response {
    let accounts = match accounts {
        Some(list) => list,
        None => state.settings().await.accounts.names(),
    };
    let health = state.health.lock().await;
    json_response(&FleetHealth {
        accounts: health.get_statuses(&accounts),
        aggregate: health.get_aggregate_status(&accounts),
    })
}

/// Self-reported signals from the calling account.
pub async fn handle_report_health(
    state: &Arc<NodeState>,
    me: &str,
    rate_limited: Option<bool>,
    error: Option<String>,
    clear_errors: bool,
) -> Response {
    let mut health = state.health.lock().await;
    if clear_errors {
        health.clear_errors(me);
    }
    if let Some(message) = error {
        tracing::warn!(account = %me, error = %message, "account reported an error");
        health.record_error(me);
    }
    match rate_limited {
        Some(true) => health.record_rate_limit(me),
        Some(false) => health.clear_rate_limit(me),
        None => {}
    }
    match health.get_health(me) {
        Some(view) => json_response(&view),
        None => ok_response(None),
    }
}
