use super::{NodeState, fleet_error, json_response, now_ms, require_account};
use convoy::protocol::Response;
use convoy_fleet::FleetError;
use std::sync::Arc;

pub async fn handle_get_trust(state: &Arc<NodeState>, account: &str) -> Response {
    if let Err(resp) = require_account(state, account).await {
        return resp;
    }
    json_response(&state.trust.lock().await.trust(account))
}

pub async fn handle_check_circuit(state: &Arc<NodeState>, account: &str) -> Response {
    if let Err(resp) = require_account(state, account).await {
        return resp;
    }
    json_response(&state.trust.lock().await.circuit(account))
}

/// Close an account's circuit so it can receive handoffs again.
pub async fn handle_reinstate(
    state: &Arc<NodeState>,
    me: &str,
    account: &str,
    reason: &str,
) -> Response {
    if let Err(resp) = require_account(state, account).await {
        return resp;
    }
    let result = state
        .trust
        .lock()
        .await
        .reinstate(account, me, reason, now_ms());
    match result {
        Ok(info) => json_response(&info),
        Err(e) => fleet_error(&FleetError::Storage(e)),
    }
}
