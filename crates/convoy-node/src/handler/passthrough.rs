use super::{NodeState, RequestContext, error_response, ok_response};
use crate::collab::{self, CollaboratorError};
use convoy::protocol::{ErrorCode, Request, Response};
use std::sync::Arc;

/// Forward a pass-through request to its collaborator and relay the answer.
pub async fn handle_passthrough(
    state: &Arc<NodeState>,
    ctx: &RequestContext,
    request: &Request,
) -> Response {
    let Some((service, method, params)) = collab::route(request) else {
        tracing::error!(kind = request.kind(), "request has no handler");
        return error_response(ErrorCode::InternalError, "internal error");
    };

    let Some(collaborator) = state.collaborators.read().await.get(service) else {
        let (code, message) = CollaboratorError::Unavailable(service.to_string()).to_error_code();
        return error_response(code, &message);
    };
    let timeout = state.settings().await.collaborator_timeout;

    tracing::debug!(account = %ctx.account, service, method, "forwarding to collaborator");
    match collab::call_with_deadline(collaborator, service, method, params, timeout, &ctx.cancel)
        .await
    {
        Ok(result) => ok_response(Some(result)),
        Err(e) => {
            tracing::warn!(account = %ctx.account, service, method, err = %e, "collaborator call failed");
            let (code, message) = e.to_error_code();
            error_response(code, &message)
        }
    }
}
