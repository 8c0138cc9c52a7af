use super::{
    NodeState, error_response, json_response, now_ms, ok_response, require_account,
};
use convoy::protocol::{AccountInfo, ErrorCode, Event, MessageEntry, Response};
use convoy_fleet::inbox::Message;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 50;

pub async fn handle_send_message(
    state: &Arc<NodeState>,
    from: &str,
    to: &str,
    body: String,
) -> Response {
    if let Err(resp) = require_account(state, to).await {
        return resp;
    }

    let msg = Message {
        message_id: Uuid::new_v4().to_string(),
        from: from.to_string(),
        to: to.to_string(),
        body,
        timestamp_ms: now_ms(),
        read: false,
    };
    let preview = msg.preview(PREVIEW_CHARS);
    let message_id = msg.message_id.clone();

    if let Err(e) = state.inbox.lock().await.push(msg) {
        tracing::error!(err = %e, "failed to store message");
        return error_response(ErrorCode::InternalError, "failed to store message");
    }

    tracing::debug!(from = %from, to = %to, message_id = %message_id, "message sent");
    state.notify(
        to,
        Event::NewMessage {
            message_id: message_id.clone(),
            from: from.to_string(),
            preview,
        },
    );
    ok_response(Some(json!({ "messageId": message_id })))
}

pub async fn handle_read_messages(
    state: &Arc<NodeState>,
    account: &str,
    unread_only: bool,
    limit: Option<usize>,
    mark_read: bool,
) -> Response {
    let mut inbox = state.inbox.lock().await;
    let entries: Vec<MessageEntry> = inbox
        .list(account, unread_only, limit)
        .into_iter()
        .map(Message::to_entry)
        .collect();

    if mark_read {
        let ids: Vec<String> = entries
            .iter()
            .filter(|e| !e.read)
            .map(|e| e.message_id.clone())
            .collect();
        if let Err(e) = inbox.mark_read(account, &ids) {
            tracing::error!(err = %e, "failed to mark messages read");
            return error_response(ErrorCode::InternalError, "failed to update inbox");
        }
    }

    json_response(&entries)
}

pub async fn handle_count_unread(state: &Arc<NodeState>, account: &str) -> Response {
    let unread = state.inbox.lock().await.unread_count(account);
    ok_response(Some(json!({ "unread": unread })))
}

pub async fn handle_list_accounts(state: &Arc<NodeState>) -> Response {
    let names = state.settings().await.accounts.names();
    let statuses = state.health.lock().await.get_statuses(&names);
    let open_tasks: Vec<usize> = {
        let tasks = state.tasks.lock().await;
        names.iter().map(|n| tasks.open_count_for(n)).collect()
    };
    let sessions = state.sessions.lock().await;

    let accounts: Vec<AccountInfo> = names
        .iter()
        .zip(statuses)
        .zip(open_tasks)
        .map(|((name, view), open_tasks)| AccountInfo {
            name: name.clone(),
            status: view.status,
            sessions: sessions.count(name),
            open_tasks,
        })
        .collect();
    json_response(&accounts)
}
