//! Per-connection auth gate and the registry of live sessions.

use crate::config::Accounts;
use convoy::protocol::{ErrorCode, Request, Response};
use std::collections::HashMap;

/// What the connection loop should do with one validated request.
#[derive(Debug)]
pub enum Gate {
    /// Answer without running a handler; the connection stays open.
    Reply(Response),
    /// Answer, then close the connection.
    Close(Response),
    /// The connection is now bound to this account.
    Authenticated(String),
    /// Run the request on behalf of the session's account.
    Dispatch { account: String, request: Request },
}

/// One connection's view of authentication. A connection binds to at most
/// one account for its whole lifetime.
#[derive(Debug)]
pub struct Session {
    connection_id: u64,
    account: Option<String>,
}

impl Session {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            account: None,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.account.is_some()
    }

    pub fn admit(&mut self, request: Request, accounts: &Accounts) -> Gate {
        match (request, self.account.clone()) {
            (Request::Ping, _) => Gate::Reply(Response::Pong { request_id: None }),
            (Request::Auth { .. }, Some(account)) => Gate::Reply(Response::error(
                ErrorCode::AlreadyAuthenticated,
                format!("connection is already authenticated as {account}"),
            )),
            (Request::Auth { account, token }, None) => {
                if accounts.verify(&account, &token) {
                    self.account = Some(account.clone());
                    Gate::Authenticated(account)
                } else {
                    tracing::warn!(conn = self.connection_id, account = %account, "authentication failed");
                    Gate::Close(Response::error(
                        ErrorCode::AuthFailed,
                        "invalid account or token",
                    ))
                }
            }
            (request, None) => {
                tracing::warn!(conn = self.connection_id, kind = request.kind(), "request before authentication");
                Gate::Close(Response::error(
                    ErrorCode::AuthRequired,
                    "authenticate before sending requests",
                ))
            }
            (request, Some(account)) => Gate::Dispatch { account, request },
        }
    }
}

/// Number of live sessions per account.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    counts: HashMap<String, usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the account's session count after opening.
    pub fn open(&mut self, account: &str) -> usize {
        let count = self.counts.entry(account.to_string()).or_default();
        *count += 1;
        *count
    }

    /// Returns how many sessions the account still has.
    pub fn close(&mut self, account: &str) -> usize {
        let Some(count) = self.counts.get_mut(account) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(account);
        }
        remaining
    }

    pub fn count(&self, account: &str) -> usize {
        self.counts.get(account).copied().unwrap_or(0)
    }
}
