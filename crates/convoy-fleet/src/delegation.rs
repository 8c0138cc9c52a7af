//! Delegation depth guard.
//!
//! Every task carries the chain of accounts it has been handed through. The
//! chain is append-only: a hop that would exceed the maximum depth is still
//! appended for audit, but marked as the pending blocked hop and the
//! assignee stays where it was. Only a re-authorization completes it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_MAX_DEPTH: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopCheck {
    Allowed { depth: u32 },
    Blocked { depth: u32, reason: String },
}

/// Check whether handing to `to` keeps the chain within `max_depth`.
pub fn check_hop(chain: &[String], to: &str, max_depth: u32) -> HopCheck {
    // candidate chain is chain + [to]
    let depth = chain.len() as u32;
    if depth >= max_depth {
        tracing::debug!(to = %to, depth, max_depth, "delegation hop over limit");
        HopCheck::Blocked {
            depth,
            reason: format!("Depth {depth} exceeds max {max_depth}"),
        }
    } else {
        HopCheck::Allowed { depth }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationChain {
    hops: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blocked: Option<BlockedHop>,
    #[serde(default)]
    audit: Vec<DelegationAudit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedHop {
    pub from: String,
    pub to: String,
    pub depth: u32,
    pub max_depth: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopOutcome {
    Allowed,
    Blocked,
    Reauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationAudit {
    pub at_ms: u64,
    pub actor: String,
    pub to: String,
    pub depth: u32,
    pub max_depth: u32,
    pub outcome: HopOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DelegationChain {
    /// Chain whose first hop is the task's initial owner.
    pub fn rooted(owner: &str) -> Self {
        Self {
            hops: vec![owner.to_string()],
            blocked: None,
            audit: Vec::new(),
        }
    }

    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    pub fn depth(&self) -> u32 {
        self.hops.len().saturating_sub(1) as u32
    }

    pub fn pending(&self) -> Option<&BlockedHop> {
        self.blocked.as_ref()
    }

    pub fn audit(&self) -> &[DelegationAudit] {
        &self.audit
    }

    /// Append a hop. Callers must reject the request first if a blocked
    /// hop is pending.
    pub fn extend(&mut self, actor: &str, to: &str, max_depth: u32, now_ms: u64) -> HopCheck {
        let check = check_hop(&self.hops, to, max_depth);
        self.hops.push(to.to_string());
        match &check {
            HopCheck::Allowed { depth } => self.audit.push(DelegationAudit {
                at_ms: now_ms,
                actor: actor.to_string(),
                to: to.to_string(),
                depth: *depth,
                max_depth,
                outcome: HopOutcome::Allowed,
                reason: None,
            }),
            HopCheck::Blocked { depth, reason } => {
                self.blocked = Some(BlockedHop {
                    from: actor.to_string(),
                    to: to.to_string(),
                    depth: *depth,
                    max_depth,
                    reason: reason.clone(),
                });
                self.audit.push(DelegationAudit {
                    at_ms: now_ms,
                    actor: actor.to_string(),
                    to: to.to_string(),
                    depth: *depth,
                    max_depth,
                    outcome: HopOutcome::Blocked,
                    reason: Some(reason.clone()),
                });
            }
        }
        check
    }

    /// Clear the pending blocked hop under a raised maximum and return it.
    /// Returns `None` when nothing is pending or `max_depth` does not clear
    /// the pending depth; the chain is unchanged in that case.
    pub fn complete_pending(
        &mut self,
        actor: &str,
        max_depth: u32,
        reason: &str,
        now_ms: u64,
    ) -> Option<BlockedHop> {
        if self.blocked.as_ref()?.depth >= max_depth {
            return None;
        }
        let hop = self.blocked.take()?;
        self.audit.push(DelegationAudit {
            at_ms: now_ms,
            actor: actor.to_string(),
            to: hop.to.clone(),
            depth: hop.depth,
            max_depth,
            outcome: HopOutcome::Reauthorized,
            reason: Some(reason.to_string()),
        });
        Some(hop)
    }
}

// ---------------------------------------------------------------------------
// Re-authorization policy
// ---------------------------------------------------------------------------

/// A request to raise the depth limit for one blocked hop.
#[derive(Debug)]
pub struct ReauthorizationRequest<'a> {
    pub account: &'a str,
    pub task_id: &'a str,
    pub pending: &'a BlockedHop,
    pub requested_max_depth: u32,
    pub reason: &'a str,
}

/// Decides who may raise a chain's maximum depth mid-flight.
pub trait ReauthorizationPolicy: Send + Sync {
    /// `Err` carries the reason shown to the caller.
    fn authorize(&self, request: &ReauthorizationRequest<'_>) -> Result<(), String>;
}

/// Refuses every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl ReauthorizationPolicy for DenyAll {
    fn authorize(&self, _request: &ReauthorizationRequest<'_>) -> Result<(), String> {
        Err("re-authorization is disabled".to_string())
    }
}

/// Lets listed accounts raise the limit up to `ceiling`.
#[derive(Debug, Clone)]
pub struct AllowList {
    accounts: HashSet<String>,
    ceiling: u32,
}

impl AllowList {
    pub fn new(accounts: impl IntoIterator<Item = String>, ceiling: u32) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
            ceiling,
        }
    }
}

impl ReauthorizationPolicy for AllowList {
    fn authorize(&self, request: &ReauthorizationRequest<'_>) -> Result<(), String> {
        if !self.accounts.contains(request.account) {
            return Err(format!(
                "{} may not re-authorize delegation",
                request.account
            ));
        }
        if request.requested_max_depth > self.ceiling {
            return Err(format!(
                "maxDepth {} exceeds ceiling {}",
                request.requested_max_depth, self.ceiling
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn depth_is_candidate_length_minus_one() {
        assert_eq!(
            check_hop(&chain(&["a", "b"]), "c", 3),
            HopCheck::Allowed { depth: 2 }
        );
        match check_hop(&chain(&["a", "b", "c"]), "d", 3) {
            HopCheck::Blocked { depth, reason } => {
                assert_eq!(depth, 3);
                assert_eq!(reason, "Depth 3 exceeds max 3");
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn blocked_hop_is_appended_and_pending() {
        let mut c = DelegationChain::rooted("a");
        assert_eq!(c.extend("a", "b", 3, 1), HopCheck::Allowed { depth: 1 });
        assert_eq!(c.extend("b", "c", 3, 2), HopCheck::Allowed { depth: 2 });
        assert!(matches!(
            c.extend("c", "d", 3, 3),
            HopCheck::Blocked { depth: 3, .. }
        ));

        assert_eq!(c.hops().len(), 4);
        assert_eq!(c.depth(), 3);
        assert_eq!(c.pending().unwrap().to, "d");
        assert_eq!(c.audit().last().unwrap().outcome, HopOutcome::Blocked);
    }

    #[test]
    fn complete_pending_needs_a_clearing_depth() {
        let mut c = DelegationChain::rooted("a");
        c.extend("a", "b", 1, 1);
        assert!(c.pending().is_some());

        assert!(c.complete_pending("ops", 1, "still blocked", 2).is_none());
        assert!(c.pending().is_some());

        let hop = c.complete_pending("ops", 2, "urgent fix", 3).unwrap();
        assert_eq!(hop.to, "b");
        assert!(c.pending().is_none());
        assert_eq!(c.audit().last().unwrap().outcome, HopOutcome::Reauthorized);
        // the chain keeps its length
        assert_eq!(c.depth(), 1);
    }

    #[test]
    fn deny_all_refuses() {
        let pending = BlockedHop {
            from: "a".into(),
            to: "b".into(),
            depth: 3,
            max_depth: 3,
            reason: "Depth 3 exceeds max 3".into(),
        };
        let req = ReauthorizationRequest {
            account: "root",
            task_id: "t",
            pending: &pending,
            requested_max_depth: 4,
            reason: "why not",
        };
        assert!(DenyAll.authorize(&req).is_err());

        let policy = AllowList::new(["root".to_string()], 5);
        assert!(policy.authorize(&req).is_ok());
        let too_high = ReauthorizationRequest {
            requested_max_depth: 6,
            ..req
        };
        assert!(policy.authorize(&too_high).unwrap_err().contains("ceiling"));
        let stranger = ReauthorizationRequest {
            account: "mallory",
            ..too_high
        };
        assert!(policy.authorize(&stranger).is_err());
    }
}
