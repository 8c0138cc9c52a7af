use crate::delegation::DelegationChain;
use convoy::protocol::{GateDecision, TaskFields, TaskStatus};
use serde::{Deserialize, Serialize};

/// A task record as stored and returned on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_by: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(flatten)]
    pub fields: TaskFields,
    pub delegation: DelegationChain,
    /// Set when the task was handed to its assignee and not yet accepted.
    #[serde(default)]
    pub handoff_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recreated_from: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub at_ms: u64,
    pub actor: String,
    pub event: TaskEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskEvent {
    Created {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    StatusChanged {
        from: TaskStatus,
        to: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        justification: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gate: Option<GateDecision>,
    },
    Handoff {
        from: String,
        to: String,
        depth: u32,
    },
    DelegationBlocked {
        to: String,
        depth: u32,
        max_depth: u32,
        reason: String,
    },
    Reauthorized {
        to: String,
        max_depth: u32,
        reason: String,
    },
    HandoffAccepted,
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Recreated {
        new_task_id: String,
    },
    RecreatedFrom {
        original_task_id: String,
    },
}

/// The four legal status edges.
pub fn is_legal_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Todo, TaskStatus::InProgress)
            | (TaskStatus::InProgress, TaskStatus::ReadyForReview)
            | (TaskStatus::ReadyForReview, TaskStatus::Accepted)
            | (TaskStatus::ReadyForReview, TaskStatus::Rejected)
    )
}

impl Task {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Append a history entry and bump `updated_at_ms`.
    pub fn record(&mut self, actor: &str, event: TaskEvent, now_ms: u64) {
        self.history.push(HistoryEntry {
            at_ms: now_ms,
            actor: actor.to_string(),
            event,
        });
        self.updated_at_ms = now_ms;
    }

    /// Reason given for the most recent rejection, if any.
    pub fn rejection_reason(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|h| match &h.event {
            TaskEvent::StatusChanged {
                to: TaskStatus::Rejected,
                reason,
                ..
            } => reason.as_deref(),
            _ => None,
        })
    }

    pub fn recreated_as(&self) -> Option<&str> {
        self.history.iter().find_map(|h| match &h.event {
            TaskEvent::Recreated { new_task_id } => Some(new_task_id.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_four_edges_are_legal() {
        let legal: Vec<_> = TaskStatus::ALL
            .iter()
            .flat_map(|&from| TaskStatus::ALL.iter().map(move |&to| (from, to)))
            .filter(|&(from, to)| is_legal_transition(from, to))
            .collect();
        assert_eq!(
            legal,
            vec![
                (TaskStatus::Todo, TaskStatus::InProgress),
                (TaskStatus::InProgress, TaskStatus::ReadyForReview),
                (TaskStatus::ReadyForReview, TaskStatus::Accepted),
                (TaskStatus::ReadyForReview, TaskStatus::Rejected),
            ]
        );
    }

    #[test]
    fn history_event_wire_shape() {
        let entry = HistoryEntry {
            at_ms: 5,
            actor: "alice".to_string(),
            event: TaskEvent::DelegationBlocked {
                to: "dave".to_string(),
                depth: 3,
                max_depth: 3,
                reason: "Depth 3 exceeds max 3".to_string(),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["atMs"], 5);
        assert_eq!(value["event"]["kind"], "delegation_blocked");
        assert_eq!(value["event"]["maxDepth"], 3);
    }
}
