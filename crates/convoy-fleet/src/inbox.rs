use anyhow::{Context, Result};
use convoy::protocol::MessageEntry;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

const MESSAGES_FILE: &str = "messages.jsonl";

/// A direct message between two accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub timestamp_ms: u64,
    pub read: bool,
}

impl Message {
    pub fn to_entry(&self) -> MessageEntry {
        MessageEntry {
            message_id: self.message_id.clone(),
            from: self.from.clone(),
            body: self.body.clone(),
            timestamp_ms: self.timestamp_ms,
            read: self.read,
        }
    }

    /// First line of the body, cut to `max` characters.
    pub fn preview(&self, max: usize) -> String {
        let first = self.body.lines().next().unwrap_or_default();
        if first.chars().count() <= max {
            first.to_string()
        } else {
            let cut: String = first.chars().take(max).collect();
            format!("{cut}…")
        }
    }
}

/// Messages for every account, persisted as one JSONL file.
pub struct MessageStore {
    path: Option<PathBuf>,
    messages: Vec<Message>,
}

impl MessageStore {
    /// Load existing messages from disk, or start empty.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(MESSAGES_FILE);
        let messages = if path.exists() {
            let data = std::fs::read_to_string(&path).context("failed to read messages.jsonl")?;
            data.lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| serde_json::from_str(l).context("invalid message entry"))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path),
            messages,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            messages: Vec::new(),
        }
    }

    /// Append a new message and persist it.
    pub fn push(&mut self, msg: Message) -> Result<()> {
        if let Some(path) = &self.path {
            let line = serde_json::to_string(&msg)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            writeln!(file, "{line}")?;
        }
        self.messages.push(msg);
        Ok(())
    }

    /// Messages addressed to `account`, oldest first.
    pub fn list(&self, account: &str, unread_only: bool, limit: Option<usize>) -> Vec<&Message> {
        let iter = self
            .messages
            .iter()
            .filter(|m| m.to == account)
            .filter(|m| !unread_only || !m.read);
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Mark the given messages of `account` as read. Returns how many changed.
    pub fn mark_read(&mut self, account: &str, message_ids: &[String]) -> Result<usize> {
        let mut changed = 0;
        for msg in self
            .messages
            .iter_mut()
            .filter(|m| m.to == account && !m.read && message_ids.contains(&m.message_id))
        {
            msg.read = true;
            changed += 1;
        }
        if changed > 0 {
            self.rewrite()?;
        }
        Ok(changed)
    }

    fn rewrite(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut buf = Vec::new();
        for msg in &self.messages {
            serde_json::to_writer(&mut buf, msg)?;
            buf.push(b'\n');
        }
        crate::state_dir::write_atomic(path, &buf)
    }

    pub fn unread_count(&self, account: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.to == account && !m.read)
            .count()
    }
}
