//! Per-account review outcomes and the handoff circuit breaker.
//!
//! An account whose delivered work is rejected `threshold` times in a row
//! stops receiving handoffs until someone reinstates it.

use anyhow::{Context, Result};
use convoy::protocol::{CircuitInfo, TrustInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const TRUST_FILE: &str = "trust.json";

pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    pub account: String,
    pub accepted: u32,
    pub rejected: u32,
    pub consecutive_rejections: u32,
    pub circuit_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<u64>,
    #[serde(default)]
    pub reinstatements: Vec<Reinstatement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reinstatement {
    pub at_ms: u64,
    pub by: String,
    pub reason: String,
}

impl TrustRecord {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            ..Default::default()
        }
    }

    /// Laplace-smoothed acceptance ratio; 0.5 with no history.
    pub fn score(&self) -> f64 {
        (self.accepted as f64 + 1.0) / ((self.accepted + self.rejected) as f64 + 2.0)
    }
}

/// Trust records persisted as a single JSON document.
pub struct TrustLedger {
    path: Option<PathBuf>,
    records: BTreeMap<String, TrustRecord>,
    threshold: u32,
}

impl TrustLedger {
    pub fn load(state_dir: &Path, threshold: u32) -> Result<Self> {
        let path = state_dir.join(TRUST_FILE);
        let records = if path.exists() {
            let data = std::fs::read_to_string(&path).context("failed to read trust.json")?;
            serde_json::from_str(&data).context("invalid trust.json")?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            records,
            threshold,
        })
    }

    pub fn in_memory(threshold: u32) -> Self {
        Self {
            path: None,
            records: BTreeMap::new(),
            threshold,
        }
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(&self.records)?;
        crate::state_dir::write_atomic(path, &data)
    }

    /// Record the review outcome of work delivered by `account`.
    /// Returns true when this outcome opened the circuit.
    pub fn record_outcome(&mut self, account: &str, accepted: bool, now_ms: u64) -> Result<bool> {
        let mut rec = self
            .records
            .get(account)
            .cloned()
            .unwrap_or_else(|| TrustRecord::new(account));
        let mut opened = false;
        if accepted {
            rec.accepted += 1;
            rec.consecutive_rejections = 0;
        } else {
            rec.rejected += 1;
            rec.consecutive_rejections += 1;
            if !rec.circuit_open && rec.consecutive_rejections >= self.threshold {
                rec.circuit_open = true;
                rec.opened_at_ms = Some(now_ms);
                opened = true;
            }
        }
        let previous = self.records.insert(account.to_string(), rec);
        if let Err(e) = self.save() {
            match previous {
                Some(prev) => self.records.insert(account.to_string(), prev),
                None => self.records.remove(account),
            };
            return Err(e);
        }
        if opened {
            tracing::warn!(account = %account, threshold = self.threshold, "circuit breaker opened");
        }
        Ok(opened)
    }

    pub fn is_open(&self, account: &str) -> bool {
        self.records.get(account).is_some_and(|r| r.circuit_open)
    }

    pub fn score(&self, account: &str) -> f64 {
        self.records
            .get(account)
            .map(TrustRecord::score)
            .unwrap_or(0.5)
    }

    pub fn trust(&self, account: &str) -> TrustInfo {
        let rec = self
            .records
            .get(account)
            .cloned()
            .unwrap_or_else(|| TrustRecord::new(account));
        TrustInfo {
            account: account.to_string(),
            score: rec.score(),
            accepted: rec.accepted,
            rejected: rec.rejected,
            consecutive_rejections: rec.consecutive_rejections,
        }
    }

    pub fn circuit(&self, account: &str) -> CircuitInfo {
        let rec = self.records.get(account);
        CircuitInfo {
            account: account.to_string(),
            open: rec.is_some_and(|r| r.circuit_open),
            consecutive_rejections: rec.map_or(0, |r| r.consecutive_rejections),
            threshold: self.threshold,
            opened_at_ms: rec.and_then(|r| r.opened_at_ms),
        }
    }

    /// Close the circuit and reset the rejection streak.
    pub fn reinstate(&mut self, account: &str, by: &str, reason: &str, now_ms: u64) -> Result<CircuitInfo> {
        let mut rec = self
            .records
            .get(account)
            .cloned()
            .unwrap_or_else(|| TrustRecord::new(account));
        rec.circuit_open = false;
        rec.opened_at_ms = None;
        rec.consecutive_rejections = 0;
        rec.reinstatements.push(Reinstatement {
            at_ms: now_ms,
            by: by.to_string(),
            reason: reason.to_string(),
        });
        let previous = self.records.insert(account.to_string(), rec);
        if let Err(e) = self.save() {
            match previous {
                Some(prev) => self.records.insert(account.to_string(), prev),
                None => self.records.remove(account),
            };
            return Err(e);
        }
        tracing::info!(account = %account, by = %by, "account reinstated");
        Ok(self.circuit(account))
    }

    pub fn record(&self, account: &str) -> Option<&TrustRecord> {
        self.records.get(account)
    }
}
