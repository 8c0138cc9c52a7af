//! Per-account health.
//!
//! The monitor only stores raw counters. Status is derived on every read
//! from the counters and the wall clock, so an account that stops sending
//! requests drifts to `degraded` without anyone writing to its record.

use convoy::protocol::{AggregateHealth, HealthStatus, HealthView};
use convoy_crypto::time::now_ms;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthThresholds {
    /// Error count at which an account becomes critical.
    pub critical_errors: u32,
    /// Idle time after which a connected account is degraded.
    pub idle_degraded_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            critical_errors: 5,
            idle_degraded_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthRecord {
    pub connected: bool,
    pub last_activity_ms: Option<u64>,
    pub error_count: u32,
    pub rate_limited: bool,
    pub sla_violations: u32,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthPatch {
    pub connected: Option<bool>,
    pub last_activity_ms: Option<u64>,
    pub error_count: Option<u32>,
    pub rate_limited: Option<bool>,
    pub sla_violations: Option<u32>,
}

/// Derive status from a record. First matching rule wins.
pub fn derive_status(record: &HealthRecord, now_ms: u64, th: &HealthThresholds) -> HealthStatus {
    if record.rate_limited || record.error_count >= th.critical_errors || !record.connected {
        return HealthStatus::Critical;
    }
    let Some(last) = record.last_activity_ms else {
        return HealthStatus::Critical;
    };
    if now_ms.saturating_sub(last) > th.idle_degraded_ms
        || record.error_count >= 1
        || record.sla_violations > 0
    {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    records: HashMap<String, HealthRecord>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            records: HashMap::new(),
            thresholds,
        }
    }

    pub fn set_thresholds(&mut self, thresholds: HealthThresholds) {
        self.thresholds = thresholds;
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    fn record_mut(&mut self, account: &str) -> &mut HealthRecord {
        self.records.entry(account.to_string()).or_default()
    }

    pub fn mark_active(&mut self, account: &str) {
        self.mark_active_at(account, now_ms());
    }

    pub fn mark_active_at(&mut self, account: &str, now_ms: u64) {
        let rec = self.record_mut(account);
        rec.connected = true;
        rec.last_activity_ms = Some(now_ms);
    }

    pub fn mark_disconnected(&mut self, account: &str) {
        self.record_mut(account).connected = false;
    }

    pub fn record_error(&mut self, account: &str) {
        let rec = self.record_mut(account);
        rec.error_count = rec.error_count.saturating_add(1);
    }

    pub fn clear_errors(&mut self, account: &str) {
        self.record_mut(account).error_count = 0;
    }

    pub fn record_rate_limit(&mut self, account: &str) {
        self.record_mut(account).rate_limited = true;
    }

    pub fn clear_rate_limit(&mut self, account: &str) {
        self.record_mut(account).rate_limited = false;
    }

    pub fn record_sla_violation(&mut self, account: &str) {
        let rec = self.record_mut(account);
        rec.sla_violations = rec.sla_violations.saturating_add(1);
    }

    /// Merge a patch into the account's record, creating it if needed.
    pub fn update(&mut self, account: &str, patch: HealthPatch) {
        let rec = self.record_mut(account);
        if let Some(v) = patch.connected {
            rec.connected = v;
        }
        if let Some(v) = patch.last_activity_ms {
            rec.last_activity_ms = Some(v);
        }
        if let Some(v) = patch.error_count {
            rec.error_count = v;
        }
        if let Some(v) = patch.rate_limited {
            rec.rate_limited = v;
        }
        if let Some(v) = patch.sla_violations {
            rec.sla_violations = v;
        }
    }

    pub fn record(&self, account: &str) -> Option<&HealthRecord> {
        self.records.get(account)
    }

    pub fn get_health(&self, account: &str) -> Option<HealthView> {
        self.get_health_at(account, now_ms())
    }

    pub fn get_health_at(&self, account: &str, now_ms: u64) -> Option<HealthView> {
        self.records
            .get(account)
            .map(|rec| self.view(account, rec, now_ms))
    }

    pub fn get_statuses(&self, accounts: &[String]) -> Vec<HealthView> {
        self.get_statuses_at(accounts, now_ms())
    }

    /// One view per requested account, in order. Accounts never observed get a
    /// synthesized critical, disconnected view.
    pub fn get_statuses_at(&self, accounts: &[String], now_ms: u64) -> Vec<HealthView> {
        accounts
            .iter()
            .map(|account| {
                self.get_health_at(account, now_ms)
                    .unwrap_or_else(|| unobserved(account))
            })
            .collect()
    }

    pub fn get_aggregate_status(&self, accounts: &[String]) -> AggregateHealth {
        self.get_aggregate_status_at(accounts, now_ms())
    }

    pub fn get_aggregate_status_at(&self, accounts: &[String], now_ms: u64) -> AggregateHealth {
        let mut agg = AggregateHealth {
            healthy: 0,
            degraded: 0,
            critical: 0,
            overall: HealthStatus::Healthy,
        };
        for view in self.get_statuses_at(accounts, now_ms) {
            match view.status {
                HealthStatus::Healthy => agg.healthy += 1,
                HealthStatus::Degraded => agg.degraded += 1,
                HealthStatus::Critical => agg.critical += 1,
            }
            agg.overall = agg.overall.max(view.status);
        }
        agg
    }

    fn view(&self, account: &str, rec: &HealthRecord, now_ms: u64) -> HealthView {
        HealthView {
            account: account.to_string(),
            status: derive_status(rec, now_ms, &self.thresholds),
            connected: rec.connected,
            last_activity_ms: rec.last_activity_ms,
            error_count: rec.error_count,
            rate_limited: rec.rate_limited,
            sla_violations: rec.sla_violations,
        }
    }
}

fn unobserved(account: &str) -> HealthView {
    HealthView {
        account: account.to_string(),
        status: HealthStatus::Critical,
        connected: false,
        last_activity_ms: None,
        error_count: 0,
        rate_limited: false,
        sla_violations: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn active(monitor: &mut HealthMonitor, account: &str) {
        monitor.mark_active_at(account, NOW);
    }

    fn status(monitor: &HealthMonitor, account: &str) -> HealthStatus {
        monitor.get_health_at(account, NOW).unwrap().status
    }

    #[test]
    fn unobserved_account() {
        let monitor = HealthMonitor::default();
        assert!(monitor.get_health_at("ghost", NOW).is_none());

        let views = monitor.get_statuses_at(&["ghost".to_string()], NOW);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, HealthStatus::Critical);
        assert!(!views[0].connected);
    }

    #[test]
    fn fresh_activity_is_healthy() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Healthy);
    }

    #[test]
    fn error_thresholds() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        monitor.record_error("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Degraded);
        for _ in 0..3 {
            monitor.record_error("a");
        }
        assert_eq!(status(&monitor, "a"), HealthStatus::Degraded);
        monitor.record_error("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Critical);
    }

    #[test]
    fn rate_limit_forces_critical_and_clearing_rederives() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        monitor.record_error("a");
        monitor.record_rate_limit("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Critical);

        monitor.clear_rate_limit("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Degraded);
    }

    #[test]
    fn idle_account_degrades_without_writes() {
        let mut monitor = HealthMonitor::default();
        monitor.mark_active_at("a", NOW);
        let later = NOW + 10 * 60 * 1000;
        assert_eq!(
            monitor.get_health_at("a", later).unwrap().status,
            HealthStatus::Healthy
        );
        assert_eq!(
            monitor.get_health_at("a", later + 1).unwrap().status,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn disconnected_is_critical() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        monitor.mark_disconnected("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Critical);
    }

    #[test]
    fn connected_without_activity_is_critical() {
        let mut monitor = HealthMonitor::default();
        monitor.update(
            "a",
            HealthPatch {
                connected: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(status(&monitor, "a"), HealthStatus::Critical);
    }

    #[test]
    fn sla_violation_degrades() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        monitor.record_sla_violation("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Degraded);
    }

    #[test]
    fn patch_leaves_unspecified_fields() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        monitor.record_error("a");
        monitor.update(
            "a",
            HealthPatch {
                rate_limited: Some(true),
                ..Default::default()
            },
        );
        let rec = monitor.record("a").unwrap();
        assert_eq!(rec.error_count, 1);
        assert!(rec.connected);
        assert!(rec.rate_limited);
    }

    #[test]
    fn custom_thresholds() {
        let mut monitor = HealthMonitor::new(HealthThresholds {
            critical_errors: 2,
            idle_degraded_ms: 1000,
        });
        active(&mut monitor, "a");
        monitor.record_error("a");
        monitor.record_error("a");
        assert_eq!(status(&monitor, "a"), HealthStatus::Critical);
    }

    #[test]
    fn aggregate_counts_and_worst_overall() {
        let mut monitor = HealthMonitor::default();
        active(&mut monitor, "a");
        active(&mut monitor, "b");
        monitor.record_error("b");

        let accounts = vec!["a".to_string(), "b".to_string()];
        let agg = monitor.get_aggregate_status_at(&accounts, NOW);
        assert_eq!((agg.healthy, agg.degraded, agg.critical), (1, 1, 0));
        assert_eq!(agg.overall, HealthStatus::Degraded);

        let with_ghost = vec!["a".to_string(), "ghost".to_string()];
        let agg = monitor.get_aggregate_status_at(&with_ghost, NOW);
        assert_eq!(agg.overall, HealthStatus::Critical);
    }

    #[test]
    fn empty_aggregate_is_healthy() {
        let monitor = HealthMonitor::default();
        let agg = monitor.get_aggregate_status_at(&[], NOW);
        assert_eq!(agg.overall, HealthStatus::Healthy);
        assert_eq!(agg.healthy + agg.degraded + agg.critical, 0);
    }
}
