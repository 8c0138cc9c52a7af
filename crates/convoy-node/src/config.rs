//! Daemon configuration.
//!
//! Loaded from a TOML file (`$XDG_CONFIG_HOME/convoy/config.toml` unless
//! `--config` is given). A missing file yields the defaults, which have no
//! accounts and therefore admit nobody. The file is polled while the daemon
//! runs and re-applied after it stops changing.

use crate::handler::NodeState;
use anyhow::{Context, Result, bail};
use convoy_crypto::credential::TokenDigest;
use convoy_fleet::delegation::{AllowList, DEFAULT_MAX_DEPTH, DenyAll, ReauthorizationPolicy};
use convoy_fleet::health::HealthThresholds;
use convoy_fleet::sla::{AdaptiveConfig, SlaThresholds, StaleThresholds};
use convoy_fleet::trust::DEFAULT_BREAKER_THRESHOLD;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub accounts: BTreeMap<String, AccountEntry>,
    pub health: HealthSection,
    pub delegation: DelegationSection,
    pub sla: SlaSection,
    pub adaptive: AdaptiveConfig,
    pub collaborators: CollaboratorSection,
    pub rate_limit: RateLimitSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub session: SessionSection,
}

/// Credential of one account. Exactly one of the two fields must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountEntry {
    pub token: Option<String>,
    pub token_sha256: Option<String>,
}

impl AccountEntry {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            token_sha256: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub critical_errors: u32,
    pub idle_degraded_mins: u64,
    /// How often the health watcher looks for status changes.
    pub watch_interval_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            critical_errors: 5,
            idle_degraded_mins: 10,
            watch_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DelegationSection {
    pub max_depth: u32,
    /// Accounts allowed to raise the depth limit of a blocked chain.
    pub reauthorize: Vec<String>,
    /// Highest limit a re-authorization may grant.
    pub reauthorize_ceiling: u32,
}

impl Default for DelegationSection {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            reauthorize: Vec::new(),
            reauthorize_ceiling: DEFAULT_MAX_DEPTH * 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlaSection {
    pub sweep_interval_secs: u64,
    pub todo: StaleThresholds,
    pub in_progress: StaleThresholds,
    pub ready_for_review: StaleThresholds,
}

impl Default for SlaSection {
    fn default() -> Self {
        let th = SlaThresholds::default();
        Self {
            sweep_interval_secs: 60,
            todo: th.todo,
            in_progress: th.in_progress,
            ready_for_review: th.ready_for_review,
        }
    }
}

impl SlaSection {
    pub fn thresholds(&self) -> SlaThresholds {
        SlaThresholds {
            todo: self.todo,
            in_progress: self.in_progress,
            ready_for_review: self.ready_for_review,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollaboratorSection {
    pub timeout_ms: u64,
    /// Service name to Unix socket path, e.g. `council = "/run/convoy/council.sock"`.
    pub endpoints: BTreeMap<String, PathBuf>,
}

impl Default for CollaboratorSection {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            endpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    /// Burst size per account. Zero disables limiting.
    pub capacity: u32,
    pub per_second: f64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: 20,
            per_second: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSection {
    pub threshold: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BREAKER_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    /// Close connections that send nothing for this long. Zero disables.
    pub idle_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
        }
    }
}

impl NodeConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delegation.max_depth == 0 {
            bail!("delegation.max_depth must be at least 1");
        }
        if self.rate_limit.capacity > 0 && self.rate_limit.per_second <= 0.0 {
            bail!("rate_limit.per_second must be positive");
        }
        if self.circuit_breaker.threshold == 0 {
            bail!("circuit_breaker.threshold must be at least 1");
        }
        if self.sla.sweep_interval_secs == 0 || self.health.watch_interval_secs == 0 {
            bail!("timer intervals must be at least one second");
        }
        self.adaptive
            .actions
            .validate()
            .map_err(|e| anyhow::anyhow!("adaptive.actions: {e}"))?;
        Accounts::from_entries(&self.accounts)?;
        Ok(())
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_dir).join("convoy").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("convoy")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/convoy/config.toml")
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Configured accounts with their credential digests.
#[derive(Debug, Clone, Default)]
pub struct Accounts {
    digests: BTreeMap<String, TokenDigest>,
}

impl Accounts {
    pub fn from_entries(entries: &BTreeMap<String, AccountEntry>) -> Result<Self> {
        let mut digests = BTreeMap::new();
        for (name, entry) in entries {
            if name.trim().is_empty() {
                bail!("account names must not be empty");
            }
            let digest = match (&entry.token, &entry.token_sha256) {
                (Some(token), None) => TokenDigest::of_token(token),
                (None, Some(hex)) => TokenDigest::from_hex(hex)
                    .with_context(|| format!("accounts.{name}.token_sha256"))?,
                _ => bail!("accounts.{name}: set exactly one of token or token_sha256"),
            };
            digests.insert(name.clone(), digest);
        }
        Ok(Self { digests })
    }

    pub fn verify(&self, account: &str, token: &str) -> bool {
        self.digests
            .get(account)
            .is_some_and(|digest| digest.verify(token))
    }

    pub fn contains(&self, account: &str) -> bool {
        self.digests.contains_key(account)
    }

    /// Account names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.digests.keys().cloned().collect()
    }
}

/// Configuration in the shape the request handlers consume.
pub struct Settings {
    pub accounts: Accounts,
    pub health: HealthThresholds,
    pub health_watch_interval: Duration,
    pub max_depth: u32,
    pub policy: Arc<dyn ReauthorizationPolicy>,
    pub sla: SlaThresholds,
    pub sla_sweep_interval: Duration,
    pub adaptive: AdaptiveConfig,
    pub collaborator_timeout: Duration,
    pub collaborator_endpoints: BTreeMap<String, PathBuf>,
    pub rate_limit: RateLimitSection,
    pub breaker_threshold: u32,
    pub idle_timeout: Option<Duration>,
}

impl Settings {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let policy: Arc<dyn ReauthorizationPolicy> = if config.delegation.reauthorize.is_empty() {
            Arc::new(DenyAll)
        } else {
            Arc::new(AllowList::new(
                config.delegation.reauthorize.iter().cloned(),
                config.delegation.reauthorize_ceiling,
            ))
        };
        Ok(Self {
            accounts: Accounts::from_entries(&config.accounts)?,
            health: HealthThresholds {
                critical_errors: config.health.critical_errors,
                idle_degraded_ms: config.health.idle_degraded_mins * 60 * 1000,
            },
            health_watch_interval: Duration::from_secs(config.health.watch_interval_secs),
            max_depth: config.delegation.max_depth,
            policy,
            sla: config.sla.thresholds(),
            sla_sweep_interval: Duration::from_secs(config.sla.sweep_interval_secs),
            adaptive: config.adaptive.clone(),
            collaborator_timeout: Duration::from_millis(config.collaborators.timeout_ms),
            collaborator_endpoints: config.collaborators.endpoints.clone(),
            rate_limit: config.rate_limit,
            breaker_threshold: config.circuit_breaker.threshold,
            idle_timeout: match config.session.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEBOUNCE: Duration = Duration::from_millis(500);

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Poll `path` and apply every new, valid configuration to `state`. A file
/// that fails to parse is logged and the running configuration is kept.
pub async fn watch(state: Arc<NodeState>, path: PathBuf, cancel: CancellationToken) {
    let mut seen = modified(&path);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = modified(&path);
        if current == seen {
            continue;
        }

        // Wait for the writer to finish before reading.
        let mut settled = current;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(DEBOUNCE) => {}
            }
            let now = modified(&path);
            if now == settled {
                break;
            }
            settled = now;
        }
        seen = settled;

        match NodeConfig::load(&path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "config changed, reloading");
                if let Err(e) = state.apply_config(&config).await {
                    tracing::warn!(err = %format!("{e:#}"), "failed to apply config");
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %format!("{e:#}"), "ignoring invalid config");
            }
        }
    }
    tracing::debug!("config watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy::protocol::EscalationAction;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.delegation.max_depth, 3);
        assert_eq!(config.rate_limit.capacity, 20);
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.health, HealthThresholds::default());
        assert_eq!(settings.sla, SlaThresholds::default());
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn parses_accounts_and_sections() {
        let digest = TokenDigest::of_token("bob-secret").to_hex();
        let config = NodeConfig::from_toml(&format!(
            r#"
            [accounts.alice]
            token = "alice-secret"

            [accounts.bob]
            token_sha256 = "{digest}"

            [delegation]
            max_depth = 4
            reauthorize = ["alice"]

            [sla.in_progress]
            ping_mins = 5
            reassign_mins = 10
            escalate_mins = 20

            [adaptive.actions.no_checkpoint]
            elevated = "ping"
            severe = "terminate"

            [session]
            idle_timeout_secs = 0
            "#
        ))
        .unwrap();
        let settings = Settings::from_config(&config).unwrap();
        assert!(settings.accounts.verify("alice", "alice-secret"));
        assert!(settings.accounts.verify("bob", "bob-secret"));
        assert!(!settings.accounts.verify("bob", "alice-secret"));
        assert!(!settings.accounts.verify("carol", "anything"));
        assert_eq!(settings.accounts.names(), vec!["alice", "bob"]);
        assert_eq!(settings.max_depth, 4);
        assert_eq!(settings.sla.in_progress.ping_mins, 5);
        assert_eq!(settings.sla.todo, SlaThresholds::default().todo);
        assert_eq!(
            settings.adaptive.actions.no_checkpoint.severe,
            EscalationAction::Terminate
        );
        assert_eq!(settings.idle_timeout, None);
    }

    #[test]
    fn account_needs_exactly_one_credential() {
        let err = NodeConfig::from_toml("[accounts.alice]\n").unwrap_err();
        assert!(format!("{err:#}").contains("exactly one"));

        let err = NodeConfig::from_toml(
            "[accounts.alice]\ntoken = \"a\"\ntoken_sha256 = \"00\"\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("exactly one"));
    }

    #[test]
    fn rejects_time_based_action_in_adaptive_table() {
        let err = NodeConfig::from_toml(
            "[adaptive.actions.context_saturation]\nelevated = \"ping\"\nsevere = \"escalate\"\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("adaptive.actions"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(NodeConfig::from_toml("[health]\nbogus = 1\n").is_err());
        assert!(NodeConfig::from_toml("[delegation]\nmax_depth = 0\n").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.accounts.is_empty());
    }
}
