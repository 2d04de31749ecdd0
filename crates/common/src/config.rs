use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{TurnstileError, TurnstileResult};
use crate::Identity;

/// Top-level service configuration.
///
/// Static for the lifetime of the process. A [`ScaleProfile`], when set, is
/// folded in once by [`AppConfig::effective`] before any service is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Identities that bypass both limiters and are classified VIP.
    #[serde(default)]
    pub admins: Vec<Identity>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub command_limit: CommandLimitConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub profile: Option<ScaleProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admins: vec![],
            rate_limit: RateLimitConfig::default(),
            command_limit: CommandLimitConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            scheduler: SchedulerConfig::default(),
            persistence: PersistenceConfig::default(),
            profile: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            enabled: true,
        }
    }
}

/// Multi-window request limits. Caps are event counts per horizon, cooldowns
/// are the penalty armed when that horizon's cap is hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
    #[serde(default = "default_cooldown_minute")]
    pub cooldown_minute_secs: u64,
    #[serde(default = "default_cooldown_hour")]
    pub cooldown_hour_secs: u64,
    #[serde(default = "default_cooldown_day")]
    pub cooldown_day_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
            cooldown_minute_secs: default_cooldown_minute(),
            cooldown_hour_secs: default_cooldown_hour(),
            cooldown_day_secs: default_cooldown_day(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> TurnstileResult<()> {
        if self.per_minute == 0 || self.per_hour == 0 || self.per_day == 0 {
            return Err(TurnstileError::Config(
                "rate_limit caps must be greater than zero".into(),
            ));
        }
        if self.per_minute > self.per_hour || self.per_hour > self.per_day {
            return Err(TurnstileError::Config(format!(
                "rate_limit caps must not shrink with longer horizons (minute={}, hour={}, day={})",
                self.per_minute, self.per_hour, self.per_day
            )));
        }
        if self.cooldown_minute_secs == 0
            || self.cooldown_hour_secs == 0
            || self.cooldown_day_secs == 0
        {
            return Err(TurnstileError::Config(
                "rate_limit cooldowns must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Short-window command throttling with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLimitConfig {
    #[serde(default = "default_command_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_command_initial_cooldown")]
    pub initial_cooldown_secs: u64,
    #[serde(default = "default_command_multiplier")]
    pub multiplier: u64,
    #[serde(default = "default_command_max_cooldown")]
    pub max_cooldown_secs: u64,
    #[serde(default)]
    pub violation_reset: ViolationResetPolicy,
}

impl Default for CommandLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_command_per_minute(),
            initial_cooldown_secs: default_command_initial_cooldown(),
            multiplier: default_command_multiplier(),
            max_cooldown_secs: default_command_max_cooldown(),
            violation_reset: ViolationResetPolicy::default(),
        }
    }
}

impl CommandLimitConfig {
    pub fn validate(&self) -> TurnstileResult<()> {
        if self.per_minute == 0 {
            return Err(TurnstileError::Config(
                "command_limit.per_minute must be greater than zero".into(),
            ));
        }
        if self.initial_cooldown_secs == 0 {
            return Err(TurnstileError::Config(
                "command_limit.initial_cooldown_secs must be greater than zero".into(),
            ));
        }
        if self.multiplier == 0 {
            return Err(TurnstileError::Config(
                "command_limit.multiplier must be at least 1".into(),
            ));
        }
        if self.max_cooldown_secs < self.initial_cooldown_secs {
            return Err(TurnstileError::Config(format!(
                "command_limit.max_cooldown_secs ({}) is below initial_cooldown_secs ({})",
                self.max_cooldown_secs, self.initial_cooldown_secs
            )));
        }
        if let ViolationResetPolicy::AfterCleanWindows { windows: 0 } = self.violation_reset {
            return Err(TurnstileError::Config(
                "command_limit.violation_reset.windows must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// When a repeat offender's standing violation count is forgiven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ViolationResetPolicy {
    /// Violations accumulate for the process lifetime.
    Never,
    /// Reset once `windows` full command windows have passed since the last
    /// cooldown ended.
    AfterCleanWindows { windows: u32 },
}

impl Default for ViolationResetPolicy {
    fn default() -> Self {
        ViolationResetPolicy::AfterCleanWindows { windows: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_global_slots")]
    pub global: usize,
    #[serde(default = "default_per_identity_slots")]
    pub per_identity: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global: default_global_slots(),
            per_identity: default_per_identity_slots(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn validate(&self) -> TurnstileResult<()> {
        if self.global == 0 || self.per_identity == 0 {
            return Err(TurnstileError::Config(
                "concurrency caps must be greater than zero".into(),
            ));
        }
        if self.per_identity > self.global {
            return Err(TurnstileError::Config(format!(
                "concurrency.per_identity ({}) exceeds concurrency.global ({})",
                self.per_identity, self.global
            )));
        }
        Ok(())
    }
}

/// Worker counts per priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCapacities {
    #[serde(default = "default_vip_workers")]
    pub vip: usize,
    #[serde(default = "default_high_workers")]
    pub high: usize,
    #[serde(default = "default_normal_workers")]
    pub normal: usize,
    #[serde(default = "default_low_workers")]
    pub low: usize,
}

impl Default for TierCapacities {
    fn default() -> Self {
        Self {
            vip: default_vip_workers(),
            high: default_high_workers(),
            normal: default_normal_workers(),
            low: default_low_workers(),
        }
    }
}

impl TierCapacities {
    pub fn total(&self) -> usize {
        self.vip + self.high + self.normal + self.low
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub tiers: TierCapacities,
    /// Jobs a tier may hold waiting for a worker before submissions fail.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_high_every")]
    pub high_every: i64,
    #[serde(default = "default_normal_every")]
    pub normal_every: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tiers: TierCapacities::default(),
            queue_depth: default_queue_depth(),
            high_every: default_high_every(),
            normal_every: default_normal_every(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> TurnstileResult<()> {
        let t = &self.tiers;
        if t.vip == 0 || t.high == 0 || t.normal == 0 || t.low == 0 {
            return Err(TurnstileError::Config(
                "every scheduler tier needs at least one worker".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(TurnstileError::Config(
                "scheduler.queue_depth must be greater than zero".into(),
            ));
        }
        if self.high_every <= 0 || self.normal_every <= 0 {
            return Err(TurnstileError::Config(
                "scheduler partition moduli must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// 0 writes through on every mutation; otherwise writes are coalesced to
    /// at most one per interval.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_state_dir(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Predefined capacity bundles for different deployment sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleProfile {
    Small,
    Medium,
    Large,
    Enterprise,
    Extreme,
}

impl ScaleProfile {
    /// Pick the smallest profile that covers `expected_users`.
    pub fn for_expected_users(expected_users: u64) -> Self {
        match expected_users {
            0..=100 => ScaleProfile::Small,
            101..=1_000 => ScaleProfile::Medium,
            1_001..=5_000 => ScaleProfile::Large,
            5_001..=10_000 => ScaleProfile::Enterprise,
            _ => ScaleProfile::Extreme,
        }
    }

    pub fn concurrency(&self) -> ConcurrencyConfig {
        let (global, per_identity) = match self {
            ScaleProfile::Small => (3, 1),
            ScaleProfile::Medium => (10, 1),
            ScaleProfile::Large => (50, 2),
            ScaleProfile::Enterprise => (100, 2),
            ScaleProfile::Extreme => (250, 3),
        };
        ConcurrencyConfig {
            global,
            per_identity,
        }
    }

    pub fn tiers(&self) -> TierCapacities {
        let (vip, high, normal, low) = match self {
            ScaleProfile::Small => (1, 1, 2, 4),
            ScaleProfile::Medium => (2, 4, 8, 16),
            ScaleProfile::Large => (4, 8, 16, 32),
            ScaleProfile::Enterprise => (8, 16, 32, 64),
            ScaleProfile::Extreme => (16, 32, 64, 128),
        };
        TierCapacities {
            vip,
            high,
            normal,
            low,
        }
    }
}

// Default value helpers
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_true() -> bool {
    true
}
fn default_per_minute() -> u32 {
    5
}
fn default_per_hour() -> u32 {
    30
}
fn default_per_day() -> u32 {
    100
}
fn default_cooldown_minute() -> u64 {
    300
}
fn default_cooldown_hour() -> u64 {
    3600
}
fn default_cooldown_day() -> u64 {
    86_400
}
fn default_command_per_minute() -> u32 {
    20
}
fn default_command_initial_cooldown() -> u64 {
    60
}
fn default_command_multiplier() -> u64 {
    2
}
fn default_command_max_cooldown() -> u64 {
    86_400
}
fn default_global_slots() -> usize {
    3
}
fn default_per_identity_slots() -> usize {
    1
}
fn default_vip_workers() -> usize {
    2
}
fn default_high_workers() -> usize {
    4
}
fn default_normal_workers() -> usize {
    8
}
fn default_low_workers() -> usize {
    16
}
fn default_queue_depth() -> usize {
    256
}
fn default_high_every() -> i64 {
    100
}
fn default_normal_every() -> i64 {
    10
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_flush_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        let config = config.effective();
        config.validate()?;
        Ok(config)
    }

    /// Fold the scale profile, if any, into the concurrency and tier sections.
    pub fn effective(mut self) -> Self {
        if let Some(profile) = self.profile {
            tracing::info!(?profile, "applying scale profile");
            self.concurrency = profile.concurrency();
            self.scheduler.tiers = profile.tiers();
        }
        self
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rate_limit.validate()?;
        self.command_limit.validate()?;
        self.concurrency.validate()?;
        self.scheduler.validate()?;

        if self.server.admin.enabled && self.server.admin.listen.is_empty() {
            anyhow::bail!("server.admin.listen must be set when the admin API is enabled");
        }

        Ok(())
    }

    pub fn is_admin(&self, identity: Identity) -> bool {
        self.admins.contains(&identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
admins: [1, 2, 3]
rate_limit:
  per_minute: 2
command_limit:
  violation_reset:
    policy: never
persistence:
  enabled: false
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.admins, vec![1, 2, 3]);
        assert_eq!(config.rate_limit.per_minute, 2);
        assert_eq!(config.rate_limit.per_hour, 30);
        assert_eq!(
            config.command_limit.violation_reset,
            ViolationResetPolicy::Never
        );
        assert!(!config.persistence.enabled);
        assert!(config.is_admin(2));
        assert!(!config.is_admin(42));
    }

    #[test]
    fn parses_clean_windows_policy() {
        let yaml = "policy: after_clean_windows\nwindows: 5\n";
        let policy: ViolationResetPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy, ViolationResetPolicy::AfterCleanWindows { windows: 5 });
    }

    #[test]
    fn rejects_zero_caps() {
        let mut config = AppConfig::default();
        config.concurrency.global = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.command_limit.multiplier = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_per_identity_above_global() {
        let mut config = AppConfig::default();
        config.concurrency.global = 2;
        config.concurrency.per_identity = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shrinking_horizon_caps() {
        let mut config = AppConfig::default();
        config.rate_limit.per_minute = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn profile_overrides_capacities() {
        let mut config = AppConfig::default();
        config.profile = Some(ScaleProfile::Large);
        let config = config.effective();
        assert_eq!(config.concurrency.global, 50);
        assert_eq!(config.scheduler.tiers, ScaleProfile::Large.tiers());
        config.validate().unwrap();
    }

    #[test]
    fn profile_for_expected_users() {
        assert_eq!(ScaleProfile::for_expected_users(50), ScaleProfile::Small);
        assert_eq!(ScaleProfile::for_expected_users(1_000), ScaleProfile::Medium);
        assert_eq!(ScaleProfile::for_expected_users(4_000), ScaleProfile::Large);
        assert_eq!(
            ScaleProfile::for_expected_users(10_000),
            ScaleProfile::Enterprise
        );
        assert_eq!(
            ScaleProfile::for_expected_users(50_000),
            ScaleProfile::Extreme
        );
    }

    #[test]
    fn every_profile_is_valid() {
        for profile in [
            ScaleProfile::Small,
            ScaleProfile::Medium,
            ScaleProfile::Large,
            ScaleProfile::Enterprise,
            ScaleProfile::Extreme,
        ] {
            let mut config = AppConfig::default();
            config.profile = Some(profile);
            config.effective().validate().unwrap();
        }
    }

    #[test]
    fn bundled_config_parses() {
        let raw = include_str!("../../../config/turnstile.yaml");
        let config: AppConfig = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.admins, vec![1, 2, 3]);
        assert_eq!(
            config.command_limit.violation_reset,
            ViolationResetPolicy::AfterCleanWindows { windows: 60 }
        );
    }
}
