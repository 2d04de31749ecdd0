use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, info, warn};
use turnstile_common::{Identity, RateLimitConfig, TurnstileResult};

use crate::clock::{format_remaining, now_ms};
use crate::cooldown::{CooldownRecord, Decision};
use crate::persistence::{Persistence, Snapshot};
use crate::window::{Horizon, WindowEntry};

pub const RATE_LIMITS_FILE: &str = "rate_limits.json";
pub const COOLDOWNS_FILE: &str = "cooldowns.json";

/// Window state for one identity across the minute/hour/day horizons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonWindows {
    #[serde(default)]
    pub minute: WindowEntry,
    #[serde(default)]
    pub hour: WindowEntry,
    #[serde(default)]
    pub day: WindowEntry,
}

impl HorizonWindows {
    pub fn get(&self, horizon: Horizon) -> &WindowEntry {
        match horizon {
            Horizon::Minute => &self.minute,
            Horizon::Hour => &self.hour,
            Horizon::Day => &self.day,
        }
    }

    pub fn get_mut(&mut self, horizon: Horizon) -> &mut WindowEntry {
        match horizon {
            Horizon::Minute => &mut self.minute,
            Horizon::Hour => &mut self.hour,
            Horizon::Day => &mut self.day,
        }
    }

    fn has_live_events(&self, now_ms: u64) -> bool {
        Horizon::ALL
            .iter()
            .any(|h| self.get(*h).live_count(now_ms, *h) > 0)
    }
}

#[derive(Debug, Default)]
struct IdentityState {
    windows: HorizonWindows,
    cooldown: Option<CooldownRecord>,
}

/// Read-only view of one identity's standing, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RateUsage {
    pub minute: usize,
    pub hour: usize,
    pub day: usize,
    pub cooldown: Option<CooldownRecord>,
    pub cooldown_remaining_secs: Option<u64>,
}

/// Per-identity request throttling over minute, hour and day horizons.
///
/// Exceeding a horizon's cap arms a fixed per-horizon cooldown during which
/// every request is denied without touching the windows. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: RateLimitConfig,
    state: DashMap<Identity, IdentityState>,
    persistence: Persistence,
}

impl RateLimiter {
    /// Build a limiter, restoring any snapshot `persistence` points at.
    ///
    /// Fails if the configured caps or cooldowns are out of range.
    pub fn new(config: RateLimitConfig, persistence: Persistence) -> TurnstileResult<Self> {
        config.validate()?;

        let snapshot: Snapshot<HorizonWindows, CooldownRecord> = persistence.load();
        let state = DashMap::new();
        for (identity, windows) in snapshot.windows {
            state.insert(
                identity,
                IdentityState {
                    windows,
                    cooldown: None,
                },
            );
        }
        for (identity, cooldown) in snapshot.cooldowns {
            state.entry(identity).or_default().cooldown = Some(cooldown);
        }

        info!(
            per_minute = config.per_minute,
            per_hour = config.per_hour,
            per_day = config.per_day,
            restored = state.len(),
            persistent = persistence.is_enabled(),
            "creating multi-window rate limiter"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                persistence,
            }),
        })
    }

    /// In-memory limiter with no snapshot files.
    pub fn in_memory(config: RateLimitConfig) -> TurnstileResult<Self> {
        Self::new(config, Persistence::disabled())
    }

    pub fn check(&self, identity: Identity, is_admin: bool) -> Decision {
        self.check_at(identity, is_admin, now_ms())
    }

    /// [`check`](Self::check) against an explicit clock reading (unix ms).
    pub fn check_at(&self, identity: Identity, is_admin: bool, now_ms: u64) -> Decision {
        if is_admin {
            return Decision::Allowed;
        }

        let decision = {
            let mut entry = self.inner.state.entry(identity).or_default();
            let state = entry.value_mut();

            if let Some(cooldown) = &state.cooldown {
                if !cooldown.is_expired(now_ms) {
                    let remaining = cooldown.remaining(now_ms);
                    return Decision::Denied {
                        message: format!(
                            "Rate limit exceeded. Cooldown: {} remaining",
                            format_remaining(remaining)
                        ),
                        retry_after: remaining,
                    };
                }
                debug!(identity, "rate limit cooldown expired");
                state.cooldown = None;
            }

            for horizon in Horizon::ALL {
                state.windows.get_mut(horizon).prune(now_ms, horizon);
            }

            let exceeded = Horizon::ALL.into_iter().find(|h| {
                state.windows.get(*h).len() >= self.cap(*h) as usize
            });

            match exceeded {
                Some(horizon) => {
                    let duration = self.cooldown_secs(horizon);
                    let record = CooldownRecord::arm(now_ms, duration, 0, Some(horizon));
                    let remaining = record.remaining(now_ms);
                    state.cooldown = Some(record);

                    warn!(
                        identity,
                        horizon = %horizon,
                        cap = self.cap(horizon),
                        cooldown_secs = duration,
                        "rate limit exceeded, cooldown armed"
                    );

                    Decision::Denied {
                        message: format!(
                            "Rate limit exceeded (max {} requests/{}). Cooldown: {} remaining",
                            self.cap(horizon),
                            horizon,
                            format_remaining(remaining)
                        ),
                        retry_after: remaining,
                    }
                }
                None => {
                    for horizon in Horizon::ALL {
                        state.windows.get_mut(horizon).record(now_ms);
                    }
                    Decision::Allowed
                }
            }
        };

        // The entry guard is released above; snapshotting iterates the map.
        if self.inner.persistence.mark_dirty() {
            self.flush();
        }

        decision
    }

    pub fn usage(&self, identity: Identity) -> RateUsage {
        self.usage_at(identity, now_ms())
    }

    pub fn usage_at(&self, identity: Identity, now_ms: u64) -> RateUsage {
        let Some(entry) = self.inner.state.get(&identity) else {
            return RateUsage {
                minute: 0,
                hour: 0,
                day: 0,
                cooldown: None,
                cooldown_remaining_secs: None,
            };
        };

        let cooldown = entry
            .cooldown
            .clone()
            .filter(|c| !c.is_expired(now_ms));
        let cooldown_remaining_secs = cooldown
            .as_ref()
            .map(|c| c.remaining(now_ms).as_millis().div_ceil(1000) as u64);

        RateUsage {
            minute: entry.windows.minute.live_count(now_ms, Horizon::Minute),
            hour: entry.windows.hour.live_count(now_ms, Horizon::Hour),
            day: entry.windows.day.live_count(now_ms, Horizon::Day),
            cooldown,
            cooldown_remaining_secs,
        }
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.state.len()
    }

    /// Write the current state to disk if persistence is enabled.
    pub fn flush(&self) {
        self.inner.persistence.flush_with(|| self.snapshot());
    }

    /// Flush only if there are unsaved mutations.
    pub fn flush_if_dirty(&self) {
        if self.inner.persistence.is_dirty() {
            self.flush();
        }
    }

    pub fn snapshot(&self) -> Snapshot<HorizonWindows, CooldownRecord> {
        let mut snapshot = Snapshot::default();
        for entry in self.inner.state.iter() {
            snapshot.windows.insert(*entry.key(), entry.windows.clone());
            if let Some(cooldown) = &entry.cooldown {
                snapshot.cooldowns.insert(*entry.key(), cooldown.clone());
            }
        }
        snapshot
    }

    /// Evict identities with no live events and no active cooldown.
    pub fn cleanup(&self) {
        self.cleanup_at(now_ms());
    }

    pub fn cleanup_at(&self, now_ms: u64) {
        let before = self.inner.state.len();

        self.inner.state.retain(|_identity, state| {
            if state.cooldown.as_ref().is_some_and(|c| c.is_expired(now_ms)) {
                state.cooldown = None;
            }
            state.cooldown.is_some() || state.windows.has_live_events(now_ms)
        });

        let removed = before - self.inner.state.len();
        if removed > 0 && self.inner.persistence.mark_dirty() {
            self.flush();
        }

        debug!(
            removed,
            remaining = self.inner.state.len(),
            "rate limiter cleanup complete"
        );
    }

    fn cap(&self, horizon: Horizon) -> u32 {
        match horizon {
            Horizon::Minute => self.inner.config.per_minute,
            Horizon::Hour => self.inner.config.per_hour,
            Horizon::Day => self.inner.config.per_day,
        }
    }

    fn cooldown_secs(&self, horizon: Horizon) -> u64 {
        match horizon {
            Horizon::Minute => self.inner.config.cooldown_minute_secs,
            Horizon::Hour => self.inner.config.cooldown_hour_secs,
            Horizon::Day => self.inner.config.cooldown_day_secs,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.inner.config)
            .field("tracked", &self.inner.state.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::persistence::SnapshotStore;

    const T0: u64 = 1_700_000_000_000;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            per_minute: 5,
            per_hour: 8,
            per_day: 10,
            cooldown_minute_secs: 300,
            cooldown_hour_secs: 3_600,
            cooldown_day_secs: 86_400,
        }
    }

    #[test]
    fn sixth_request_in_a_minute_is_denied() {
        let limiter = RateLimiter::in_memory(config()).unwrap();

        for i in 0..5 {
            let (allowed, message) = limiter.check_at(42, false, T0 + i * 2_000).into_parts();
            assert!(allowed, "request {} should pass", i + 1);
            assert_eq!(message, "");
        }

        let (allowed, message) = limiter.check_at(42, false, T0 + 10_000).into_parts();
        assert!(!allowed);
        assert!(message.starts_with("Rate limit exceeded"), "{}", message);
        assert!(message.ends_with("Cooldown: 5m0s remaining"), "{}", message);
    }

    #[test]
    fn cooldown_remaining_decreases_and_expires() {
        let limiter = RateLimiter::in_memory(config()).unwrap();
        for i in 0..5 {
            limiter.check_at(1, false, T0 + i);
        }
        let armed = limiter.check_at(1, false, T0 + 10);
        let first = armed.retry_after().unwrap();
        assert!(first <= Duration::from_secs(300));

        let later = limiter.check_at(1, false, T0 + 60_000);
        let second = later.retry_after().unwrap();
        assert!(second < first);
        assert_eq!(later.message(), "Rate limit exceeded. Cooldown: 4m1s remaining");

        // The minute window has long rolled over once the cooldown lapses.
        assert!(limiter.check_at(1, false, T0 + 10 + 300_000).is_allowed());
    }

    #[test]
    fn cooldown_fast_path_leaves_windows_alone() {
        let limiter = RateLimiter::in_memory(config()).unwrap();
        for i in 0..6 {
            limiter.check_at(9, false, T0 + i);
        }
        let before = limiter.usage_at(9, T0 + 100);
        for i in 0..20 {
            assert!(!limiter.check_at(9, false, T0 + 100 + i).is_allowed());
        }
        let after = limiter.usage_at(9, T0 + 100);
        assert_eq!(before.minute, after.minute);
        assert_eq!(after.minute, 5);
        assert!(after.cooldown.is_some());
    }

    #[test]
    fn hour_cap_arms_hour_cooldown() {
        let limiter = RateLimiter::in_memory(config()).unwrap();
        // Spread 8 requests over two minutes so the minute cap never trips.
        for i in 0..4 {
            assert!(limiter.check_at(3, false, T0 + i * 1_000).is_allowed());
        }
        for i in 0..4 {
            assert!(limiter.check_at(3, false, T0 + 120_000 + i * 1_000).is_allowed());
        }

        let denied = limiter.check_at(3, false, T0 + 240_000);
        assert!(!denied.is_allowed());
        assert!(denied.message().contains("requests/hour"), "{}", denied.message());
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(3_600)));
        let usage = limiter.usage_at(3, T0 + 240_000);
        assert_eq!(usage.cooldown.unwrap().period, Some(Horizon::Hour));
    }

    #[test]
    fn only_shortest_exceeded_horizon_arms() {
        let mut cfg = config();
        cfg.per_minute = 2;
        cfg.per_hour = 2;
        cfg.per_day = 2;
        let limiter = RateLimiter::in_memory(cfg).unwrap();

        limiter.check_at(5, false, T0);
        limiter.check_at(5, false, T0 + 1);
        let denied = limiter.check_at(5, false, T0 + 2);

        assert!(denied.message().contains("requests/minute"));
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn admins_bypass_entirely() {
        let limiter = RateLimiter::in_memory(config()).unwrap();
        for i in 0..100 {
            assert_eq!(limiter.check_at(1, true, T0 + i).into_parts(), (true, String::new()));
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::in_memory(config()).unwrap();
        for i in 0..6 {
            limiter.check_at(10, false, T0 + i);
        }
        assert!(!limiter.check_at(10, false, T0 + 10).is_allowed());
        assert!(limiter.check_at(11, false, T0 + 10).is_allowed());
    }

    #[test]
    fn cleanup_removes_idle_identities() {
        let limiter = RateLimiter::in_memory(config()).unwrap();
        limiter.check_at(1, false, T0);
        for i in 0..6 {
            limiter.check_at(2, false, T0 + i);
        }

        limiter.cleanup_at(T0 + 2 * 86_400_000);
        assert_eq!(limiter.tracked(), 0);

        limiter.check_at(3, false, T0);
        limiter.cleanup_at(T0 + 1_000);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = || SnapshotStore::new(dir.path(), RATE_LIMITS_FILE, COOLDOWNS_FILE);

        let limiter =
            RateLimiter::new(config(), Persistence::new(store(), Duration::ZERO)).unwrap();
        for i in 0..4 {
            limiter.check_at(77, false, T0 + i);
        }
        for i in 0..6 {
            limiter.check_at(78, false, T0 + i);
        }
        drop(limiter);

        let restored =
            RateLimiter::new(config(), Persistence::new(store(), Duration::ZERO)).unwrap();
        assert!(restored.check_at(77, false, T0 + 100).is_allowed());
        assert!(!restored.check_at(77, false, T0 + 101).is_allowed());
        let denied = restored.check_at(78, false, T0 + 100);
        assert_eq!(denied.message(), "Rate limit exceeded. Cooldown: 5m0s remaining");
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = config();
        cfg.per_minute = 0;
        assert!(RateLimiter::in_memory(cfg).is_err());
    }
}
