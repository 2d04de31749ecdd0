use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, info, warn};
use turnstile_common::{CommandLimitConfig, Identity, TurnstileResult, ViolationResetPolicy};

use crate::clock::{format_remaining, now_ms};
use crate::cooldown::{CooldownRecord, Decision};
use crate::persistence::{Persistence, Snapshot};
use crate::window::{Horizon, WindowEntry};

pub const COMMAND_LIMITS_FILE: &str = "command_limits.json";
pub const COMMAND_COOLDOWNS_FILE: &str = "command_cooldowns.json";

/// Persisted command window plus the standing violation count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandWindow {
    #[serde(default)]
    pub commands: WindowEntry,
    #[serde(default)]
    pub violations: u32,
    /// Unix ms at which the most recent cooldown ended or will end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cooldown_until: Option<u64>,
}

#[derive(Debug, Default)]
struct SpamState {
    window: CommandWindow,
    cooldown: Option<CooldownRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandUsage {
    pub commands: usize,
    pub violations: u32,
    pub cooldown: Option<CooldownRecord>,
    pub cooldown_remaining_secs: Option<u64>,
}

/// Short-window command throttling with exponentially growing cooldowns.
///
/// The n-th violation arms `initial * multiplier^(n-1)` seconds, capped at
/// the configured maximum. Violations carry over when a cooldown expires and
/// are only forgiven according to the [`ViolationResetPolicy`].
#[derive(Clone)]
pub struct CommandSpamLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: CommandLimitConfig,
    state: DashMap<Identity, SpamState>,
    persistence: Persistence,
}

impl CommandSpamLimiter {
    pub fn new(config: CommandLimitConfig, persistence: Persistence) -> TurnstileResult<Self> {
        config.validate()?;

        let snapshot: Snapshot<CommandWindow, CooldownRecord> = persistence.load();
        let state = DashMap::new();
        for (identity, window) in snapshot.windows {
            state.insert(
                identity,
                SpamState {
                    window,
                    cooldown: None,
                },
            );
        }
        for (identity, cooldown) in snapshot.cooldowns {
            state.entry(identity).or_default().cooldown = Some(cooldown);
        }

        info!(
            per_minute = config.per_minute,
            initial_cooldown_secs = config.initial_cooldown_secs,
            multiplier = config.multiplier,
            restored = state.len(),
            persistent = persistence.is_enabled(),
            "creating command spam limiter"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                persistence,
            }),
        })
    }

    pub fn in_memory(config: CommandLimitConfig) -> TurnstileResult<Self> {
        Self::new(config, Persistence::disabled())
    }

    pub fn check(&self, identity: Identity, is_admin: bool) -> Decision {
        self.check_at(identity, is_admin, now_ms())
    }

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
                            "Too many commands. Cooldown: {} remaining",
                            format_remaining(remaining)
                        ),
                        retry_after: remaining,
                    };
                }
                let window = &mut state.window;
                window.violations = window.violations.max(cooldown.violations);
                window.last_cooldown_until = Some(cooldown.until);
                debug!(
                    identity,
                    violations = window.violations,
                    "command cooldown expired"
                );
                state.cooldown = None;
            }

            self.apply_reset_policy(identity, &mut state.window, now_ms);

            let window = &mut state.window;
            window.commands.prune(now_ms, Horizon::Minute);

            if window.commands.len() >= self.inner.config.per_minute as usize {
                window.violations = window.violations.saturating_add(1);
                window.commands.clear();

                let duration = self.cooldown_for(window.violations);
                let record = CooldownRecord::arm(now_ms, duration, window.violations, None);
                window.last_cooldown_until = Some(record.until);
                let remaining = record.remaining(now_ms);
                let violations = window.violations;
                state.cooldown = Some(record);

                warn!(
                    identity,
                    violations,
                    cooldown_secs = duration,
                    "command spam detected, cooldown armed"
                );

                Decision::Denied {
                    message: format!(
                        "Too many commands (max {}/minute). Cooldown: {}",
                        self.inner.config.per_minute,
                        format_remaining(remaining)
                    ),
                    retry_after: remaining,
                }
            } else {
                window.commands.record(now_ms);
                Decision::Allowed
            }
        };

        if self.inner.persistence.mark_dirty() {
            self.flush();
        }

        decision
    }

    /// Cooldown in seconds for the given (1-based) violation number.
    pub fn cooldown_for(&self, violations: u32) -> u64 {
        let config = &self.inner.config;
        let exponent = violations.saturating_sub(1);
        config
            .multiplier
            .checked_pow(exponent)
            .and_then(|factor| config.initial_cooldown_secs.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(config.max_cooldown_secs)
    }

    fn apply_reset_policy(&self, identity: Identity, window: &mut CommandWindow, now_ms: u64) {
        let ViolationResetPolicy::AfterCleanWindows { windows } = self.inner.config.violation_reset
        else {
            return;
        };
        if window.violations == 0 {
            return;
        }
        let Some(ended) = window.last_cooldown_until else {
            return;
        };

        let quiet = u64::from(windows).saturating_mul(Horizon::Minute.as_millis());
        if now_ms.saturating_sub(ended) >= quiet {
            debug!(
                identity,
                forgiven = window.violations,
                "resetting command violations after clean windows"
            );
            window.violations = 0;
            window.last_cooldown_until = None;
        }
    }

    pub fn usage(&self, identity: Identity) -> CommandUsage {
        self.usage_at(identity, now_ms())
    }

    pub fn usage_at(&self, identity: Identity, now_ms: u64) -> CommandUsage {
        let Some(entry) = self.inner.state.get(&identity) else {
            return CommandUsage {
                commands: 0,
                violations: 0,
                cooldown: None,
                cooldown_remaining_secs: None,
            };
        };

        let cooldown = entry
            .cooldown
            .clone()
            .filter(|c| !c.is_expired(now_ms));
        let violations = entry
            .window
            .violations
            .max(cooldown.as_ref().map_or(0, |c| c.violations));

        CommandUsage {
            commands: entry.window.commands.live_count(now_ms, Horizon::Minute),
            violations,
            cooldown_remaining_secs: cooldown
                .as_ref()
                .map(|c| c.remaining(now_ms).as_millis().div_ceil(1000) as u64),
            cooldown,
        }
    }

    pub fn tracked(&self) -> usize {
        self.inner.state.len()
    }

    pub fn flush(&self) {
        self.inner.persistence.flush_with(|| self.snapshot());
    }

    pub fn flush_if_dirty(&self) {
        if self.inner.persistence.is_dirty() {
            self.flush();
        }
    }

    pub fn snapshot(&self) -> Snapshot<CommandWindow, CooldownRecord> {
        let mut snapshot = Snapshot::default();
        for entry in self.inner.state.iter() {
            snapshot.windows.insert(*entry.key(), entry.window.clone());
            if let Some(cooldown) = &entry.cooldown {
                snapshot.cooldowns.insert(*entry.key(), cooldown.clone());
            }
        }
        snapshot
    }

    /// Evict identities with no live commands, no cooldown and no standing
    /// violations. Repeat offenders are kept so their escalation survives.
    pub fn cleanup(&self) {
        self.cleanup_at(now_ms());
    }

    pub fn cleanup_at(&self, now_ms: u64) {
        let before = self.inner.state.len();

        self.inner.state.retain(|_identity, state| {
            state.cooldown.is_some()
                || state.window.violations > 0
                || state.window.commands.live_count(now_ms, Horizon::Minute) > 0
        });

        let removed = before - self.inner.state.len();
        if removed > 0 && self.inner.persistence.mark_dirty() {
            self.flush();
        }

        debug!(
            removed,
            remaining = self.inner.state.len(),
            "command limiter cleanup complete"
        );
    }
}

impl std::fmt::Debug for CommandSpamLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpamLimiter")
            .field("config", &self.inner.config)
            .field("tracked", &self.inner.state.len())
            .finish()
    }
}
