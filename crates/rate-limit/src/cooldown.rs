use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::window::Horizon;

/// A penalty during which an identity is denied regardless of window counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    /// Unix ms at which the penalty lapses.
    pub until: u64,
    /// Length of the penalty in seconds.
    pub duration: u64,
    /// Violation count at the time the penalty was armed.
    #[serde(default)]
    pub violations: u32,
    /// Horizon that tripped the penalty; absent for command cooldowns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Horizon>,
}

impl CooldownRecord {
    pub fn arm(now_ms: u64, duration_secs: u64, violations: u32, period: Option<Horizon>) -> Self {
        Self {
            until: now_ms.saturating_add(duration_secs.saturating_mul(1000)),
            duration: duration_secs,
            violations,
            period,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.until
    }

    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.until.saturating_sub(now_ms))
    }
}

/// Outcome of a limiter check. A denial is a policy decision, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied {
        message: String,
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Human-readable reason; empty when allowed.
    pub fn message(&self) -> &str {
        match self {
            Decision::Allowed => "",
            Decision::Denied { message, .. } => message,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allowed => None,
            Decision::Denied { retry_after, .. } => Some(*retry_after),
        }
    }

    /// The `(allowed, message)` pair command handlers consume.
    pub fn into_parts(self) -> (bool, String) {
        match self {
            Decision::Allowed => (true, String::new()),
            Decision::Denied { message, .. } => (false, message),
        }
    }
}
