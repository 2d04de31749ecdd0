use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use turnstile_common::{Identity, SchedulerConfig};

/// Priority class an identity's work executes under. Each tier owns an
/// isolated worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriorityTier {
    Low,
    Normal,
    High,
    Vip,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Vip,
        PriorityTier::High,
        PriorityTier::Normal,
        PriorityTier::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Low => "LOW",
            PriorityTier::Normal => "NORMAL",
            PriorityTier::High => "HIGH",
            PriorityTier::Vip => "VIP",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an identity to its tier. Must be pure and deterministic: the same
/// identity always lands in the same pool.
pub trait TierClassifier: Send + Sync {
    fn classify(&self, identity: Identity) -> PriorityTier;
}

/// Admins are VIP; otherwise every `high_every`-th identity is HIGH, every
/// `normal_every`-th is NORMAL and everyone else is LOW.
#[derive(Debug, Clone)]
pub struct ModuloClassifier {
    admins: HashSet<Identity>,
    high_every: i64,
    normal_every: i64,
}

impl ModuloClassifier {
    pub fn new(admins: impl IntoIterator<Item = Identity>, high_every: i64, normal_every: i64) -> Self {
        Self {
            admins: admins.into_iter().collect(),
            high_every: high_every.max(1),
            normal_every: normal_every.max(1),
        }
    }

    pub fn from_config(admins: &[Identity], config: &SchedulerConfig) -> Self {
        Self::new(admins.iter().copied(), config.high_every, config.normal_every)
    }
}

impl TierClassifier for ModuloClassifier {
    fn classify(&self, identity: Identity) -> PriorityTier {
        if self.admins.contains(&identity) {
            PriorityTier::Vip
        } else if identity.rem_euclid(self.high_every) == 0 {
            PriorityTier::High
        } else if identity.rem_euclid(self.normal_every) == 0 {
            PriorityTier::Normal
        } else {
            PriorityTier::Low
        }
    }
}
