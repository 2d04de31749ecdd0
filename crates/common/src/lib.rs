//! Shared types for the turnstile admission-control service: the identity
//! key, the YAML configuration model and the common error type.

pub mod config;
pub mod error;

pub use config::{
    AdminConfig, AppConfig, CommandLimitConfig, ConcurrencyConfig, PersistenceConfig,
    RateLimitConfig, ScaleProfile, SchedulerConfig, ServerConfig, TierCapacities,
    ViolationResetPolicy,
};
pub use error::{TurnstileError, TurnstileResult};

/// Opaque caller key every admission decision is keyed by.
pub type Identity = i64;
