//! Per-identity request limiting for the turnstile admission pipeline.
//!
//! This crate provides the two policy limiters that run before any work is
//! admitted:
//!
//! - **[`RateLimiter`]** -- counts requests over minute, hour and day
//!   horizons. The first exceeded cap (shortest horizon first) arms a fixed
//!   per-horizon cooldown.
//!
//! - **[`CommandSpamLimiter`]** -- counts commands over a single minute
//!   window. Each violation arms a cooldown that grows exponentially with
//!   the identity's standing violation count.
//!
//! Both keep their maps in a [`DashMap`](dashmap::DashMap) keyed by
//! identity, never block, and report denials as a [`Decision`] rather than
//! an error. State is snapshotted to disk through [`Persistence`] and
//! restored at construction.

pub mod clock;
pub mod command;
pub mod cooldown;
pub mod multi_window;
pub mod persistence;
pub mod window;

use std::time::Duration;

pub use clock::{format_remaining, now_ms};
pub use command::{CommandSpamLimiter, CommandUsage, CommandWindow};
pub use cooldown::{CooldownRecord, Decision};
pub use multi_window::{HorizonWindows, RateLimiter, RateUsage};
pub use persistence::{Persistence, Snapshot, SnapshotStore};
pub use window::{Horizon, WindowEntry};

use turnstile_common::{CommandLimitConfig, PersistenceConfig, RateLimitConfig, TurnstileResult};

/// Build both limiters from configuration, each with its own snapshot files.
pub fn build_limiters(
    rate: RateLimitConfig,
    command: CommandLimitConfig,
    persistence: &PersistenceConfig,
) -> TurnstileResult<(RateLimiter, CommandSpamLimiter)> {
    let rate_limiter = RateLimiter::new(
        rate,
        Persistence::from_config(
            persistence,
            multi_window::RATE_LIMITS_FILE,
            multi_window::COOLDOWNS_FILE,
        ),
    )?;
    let command_limiter = CommandSpamLimiter::new(
        command,
        Persistence::from_config(
            persistence,
            command::COMMAND_LIMITS_FILE,
            command::COMMAND_COOLDOWNS_FILE,
        ),
    )?;
    Ok((rate_limiter, command_limiter))
}

/// Spawn a background thread that periodically evicts idle identities and
/// writes out any state the debounced flush policy has left dirty.
///
/// The thread holds clones of both limiters and runs until the process
/// exits; call `flush` on each limiter during shutdown for a final write.
pub fn start_maintenance_task(
    rate_limiter: &RateLimiter,
    command_limiter: &CommandSpamLimiter,
    every: Duration,
) -> std::io::Result<()> {
    let rate_limiter = rate_limiter.clone();
    let command_limiter = command_limiter.clone();

    std::thread::Builder::new()
        .name("limiter-maintenance".into())
        .spawn(move || loop {
            std::thread::sleep(every);

            rate_limiter.cleanup();
            command_limiter.cleanup();
            rate_limiter.flush_if_dirty();
            command_limiter.flush_if_dirty();

            tracing::trace!("limiter maintenance tick completed");
        })?;

    Ok(())
}
