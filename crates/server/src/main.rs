use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use turnstile_common::AppConfig;
use turnstile_gate::Gate;

const MAINTENANCE_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/turnstile.yaml".to_string());

    info!(config_path = %config_path, "starting turnstile");

    let config = AppConfig::load(&config_path)?;
    let gate = Arc::new(Gate::from_config(&config)?);

    let maintenance_every = if config.persistence.flush_interval_ms > 0 {
        MAINTENANCE_EVERY.min(Duration::from_millis(config.persistence.flush_interval_ms))
    } else {
        MAINTENANCE_EVERY
    };
    gate.start_maintenance(maintenance_every)?;

    info!("turnstile started successfully");

    if config.server.admin.enabled {
        let listen_addr = config.server.admin.listen.clone();
        let state = turnstile_admin::new_shared_state(config.clone(), Arc::clone(&gate));

        tokio::select! {
            result = turnstile_admin::run_admin_server(state, &listen_addr) => {
                if let Err(e) = result {
                    error!(error = %e, "admin API server error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    gate.shutdown().await;
    info!("turnstile stopped");

    Ok(())
}
