pub mod config;
pub mod health;
pub mod identities;
pub mod metrics;
pub mod status;
