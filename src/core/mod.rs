pub mod advisor;
pub mod cluster;
pub mod command;
pub mod dashboard;
pub mod error;
pub mod ingest;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Once;

pub fn version() -> &'static str {
    concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")")
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("aether"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("aether"))
}

pub fn get_log_dir() -> anyhow::Result<PathBuf> {
    let log_dir = get_data_dir()?.join("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    Ok(log_dir)
}

/// Installs the process-wide rustls provider used by the HTTP clients.
pub fn install_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Another component may already have installed one.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
