//! Daemon lifecycle glue sitting above the runner (spec §6 supplement).

pub mod shutdown;

pub use shutdown::{shutdown_handle, GracefulShutdown, ShutdownSignal};

use crate::config::RunnerConfig;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Background task that periodically prunes completed transactions past
/// their retention window (spec §4.B), running until the process exits.
pub async fn periodic_cleanup(store: Arc<Store>, config: RunnerConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.cleanup_interval_secs));
    loop {
        interval.tick().await;
        match store.cleanup(config.retain_count, config.retain_days).await {
            Ok(pruned) if pruned > 0 => info!(pruned, "cleanup pruned completed transactions"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "periodic cleanup failed"),
        }
    }
}
