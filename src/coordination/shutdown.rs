//! Graceful shutdown: on SIGINT/SIGTERM, cancel every non-terminal
//! transaction, flush the store's deferred queue, then close the pool
//! (spec §6 supplement — the teacher's `GracefulShutdown` drains orders the
//! same way this drains transactions, just with a domain-specific drain step
//! in place of order cancellation).

use crate::runner::Runner;
use crate::store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

pub struct GracefulShutdown {
    requested: AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait for either signal, then cancel every active transaction and
    /// flush the store so a restart resumes from durable state cleanly.
    pub async fn wait_and_drain(&self, runner: &Runner, store: &Store) {
        let signal_kind = match wait_for_signal().await {
            Ok(kind) => kind,
            Err(e) => {
                error!(error = %e, "failed to install signal handler, shutdown will not be graceful");
                return;
            }
        };

        self.requested.store(true, Ordering::SeqCst);
        info!(signal = %signal_kind, "shutdown requested, cancelling active transactions");

        for id in store.active_transactions().await {
            runner.cancel(id).await;
        }

        // Give the runner a few steps to let the cancellations land in
        // Cancelled handlers and persist before the pool closes.
        for _ in 0..8 {
            if !runner.run_once().await {
                break;
            }
        }

        if let Err(e) = store.flush().await {
            warn!(error = %e, "final flush before shutdown failed");
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok(ShutdownSignal::Interrupt),
        _ = sigterm.recv() => Ok(ShutdownSignal::Terminate),
    }
}

pub fn shutdown_handle() -> Arc<GracefulShutdown> {
    Arc::new(GracefulShutdown::new())
}
