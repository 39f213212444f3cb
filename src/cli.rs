//! `served-cli` front-end (spec §2 ambient CLI), shaped after the teacher's
//! `clap`-derived `Cli`/`Commands` pair.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "served-cli", about = "Crash-safe package transaction runner")]
pub struct Cli {
    /// Path to a `served.toml` config file; falls back to `SERVED_*` env vars and defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum CliTransactionType {
    Install,
    Update,
    Remove,
}

impl From<CliTransactionType> for crate::domain::TransactionType {
    fn from(value: CliTransactionType) -> Self {
        match value {
            CliTransactionType::Install => crate::domain::TransactionType::Install,
            CliTransactionType::Update => crate::domain::TransactionType::Update,
            CliTransactionType::Remove => crate::domain::TransactionType::Remove,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon loop: drives every transaction's state machine, wakes
    /// parked transactions, and runs the periodic cleanup task until a
    /// shutdown signal is received.
    Serve,
    /// Enqueue a new transaction and print its id.
    Submit {
        #[arg(value_enum)]
        transaction_type: CliTransactionType,
        name: String,
        #[arg(long, default_value = "stable")]
        channel: String,
    },
    /// Print a transaction's current state, or every active transaction if no id is given.
    Status {
        id: Option<u64>,
    },
    /// Force an out-of-band retention pass.
    Cleanup,
}
