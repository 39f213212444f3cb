//! Domain types shared by the store, the state machine, and action handlers.

mod application;
mod transaction;
mod version;

pub use application::{Application, Command, CommandType, Revision};
pub use transaction::{
    LogEntry, LogLevel, Transaction, TransactionFlags, TransactionOptions, TransactionState,
    TransactionType, WaitDescriptor, WaitTarget, WaitType,
};
pub use version::Version;

/// Monotonic, non-zero, never reused within a store lifetime (spec §3).
pub type TransactionId = u64;
