use super::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain operation a transaction drives (spec §4.C's representative handler set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Install,
    Update,
    Remove,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Install => write!(f, "install"),
            TransactionType::Update => write!(f, "update"),
            TransactionType::Remove => write!(f, "remove"),
        }
    }
}

impl TransactionType {
    /// Inverse of the `as i32` cast used when writing `transactions.type` (spec §6).
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => TransactionType::Update,
            2 => TransactionType::Remove,
            _ => TransactionType::Install,
        }
    }
}

/// Bitset of transaction qualifiers. Kept as a plain `u32` newtype rather than
/// pulling in a bitflags crate for two bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFlags(pub u32);

impl TransactionFlags {
    pub const NONE: TransactionFlags = TransactionFlags(0);
    /// Set on transactions the runner itself spawns as a dependency of another
    /// transaction (e.g. the auto-spawned base install in spec scenario S2),
    /// so operators can distinguish them from directly requested work.
    pub const CHILD: TransactionFlags = TransactionFlags(1 << 0);
    /// Set when the transaction was submitted by an automated policy rather
    /// than an interactive operator.
    pub const AUTOMATIC: TransactionFlags = TransactionFlags(1 << 1);

    pub fn contains(&self, other: TransactionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TransactionFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for TransactionFlags {
    type Output = TransactionFlags;
    fn bitor(self, rhs: TransactionFlags) -> TransactionFlags {
        TransactionFlags(self.0 | rhs.0)
    }
}

/// What a parked transaction is waiting for (spec §3, "Wait descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitType {
    None,
    Transaction,
    External,
}

/// `wait_data` companion to `WaitType`: either an awaited transaction id or an
/// opaque external event tag. The tag is stored as a small integer so it can
/// round-trip through the `wait_data INT` column in the persistence schema
/// (spec §6); callers map their own tag space onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitDescriptor {
    pub wait_type: WaitType,
    pub wait_data: u64,
}

impl WaitType {
    /// Inverse of `wait_type_code` in `store::deferred` (spec §6 `wait_type INT`).
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => WaitType::Transaction,
            2 => WaitType::External,
            _ => WaitType::None,
        }
    }
}

impl WaitDescriptor {
    pub const NONE: WaitDescriptor = WaitDescriptor {
        wait_type: WaitType::None,
        wait_data: 0,
    };

    pub fn on_transaction(id: TransactionId) -> Self {
        Self {
            wait_type: WaitType::Transaction,
            wait_data: id,
        }
    }

    pub fn on_external(tag: u64) -> Self {
        Self {
            wait_type: WaitType::External,
            wait_data: tag,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_type != WaitType::None
    }
}

/// Argument to `Runner::event` distinguishing the two wake sources named in
/// spec §4.D's wake policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Transaction(TransactionId),
    External(u64),
}

/// Parameters accepted by `Store::new_transaction` / `Runner::create_transaction`.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub transaction_type: TransactionType,
    pub flags: TransactionFlags,
    pub name: String,
    pub description: String,
}

/// Runtime record for one in-flight or completed transaction (spec §3). The
/// live state machine driving this transaction is held separately by the
/// `Runner` (keyed by the same id) so that store access from inside an
/// action never re-enters the runner's own bookkeeping map.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub transaction_type: TransactionType,
    pub flags: TransactionFlags,
    pub name: String,
    pub description: String,
    pub wait: WaitDescriptor,
    /// Last SM state id the runner reported for this transaction (the
    /// `transactions.state` column, spec §6), kept for operator status
    /// reporting and as a restart hint; the runner never resumes a live
    /// `StateMachine` from it (spec property #2 only promises cache
    /// equivalence, not in-flight SM resumption).
    pub current_state: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    /// Inverse of the `as i32` cast used when writing `transaction_logs.level` (spec §6).
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LogLevel::Debug,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One entry in a transaction's log (spec §3, bounded to 512-byte messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the SM state id at the time the entry was written.
    pub state_snapshot: u32,
    pub message: String,
}

pub const LOG_MESSAGE_MAX_BYTES: usize = 512;

impl LogEntry {
    pub fn new(level: LogLevel, state_snapshot: u32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > LOG_MESSAGE_MAX_BYTES {
            // `truncate` panics unless the cut falls on a char boundary;
            // walk back from the byte cap to the nearest one.
            let mut cut = LOG_MESSAGE_MAX_BYTES;
            while cut > 0 && !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            level,
            timestamp: Utc::now(),
            state_snapshot,
            message,
        }
    }
}

/// Domain payload for a dispatched transaction, keyed by transaction id
/// (spec §3). Exists for every Transaction that has been dispatched; deleted
/// when its transaction is pruned.
pub struct TransactionState {
    pub transaction_id: TransactionId,
    pub name: String,
    pub channel: String,
    pub revision: i64,
    pub logs: Vec<LogEntry>,
}

impl TransactionState {
    pub fn new(transaction_id: TransactionId, name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            transaction_id,
            name: name.into(),
            channel: channel.into(),
            revision: 0,
            logs: Vec::new(),
        }
    }
}
