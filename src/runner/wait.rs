use crate::domain::TransactionId;
use std::collections::HashMap;

/// Reverse index from what a transaction is waiting on to the set of parked
/// transactions that should wake when it fires (spec §4.D wake policy).
#[derive(Default)]
pub struct WaitBus {
    on_transaction: HashMap<TransactionId, Vec<TransactionId>>,
    on_external: HashMap<u64, Vec<TransactionId>>,
}

impl WaitBus {
    pub fn park_on_transaction(&mut self, waiter: TransactionId, awaited: TransactionId) {
        self.on_transaction.entry(awaited).or_default().push(waiter);
    }

    pub fn park_on_external(&mut self, waiter: TransactionId, tag: u64) {
        self.on_external.entry(tag).or_default().push(waiter);
    }

    /// Remove and return every transaction parked on `awaited`'s completion.
    pub fn take_waiters_of_transaction(&mut self, awaited: TransactionId) -> Vec<TransactionId> {
        self.on_transaction.remove(&awaited).unwrap_or_default()
    }

    pub fn take_waiters_of_external(&mut self, tag: u64) -> Vec<TransactionId> {
        self.on_external.remove(&tag).unwrap_or_default()
    }

    /// Drop any pending park record for a transaction that is being
    /// cancelled out from under its wait (spec scenario S6).
    pub fn forget(&mut self, waiter: TransactionId) {
        for waiters in self.on_transaction.values_mut() {
            waiters.retain(|&id| id != waiter);
        }
        for waiters in self.on_external.values_mut() {
            waiters.retain(|&id| id != waiter);
        }
    }
}
