//! Drives every live state machine to completion, parking and waking
//! transactions as their wait descriptors dictate (spec §4.D).

mod wait;

use crate::context::{ActionContext, ChildRegistrar, Collaborators, RegisterChildFuture};
use crate::domain::{
    TransactionFlags, TransactionId, TransactionOptions, TransactionType, WaitDescriptor, WaitTarget,
    WaitType,
};
use crate::sm::{states, ActionResult, Event, StateMachine};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{info, instrument};
use wait::WaitBus;

struct RunnerState {
    machines: HashMap<TransactionId, StateMachine>,
    wait_bus: WaitBus,
}

/// Owns every transaction's live `StateMachine`; the `Store` only ever sees
/// durable metadata (spec §3's ownership split, see `domain::Transaction`).
pub struct Runner {
    store: Arc<Store>,
    collaborators: Collaborators,
    queue_capacity: usize,
    state: Mutex<RunnerState>,
    /// Handle to itself, handed to every `ActionContext` as a `ChildRegistrar`
    /// so a handler that spawns a child transaction (e.g. `Dependencies`
    /// spawning a dependency install, spec scenario S2) can register its
    /// `StateMachine` here. Without this the store alone would record the
    /// child's durable row but nothing would ever step it, and a parent
    /// parked on its completion would wait forever.
    self_handle: Weak<Runner>,
}

/// `ChildRegistrar` implementation backing `ActionContext::register_child`.
/// Holds only a `Weak` reference so it never keeps the `Runner` alive on its
/// own; a handler calling it after the runner has been dropped is a no-op.
struct RunnerRegistrar(Weak<Runner>);

impl ChildRegistrar for RunnerRegistrar {
    fn register_child(&self, id: TransactionId, transaction_type: TransactionType) -> RegisterChildFuture<'_> {
        let weak = self.0.clone();
        Box::pin(async move {
            if let Some(runner) = weak.upgrade() {
                runner.register_transaction(id, transaction_type).await;
            }
        })
    }
}

impl Runner {
    pub fn new(store: Arc<Store>, collaborators: Collaborators, queue_capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            store,
            collaborators,
            queue_capacity,
            state: Mutex::new(RunnerState {
                machines: HashMap::new(),
                wait_bus: WaitBus::default(),
            }),
            self_handle: self_handle.clone(),
        })
    }

    /// Construct and register a transaction's `StateMachine`, keyed by an id
    /// the store has already allocated. Shared by `create_transaction` (for
    /// operator-submitted work) and `RunnerRegistrar` (for handler-spawned
    /// children), so both paths make the same id reachable by `run_once`.
    async fn register_transaction(&self, id: TransactionId, transaction_type: TransactionType) {
        let machine = StateMachine::new(transaction_type, states::initial_state(transaction_type), self.queue_capacity);
        self.state.lock().await.machines.insert(id, machine);
    }

    /// A `ChildRegistrar` bound to this runner, handed to every `ActionContext`.
    fn registrar(&self) -> Arc<dyn ChildRegistrar> {
        Arc::new(RunnerRegistrar(self.self_handle.clone()))
    }

    /// Submit a new transaction and register its state machine. Returns `0`
    /// if the store failed to allocate an id (mirrors `Store::new_transaction`).
    #[instrument(skip(self, description))]
    pub async fn create_transaction(
        &self,
        transaction_type: TransactionType,
        flags: TransactionFlags,
        name: impl Into<String>,
        channel: impl Into<String>,
        description: impl Into<String>,
    ) -> TransactionId {
        let name = name.into();
        let channel = channel.into();

        let id = self
            .store
            .new_transaction(TransactionOptions {
                transaction_type,
                flags,
                name: name.clone(),
                description: description.into(),
            })
            .await;
        if id == 0 {
            return 0;
        }

        self.store.new_transaction_state(id, name, channel).await;
        self.register_transaction(id, transaction_type).await;
        id
    }

    /// Forcibly wake a parked transaction with `Cancel`, whether or not it
    /// was actually waiting on anything (spec scenario S6).
    pub async fn cancel(&self, id: TransactionId) {
        let mut guard = self.state.lock().await;
        guard.wait_bus.forget(id);
        if let Some(machine) = guard.machines.get_mut(&id) {
            machine.post_event(Event::Cancel);
        }
        drop(guard);
        self.store.set_wait(id, WaitDescriptor::NONE).await;
    }

    /// External/completion wake source (spec §4.D wake policy): clears the
    /// wait descriptor of every transaction parked on `target` and posts a
    /// single `Wake` event to each.
    pub async fn event(&self, target: WaitTarget) {
        let waiters = {
            let mut guard = self.state.lock().await;
            match target {
                WaitTarget::Transaction(id) => guard.wait_bus.take_waiters_of_transaction(id),
                WaitTarget::External(tag) => guard.wait_bus.take_waiters_of_external(tag),
            }
        };
        self.wake_all(waiters).await;
    }

    async fn wake_all(&self, waiters: Vec<TransactionId>) {
        for waiter in waiters {
            self.store.set_wait(waiter, WaitDescriptor::NONE).await;
            let mut guard = self.state.lock().await;
            if let Some(machine) = guard.machines.get_mut(&waiter) {
                machine.post_event(Event::Wake);
            }
        }
    }

    /// Step every live, non-terminal transaction once. Returns `true` if at
    /// least one transaction actually had an event to dispatch this pass
    /// (i.e. `StateMachine::execute` returned `Some`) — a machine with an
    /// empty queue that simply got skipped over does NOT count, so a caller
    /// (the `serve` loop) that spins on `run_once` while it returns `true`
    /// correctly falls back to waiting for a timer tick or an externally
    /// posted event once every transaction is either terminal or genuinely
    /// parked with nothing to dispatch, instead of busy-looping forever.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> bool {
        let ids: Vec<TransactionId> = self.state.lock().await.machines.keys().copied().collect();
        let mut progressed = false;

        for id in ids {
            let mut machine = {
                let mut guard = self.state.lock().await;
                match guard.machines.remove(&id) {
                    Some(m) => m,
                    None => continue,
                }
            };

            if machine.is_terminal() {
                // Already finished in a prior step; drop rather than reinsert.
                continue;
            }

            let mut ctx = ActionContext::new(self.store.clone(), id, self.collaborators.clone(), self.registrar());
            let Some(result) = machine.execute(&mut ctx).await else {
                // No event was pending; this machine made no progress this
                // pass, so it must not count toward quiescence detection.
                self.state.lock().await.machines.insert(id, machine);
                continue;
            };
            progressed = true;

            if result == ActionResult::Abort {
                machine.post_event(Event::Failed);
            }

            self.store.set_current_state(id, machine.current_state().as_u32()).await;

            if machine.is_terminal() {
                info!(transaction_id = id, state = ?machine.current_state(), "transaction finished");
                let waiters = self.state.lock().await.wait_bus.take_waiters_of_transaction(id);
                self.wake_all(waiters).await;
                continue;
            }

            if result == ActionResult::Wait {
                if let Some(transaction) = self.store.get_transaction(id).await {
                    if transaction.wait.is_waiting() {
                        let mut guard = self.state.lock().await;
                        match transaction.wait.wait_type {
                            WaitType::Transaction => guard.wait_bus.park_on_transaction(id, transaction.wait.wait_data),
                            WaitType::External => guard.wait_bus.park_on_external(id, transaction.wait.wait_data),
                            WaitType::None => {}
                        }
                    }
                }
            }

            self.state.lock().await.machines.insert(id, machine);
        }

        progressed
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.machines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `Store::load` requires a live Postgres connection, so pure unit tests
    // exercise `WaitBus` directly instead of standing up a full `Runner`;
    // store-backed runner coverage lives under `tests/`.
    #[test]
    fn wait_bus_wakes_only_registered_waiters() {
        let mut bus = WaitBus::default();
        bus.park_on_transaction(2, 1);
        bus.park_on_transaction(3, 1);
        bus.park_on_external(4, 99);

        let waiters = bus.take_waiters_of_transaction(1);
        assert_eq!(waiters, vec![2, 3]);
        assert!(bus.take_waiters_of_transaction(1).is_empty());
        assert_eq!(bus.take_waiters_of_external(99), vec![4]);
    }

    #[test]
    fn forget_removes_a_waiter_from_every_index() {
        let mut bus = WaitBus::default();
        bus.park_on_transaction(5, 1);
        bus.park_on_external(5, 7);
        bus.forget(5);
        assert!(bus.take_waiters_of_transaction(1).is_empty());
        assert!(bus.take_waiters_of_external(7).is_empty());
    }
}
