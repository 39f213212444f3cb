//! Collaborator seams named but left external by spec §1: the package
//! metadata reader, the mount/unmount helper, and the process spawner. The
//! core only depends on these narrow traits so it can be exercised without
//! the real filesystem/container backends.

use crate::domain::{TransactionId, TransactionType};
use crate::error::Result;
use crate::sm::Event;
use crate::store::Store;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Package metadata as read from the on-disk package format (external
/// collaborator `chef_package_load` in spec §1). Only the fields the
/// `Dependencies` handler needs are modeled.
#[derive(Debug, Clone, Default)]
pub struct PackageMetadata {
    pub base: Option<String>,
}

pub trait PackageLoader: Send + Sync {
    fn load(&self, application_name: &str) -> Result<PackageMetadata>;
}

pub trait MountController: Send + Sync {
    fn is_mounted(&self, application_name: &str) -> Result<bool>;
    fn unmount(&self, application_name: &str) -> Result<()>;
}

pub trait ProcessSpawner: Send + Sync {
    /// Fire-and-forget spawn used by `Install`/`Update`/`Remove` for any
    /// post-install hooks. Handlers must not hold the store lock while this
    /// runs (spec §4.C handler rules).
    fn spawn(&self, command: &str, arguments: &[String]) -> Result<()>;
}

/// Bundle of collaborators an `ActionContext` carries, so the handler set can
/// be constructed once and reused by the runner for every transaction.
#[derive(Clone)]
pub struct Collaborators {
    pub packages: Arc<dyn PackageLoader>,
    pub mounts: Arc<dyn MountController>,
    pub spawner: Arc<dyn ProcessSpawner>,
}

pub type RegisterChildFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Lets an action register a transaction it just spawned (via
/// `Store::new_transaction`) as a live `StateMachine` with the runner. The
/// store only ever holds durable metadata — it has no notion of a live SM
/// (spec §3) — so a child created without going through this seam would sit
/// in the store forever with nothing to step it, and a parent parked on its
/// completion (e.g. the `Dependencies` handler spawning a base install,
/// scenario S2) would wait forever.
pub trait ChildRegistrar: Send + Sync {
    fn register_child(&self, id: TransactionId, transaction_type: TransactionType) -> RegisterChildFuture<'_>;
}

/// Per-step bundle handed to an action: the store handle, the transaction id
/// the step is executing for, the external collaborators, and a way to
/// register any child transaction the action spawns.
///
/// An action that wants to drive its own state machine's next transition
/// calls `emit` once before returning; the state machine posts that event to
/// its own queue immediately after the action returns (spec §4.A step 2/3).
pub struct ActionContext {
    pub store: Arc<Store>,
    pub transaction_id: TransactionId,
    pub collaborators: Collaborators,
    registrar: Arc<dyn ChildRegistrar>,
    pending_event: Option<Event>,
}

impl ActionContext {
    pub fn new(
        store: Arc<Store>,
        transaction_id: TransactionId,
        collaborators: Collaborators,
        registrar: Arc<dyn ChildRegistrar>,
    ) -> Self {
        Self {
            store,
            transaction_id,
            collaborators,
            registrar,
            pending_event: None,
        }
    }

    /// Record the event this action wants posted to its state machine.
    pub fn emit(&mut self, event: Event) {
        self.pending_event = Some(event);
    }

    pub(crate) fn take_emitted(&mut self) -> Option<Event> {
        self.pending_event.take()
    }

    /// Register a transaction this action just spawned so the runner starts
    /// stepping its state machine (see `ChildRegistrar`).
    pub async fn register_child(&self, id: TransactionId, transaction_type: TransactionType) {
        self.registrar.register_child(id, transaction_type).await;
    }
}

/// No-op collaborator implementations used by tests that don't exercise the
/// external flows.
pub mod fakes {
    use super::*;

    pub struct NoBase;
    impl PackageLoader for NoBase {
        fn load(&self, _application_name: &str) -> Result<PackageMetadata> {
            Ok(PackageMetadata::default())
        }
    }

    pub struct AlwaysUnmounted;
    impl MountController for AlwaysUnmounted {
        fn is_mounted(&self, _application_name: &str) -> Result<bool> {
            Ok(false)
        }
        fn unmount(&self, _application_name: &str) -> Result<()> {
            Ok(())
        }
    }

    pub struct NoSpawn;
    impl ProcessSpawner for NoSpawn {
        fn spawn(&self, _command: &str, _arguments: &[String]) -> Result<()> {
            Ok(())
        }
    }

    pub fn collaborators() -> Collaborators {
        Collaborators {
            packages: Arc::new(NoBase),
            mounts: Arc::new(AlwaysUnmounted),
            spawner: Arc::new(NoSpawn),
        }
    }
}
