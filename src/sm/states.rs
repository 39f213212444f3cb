//! Per-`TransactionType` state tables (spec §4.A/§4.C). Each table shares the
//! same `StateId` space; states the transaction type has no use for are
//! simply absent and thus unreachable for that type.

use super::{ActionFn, Event, StateDef, StateId, StateTable};
use crate::domain::TransactionType;
use crate::handlers;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

fn def(action: ActionFn, transitions: &[(Event, StateId)]) -> StateDef {
    StateDef {
        transitions: transitions.iter().copied().collect(),
        action,
        wait_target: None,
    }
}

fn terminal(action: ActionFn) -> StateDef {
    StateDef {
        transitions: HashMap::new(),
        action,
        wait_target: None,
    }
}

fn terminal_states(table: &mut StateTable) {
    table.insert(StateId::Completed, terminal(handlers::completed));
    table.insert(StateId::Failed, terminal(handlers::failed));
    table.insert(StateId::Cancelled, terminal(handlers::cancelled));
}

/// Install: resolve dependencies (parking on the dependency's own completion
/// if needed), unmount any prior mount, install, verify, commit.
fn install_table() -> StateTable {
    let mut table = StateTable::new();

    table.insert(
        StateId::Dependencies,
        StateDef {
            transitions: [
                (Event::Ok, StateId::Unmount),
                (Event::Failed, StateId::Failed),
                (Event::Cancel, StateId::Cancelled),
            ]
            .into_iter()
            .collect(),
            action: handlers::dependencies,
            wait_target: Some(StateId::DependenciesWait),
        },
    );
    table.insert(
        StateId::DependenciesWait,
        def(
            handlers::dependencies_wait,
            &[
                (Event::Wake, StateId::Unmount),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Unmount,
        def(
            handlers::unmount,
            &[
                (Event::Ok, StateId::Install),
                (Event::Failed, StateId::Failed),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Install,
        def(
            handlers::install,
            &[
                (Event::Ok, StateId::Verify),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Verify,
        def(
            handlers::verify,
            &[
                (Event::Ok, StateId::Commit),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Commit,
        def(
            handlers::commit,
            &[
                (Event::Ok, StateId::Completed),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Rollback,
        def(
            handlers::rollback,
            &[(Event::Ok, StateId::Failed), (Event::Failed, StateId::Failed)],
        ),
    );

    terminal_states(&mut table);
    table
}

/// Update: same shape as install but unmounts every mount point of the
/// application (`UnmountAll`) before re-installing the new revision in place.
fn update_table() -> StateTable {
    let mut table = StateTable::new();

    table.insert(
        StateId::Dependencies,
        StateDef {
            transitions: [
                (Event::Ok, StateId::UnmountAll),
                (Event::Failed, StateId::Failed),
                (Event::Cancel, StateId::Cancelled),
            ]
            .into_iter()
            .collect(),
            action: handlers::dependencies,
            wait_target: Some(StateId::DependenciesWait),
        },
    );
    table.insert(
        StateId::DependenciesWait,
        def(
            handlers::dependencies_wait,
            &[
                (Event::Wake, StateId::UnmountAll),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::UnmountAll,
        def(
            handlers::unmount_all,
            &[
                (Event::Ok, StateId::Update),
                (Event::Failed, StateId::Failed),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Update,
        def(
            handlers::update,
            &[
                (Event::Ok, StateId::Verify),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Verify,
        def(
            handlers::verify,
            &[
                (Event::Ok, StateId::Commit),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Commit,
        def(
            handlers::commit,
            &[
                (Event::Ok, StateId::Completed),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Rollback,
        def(
            handlers::rollback,
            &[(Event::Ok, StateId::Failed), (Event::Failed, StateId::Failed)],
        ),
    );

    terminal_states(&mut table);
    table
}

/// Remove: no dependency resolution — unmount then remove then commit.
/// `Verify` is skipped because there is no installed artifact left to check.
fn remove_table() -> StateTable {
    let mut table = StateTable::new();

    table.insert(
        StateId::Unmount,
        def(
            handlers::unmount,
            &[
                (Event::Ok, StateId::Remove),
                (Event::Failed, StateId::Failed),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Remove,
        def(
            handlers::remove,
            &[
                (Event::Ok, StateId::Commit),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Commit,
        def(
            handlers::commit,
            &[
                (Event::Ok, StateId::Completed),
                (Event::Failed, StateId::Rollback),
                (Event::Cancel, StateId::Cancelled),
            ],
        ),
    );
    table.insert(
        StateId::Rollback,
        def(
            handlers::rollback,
            &[(Event::Ok, StateId::Failed), (Event::Failed, StateId::Failed)],
        ),
    );

    terminal_states(&mut table);
    table
}

/// Entry state for a freshly created transaction of the given type, used by
/// the runner when it constructs the transaction's `StateMachine`.
pub fn initial_state(transaction_type: TransactionType) -> StateId {
    match transaction_type {
        TransactionType::Install | TransactionType::Update => StateId::Dependencies,
        TransactionType::Remove => StateId::Unmount,
    }
}

static INSTALL: OnceLock<Arc<StateTable>> = OnceLock::new();
static UPDATE: OnceLock<Arc<StateTable>> = OnceLock::new();
static REMOVE: OnceLock<Arc<StateTable>> = OnceLock::new();

pub fn table_for(transaction_type: TransactionType) -> Arc<StateTable> {
    match transaction_type {
        TransactionType::Install => INSTALL.get_or_init(|| Arc::new(install_table())).clone(),
        TransactionType::Update => UPDATE.get_or_init(|| Arc::new(update_table())).clone(),
        TransactionType::Remove => REMOVE.get_or_init(|| Arc::new(remove_table())).clone(),
    }
}
