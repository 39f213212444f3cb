//! Per-state action handlers (spec §4.C). Each handler locks the store only
//! for the cache/deferred-queue mutation it needs, then releases it before
//! doing any collaborator work (package reads, mounts, process spawns) so a
//! slow external call never holds up unrelated transactions sharing the
//! store.

use crate::context::ActionContext;
use crate::domain::{LogLevel, TransactionFlags, TransactionOptions, TransactionType, WaitDescriptor};
use crate::sm::{ActionFuture, ActionResult, Event};
use tracing::warn;

const TXLOG_ERROR: LogLevel = LogLevel::Error;

/// Log an unexpected failure and signal the state machine to move to its
/// `Failed` transition (spec §4.C handler rules: "on unexpected error, write
/// a log entry and emit `Failed`").
async fn fail(ctx: &mut ActionContext, state_snapshot: u32, message: impl Into<String>) -> ActionResult {
    let message = message.into();
    warn!(transaction_id = ctx.transaction_id, %message, "handler failing transaction");
    ctx.store.add_log(ctx.transaction_id, TXLOG_ERROR, state_snapshot, message).await;
    ctx.emit(Event::Failed);
    ActionResult::Continue
}

async fn ok(ctx: &mut ActionContext) -> ActionResult {
    ctx.emit(Event::Ok);
    ActionResult::Continue
}

/// Resolve a package's declared base dependency. If the base application
/// isn't installed yet, spawn a child `Install` transaction for it and park
/// on its completion (spec scenario S2).
pub fn dependencies(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Dependencies.as_u32();

        let Some(tx_state) = ctx.store.get_transaction_state(ctx.transaction_id).await else {
            return fail(ctx, state_snapshot, "missing transaction state").await;
        };

        let metadata = match ctx.collaborators.packages.load(&tx_state.name) {
            Ok(metadata) => metadata,
            Err(e) => return fail(ctx, state_snapshot, format!("package load failed: {e}")).await,
        };

        let Some(base) = metadata.base else {
            return ok(ctx).await;
        };

        if ctx.store.get_application(&base).await.is_some() {
            ctx.store
                .add_log(ctx.transaction_id, LogLevel::Info, state_snapshot, format!("Base {base} already installed"))
                .await;
            return ok(ctx).await;
        }

        ctx.store.lock().await;
        let child_id = ctx
            .store
            .new_transaction(TransactionOptions {
                transaction_type: TransactionType::Install,
                flags: TransactionFlags::CHILD,
                name: base.clone(),
                description: format!("dependency of {}", tx_state.name),
            })
            .await;
        if child_id != 0 {
            ctx.store.new_transaction_state(child_id, base.clone(), "stable").await;
            ctx.store.set_wait(ctx.transaction_id, WaitDescriptor::on_transaction(child_id)).await;
        }
        if let Err(e) = ctx.store.unlock().await {
            return fail(ctx, state_snapshot, format!("failed to persist dependency spawn: {e}")).await;
        }

        if child_id == 0 {
            return fail(ctx, state_snapshot, "failed to allocate dependency transaction").await;
        }

        // The child's row is durably committed; now make it reachable by
        // the runner's dispatch loop so it actually gets stepped (without
        // this the parent's wait on it would never resolve).
        ctx.register_child(child_id, TransactionType::Install).await;

        ActionResult::Wait
    })
}

/// Defensive re-entry point for `DependenciesWait`. The normal wake path
/// transitions straight to the next real state before this action would run
/// (see `StateMachine::execute`); this only fires if something posts an
/// event other than `Wake`/`Cancel` while parked, which the transition table
/// doesn't define, so it just re-confirms success.
pub fn dependencies_wait(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move { ok(ctx).await })
}

async fn unmount_one(ctx: &mut ActionContext, state_snapshot: u32) -> ActionResult {
    let Some(tx_state) = ctx.store.get_transaction_state(ctx.transaction_id).await else {
        return fail(ctx, state_snapshot, "missing transaction state").await;
    };

    match ctx.collaborators.mounts.is_mounted(&tx_state.name) {
        Ok(false) => ok(ctx).await,
        Ok(true) => match ctx.collaborators.mounts.unmount(&tx_state.name) {
            Ok(()) => ok(ctx).await,
            Err(e) => fail(ctx, state_snapshot, format!("unmount failed: {e}")).await,
        },
        Err(e) => fail(ctx, state_snapshot, format!("mount check failed: {e}")).await,
    }
}

pub fn unmount(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move { unmount_one(ctx, crate::sm::StateId::Unmount.as_u32()).await })
}

/// Unmounts every mount point of the application being updated. The
/// collaborator seam only exposes a single current mount per application, so
/// this delegates to the same unmount path as `Unmount`; a backend with
/// multiple simultaneous mounts would extend `MountController` accordingly.
pub fn unmount_all(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move { unmount_one(ctx, crate::sm::StateId::UnmountAll.as_u32()).await })
}

pub fn install(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Install.as_u32();
        let Some(tx_state) = ctx.store.get_transaction_state(ctx.transaction_id).await else {
            return fail(ctx, state_snapshot, "missing transaction state").await;
        };

        if let Err(e) = ctx.collaborators.spawner.spawn("install", &[tx_state.name.clone(), tx_state.channel.clone()]) {
            return fail(ctx, state_snapshot, format!("install spawn failed: {e}")).await;
        }

        ctx.store
            .update_transaction_state(ctx.transaction_id, tx_state.name, tx_state.channel, tx_state.revision + 1)
            .await;
        ok(ctx).await
    })
}

pub fn update(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Update.as_u32();
        let Some(tx_state) = ctx.store.get_transaction_state(ctx.transaction_id).await else {
            return fail(ctx, state_snapshot, "missing transaction state").await;
        };

        if let Err(e) = ctx.collaborators.spawner.spawn("update", &[tx_state.name.clone(), tx_state.channel.clone()]) {
            return fail(ctx, state_snapshot, format!("update spawn failed: {e}")).await;
        }

        ctx.store
            .update_transaction_state(ctx.transaction_id, tx_state.name, tx_state.channel, tx_state.revision + 1)
            .await;
        ok(ctx).await
    })
}

pub fn remove(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Remove.as_u32();
        let Some(tx_state) = ctx.store.get_transaction_state(ctx.transaction_id).await else {
            return fail(ctx, state_snapshot, "missing transaction state").await;
        };

        if let Err(e) = ctx.collaborators.spawner.spawn("remove", &[tx_state.name.clone()]) {
            return fail(ctx, state_snapshot, format!("remove spawn failed: {e}")).await;
        }

        ctx.store.lock().await;
        ctx.store.remove_application(&tx_state.name).await;
        if let Err(e) = ctx.store.unlock().await {
            return fail(ctx, state_snapshot, format!("failed to persist removal: {e}")).await;
        }
        ok(ctx).await
    })
}

pub fn verify(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Verify.as_u32();
        let Some(tx_state) = ctx.store.get_transaction_state(ctx.transaction_id).await else {
            return fail(ctx, state_snapshot, "missing transaction state").await;
        };
        if tx_state.revision <= 0 {
            return fail(ctx, state_snapshot, "post-install revision not recorded").await;
        }
        ok(ctx).await
    })
}

pub fn commit(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Commit.as_u32();
        ctx.store.add_log(ctx.transaction_id, LogLevel::Info, state_snapshot, "committed").await;
        ok(ctx).await
    })
}

/// Best-effort recovery attempt. The source names no specific rollback
/// procedure beyond "attempt to restore the previous state"; here that means
/// clearing any wait descriptor so the transaction doesn't linger parked
/// while it finishes failing.
pub fn rollback(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move {
        let state_snapshot = crate::sm::StateId::Rollback.as_u32();
        ctx.store.set_wait(ctx.transaction_id, WaitDescriptor::NONE).await;
        ctx.store
            .add_log(ctx.transaction_id, LogLevel::Warning, state_snapshot, "rolled back")
            .await;
        ok(ctx).await
    })
}

/// Entering a terminal state writes its log entry and marks `completed_at`
/// as one logical step, batched into a single persistent commit by wrapping
/// both mutations in one advisory-lock frame (spec §4.B rationale).
async fn finish(ctx: &mut ActionContext, level: LogLevel, state_snapshot: u32, message: &str) -> ActionResult {
    ctx.store.lock().await;
    ctx.store.add_log(ctx.transaction_id, level, state_snapshot, message).await;
    ctx.store.complete_transaction(ctx.transaction_id).await;
    if let Err(e) = ctx.store.unlock().await {
        warn!(transaction_id = ctx.transaction_id, error = %e, "failed to persist terminal state");
    }
    ActionResult::Continue
}

pub fn completed(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move { finish(ctx, LogLevel::Info, crate::sm::StateId::Completed.as_u32(), "completed").await })
}

pub fn failed(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move { finish(ctx, LogLevel::Error, crate::sm::StateId::Failed.as_u32(), "failed").await })
}

pub fn cancelled(ctx: &mut ActionContext) -> ActionFuture<'_> {
    Box::pin(async move { finish(ctx, LogLevel::Warning, crate::sm::StateId::Cancelled.as_u32(), "cancelled").await })
}
