//! Store-level properties from spec.md §8 that don't need a live `Runner`:
//! cleanup retention (S4) and deferred-batch atomicity (property #3).

mod common;

use common::DockerPostgres;
use served::domain::{Application, LogLevel, TransactionFlags, TransactionOptions, TransactionType};
use sqlx::PgPool;

/// S4: 12 completed transactions all 8 days old — cleanup keeps the 10 most
/// recent and reports exactly 2 pruned.
#[tokio::test]
async fn s4_cleanup_retains_only_the_most_recent_within_bounds() {
    let Some(docker) = DockerPostgres::start().await else { return };
    let store = docker.fresh_store().await;

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = store
            .new_transaction(TransactionOptions {
                transaction_type: TransactionType::Install,
                flags: TransactionFlags::NONE,
                name: format!("pkg-{i}"),
                description: "cleanup fixture".into(),
            })
            .await;
        assert_ne!(id, 0);
        ids.push(id);
    }

    // `complete_transaction` stamps `now()`; backdate everything to 8 days
    // old directly so every row falls outside the retention window and only
    // `retain_count` decides what survives.
    backdate_all_completed(&store_pool(&docker).await, 8).await;
    for id in &ids {
        store.complete_transaction(*id).await;
    }
    backdate_all_completed(&store_pool(&docker).await, 8).await;

    let pruned = store.cleanup(10, 7).await.expect("cleanup");
    assert_eq!(pruned, 2);

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM transactions")
        .fetch_one(&store_pool(&docker).await)
        .await
        .expect("count remaining");
    assert_eq!(remaining, 10);

    store.close().await;
}

async fn store_pool(docker: &DockerPostgres) -> PgPool {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&docker.database_url)
        .await
        .expect("connect for fixture setup")
}

async fn backdate_all_completed(pool: &PgPool, days: i64) {
    sqlx::query("UPDATE transactions SET completed_at = now() - make_interval(days => $1::int) WHERE completed_at IS NOT NULL")
        .bind(days as i32)
        .execute(pool)
        .await
        .expect("backdate fixture rows");
    pool.close().await;
}

/// Property #3: a deferred batch that fails partway through leaves the
/// persistent store unchanged from before the outermost `lock()`. Forced by
/// pre-inserting a row at the id the allocator is about to hand out, so the
/// batch's own `AddTransaction` collides on the primary key and the bundled
/// `AddTransactionState` in the same lock frame never lands either.
#[tokio::test]
async fn deferred_batch_failure_leaves_durable_store_unchanged() {
    let Some(docker) = DockerPostgres::start().await else { return };
    let store = docker.fresh_store().await;
    let pool = store_pool(&docker).await;

    // The allocator starts at 1, so transaction 2 is the next id handed out
    // below; pre-seed a conflicting row for it out of band.
    let first = store
        .new_transaction(TransactionOptions {
            transaction_type: TransactionType::Install,
            flags: TransactionFlags::NONE,
            name: "first".into(),
            description: "seed".into(),
        })
        .await;
    assert_eq!(first, 1);

    sqlx::query(
        "INSERT INTO transactions (id, type, flags, state, name, description, wait_type, wait_data, created_at) \
         VALUES (2, 0, 0, 0, 'collider', 'pre-seeded to force a pk collision', 0, 0, now())",
    )
    .execute(&pool)
    .await
    .expect("pre-seed conflicting row");

    store.lock().await;
    let second = store
        .new_transaction(TransactionOptions {
            transaction_type: TransactionType::Install,
            flags: TransactionFlags::NONE,
            name: "second".into(),
            description: "will collide on insert".into(),
        })
        .await;
    assert_eq!(second, 2);
    store.new_transaction_state(second, "second", "stable").await;
    let commit_result = store.unlock().await;
    assert!(commit_result.is_err(), "inserting a duplicate transaction id must fail the whole batch");

    let state_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM transactions_state WHERE transaction_id = $1")
        .bind(second as i64)
        .fetch_one(&pool)
        .await
        .expect("count state rows");
    assert_eq!(state_rows, 0, "the bundled state insert must not have committed either");

    let preserved_name: String = sqlx::query_scalar("SELECT name FROM transactions WHERE id = 2")
        .fetch_one(&pool)
        .await
        .expect("pre-seeded row must survive untouched");
    assert_eq!(preserved_name, "collider");

    pool.close().await;
    store.close().await;
}

/// Property #4: within the same lock frame, a read immediately observes a
/// write, even though the matching durable commit hasn't happened yet.
#[tokio::test]
async fn add_application_is_visible_to_a_read_in_the_same_lock_frame() {
    let Some(docker) = DockerPostgres::start().await else { return };
    let store = docker.fresh_store().await;

    store.lock().await;
    store.add_application(Application::new("htop")).await;
    let seen = store.get_application("htop").await;
    store.unlock().await.expect("commit");

    assert!(seen.is_some(), "read-your-writes must see the application before the frame unlocks");
    assert_eq!(seen.unwrap().name, "htop");

    store.close().await;
}

/// Property #2: `close()` then `load()` against the same database yields a
/// cache observationally equivalent to the one before the restart —
/// applications, a transaction's `completed_at`, and its logs all survive.
#[tokio::test]
async fn close_then_load_reconstitutes_an_equivalent_cache() {
    let Some(docker) = DockerPostgres::start().await else { return };
    let store = docker.fresh_store().await;

    let mut app = Application::new("htop");
    app.revisions.push(served::domain::Revision {
        channel: "stable".into(),
        version: served::domain::Version {
            major: 1,
            minor: 2,
            patch: 3,
            revision: 0,
            tag: "stable".into(),
        },
        size: 4096,
        created_at: chrono::Utc::now(),
    });
    store.add_application(app).await;

    let id = store
        .new_transaction(TransactionOptions {
            transaction_type: TransactionType::Install,
            flags: TransactionFlags::NONE,
            name: "htop".into(),
            description: "install htop".into(),
        })
        .await;
    assert_ne!(id, 0);
    store.new_transaction_state(id, "htop", "stable").await;
    store.add_log(id, LogLevel::Info, 0, "started").await;
    store.complete_transaction(id).await;

    store.close().await;

    let reloaded = docker.fresh_store().await;

    let app = reloaded.get_application("htop").await.expect("application survives restart");
    assert_eq!(app.revisions.len(), 1);
    assert_eq!(app.revisions[0].version.major, 1);
    assert_eq!(app.revisions[0].size, 4096);

    let transaction = reloaded.get_transaction(id).await.expect("transaction survives restart");
    assert!(transaction.completed_at.is_some(), "completed_at must survive a reload");

    let state = reloaded.get_transaction_state(id).await.expect("transaction state survives restart");
    assert_eq!(state.logs.len(), 1);
    assert_eq!(state.logs[0].message, "started");

    reloaded.close().await;
}
