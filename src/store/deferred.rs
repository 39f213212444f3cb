use crate::domain::{
    Application, LogLevel, TransactionFlags, TransactionId, TransactionType, WaitType,
};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction as SqlxTx};

/// A tagged record enqueued while the store lock is held (spec §3). Payloads
/// are owned at enqueue time — no pointers into cache rows are ever stored,
/// closing the dangling-pointer hazard spec §9 flags in the source.
pub enum DeferredOp {
    AddApplication(Application),
    RemoveApplication(String),
    AddTransaction {
        id: TransactionId,
        transaction_type: TransactionType,
        flags: TransactionFlags,
        name: String,
        description: String,
        created_at: DateTime<Utc>,
    },
    UpdateTransaction {
        id: TransactionId,
        wait_type: WaitType,
        wait_data: u64,
    },
    UpdateTransactionCurrentState {
        id: TransactionId,
        state: u32,
    },
    AddTransactionState {
        transaction_id: TransactionId,
        name: String,
        channel: String,
        revision: i64,
    },
    UpdateTransactionState {
        transaction_id: TransactionId,
        name: String,
        channel: String,
        revision: i64,
    },
    CompleteTransaction {
        id: TransactionId,
        completed_at: DateTime<Utc>,
    },
    AddTransactionLog {
        transaction_id: TransactionId,
        level: LogLevel,
        timestamp: DateTime<Utc>,
        state_snapshot: u32,
        message: String,
    },
}

fn wait_type_code(wt: WaitType) -> i32 {
    match wt {
        WaitType::None => 0,
        WaitType::Transaction => 1,
        WaitType::External => 2,
    }
}

/// Apply one op against the open transaction. Enqueue order is preserved by
/// the caller driving this function over the deferred queue in order
/// (spec §5 "Deferred persistent operations commit in enqueue order").
pub async fn apply(op: &DeferredOp, tx: &mut SqlxTx<'_, Postgres>) -> sqlx::Result<()> {
    match op {
        DeferredOp::AddApplication(app) => {
            let app_id: i64 = sqlx::query_scalar(
                "INSERT INTO applications (name) VALUES ($1) RETURNING id",
            )
            .bind(&app.name)
            .fetch_one(&mut **tx)
            .await?;

            for command in &app.commands {
                sqlx::query(
                    "INSERT INTO commands (application_id, name, path, arguments, type) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(app_id)
                .bind(&command.name)
                .bind(&command.path)
                .bind(command.arguments.join(" "))
                .bind(command.kind as i32)
                .execute(&mut **tx)
                .await?;
            }

            for revision in &app.revisions {
                sqlx::query(
                    "INSERT INTO revisions \
                     (application_id, channel, major, minor, patch, revision, tag, size, created) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(app_id)
                .bind(&revision.channel)
                .bind(revision.version.major as i32)
                .bind(revision.version.minor as i32)
                .bind(revision.version.patch as i32)
                .bind(revision.version.revision as i32)
                .bind(&revision.version.tag)
                .bind(revision.size as i64)
                .bind(revision.created_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        DeferredOp::RemoveApplication(name) => {
            sqlx::query("DELETE FROM applications WHERE name = $1")
                .bind(name)
                .execute(&mut **tx)
                .await?;
        }
        DeferredOp::AddTransaction {
            id,
            transaction_type,
            flags,
            name,
            description,
            created_at,
        } => {
            sqlx::query(
                "INSERT INTO transactions \
                 (id, type, flags, state, name, description, wait_type, wait_data, created_at) \
                 VALUES ($1, $2, $3, 0, $4, $5, 0, 0, $6)",
            )
            .bind(*id as i64)
            .bind(*transaction_type as i32)
            .bind(flags.0 as i32)
            .bind(name)
            .bind(description)
            .bind(created_at)
            .execute(&mut **tx)
            .await?;
        }
        DeferredOp::UpdateTransaction {
            id,
            wait_type,
            wait_data,
        } => {
            sqlx::query(
                "UPDATE transactions SET wait_type = $2, wait_data = $3 WHERE id = $1",
            )
            .bind(*id as i64)
            .bind(wait_type_code(*wait_type))
            .bind(*wait_data as i64)
            .execute(&mut **tx)
            .await?;
        }
        DeferredOp::UpdateTransactionCurrentState { id, state } => {
            sqlx::query("UPDATE transactions SET state = $2 WHERE id = $1")
                .bind(*id as i64)
                .bind(*state as i32)
                .execute(&mut **tx)
                .await?;
        }
        DeferredOp::AddTransactionState {
            transaction_id,
            name,
            channel,
            revision,
        } => {
            sqlx::query(
                "INSERT INTO transactions_state (transaction_id, name, channel, revision) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(*transaction_id as i64)
            .bind(name)
            .bind(channel)
            .bind(*revision)
            .execute(&mut **tx)
            .await?;
        }
        DeferredOp::UpdateTransactionState {
            transaction_id,
            name,
            channel,
            revision,
        } => {
            sqlx::query(
                "UPDATE transactions_state SET name = $2, channel = $3, revision = $4 \
                 WHERE transaction_id = $1",
            )
            .bind(*transaction_id as i64)
            .bind(name)
            .bind(channel)
            .bind(*revision)
            .execute(&mut **tx)
            .await?;
        }
        DeferredOp::CompleteTransaction { id, completed_at } => {
            sqlx::query("UPDATE transactions SET completed_at = $2 WHERE id = $1")
                .bind(*id as i64)
                .bind(completed_at)
                .execute(&mut **tx)
                .await?;
        }
        DeferredOp::AddTransactionLog {
            transaction_id,
            level,
            timestamp,
            state_snapshot,
            message,
        } => {
            sqlx::query(
                "INSERT INTO transaction_logs (transaction_id, level, timestamp, state, message) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(*transaction_id as i64)
            .bind(*level as i32)
            .bind(timestamp)
            .bind(*state_snapshot as i32)
            .bind(message)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}
