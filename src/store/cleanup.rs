use crate::domain::TransactionId;
use crate::error::Result;
use sqlx::PgPool;

/// Delete completed transactions past the retention window: keep the most
/// recent `retain_count` regardless of age, and anything younger than
/// `retain_days`; everything else ranked below that window is pruned along
/// with its cascading state/log rows (spec §4.B).
pub async fn prune(pool: &PgPool, retain_count: i64, retain_days: i64) -> Result<Vec<TransactionId>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "WITH ranked AS ( \
             SELECT id, completed_at, \
                    ROW_NUMBER() OVER (ORDER BY completed_at DESC) AS rank \
             FROM transactions \
             WHERE completed_at IS NOT NULL \
         ) \
         DELETE FROM transactions \
         USING ranked \
         WHERE transactions.id = ranked.id \
           AND ranked.rank > $1 \
           AND ranked.completed_at < now() - make_interval(days => $2::int) \
         RETURNING transactions.id",
    )
    .bind(retain_count)
    .bind(retain_days)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id as TransactionId).collect())
}
