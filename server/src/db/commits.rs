//! Database operations for the commits and inventory tables.

use sparkwms_engine::Commit;
use sqlx::PgPool;

/// Record a commit and apply its delta to the stock level.
///
/// Both writes happen in one transaction. A commit id that was already
/// recorded changes nothing and returns `false`.
pub async fn apply_commit(pool: &PgPool, commit: &Commit) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO commits (commit_id, device_id, location, item_id, delta, enqueued_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (commit_id) DO NOTHING
        "#,
    )
    .bind(*commit.commit_id().as_uuid())
    .bind(commit.device_id())
    .bind(commit.location())
    .bind(commit.item_id())
    .bind(commit.delta())
    .bind(i64::try_from(commit.enqueued_at()).unwrap_or(i64::MAX))
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        sqlx::query(
            r#"
            INSERT INTO inventory (location, item_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (location, item_id) DO UPDATE SET
                quantity = inventory.quantity + EXCLUDED.quantity,
                updated_at = NOW()
            "#,
        )
        .bind(commit.location())
        .bind(commit.item_id())
        .bind(i64::from(commit.delta()))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(inserted)
}
