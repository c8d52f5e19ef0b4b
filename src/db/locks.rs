use super::Pool;
use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::instrument;

/// Try to take the lock row for `key` without waiting.
///
/// Succeeds when nobody holds `key` or the previous lease has expired. The
/// lease bounds how long a crashed holder can keep a stage blocked.
#[instrument(skip_all)]
pub async fn acquire_lock(pool: &Pool, key: i64, holder: &str, lease: Duration) -> Result<bool> {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::from_std(lease).context("lock lease out of range")?;
    let res = sqlx::query(
        "INSERT INTO stage_locks (key, holder, acquired_at, expires_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, acquired_at = excluded.acquired_at, \
         expires_at = excluded.expires_at \
         WHERE stage_locks.expires_at <= ?",
    )
    .bind(key)
    .bind(holder)
    .bind(now)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("failed to acquire lock {key}"))?;
    Ok(res.rows_affected() == 1)
}

/// Release `key` if `holder` still owns it. Returns false when the lock was
/// not held by `holder` (never taken, or taken over after the lease expired).
#[instrument(skip_all)]
pub async fn release_lock(pool: &Pool, key: i64, holder: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM stage_locks WHERE key = ? AND holder = ?")
        .bind(key)
        .bind(holder)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release lock {key}"))?;
    Ok(res.rows_affected() == 1)
}
