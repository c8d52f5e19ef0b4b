use super::model::CycleRow;
use super::Pool;
use crate::model::{CycleStatus, DigestCycle};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, instrument};
use uuid::Uuid;

const CYCLE_COLUMNS: &str = "id, subscription_id, status, cycle_date, created_at, updated_at";

/// Open a PREPARING cycle for `subscription_id` on `date`.
#[instrument(skip_all)]
pub async fn create_cycle(pool: &Pool, subscription_id: Uuid, date: NaiveDate) -> Result<DigestCycle> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, CycleRow>(&format!(
        "INSERT INTO digest_cycles (subscription_id, status, cycle_date, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING {CYCLE_COLUMNS}"
    ))
    .bind(subscription_id.to_string())
    .bind(CycleStatus::Preparing.as_str())
    .bind(date)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to create cycle for subscription {subscription_id}"))?;
    DigestCycle::try_from(row)
}

#[instrument(skip_all)]
pub async fn set_cycle_status(pool: &Pool, cycle_id: i64, status: CycleStatus) -> Result<()> {
    let res = sqlx::query("UPDATE digest_cycles SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(cycle_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to set cycle {cycle_id} to {status}"))?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("cycle {} not found", cycle_id));
    }
    debug!(cycle = cycle_id, %status, "cycle status updated");
    Ok(())
}

pub async fn cycles_for_subscription(pool: &Pool, subscription_id: Uuid) -> Result<Vec<DigestCycle>> {
    let rows = sqlx::query_as::<_, CycleRow>(&format!(
        "SELECT {CYCLE_COLUMNS} FROM digest_cycles WHERE subscription_id = ? ORDER BY id"
    ))
    .bind(subscription_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(DigestCycle::try_from).collect()
}

/// Cycles created on `date` that the dispatcher should pick up: READY ones,
/// plus BLOCKED ones whose recipient may have been confirmed since. An empty
/// `subscription_ids` slice selects every subscription.
///
/// Only `date` is looked at, so a cycle still BLOCKED when its day ends stays
/// BLOCKED. Its watermarks never moved, and the next week's cycle fetches the
/// same posts again.
#[instrument(skip_all)]
pub async fn dispatchable_cycles(
    pool: &Pool,
    date: NaiveDate,
    subscription_ids: &[Uuid],
) -> Result<Vec<DigestCycle>> {
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
        "SELECT {CYCLE_COLUMNS} FROM digest_cycles WHERE cycle_date = "
    ));
    qb.push_bind(date);
    qb.push(" AND status IN (");
    qb.push_bind(CycleStatus::Ready.as_str());
    qb.push(", ");
    qb.push_bind(CycleStatus::Blocked.as_str());
    qb.push(")");
    if !subscription_ids.is_empty() {
        qb.push(" AND subscription_id IN (");
        let mut separated = qb.separated(", ");
        for id in subscription_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY id");

    let rows: Vec<CycleRow> = qb.build_query_as().fetch_all(pool).await?;
    rows.into_iter().map(DigestCycle::try_from).collect()
}
