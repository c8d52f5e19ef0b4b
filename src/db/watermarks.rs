use super::model::AccountRow;
use super::{parse_uuid, Pool};
use crate::model::{cmp_post_ids, FollowedAccount};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use uuid::Uuid;

/// (subscription, account) pairs that have no watermark yet, grouped by
/// subscription. An empty `ids` slice selects every subscription.
#[instrument(skip_all)]
pub async fn uninitialized_pairs(pool: &Pool, ids: &[Uuid]) -> Result<BTreeMap<Uuid, Vec<String>>> {
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        "SELECT sa.subscription_id, sa.account_id FROM subscription_accounts sa \
         LEFT JOIN watermarks w ON w.subscription_id = sa.subscription_id AND w.account_id = sa.account_id \
         WHERE w.subscription_id IS NULL",
    );
    if !ids.is_empty() {
        qb.push(" AND sa.subscription_id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY sa.subscription_id, sa.rowid");

    let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(pool).await?;
    let mut grouped: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
    for (subscription_id, account_id) in rows {
        grouped
            .entry(parse_uuid(&subscription_id)?)
            .or_default()
            .push(account_id);
    }
    Ok(grouped)
}

/// Seed the watermark for a pair. An existing watermark is left untouched.
#[instrument(skip_all)]
pub async fn insert_watermark(
    pool: &Pool,
    subscription_id: Uuid,
    account_id: &str,
    last_seen_post_id: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO watermarks (subscription_id, account_id, last_seen_post_id, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(subscription_id, account_id) DO NOTHING",
    )
    .bind(subscription_id.to_string())
    .bind(account_id)
    .bind(last_seen_post_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert watermark for {subscription_id}/{account_id}"))?;
    Ok(res.rows_affected() == 1)
}

pub async fn get_watermark(pool: &Pool, subscription_id: Uuid, account_id: &str) -> Result<Option<String>> {
    let marker = sqlx::query_scalar(
        "SELECT last_seen_post_id FROM watermarks WHERE subscription_id = ? AND account_id = ?",
    )
    .bind(subscription_id.to_string())
    .bind(account_id)
    .fetch_optional(pool)
    .await?;
    Ok(marker)
}

/// Accounts followed by a subscription paired with their watermark, if any.
#[instrument(skip_all)]
pub async fn follow_list_with_watermarks(
    pool: &Pool,
    subscription_id: Uuid,
) -> Result<Vec<(FollowedAccount, Option<String>)>> {
    #[derive(sqlx::FromRow)]
    struct Row {
        #[sqlx(flatten)]
        account: AccountRow,
        last_seen_post_id: Option<String>,
    }

    let rows = sqlx::query_as::<_, Row>(
        "SELECT a.external_id, a.display_name, a.screen_name, a.avatar_url, w.last_seen_post_id \
         FROM subscription_accounts sa \
         JOIN accounts a ON a.external_id = sa.account_id \
         LEFT JOIN watermarks w ON w.subscription_id = sa.subscription_id AND w.account_id = sa.account_id \
         WHERE sa.subscription_id = ? ORDER BY sa.rowid",
    )
    .bind(subscription_id.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.account.into(), row.last_seen_post_id))
        .collect())
}

/// Move a watermark forward to `post_id`. Returns false when the pair has no
/// watermark or the stored marker is already at or past `post_id`.
#[instrument(skip_all)]
pub async fn advance_watermark(
    pool: &Pool,
    subscription_id: Uuid,
    account_id: &str,
    post_id: &str,
) -> Result<bool> {
    let Some(current) = get_watermark(pool, subscription_id, account_id).await? else {
        debug!(subscription = %subscription_id, account = account_id, "no watermark to advance");
        return Ok(false);
    };
    if cmp_post_ids(post_id, &current) != Ordering::Greater {
        return Ok(false);
    }
    // Guarded on the value we compared against so a concurrent advance is not overwritten.
    let res = sqlx::query(
        "UPDATE watermarks SET last_seen_post_id = ?, updated_at = ? \
         WHERE subscription_id = ? AND account_id = ? AND last_seen_post_id = ?",
    )
    .bind(post_id)
    .bind(Utc::now())
    .bind(subscription_id.to_string())
    .bind(account_id)
    .bind(&current)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}
