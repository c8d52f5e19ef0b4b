use super::model::{AccountRow, Reconciliation, SubscriptionRow};
use super::{is_unique_violation, parse_uuid, release_savepoint, rollback_to_savepoint, savepoint, Pool};
use crate::model::{parse_weekday, weekday_name, FollowList, FollowedAccount, Subscription};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Weekday};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const ACCOUNT_SAVEPOINT: &str = "account_insert";

/// Store a new subscription and link every account of its follow list.
#[instrument(skip_all)]
pub async fn insert_subscription(pool: &Pool, subscription: &Subscription) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO subscriptions (id, owner_id, title, notify_email, day_of_week, ignore_retweets, ignore_replies) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(subscription.id.to_string())
    .bind(subscription.owner_id.to_string())
    .bind(&subscription.title)
    .bind(&subscription.notify_email)
    .bind(weekday_name(subscription.day_of_week))
    .bind(subscription.ignore_retweets)
    .bind(subscription.ignore_replies)
    .execute(&mut *tx)
    .await
    .context("failed to insert subscription")?;

    for account in &subscription.follow_list {
        link_account(&mut tx, subscription.id, account).await?;
    }
    tx.commit().await?;
    info!(
        subscription = %subscription.id,
        accounts = subscription.follow_list.len(),
        "subscription created"
    );
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_subscription(pool: &Pool, subscription_id: Uuid) -> Result<Option<Subscription>> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT id, owner_id, title, notify_email, day_of_week, ignore_retweets, ignore_replies \
         FROM subscriptions WHERE id = ?",
    )
    .bind(subscription_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let follow_list = load_follow_list(&mut conn, subscription_id).await?;
    Ok(Some(subscription_from_row(row, follow_list)?))
}

/// Apply `desired` to the stored subscription.
///
/// Scalar fields are overwritten. Accounts only in `desired` are inserted (or
/// reused) and linked; accounts no longer in `desired` lose both their link
/// and their watermark, so following them again goes back through
/// initialization.
#[instrument(skip_all)]
pub async fn update_subscription(pool: &Pool, desired: &Subscription) -> Result<Reconciliation> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE subscriptions SET title = ?, notify_email = ?, day_of_week = ?, ignore_retweets = ?, ignore_replies = ? \
         WHERE id = ? AND owner_id = ?",
    )
    .bind(&desired.title)
    .bind(&desired.notify_email)
    .bind(weekday_name(desired.day_of_week))
    .bind(desired.ignore_retweets)
    .bind(desired.ignore_replies)
    .bind(desired.id.to_string())
    .bind(desired.owner_id.to_string())
    .execute(&mut *tx)
    .await
    .context("failed to update subscription")?;
    if updated.rows_affected() == 0 {
        return Err(anyhow!("subscription {} not found for owner {}", desired.id, desired.owner_id));
    }

    let current = load_follow_list(&mut tx, desired.id).await?;
    let to_add = desired.follow_list.diff(&current);
    let to_remove = current.diff(&desired.follow_list);

    for account in &to_add {
        link_account(&mut tx, desired.id, account).await?;
    }
    for account in &to_remove {
        unlink_account(&mut tx, desired.id, &account.external_id).await?;
    }
    tx.commit().await?;

    let outcome = Reconciliation {
        added: to_add.into_iter().map(|a| a.external_id).collect(),
        removed: to_remove.into_iter().map(|a| a.external_id).collect(),
    };
    info!(
        subscription = %desired.id,
        added = outcome.added.len(),
        removed = outcome.removed.len(),
        "follow list reconciled"
    );
    Ok(outcome)
}

/// Remove a subscription together with its links, watermarks and cycles.
/// Shared accounts and posts stay.
#[instrument(skip_all)]
pub async fn delete_subscription(pool: &Pool, subscription_id: Uuid) -> Result<()> {
    let id = subscription_id.to_string();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM cycle_posts WHERE cycle_id IN (SELECT id FROM digest_cycles WHERE subscription_id = ?)",
    )
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    for sql in [
        "DELETE FROM digest_cycles WHERE subscription_id = ?",
        "DELETE FROM watermarks WHERE subscription_id = ?",
        "DELETE FROM subscription_accounts WHERE subscription_id = ?",
        "DELETE FROM subscriptions WHERE id = ?",
    ] {
        sqlx::query(sql).bind(&id).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    info!(subscription = %subscription_id, "subscription deleted");
    Ok(())
}

/// Subscriptions scheduled for `weekday` with no cycle created on `date`.
#[instrument(skip_all)]
pub async fn todays_subscription_ids(
    pool: &Pool,
    weekday: Weekday,
    date: NaiveDate,
) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT s.id FROM subscriptions s \
         WHERE s.day_of_week = ? \
           AND NOT EXISTS (SELECT 1 FROM digest_cycles c WHERE c.subscription_id = s.id AND c.cycle_date = ?) \
         ORDER BY s.created_at, s.id",
    )
    .bind(weekday_name(weekday))
    .bind(date)
    .fetch_all(pool)
    .await?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// The subset of `ids` that exist and have no cycle created on `date`,
/// regardless of their scheduled weekday.
#[instrument(skip_all)]
pub async fn unprepared_subscription_ids(
    pool: &Pool,
    ids: &[Uuid],
    date: NaiveDate,
) -> Result<Vec<Uuid>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT s.id FROM subscriptions s WHERE s.id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(") ");
    qb.push("AND NOT EXISTS (SELECT 1 FROM digest_cycles c WHERE c.subscription_id = s.id AND c.cycle_date = ");
    qb.push_bind(date);
    qb.push(") ORDER BY s.created_at, s.id");

    let found: Vec<String> = qb.build_query_scalar().fetch_all(pool).await?;
    found.iter().map(|id| parse_uuid(id)).collect()
}

async fn load_follow_list(conn: &mut SqliteConnection, subscription_id: Uuid) -> Result<FollowList> {
    let rows = sqlx::query_as::<_, AccountRow>(
        "SELECT a.external_id, a.display_name, a.screen_name, a.avatar_url \
         FROM subscription_accounts sa JOIN accounts a ON a.external_id = sa.account_id \
         WHERE sa.subscription_id = ? ORDER BY sa.rowid",
    )
    .bind(subscription_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(FollowedAccount::from).collect::<Vec<_>>().into())
}

fn subscription_from_row(row: SubscriptionRow, follow_list: FollowList) -> Result<Subscription> {
    let day_of_week = parse_weekday(&row.day_of_week)
        .ok_or_else(|| anyhow!("subscription {} has invalid day {}", row.id, row.day_of_week))?;
    Ok(Subscription {
        id: parse_uuid(&row.id)?,
        owner_id: parse_uuid(&row.owner_id)?,
        title: row.title,
        notify_email: row.notify_email,
        day_of_week,
        ignore_retweets: row.ignore_retweets,
        ignore_replies: row.ignore_replies,
        follow_list,
    })
}

async fn link_account(
    tx: &mut Transaction<'_, Sqlite>,
    subscription_id: Uuid,
    account: &FollowedAccount,
) -> Result<()> {
    let stored = insert_or_get_account(tx, account).await?;
    sqlx::query("INSERT OR IGNORE INTO subscription_accounts (subscription_id, account_id) VALUES (?, ?)")
        .bind(subscription_id.to_string())
        .bind(&stored.external_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn unlink_account(
    tx: &mut Transaction<'_, Sqlite>,
    subscription_id: Uuid,
    account_id: &str,
) -> Result<()> {
    let id = subscription_id.to_string();
    sqlx::query("DELETE FROM subscription_accounts WHERE subscription_id = ? AND account_id = ?")
        .bind(&id)
        .bind(account_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM watermarks WHERE subscription_id = ? AND account_id = ?")
        .bind(&id)
        .bind(account_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Insert a followed account, or fetch the row another subscription already
/// created for the same external id.
async fn insert_or_get_account(
    tx: &mut Transaction<'_, Sqlite>,
    account: &FollowedAccount,
) -> Result<FollowedAccount> {
    savepoint(tx, ACCOUNT_SAVEPOINT).await?;
    let inserted = sqlx::query(
        "INSERT INTO accounts (external_id, display_name, screen_name, avatar_url) VALUES (?, ?, ?, ?)",
    )
    .bind(&account.external_id)
    .bind(&account.display_name)
    .bind(&account.screen_name)
    .bind(&account.avatar_url)
    .execute(&mut **tx)
    .await;

    match inserted {
        Ok(_) => {
            release_savepoint(tx, ACCOUNT_SAVEPOINT).await?;
            Ok(account.clone())
        }
        Err(err) if is_unique_violation(&err) => {
            rollback_to_savepoint(tx, ACCOUNT_SAVEPOINT).await?;
            debug!(account = %account.external_id, "account already stored");
            let row = sqlx::query_as::<_, AccountRow>(
                "SELECT external_id, display_name, screen_name, avatar_url FROM accounts WHERE external_id = ?",
            )
            .bind(&account.external_id)
            .fetch_one(&mut **tx)
            .await?;
            Ok(row.into())
        }
        Err(err) => Err(err).with_context(|| format!("failed to insert account {}", account.external_id)),
    }
}
