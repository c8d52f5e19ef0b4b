use super::model::{PostRow, SentContribution};
use super::{is_unique_violation, parse_uuid, release_savepoint, rollback_to_savepoint, savepoint, Pool};
use crate::model::{cmp_post_ids, CycleStatus, FetchedPost, Post};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, instrument};

const POST_SAVEPOINT: &str = "post_insert";

/// Store `posts` and link each one to `cycle_id` in a single transaction.
///
/// Posts already known under the same external id are reused, so a post
/// shared by several subscriptions is stored once and linked once per cycle.
/// Returns the number of posts linked.
#[instrument(skip_all)]
pub async fn store_cycle_posts(pool: &Pool, cycle_id: i64, posts: &[FetchedPost]) -> Result<usize> {
    if posts.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    for post in posts {
        let post_id = insert_or_get_post(&mut tx, post).await?;
        link_post(&mut tx, cycle_id, post_id).await?;
    }
    tx.commit().await?;
    Ok(posts.len())
}

/// Insert a post keyed by its external id, or return the id of the row that
/// already holds it. A conflicting insert is undone with a savepoint so the
/// rest of `tx` survives.
pub async fn insert_or_get_post(tx: &mut Transaction<'_, Sqlite>, post: &FetchedPost) -> Result<i64> {
    let payload = serde_json::to_string(&post.payload).context("failed to encode post payload")?;
    savepoint(tx, POST_SAVEPOINT).await?;
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO posts (external_id, account_id, payload, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(&post.external_id)
    .bind(&post.account_id)
    .bind(&payload)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await;

    match inserted {
        Ok(id) => {
            release_savepoint(tx, POST_SAVEPOINT).await?;
            Ok(id)
        }
        Err(err) if is_unique_violation(&err) => {
            rollback_to_savepoint(tx, POST_SAVEPOINT).await?;
            debug!(post = %post.external_id, "post already stored");
            let id = sqlx::query_scalar::<_, i64>("SELECT id FROM posts WHERE external_id = ?")
                .bind(&post.external_id)
                .fetch_one(&mut **tx)
                .await?;
            Ok(id)
        }
        Err(err) => Err(err).with_context(|| format!("failed to insert post {}", post.external_id)),
    }
}

/// Linking the same post to the same cycle twice is a no-op.
pub async fn link_post(tx: &mut Transaction<'_, Sqlite>, cycle_id: i64, post_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO cycle_posts (cycle_id, post_id) VALUES (?, ?)")
        .bind(cycle_id)
        .bind(post_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Posts linked to a cycle, ascending by numeric external id.
#[instrument(skip_all)]
pub async fn cycle_posts(pool: &Pool, cycle_id: i64) -> Result<Vec<Post>> {
    let rows = sqlx::query_as::<_, PostRow>(
        "SELECT p.id, p.external_id, p.account_id, p.payload, p.created_at \
         FROM cycle_posts cp JOIN posts p ON p.id = cp.post_id WHERE cp.cycle_id = ?",
    )
    .bind(cycle_id)
    .fetch_all(pool)
    .await?;
    let mut posts: Vec<Post> = rows.into_iter().map(Post::from).collect();
    posts.sort_by(|a, b| cmp_post_ids(&a.external_id, &b.external_id));
    Ok(posts)
}

pub async fn get_post_by_external_id(pool: &Pool, external_id: &str) -> Result<Option<Post>> {
    let row = sqlx::query_as::<_, PostRow>(
        "SELECT id, external_id, account_id, payload, created_at FROM posts WHERE external_id = ?",
    )
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Post::from))
}

/// Every post delivered by a cycle of `date` that reached SENT.
#[instrument(skip_all)]
pub async fn sent_contributions(pool: &Pool, date: NaiveDate) -> Result<Vec<SentContribution>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT c.subscription_id, p.account_id, p.external_id \
         FROM digest_cycles c \
         JOIN cycle_posts cp ON cp.cycle_id = c.id \
         JOIN posts p ON p.id = cp.post_id \
         WHERE c.cycle_date = ? AND c.status = ?",
    )
    .bind(date)
    .bind(CycleStatus::Sent.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(subscription_id, account_id, external_post_id)| {
            Ok(SentContribution {
                subscription_id: parse_uuid(&subscription_id)?,
                account_id,
                external_post_id,
            })
        })
        .collect()
}

/// Delete posts stored before `cutoff` together with their cycle links.
#[instrument(skip_all)]
pub async fn prune_posts(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM cycle_posts WHERE post_id IN (SELECT id FROM posts WHERE created_at < ?)")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
    let removed = sqlx::query("DELETE FROM posts WHERE created_at < ?")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(removed)
}
