use super::model::{OwnerEmailRow, OwnerRow};
use super::Pool;
use crate::model::{Credentials, EmailStatus, Owner, OwnerEmail};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Insert an owner or refresh the name and credentials of an existing one.
#[instrument(skip_all)]
pub async fn upsert_owner(pool: &Pool, owner: &Owner) -> Result<()> {
    sqlx::query(
        "INSERT INTO owners (id, name, upstream_user_id, access_token, token_secret) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, upstream_user_id = excluded.upstream_user_id, \
         access_token = excluded.access_token, token_secret = excluded.token_secret",
    )
    .bind(owner.id.to_string())
    .bind(&owner.name)
    .bind(&owner.credentials.user_id)
    .bind(&owner.credentials.access_token)
    .bind(&owner.credentials.token_secret)
    .execute(pool)
    .await
    .context("failed to upsert owner")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_owner(pool: &Pool, owner_id: Uuid) -> Result<Option<Owner>> {
    let row = sqlx::query_as::<_, OwnerRow>(
        "SELECT id, name, upstream_user_id, access_token, token_secret FROM owners WHERE id = ?",
    )
    .bind(owner_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(Owner::try_from).transpose()
}

/// Upstream credentials for `owner_id`; a missing owner is an error.
pub async fn owner_credentials(pool: &Pool, owner_id: Uuid) -> Result<Credentials> {
    get_owner(pool, owner_id)
        .await?
        .map(|owner| owner.credentials)
        .ok_or_else(|| anyhow!("owner {} not found", owner_id))
}

#[instrument(skip_all)]
pub async fn upsert_owner_email(
    pool: &Pool,
    owner_id: Uuid,
    email: &str,
    status: EmailStatus,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO owner_emails (owner_id, email, status, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(owner_id, email) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
    )
    .bind(owner_id.to_string())
    .bind(email)
    .bind(status.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to upsert owner email")?;
    Ok(())
}

/// Verification status of `email` for `owner_id`, `None` if never registered.
#[instrument(skip_all)]
pub async fn email_status(pool: &Pool, owner_id: Uuid, email: &str) -> Result<Option<EmailStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM owner_emails WHERE owner_id = ? AND email = ?")
            .bind(owner_id.to_string())
            .bind(email)
            .fetch_optional(pool)
            .await?;
    match status {
        Some(s) => EmailStatus::parse_state(&s)
            .map(Some)
            .ok_or_else(|| anyhow!("email {} has unknown status {}", email, s)),
        None => Ok(None),
    }
}

/// Every registered address currently in `status`, oldest change first.
#[instrument(skip_all)]
pub async fn emails_with_status(pool: &Pool, status: EmailStatus) -> Result<Vec<OwnerEmail>> {
    let rows = sqlx::query_as::<_, OwnerEmailRow>(
        "SELECT owner_id, email, status FROM owner_emails WHERE status = ? ORDER BY updated_at, owner_id, email",
    )
    .bind(status.as_str())
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list {} emails", status.as_str()))?;
    rows.into_iter().map(OwnerEmail::try_from).collect()
}

/// Move an address from `from` to `to`. Returns false when the address is
/// missing or no longer in `from`, leaving it untouched.
#[instrument(skip_all)]
pub async fn transition_email_status(
    pool: &Pool,
    owner_id: Uuid,
    email: &str,
    from: EmailStatus,
    to: EmailStatus,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE owner_emails SET status = ?, updated_at = ? WHERE owner_id = ? AND email = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(Utc::now())
    .bind(owner_id.to_string())
    .bind(email)
    .bind(from.as_str())
    .execute(pool)
    .await
    .with_context(|| format!("failed to update status of {email}"))?;
    let moved = res.rows_affected() == 1;
    if moved {
        debug!(owner = %owner_id, %email, from = from.as_str(), to = to.as_str(), "email status updated");
    }
    Ok(moved)
}
