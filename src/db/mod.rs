//! Content store: SQLite persistence for the digest pipeline.
//!
//! Each submodule owns the SQL for one entity:
//! - `owners`: subscription owners, their upstream credentials and emails.
//! - `subscriptions`: subscriptions, followed accounts and follow-list
//!   reconciliation.
//! - `watermarks`: per (subscription, account) last-seen post markers.
//! - `cycles`: digest cycles and their status transitions.
//! - `posts`: globally deduplicated posts and cycle links.
//! - `locks`: leased advisory locks keyed by pipeline stage.
//!
//! Write transactions always open with a write statement so concurrent units
//! queue on SQLite's write lock instead of failing on a stale read snapshot.

pub mod cycles;
pub mod locks;
pub mod model;
pub mod owners;
pub mod posts;
pub mod subscriptions;
pub mod watermarks;

pub use cycles::*;
pub use locks::*;
pub use model::{Reconciliation, SentContribution};
pub use owners::*;
pub use posts::*;
pub use subscriptions::*;
pub use watermarks::*;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub type Pool = SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_CONNECTIONS: u32 = 8;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .context("failed to open database")?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Expands a leading `~/` in file-backed SQLite URLs and makes sure the parent
/// directory exists. Other URLs are returned untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}

pub(crate) async fn savepoint(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<()> {
    sqlx::query(&format!("SAVEPOINT {name}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn release_savepoint(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<()> {
    sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Undo everything since `name` without touching earlier work in `tx`.
pub(crate) async fn rollback_to_savepoint(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
) -> Result<()> {
    sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
        .execute(&mut **tx)
        .await?;
    sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("stored id {value} is not a uuid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("digest.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }
}
