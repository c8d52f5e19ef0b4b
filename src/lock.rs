//! Per-stage mutual exclusion across command invocations.

use crate::db::{self, Pool};
use crate::error::CommandError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    Prepare,
    Send,
    Prune,
    Confirm,
}

impl Stage {
    pub const fn key(self) -> i64 {
        match self {
            Stage::Init => 1,
            Stage::Prepare => 2,
            Stage::Send => 3,
            Stage::Prune => 4,
            Stage::Confirm => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Prepare => "prepare",
            Stage::Send => "send",
            Stage::Prune => "prune",
            Stage::Confirm => "confirm",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run `f` while holding the lock for `stage`.
///
/// Returns [`CommandError::LockBusy`] without calling `f` when another
/// invocation holds the lock. Once acquired, the lock is released after `f`
/// finishes whatever its outcome; a failed release is logged, not returned.
pub async fn with_lock<T, F, Fut>(
    pool: &Pool,
    stage: Stage,
    lease: Duration,
    f: F,
) -> Result<T, CommandError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CommandError>>,
{
    let holder = Uuid::new_v4().to_string();
    let acquired = db::acquire_lock(pool, stage.key(), &holder, lease)
        .await
        .map_err(|source| CommandError::Lock { stage, source })?;
    if !acquired {
        warn!(%stage, "lock is held by another invocation");
        return Err(CommandError::LockBusy(stage));
    }
    info!(%stage, "lock acquired");

    let result = f().await;

    match db::release_lock(pool, stage.key(), &holder).await {
        Ok(true) => debug!(%stage, "lock released"),
        Ok(false) => warn!(%stage, "lock lease was lost before release"),
        Err(err) => error!(?err, %stage, "failed to release lock"),
    }
    result
}
