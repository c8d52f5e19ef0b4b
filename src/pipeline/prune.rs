use super::Pipeline;
use crate::db;
use crate::error::CommandError;
use crate::lock::{with_lock, Stage};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

impl Pipeline {
    pub async fn prune_posts(&self) -> Result<u64, CommandError> {
        self.prune_posts_at(Utc::now()).await
    }

    /// Drop posts stored longer than the configured retention before `now`.
    #[instrument(skip_all)]
    pub async fn prune_posts_at(&self, now: DateTime<Utc>) -> Result<u64, CommandError> {
        let cutoff = now - self.settings.post_ttl;
        with_lock(&self.pool, Stage::Prune, self.settings.lock_lease, || async move {
            let removed = db::prune_posts(&self.pool, cutoff).await?;
            info!(removed, %cutoff, "pruned posts");
            Ok(removed)
        })
        .await
    }
}
