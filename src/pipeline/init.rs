use super::{join_units, Pipeline};
use crate::db;
use crate::error::{CommandError, UnitError};
use crate::lock::{with_lock, Stage};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    pub subscriptions: usize,
    /// Pairs that received a watermark.
    pub initialized: usize,
    /// Pairs whose account has no posts yet; retried next run.
    pub empty: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct UnitOutcome {
    initialized: usize,
    empty: usize,
    failed: usize,
}

impl Pipeline {
    /// Seed a watermark for every followed account that lacks one, from the
    /// account's single most recent post.
    #[instrument(skip_all)]
    pub async fn init_subscriptions(&self, ids: &[Uuid]) -> Result<InitReport, CommandError> {
        with_lock(&self.pool, Stage::Init, self.settings.lock_lease, || self.run_init(ids)).await
    }

    async fn run_init(&self, ids: &[Uuid]) -> Result<InitReport, CommandError> {
        let pending = db::uninitialized_pairs(&self.pool, ids)
            .await
            .map_err(CommandError::Selection)?;
        let mut report = InitReport {
            subscriptions: pending.len(),
            ..Default::default()
        };
        info!(subscriptions = pending.len(), "initializing watermarks");

        let mut units = JoinSet::new();
        for (subscription_id, accounts) in pending {
            let pipeline = self.clone();
            units.spawn(async move {
                let outcome = pipeline.init_unit(subscription_id, &accounts).await;
                (subscription_id, accounts.len(), outcome)
            });
        }

        let (finished, aborted) = join_units(Stage::Init, units).await;
        report.failed += aborted;
        for (subscription_id, pairs, outcome) in finished {
            match outcome {
                Ok(outcome) => {
                    report.initialized += outcome.initialized;
                    report.empty += outcome.empty;
                    report.failed += outcome.failed;
                }
                Err(err) => {
                    warn!(subscription = %subscription_id, error = %err, "init unit failed");
                    report.failed += pairs;
                }
            }
        }
        info!(?report, "init finished");
        Ok(report)
    }

    async fn init_unit(&self, subscription_id: Uuid, account_ids: &[String]) -> Result<UnitOutcome, UnitError> {
        let subscription = db::get_subscription(&self.pool, subscription_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscription {} vanished", subscription_id))?;
        let credentials = db::owner_credentials(&self.pool, subscription.owner_id).await?;

        let mut outcome = UnitOutcome::default();
        for account in subscription
            .follow_list
            .iter()
            .filter(|a| account_ids.contains(&a.external_id))
        {
            let latest = match self.fetcher.fetch_most_recent_one(account, &credentials).await {
                Ok(latest) => latest,
                Err(source) => {
                    let err = UnitError::Fetch {
                        account: account.external_id.clone(),
                        source,
                    };
                    warn!(subscription = %subscription_id, error = %err, "skipping account");
                    outcome.failed += 1;
                    continue;
                }
            };
            let Some(post) = latest else {
                debug!(subscription = %subscription_id, account = %account.external_id, "account has no posts yet");
                outcome.empty += 1;
                continue;
            };
            db::insert_watermark(&self.pool, subscription_id, &account.external_id, &post.external_id).await?;
            outcome.initialized += 1;
        }
        Ok(outcome)
    }
}
