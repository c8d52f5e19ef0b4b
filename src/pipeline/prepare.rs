use super::{join_units, today, Pipeline};
use crate::db;
use crate::error::{CommandError, UnitError};
use crate::lock::{with_lock, Stage};
use crate::model::{Credentials, CycleStatus, DigestCycle, FetchedPost, FollowedAccount, TimelineFilters};
use anyhow::anyhow;
use chrono::{Datelike, NaiveDate};
use futures::future::join_all;
use futures::TryStreamExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrepareReport {
    pub selected: usize,
    pub ready: usize,
    pub failed: usize,
    /// Posts linked across all READY cycles.
    pub posts: usize,
    /// Accounts dropped from their cycle after a fetch or store error.
    pub skipped_accounts: usize,
}

#[derive(Debug, Default)]
struct CycleFill {
    posts: usize,
    skipped_accounts: usize,
}

impl Pipeline {
    pub async fn prepare_subscriptions(&self, ids: &[Uuid]) -> Result<PrepareReport, CommandError> {
        self.prepare_subscriptions_on(today(), ids).await
    }

    /// Open and fill one cycle per selected subscription for `date`.
    ///
    /// Without `ids`, selects subscriptions scheduled for the weekday of
    /// `date`. With `ids`, the weekday is ignored. Either way a subscription
    /// that already has a cycle on `date` is skipped.
    #[instrument(skip_all, fields(date = %date))]
    pub async fn prepare_subscriptions_on(
        &self,
        date: NaiveDate,
        ids: &[Uuid],
    ) -> Result<PrepareReport, CommandError> {
        with_lock(&self.pool, Stage::Prepare, self.settings.lock_lease, || {
            self.run_prepare(date, ids)
        })
        .await
    }

    async fn run_prepare(&self, date: NaiveDate, ids: &[Uuid]) -> Result<PrepareReport, CommandError> {
        let selected = if ids.is_empty() {
            db::todays_subscription_ids(&self.pool, date.weekday(), date).await
        } else {
            db::unprepared_subscription_ids(&self.pool, ids, date).await
        }
        .map_err(CommandError::Selection)?;
        info!(subscriptions = selected.len(), "preparing digests");

        let mut report = PrepareReport {
            selected: selected.len(),
            ..Default::default()
        };
        let mut units = JoinSet::new();
        for subscription_id in selected {
            let pipeline = self.clone();
            units.spawn(async move {
                let outcome = pipeline.prepare_unit(subscription_id, date).await;
                (subscription_id, outcome)
            });
        }

        let (finished, aborted) = join_units(Stage::Prepare, units).await;
        report.failed += aborted;
        for (subscription_id, outcome) in finished {
            match outcome {
                Ok(fill) => {
                    report.ready += 1;
                    report.posts += fill.posts;
                    report.skipped_accounts += fill.skipped_accounts;
                }
                Err(err) => {
                    warn!(subscription = %subscription_id, error = %err, "prepare unit failed");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "prepare finished");
        Ok(report)
    }

    async fn prepare_unit(&self, subscription_id: Uuid, date: NaiveDate) -> Result<CycleFill, UnitError> {
        let cycle = db::create_cycle(&self.pool, subscription_id, date).await?;
        debug!(subscription = %subscription_id, cycle = cycle.id, "cycle opened");

        match self.fill_cycle(&cycle).await {
            Ok(fill) => {
                db::set_cycle_status(&self.pool, cycle.id, CycleStatus::Ready).await?;
                info!(subscription = %subscription_id, cycle = cycle.id, posts = fill.posts, "cycle ready");
                Ok(fill)
            }
            Err(err) => {
                if let Err(mark_err) = db::set_cycle_status(&self.pool, cycle.id, CycleStatus::Failed).await {
                    error!(cycle = cycle.id, error = ?mark_err, "failed to mark cycle as failed");
                }
                Err(err)
            }
        }
    }

    async fn fill_cycle(&self, cycle: &DigestCycle) -> Result<CycleFill, UnitError> {
        let subscription = db::get_subscription(&self.pool, cycle.subscription_id)
            .await?
            .ok_or_else(|| anyhow!("subscription {} vanished", cycle.subscription_id))?;
        let credentials = db::owner_credentials(&self.pool, subscription.owner_id).await?;
        let filters = subscription.filters();
        let accounts = db::follow_list_with_watermarks(&self.pool, subscription.id).await?;

        let mut fill = CycleFill::default();
        let mut fetches = Vec::new();
        for (account, watermark) in &accounts {
            let Some(since) = watermark else {
                debug!(cycle = cycle.id, account = %account.external_id, "account not initialized yet");
                continue;
            };
            fetches.push(self.collect_account(cycle.id, account, &credentials, since, filters));
        }

        for result in join_all(fetches).await {
            match result {
                Ok(linked) => fill.posts += linked,
                Err(err) => {
                    warn!(cycle = cycle.id, error = %err, "account skipped for this cycle");
                    fill.skipped_accounts += 1;
                }
            }
        }
        Ok(fill)
    }

    /// Drain one account's new posts, then store and link them together.
    async fn collect_account(
        &self,
        cycle_id: i64,
        account: &FollowedAccount,
        credentials: &Credentials,
        since: &str,
        filters: TimelineFilters,
    ) -> Result<usize, UnitError> {
        let fetch_err = |source| UnitError::Fetch {
            account: account.external_id.clone(),
            source,
        };
        let stream = self
            .fetcher
            .fetch_recent(account, credentials, Some(since), filters)
            .await
            .map_err(fetch_err)?;
        let posts: Vec<FetchedPost> = stream.try_collect().await.map_err(fetch_err)?;
        let linked = db::store_cycle_posts(&self.pool, cycle_id, &posts).await?;
        debug!(cycle = cycle_id, account = %account.external_id, linked, "account collected");
        Ok(linked)
    }
}
