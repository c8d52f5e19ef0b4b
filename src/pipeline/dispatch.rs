use super::{join_units, today, Pipeline};
use crate::db;
use crate::error::{CommandError, UnitError};
use crate::lock::{with_lock, Stage};
use crate::model::{cmp_post_ids, CycleStatus, DigestCycle, EmailStatus};
use crate::render::render_digest;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub selected: usize,
    pub sent: usize,
    /// Posts delivered across all sent digests.
    pub posts: usize,
    /// Cycles marked SENT without mail because they had no posts.
    pub empty: usize,
    pub blocked: usize,
    pub failed: usize,
    pub watermarks_advanced: usize,
}

enum Delivery {
    Sent(usize),
    Empty,
}

impl Pipeline {
    pub async fn send_subscriptions(&self, ids: &[Uuid]) -> Result<DispatchReport, CommandError> {
        self.send_subscriptions_on(today(), ids).await
    }

    /// Deliver READY and BLOCKED cycles of `date`, then advance watermarks
    /// for everything that reached SENT that day.
    #[instrument(skip_all, fields(date = %date))]
    pub async fn send_subscriptions_on(
        &self,
        date: NaiveDate,
        ids: &[Uuid],
    ) -> Result<DispatchReport, CommandError> {
        with_lock(&self.pool, Stage::Send, self.settings.lock_lease, || {
            self.run_dispatch(date, ids)
        })
        .await
    }

    async fn run_dispatch(&self, date: NaiveDate, ids: &[Uuid]) -> Result<DispatchReport, CommandError> {
        let cycles = db::dispatchable_cycles(&self.pool, date, ids)
            .await
            .map_err(CommandError::Selection)?;
        info!(cycles = cycles.len(), "dispatching digests");

        let mut report = DispatchReport {
            selected: cycles.len(),
            ..Default::default()
        };
        let mut units = JoinSet::new();
        for cycle in cycles {
            let pipeline = self.clone();
            units.spawn(async move {
                let cycle_id = cycle.id;
                (cycle_id, pipeline.dispatch_unit(cycle).await)
            });
        }

        let (finished, aborted) = join_units(Stage::Send, units).await;
        report.failed += aborted;
        for (cycle_id, outcome) in finished {
            match outcome {
                Ok(Delivery::Sent(posts)) => {
                    report.sent += 1;
                    report.posts += posts;
                }
                Ok(Delivery::Empty) => report.empty += 1,
                Err(UnitError::NotConfirmed(email)) => {
                    info!(cycle = cycle_id, %email, "cycle blocked until the address is confirmed");
                    report.blocked += 1;
                }
                Err(err) => {
                    warn!(cycle = cycle_id, error = %err, "dispatch unit failed");
                    report.failed += 1;
                }
            }
        }

        report.watermarks_advanced = self
            .advance_watermarks(date)
            .await
            .map_err(CommandError::Finalize)?;
        info!(?report, "dispatch finished");
        Ok(report)
    }

    async fn dispatch_unit(&self, cycle: DigestCycle) -> Result<Delivery, UnitError> {
        db::set_cycle_status(&self.pool, cycle.id, CycleStatus::Sending).await?;
        let outcome = self.deliver(&cycle).await;
        let status = match &outcome {
            Ok(_) => CycleStatus::Sent,
            Err(UnitError::NotConfirmed(_)) => CycleStatus::Blocked,
            Err(_) => CycleStatus::Failed,
        };
        if let Err(err) = db::set_cycle_status(&self.pool, cycle.id, status).await {
            error!(cycle = cycle.id, %status, error = ?err, "failed to record cycle outcome");
            return Err(err.into());
        }
        outcome
    }

    async fn deliver(&self, cycle: &DigestCycle) -> Result<Delivery, UnitError> {
        let subscription = db::get_subscription(&self.pool, cycle.subscription_id)
            .await?
            .ok_or_else(|| anyhow!("subscription {} vanished", cycle.subscription_id))?;
        let email = &subscription.notify_email;
        let status = db::email_status(&self.pool, subscription.owner_id, email).await?;
        if status != Some(EmailStatus::Confirmed) {
            return Err(UnitError::NotConfirmed(email.clone()));
        }

        let posts = db::cycle_posts(&self.pool, cycle.id).await?;
        if posts.is_empty() {
            info!(cycle = cycle.id, "nothing to send");
            return Ok(Delivery::Empty);
        }

        let digest = render_digest(&subscription, cycle.cycle_date, &posts)?;
        self.mailer
            .send(&self.settings.from, email, &digest.subject, &digest.html)
            .await
            .map_err(UnitError::Send)?;
        info!(cycle = cycle.id, posts = posts.len(), %email, "digest sent");
        Ok(Delivery::Sent(posts.len()))
    }

    /// Move each (subscription, account) watermark to the newest post that
    /// was actually delivered by a SENT cycle of `date`.
    #[instrument(skip_all)]
    pub async fn advance_watermarks(&self, date: NaiveDate) -> Result<usize> {
        let mut newest: HashMap<(Uuid, String), String> = HashMap::new();
        for sent in db::sent_contributions(&self.pool, date).await? {
            let key = (sent.subscription_id, sent.account_id);
            match newest.get_mut(&key) {
                Some(current) => {
                    if cmp_post_ids(&sent.external_post_id, current) == Ordering::Greater {
                        *current = sent.external_post_id;
                    }
                }
                None => {
                    newest.insert(key, sent.external_post_id);
                }
            }
        }

        let mut advanced = 0;
        for ((subscription_id, account_id), post_id) in &newest {
            if db::advance_watermark(&self.pool, *subscription_id, account_id, post_id).await? {
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Send a one-off message through the configured mailer.
    pub async fn send_test_email(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.mailer.send(&self.settings.from, to, subject, body).await?;
        info!(%to, "test email sent");
        Ok(())
    }
}
