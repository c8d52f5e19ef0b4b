//! The three digest stages plus address confirmation and post pruning.
//!
//! Every stage runs under its own lock and fans out into independent units
//! spawned on a `JoinSet`: one per subscription for init and prepare, one per
//! cycle for dispatch, one per address for confirmation. Units share nothing but the database, report a private
//! result, and are joined before the stage returns. A unit failure is logged
//! at the join and never reaches its siblings.

mod confirm;
mod dispatch;
mod init;
mod prepare;
mod prune;

pub use confirm::ConfirmReport;
pub use dispatch::DispatchReport;
pub use init::InitReport;
pub use prepare::PrepareReport;

use crate::config::Config;
use crate::confirm::LinkSigner;
use crate::db::Pool;
use crate::lock::Stage;
use crate::mail::EmailSender;
use crate::timeline::TimelineFetcher;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::error;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Sender address for digests and confirmation mail.
    pub from: String,
    pub lock_lease: Duration,
    pub post_ttl: chrono::Duration,
    pub links: LinkSigner,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            from: cfg.mail.from.clone(),
            lock_lease: Duration::from_secs(cfg.pipeline.lock_lease_seconds),
            post_ttl: chrono::Duration::days(i64::from(cfg.pipeline.post_ttl_days)),
            links: LinkSigner::from_config(cfg)?,
        })
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pool: Pool,
    fetcher: Arc<dyn TimelineFetcher>,
    mailer: Arc<dyn EmailSender>,
    settings: Arc<PipelineSettings>,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        fetcher: Arc<dyn TimelineFetcher>,
        mailer: Arc<dyn EmailSender>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            fetcher,
            mailer,
            settings: Arc::new(settings),
        }
    }
}

/// The calendar day stages operate on, in UTC.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Wait for every unit in `set`. Returns the finished results and the number
/// of units that panicked or were aborted.
async fn join_units<T: 'static>(stage: Stage, mut set: JoinSet<T>) -> (Vec<T>, usize) {
    let mut finished = Vec::with_capacity(set.len());
    let mut aborted = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(value) => finished.push(value),
            Err(err) => {
                aborted += 1;
                error!(%stage, ?err, "unit did not complete");
            }
        }
    }
    (finished, aborted)
}
