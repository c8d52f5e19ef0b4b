use super::{join_units, Pipeline};
use crate::db;
use crate::error::{CommandError, UnitError};
use crate::lock::{with_lock, Stage};
use crate::model::{EmailStatus, OwnerEmail};
use crate::render::render_confirmation;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmReport {
    pub selected: usize,
    /// Addresses mailed and moved to SENT.
    pub sent: usize,
    /// Addresses left NEW for the next run.
    pub failed: usize,
}

impl Pipeline {
    /// Mail a signed confirmation link to every NEW address and mark it SENT.
    #[instrument(skip_all)]
    pub async fn send_confirmations(&self) -> Result<ConfirmReport, CommandError> {
        with_lock(&self.pool, Stage::Confirm, self.settings.lock_lease, || self.run_confirm()).await
    }

    async fn run_confirm(&self) -> Result<ConfirmReport, CommandError> {
        let pending = db::emails_with_status(&self.pool, EmailStatus::New)
            .await
            .map_err(CommandError::Selection)?;
        info!(addresses = pending.len(), "sending confirmation links");

        let mut report = ConfirmReport {
            selected: pending.len(),
            ..Default::default()
        };
        let mut units = JoinSet::new();
        for address in pending {
            let pipeline = self.clone();
            units.spawn(async move {
                let email = address.email.clone();
                (email, pipeline.confirm_unit(address).await)
            });
        }

        let (finished, aborted) = join_units(Stage::Confirm, units).await;
        report.failed += aborted;
        for (email, outcome) in finished {
            match outcome {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    warn!(%email, error = %err, "confirmation not sent");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "confirmation finished");
        Ok(report)
    }

    async fn confirm_unit(&self, address: OwnerEmail) -> Result<(), UnitError> {
        let link = self
            .settings
            .links
            .link(&address.email, address.owner_id, Utc::now())
            .map_err(UnitError::Link)?;
        let message = render_confirmation(&link);
        self.mailer
            .send(&self.settings.from, &address.email, &message.subject, &message.html)
            .await
            .map_err(UnitError::Send)?;

        let moved = db::transition_email_status(
            &self.pool,
            address.owner_id,
            &address.email,
            EmailStatus::New,
            EmailStatus::Sent,
        )
        .await?;
        if !moved {
            debug!(email = %address.email, "address changed status while mailing");
        }
        info!(email = %address.email, "confirmation link sent");
        Ok(())
    }
}
