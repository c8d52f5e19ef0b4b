//! Error types for the digest pipeline.
//!
//! `CommandError` ends a whole command invocation. `UnitError` ends a single
//! concurrent unit (one subscription, account, cycle or address) and is logged at the
//! unit boundary instead of propagating.

use crate::lock::Stage;
use crate::render::RenderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Another invocation of the same stage holds its lock.
    #[error("{0} stage is already running")]
    LockBusy(Stage),

    #[error("failed to acquire {stage} lock: {source:#}")]
    Lock {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("selection query failed: {0:#}")]
    Selection(#[source] anyhow::Error),

    #[error("watermark finalization failed: {0:#}")]
    Finalize(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CommandError {
    /// Process exit code for a command that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            CommandError::LockBusy(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("upstream fetch failed for account {account}: {source:#}")]
    Fetch {
        account: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("email {0} is not confirmed")]
    NotConfirmed(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("failed to build confirmation link: {0:#}")]
    Link(#[source] anyhow::Error),

    #[error("send failed: {0:#}")]
    Send(#[source] anyhow::Error),
}
