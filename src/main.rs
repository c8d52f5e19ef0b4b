use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tw_digest::config;
use tw_digest::db;
use tw_digest::error::CommandError;
use tw_digest::mail::MailgunSender;
use tw_digest::pipeline::{Pipeline, PipelineSettings};
use tw_digest::timeline::{HttpTimelineFetcher, RateLimited};

#[derive(Debug, Parser)]
#[command(author, version, about = "Prepare and send timeline digest emails")]
struct Args {
    /// Path to YAML config file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed watermarks for followed accounts that have none
    InitSubscriptions(Filter),
    /// Open and fill today's digest cycles
    PrepareSubscriptions(Filter),
    /// Send today's ready digests and advance watermarks
    SendSubscriptions(Filter),
    /// Mail confirmation links to newly registered addresses
    SendConfirmation,
    /// Delete stored posts older than the retention window
    PrunePosts,
    /// Send a single message to check mail delivery
    TestEmail {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
}

#[derive(Debug, clap::Args)]
struct Filter {
    /// Restrict the run to these subscription ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    ids: Vec<Uuid>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<CommandError>() {
            Some(cmd_err) if matches!(cmd_err, CommandError::LockBusy(_)) => {
                warn!("{}", cmd_err);
                ExitCode::from(cmd_err.exit_code())
            }
            Some(cmd_err) => {
                error!("{}", cmd_err);
                ExitCode::from(cmd_err.exit_code())
            }
            None => {
                error!("{:#}", err);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let fetcher = RateLimited::new(
        HttpTimelineFetcher::from_config(&cfg)?,
        cfg.timeline.max_concurrent_requests,
    );
    let mailer = MailgunSender::from_config(&cfg)?;
    let pipeline = Pipeline::new(
        pool,
        Arc::new(fetcher),
        Arc::new(mailer),
        PipelineSettings::from_config(&cfg)?,
    );

    match args.command {
        Command::InitSubscriptions(filter) => {
            let report = pipeline.init_subscriptions(&filter.ids).await?;
            info!(?report, "init-subscriptions done");
        }
        Command::PrepareSubscriptions(filter) => {
            let report = pipeline.prepare_subscriptions(&filter.ids).await?;
            info!(?report, "prepare-subscriptions done");
        }
        Command::SendSubscriptions(filter) => {
            let report = pipeline.send_subscriptions(&filter.ids).await?;
            info!(?report, "send-subscriptions done");
        }
        Command::SendConfirmation => {
            let report = pipeline.send_confirmations().await?;
            info!(?report, "send-confirmation done");
        }
        Command::PrunePosts => {
            let removed = pipeline.prune_posts().await?;
            info!(removed, "prune-posts done");
        }
        Command::TestEmail { to, subject, body } => {
            pipeline.send_test_email(&to, &subject, &body).await?;
        }
    }
    Ok(())
}
