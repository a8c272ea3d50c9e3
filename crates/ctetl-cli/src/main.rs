use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ctetl_core::utc_now_seconds;
use ctetl_sync::{EtlConfig, EtlPipeline, ExtractOutcome};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_DIRECTIVES: &str = "warn,ctetl=info";

#[derive(Debug, Parser)]
#[command(name = "ctetl-cli")]
#[command(about = "CrowdTangle extract, transform and load")]
struct Cli {
    /// Abort the command once this many seconds have passed.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Fetch the next eligible time window into the posts bucket.
    Extract,
    /// Fetch details for every unprocessed listing page.
    Details,
    /// Load unprocessed detail objects into Postgres.
    Load,
    /// Write the score report for recent posts.
    Report,
    /// Extract, details, load and report in one pass.
    Run,
    /// Apply database migrations.
    Migrate,
    /// Run the full pipeline on CTETL_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ctetl-cli failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = EtlConfig::from_env().context("loading configuration")?;
    let command = cli.command.unwrap_or(if config.scheduler_enabled {
        Commands::Schedule
    } else {
        Commands::Run
    });
    let pipeline = Arc::new(EtlPipeline::connect(config).await?);
    let timeout = cli.timeout_secs;

    match command {
        Commands::Extract => {
            let outcome = cancellable(timeout, pipeline.extract(utc_now_seconds())).await?;
            print_extract(&outcome);
        }
        Commands::Details => {
            let summary = cancellable(timeout, pipeline.details()).await?;
            println!(
                "details complete: pages_processed={} pages_skipped={} pages_unreadable={} details={}",
                summary.pages_processed,
                summary.pages_skipped,
                summary.pages_unreadable,
                summary.details_written
            );
        }
        Commands::Load => {
            let summary = cancellable(timeout, pipeline.load()).await?;
            println!(
                "load complete: objects_loaded={} objects_skipped={} objects_unreadable={} new_metrics={}",
                summary.objects_loaded,
                summary.objects_skipped,
                summary.objects_unreadable,
                summary.inserted.post_metrics
            );
        }
        Commands::Report => {
            let summary = cancellable(timeout, pipeline.report(utc_now_seconds())).await?;
            println!(
                "report complete: posts={} rows={} path={}",
                summary.posts,
                summary.rows,
                summary.path.display()
            );
        }
        Commands::Run => {
            let summary = cancellable(timeout, pipeline.run_once()).await?;
            print_extract(&summary.extract);
            println!(
                "run complete: run_id={} details={} loaded={} report={}",
                summary.run_id,
                summary.details.details_written,
                summary.load.objects_loaded,
                summary.report.path.display()
            );
        }
        Commands::Migrate => {
            cancellable(timeout, pipeline.migrate()).await?;
            println!("migrations applied");
        }
        Commands::Schedule => schedule(pipeline).await?,
    }
    Ok(())
}

/// Race `work` against Ctrl-C and the optional deadline. Dropping the losing
/// future cancels any in-flight request or rate budget wait.
async fn cancellable<T>(timeout_secs: Option<u64>, work: impl Future<Output = Result<T>>) -> Result<T> {
    let deadline = async {
        match timeout_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        _ = deadline => bail!("timed out after {}s", timeout_secs.unwrap_or_default()),
    }
}

fn print_extract(outcome: &ExtractOutcome) {
    match outcome {
        ExtractOutcome::CaughtUp {
            next_start,
            start_limit,
        } => println!(
            "extract: caught up; window starting {next_start} is inside the freshness lag (limit {start_limit})"
        ),
        ExtractOutcome::Extracted { window, pages } => println!(
            "extract complete: window={}..{} pages={pages}",
            window.start, window.end
        ),
    }
}

async fn schedule(pipeline: Arc<EtlPipeline>) -> Result<()> {
    let cron = pipeline.config().cron.clone();
    let mut sched = pipeline.build_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
