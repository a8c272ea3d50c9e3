//! Pipeline orchestration: cursor, extraction, detail fan-out, load, report.
//!
//! Stages return outcomes for terminal-but-normal conditions and `Err` for
//! anything fatal; deciding the process exit status is left to the caller.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use ctetl_adapters::{CrowdTangleAdapter, PostSource};
use ctetl_core::utc_now_seconds;
use ctetl_storage::{
    ensure_buckets, BudgetStore, FsObjectStore, HttpFetcher, MemoryBudgetStore, ObjectStore,
    PgBudgetStore, S3ObjectStore, SlidingWindowLimiter,
};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod cursor;
pub mod details;
pub mod extract;
pub mod load;
pub mod report;

pub use config::{
    BudgetStoreSettings, ConfigError, CursorSettings, EtlConfig, ObjectStoreSettings,
    ReportSettings,
};
pub use cursor::{decide, latest_page, next_window, CursorDecision, CursorError};
pub use details::{process_page, process_pending_pages, DetailsSummary, PageOutcome};
pub use extract::{extract_window, ExtractOutcome};
pub use load::{insert_rows, load_pending, InsertCounts, LoadSummary};
pub use report::{build_report, write_report, ReportSummary, ScoreObservation};

pub const CRATE_NAME: &str = "ctetl-sync";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Handles every stage needs to talk to the provider and the object store.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn ObjectStore>,
    pub http: HttpFetcher,
    pub limiter: SlidingWindowLimiter,
    pub source: Arc<dyn PostSource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extract: ExtractOutcome,
    pub details: DetailsSummary,
    pub load: LoadSummary,
    pub report: ReportSummary,
}

pub struct EtlPipeline {
    config: EtlConfig,
    ctx: StageContext,
    pool: PgPool,
    running: Mutex<()>,
}

impl EtlPipeline {
    /// Wire clients from configuration. Database pools connect lazily, so
    /// stages that never touch Postgres never open a connection.
    pub async fn connect(config: EtlConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http.clone())?;

        let store: Arc<dyn ObjectStore> = match &config.object_store {
            ObjectStoreSettings::S3(s3) => Arc::new(S3ObjectStore::connect(s3).await),
            ObjectStoreSettings::Fs { root } => Arc::new(FsObjectStore::new(root.clone())),
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(config.database.clone());

        let budgets: Arc<dyn BudgetStore> = match &config.budget_store {
            BudgetStoreSettings::Postgres(None) => Arc::new(PgBudgetStore::new(pool.clone())),
            BudgetStoreSettings::Postgres(Some(options)) => {
                let limiter_pool = PgPoolOptions::new()
                    .max_connections(2)
                    .connect_lazy_with(options.clone());
                Arc::new(PgBudgetStore::new(limiter_pool))
            }
            BudgetStoreSettings::Memory => {
                warn!("rate budget is process-local; concurrent runs will not share it");
                Arc::new(MemoryBudgetStore::new())
            }
        };
        let limiter = SlidingWindowLimiter::new(budgets, config.budget_key(), config.rate_limit);
        let source = Arc::new(CrowdTangleAdapter::new(&config.api_base, &config.api_key));

        let ctx = StageContext {
            store,
            http,
            limiter,
            source,
        };
        Ok(Self::from_parts(config, ctx, pool))
    }

    pub fn from_parts(config: EtlConfig, ctx: StageContext, pool: PgPool) -> Self {
        Self {
            config,
            ctx,
            pool,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        info!("migrations applied");
        Ok(())
    }

    async fn require_buckets(&self, buckets: &[&str]) -> Result<()> {
        ensure_buckets(self.ctx.store.as_ref(), buckets)
            .await
            .context("cannot find bucket")
    }

    /// Extract the next eligible window, or report that the cursor is caught up.
    pub async fn extract(&self, now: NaiveDateTime) -> Result<ExtractOutcome> {
        let bucket = self.config.posts_bucket.as_str();
        self.require_buckets(&[bucket]).await?;

        let decision = next_window(self.ctx.store.as_ref(), bucket, &self.config.cursor, now)
            .await
            .context("recovering the extraction cursor")?;
        match decision {
            CursorDecision::CaughtUp {
                next_start,
                start_limit,
            } => {
                info!(%next_start, %start_limit, "next window is not yet eligible");
                Ok(ExtractOutcome::CaughtUp {
                    next_start,
                    start_limit,
                })
            }
            CursorDecision::Window(window) => {
                let pages = extract_window(&self.ctx, bucket, &window).await?;
                Ok(ExtractOutcome::Extracted { window, pages })
            }
        }
    }

    pub async fn details(&self) -> Result<DetailsSummary> {
        let pages = self.config.posts_bucket.as_str();
        let details = self.config.details_bucket.as_str();
        self.require_buckets(&[pages, details]).await?;
        process_pending_pages(&self.ctx, pages, details).await
    }

    pub async fn load(&self) -> Result<LoadSummary> {
        let details = self.config.details_bucket.as_str();
        self.require_buckets(&[details]).await?;
        load_pending(&self.ctx, &self.pool, details).await
    }

    pub async fn report(&self, now: NaiveDateTime) -> Result<ReportSummary> {
        write_report(&self.pool, &self.config.report, now).await
    }

    /// Every stage in order. A caught-up cursor only skips extraction.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let now = utc_now_seconds();

        async {
            let extract = self.extract(now).await.context("extract stage")?;
            let details = self.details().await.context("details stage")?;
            let load = self.load().await.context("load stage")?;
            let report = self.report(now).await.context("report stage")?;
            Ok(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                extract,
                details,
                load,
                report,
            })
        }
        .instrument(info_span!("run", %run_id))
        .await
    }

    /// Scheduler firing [`Self::run_once`] on the configured cron expression.
    /// A tick that arrives while a run is still in flight is skipped.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cron.clone();
        let pipeline = self;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let Ok(_guard) = pipeline.running.try_lock() else {
                    warn!("previous run still in progress; skipping this tick");
                    return;
                };
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}
