//! Transform/load: normalize each unprocessed detail object into the three
//! fact tables. Conflicts on natural keys are no-ops, and a detail object is
//! marked only after its transaction commits. Objects that fail to parse
//! stay unmarked and are counted, not fatal.

use anyhow::{Context, Result};
use ctetl_core::{DetailName, DetailRows};
use ctetl_storage::CompletionMarker;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, info_span, warn, Instrument};

use crate::StageContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertCounts {
    pub accounts: u64,
    pub posts: u64,
    pub post_metrics: u64,
}

impl InsertCounts {
    fn add(&mut self, other: InsertCounts) {
        self.accounts += other.accounts;
        self.posts += other.posts;
        self.post_metrics += other.post_metrics;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub objects_seen: usize,
    pub objects_skipped: usize,
    pub objects_loaded: usize,
    pub objects_unreadable: usize,
    pub inserted: InsertCounts,
}

/// Insert one payload's rows in a single transaction. Rows already present
/// are left untouched; the returned counts cover new rows only.
pub async fn insert_rows(pool: &PgPool, rows: &DetailRows) -> Result<InsertCounts, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut counts = InsertCounts::default();

    for account in &rows.accounts {
        counts.accounts += sqlx::query(
            "INSERT INTO accounts (account_id, account_name, account_handle, account_url, \
             account_platform, account_platform_id, account_type, account_page_admin_top_country, \
             account_page_description, account_page_created_date, account_page_category, \
             account_verified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(account.account_id)
        .bind(&account.account_name)
        .bind(&account.account_handle)
        .bind(&account.account_url)
        .bind(&account.account_platform)
        .bind(account.account_platform_id)
        .bind(&account.account_type)
        .bind(&account.account_page_admin_top_country)
        .bind(&account.account_page_description)
        .bind(account.account_page_created_date)
        .bind(&account.account_page_category)
        .bind(account.account_verified)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    for post in &rows.posts {
        counts.posts += sqlx::query(
            "INSERT INTO posts (platform_id, platform, posting_date, post_type, post_message, \
             post_url, subscriber_count, account_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (platform_id) DO NOTHING",
        )
        .bind(&post.platform_id)
        .bind(&post.platform)
        .bind(post.posting_date)
        .bind(&post.post_type)
        .bind(&post.post_message)
        .bind(&post.post_url)
        .bind(post.subscriber_count)
        .bind(post.account_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    for metric in &rows.post_metrics {
        counts.post_metrics += sqlx::query(
            "INSERT INTO post_metrics (platform_id, as_of, score, metric_name, metric_value, \
             metric_timestamp, metric_timestep) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&metric.platform_id)
        .bind(metric.as_of)
        .bind(metric.score)
        .bind(&metric.metric_name)
        .bind(metric.metric_value)
        .bind(metric.metric_timestamp)
        .bind(metric.metric_timestep)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    tx.commit().await?;
    Ok(counts)
}

pub async fn load_pending(ctx: &StageContext, pool: &PgPool, details_bucket: &str) -> Result<LoadSummary> {
    async {
        let names = ctx
            .store
            .list(details_bucket, None)
            .await
            .with_context(|| format!("listing {details_bucket}"))?;

        let mut summary = LoadSummary::default();
        for raw_name in &names {
            let Ok(name) = raw_name.parse::<DetailName>() else {
                warn!(object = %raw_name, "skipping object outside the detail layout");
                continue;
            };
            summary.objects_seen += 1;

            if ctx
                .store
                .is_done(details_bucket, raw_name)
                .await
                .with_context(|| format!("reading tags of {details_bucket}/{raw_name}"))?
            {
                summary.objects_skipped += 1;
                continue;
            }

            let body = ctx
                .store
                .get(details_bucket, raw_name)
                .await
                .with_context(|| format!("reading {details_bucket}/{raw_name}"))?;
            let rows = match ctx.source.parse_detail(&body, &name) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(object = %raw_name, error = %err, "detail payload is unreadable; leaving it unmarked");
                    summary.objects_unreadable += 1;
                    continue;
                }
            };
            let inserted = insert_rows(pool, &rows)
                .await
                .with_context(|| format!("loading rows from {raw_name}"))?;
            ctx.store
                .mark_done(details_bucket, raw_name)
                .await
                .with_context(|| format!("marking {details_bucket}/{raw_name} processed"))?;

            summary.objects_loaded += 1;
            summary.inserted.add(inserted);
        }

        info!(
            loaded = summary.objects_loaded,
            skipped = summary.objects_skipped,
            unreadable = summary.objects_unreadable,
            metrics = summary.inserted.post_metrics,
            "load finished"
        );
        Ok(summary)
    }
    .instrument(info_span!("load", bucket = details_bucket))
    .await
}
