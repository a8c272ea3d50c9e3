//! Score report: recent posts, one row per post per timestep after
//! forward-filling, written as CSV.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveDateTime, TimeDelta, TimeZone, Utc};
use ctetl_core::{compact, format_timestamp, ReportRow};
use serde::Serialize;
use sqlx::PgPool;
use tokio::fs;
use tracing::{info, info_span, Instrument};

use crate::config::ReportSettings;

const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Joined metric observation as read from the fact tables.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ScoreObservation {
    pub account_name: Option<String>,
    pub account_id: i64,
    pub platform_id: String,
    pub post_message: Option<String>,
    pub post_url: Option<String>,
    pub posting_date: NaiveDateTime,
    pub as_of: NaiveDateTime,
    pub score: f64,
    pub metric_timestep: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub path: PathBuf,
    pub posts: usize,
    pub rows: usize,
}

/// Posting-date bounds `[now - start_hours, now - end_hours]`.
pub fn report_window(
    settings: &ReportSettings,
    now: NaiveDateTime,
) -> Result<(NaiveDateTime, NaiveDateTime)> {
    let hours_before = |hours: i64| {
        TimeDelta::try_hours(hours)
            .and_then(|span| now.checked_sub_signed(span))
            .with_context(|| format!("{hours}h before {now} is out of the supported date range"))
    };
    Ok((
        hours_before(settings.start_hours)?,
        hours_before(settings.end_hours)?,
    ))
}

/// Observations for posts created inside [`report_window`].
/// Newer fetches come first per post so compaction keeps the latest score
/// for a timestep.
pub async fn query_observations(
    pool: &PgPool,
    settings: &ReportSettings,
    now: NaiveDateTime,
) -> Result<Vec<ScoreObservation>> {
    let (from, to) = report_window(settings, now)?;
    let observations = sqlx::query_as::<_, ScoreObservation>(
        "SELECT a.account_name, a.account_id, p.platform_id, p.post_message, p.post_url, \
         p.posting_date, m.as_of, m.score, m.metric_timestep \
         FROM posts p \
         JOIN accounts a ON a.account_id = p.account_id \
         JOIN post_metrics m ON m.platform_id = p.platform_id \
         WHERE p.posting_date BETWEEN $1 AND $2 \
         ORDER BY p.posting_date, p.platform_id, m.as_of DESC, m.metric_timestep",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(observations)
}

fn to_local(ts: NaiveDateTime, offset: FixedOffset) -> String {
    Utc.from_utc_datetime(&ts)
        .with_timezone(&offset)
        .format(LOCAL_FORMAT)
        .to_string()
}

/// Deduplicate, group per post in order of first appearance and compact each
/// group onto the `max_timesteps` grid.
pub fn build_report(
    observations: Vec<ScoreObservation>,
    offset: FixedOffset,
    max_timesteps: u32,
) -> Vec<ReportRow> {
    let mut seen = HashSet::new();
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ReportRow>> = HashMap::new();

    for obs in observations {
        let row = ReportRow {
            account_name: obs.account_name,
            account_id: obs.account_id,
            platform_id: obs.platform_id,
            post_message: obs.post_message,
            post_url: obs.post_url,
            local_posting_date: to_local(obs.posting_date, offset),
            local_as_of: to_local(obs.as_of, offset),
            score: obs.score,
            metric_timestep: obs.metric_timestep,
        };
        if !seen.insert(row.dedup_key()) {
            continue;
        }
        groups
            .entry(row.platform_id.clone())
            .or_insert_with(|| {
                order.push(row.platform_id.clone());
                Vec::new()
            })
            .push(row);
    }

    order
        .iter()
        .filter_map(|id| groups.get(id))
        .flat_map(|history| compact(history, max_timesteps))
        .collect()
}

pub fn report_file_name(as_of: NaiveDateTime) -> String {
    format!("{}-report.csv", format_timestamp(as_of).replace(':', "-"))
}

pub fn render_csv(rows: &[ReportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing report row")?;
    }
    // An empty report still carries its header.
    if rows.is_empty() {
        writer
            .write_record([
                "account_name",
                "account_id",
                "platform_id",
                "post_message",
                "post_url",
                "local_posting_date",
                "local_as_of",
                "score",
                "metric_timestep",
            ])
            .context("writing report header")?;
    }
    writer.into_inner().context("flushing report")
}

pub async fn write_report(
    pool: &PgPool,
    settings: &ReportSettings,
    now: NaiveDateTime,
) -> Result<ReportSummary> {
    async {
        let offset = FixedOffset::east_opt(settings.utc_offset_hours * 3600)
            .context("report utc offset out of range")?;
        let observations = query_observations(pool, settings, now)
            .await
            .context("querying score observations")?;
        let fetched = observations.len();
        let rows = build_report(observations, offset, settings.max_timesteps);
        let posts = rows
            .iter()
            .map(|r| r.platform_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        fs::create_dir_all(&settings.reports_dir)
            .await
            .with_context(|| format!("creating {}", settings.reports_dir.display()))?;
        let path = settings.reports_dir.join(report_file_name(now));
        fs::write(&path, render_csv(&rows)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        info!(path = %path.display(), fetched, posts, rows = rows.len(), "report written");
        Ok(ReportSummary {
            path,
            posts,
            rows: rows.len(),
        })
    }
    .instrument(info_span!("report"))
    .await
}
