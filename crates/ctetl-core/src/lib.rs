//! Core domain model for the CrowdTangle extract, transform and load pipeline.
//!
//! Object names double as the pipeline's checkpoint: the extraction cursor is
//! recovered by parsing the largest page name in the raw namespace, so the
//! layouts produced here must stay stable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod compact;

pub use compact::{compact, Timestepped};

pub const CRATE_NAME: &str = "ctetl-core";

/// ISO-8601 to the second, no offset. Never contains an underscore.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const OBJECT_SUFFIX: &str = ".txt";
const DETAIL_SUFFIX: &str = "_.txt";

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, NameError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| NameError::Timestamp {
        raw: raw.to_string(),
    })
}

/// Current UTC wall clock truncated to whole seconds.
pub fn utc_now_seconds() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    DateTime::from_timestamp(now.and_utc().timestamp(), 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(now)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("object name `{name}` does not match the {kind} layout")]
    Layout { kind: &'static str, name: String },
    #[error("`{raw}` is not a YYYY-MM-DDTHH:MM:SS timestamp")]
    Timestamp { raw: String },
    #[error("`{raw}` is not a page number")]
    PageNumber { raw: String },
}

/// The `[start, end)` slice requested in one extraction run, plus the `as_of`
/// instant captured once and reused for every object name in that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub as_of: NaiveDateTime,
}

/// Name of one raw listing page: `{as_of}_{window_end}_{window_start}_{page}.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageName {
    pub as_of: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub window_start: NaiveDateTime,
    pub page: u32,
}

impl PageName {
    pub fn for_window(window: &TimeWindow, page: u32) -> Self {
        Self {
            as_of: window.as_of,
            window_end: window.end,
            window_start: window.start,
            page,
        }
    }
}

impl fmt::Display for PageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}{OBJECT_SUFFIX}",
            format_timestamp(self.as_of),
            format_timestamp(self.window_end),
            format_timestamp(self.window_start),
            self.page
        )
    }
}

impl FromStr for PageName {
    type Err = NameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let layout_err = || NameError::Layout {
            kind: "page",
            name: name.to_string(),
        };
        let stem = name.strip_suffix(OBJECT_SUFFIX).ok_or_else(layout_err)?;
        let parts: Vec<&str> = stem.split('_').collect();
        let [as_of, end, start, page] = parts.as_slice() else {
            return Err(layout_err());
        };
        Ok(Self {
            as_of: parse_timestamp(as_of)?,
            window_end: parse_timestamp(end)?,
            window_start: parse_timestamp(start)?,
            page: page.parse().map_err(|_| NameError::PageNumber {
                raw: page.to_string(),
            })?,
        })
    }
}

/// Name of one per-entity detail payload: `{entity_id}_{as_of}_.txt`.
///
/// Provider identifiers may themselves contain underscores, so parsing
/// splits from the right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailName {
    pub entity_id: String,
    pub as_of: NaiveDateTime,
}

impl fmt::Display for DetailName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}{DETAIL_SUFFIX}",
            self.entity_id,
            format_timestamp(self.as_of)
        )
    }
}

impl FromStr for DetailName {
    type Err = NameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let layout_err = || NameError::Layout {
            kind: "detail",
            name: name.to_string(),
        };
        let stem = name.strip_suffix(DETAIL_SUFFIX).ok_or_else(layout_err)?;
        let (entity_id, as_of) = stem.rsplit_once('_').ok_or_else(layout_err)?;
        if entity_id.is_empty() {
            return Err(layout_err());
        }
        Ok(Self {
            entity_id: entity_id.to_string(),
            as_of: parse_timestamp(as_of)?,
        })
    }
}

/// Normalized `accounts` fact, keyed by `account_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRow {
    pub account_id: i64,
    pub account_name: Option<String>,
    pub account_handle: Option<String>,
    pub account_url: Option<String>,
    pub account_platform: Option<String>,
    pub account_platform_id: Option<i64>,
    pub account_type: Option<String>,
    pub account_page_admin_top_country: Option<String>,
    pub account_page_description: Option<String>,
    pub account_page_created_date: Option<NaiveDateTime>,
    pub account_page_category: Option<String>,
    pub account_verified: bool,
}

/// Normalized `posts` fact, keyed by `platform_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRow {
    pub platform_id: String,
    pub platform: Option<String>,
    pub posting_date: NaiveDateTime,
    pub post_type: Option<String>,
    pub post_message: Option<String>,
    pub post_url: Option<String>,
    pub subscriber_count: Option<i64>,
    pub account_id: i64,
}

/// One melted observation from a post's history. Every column is part of the
/// table's unique key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostMetricRow {
    pub platform_id: String,
    pub as_of: NaiveDateTime,
    pub score: f64,
    pub metric_name: String,
    pub metric_value: i64,
    pub metric_timestamp: NaiveDateTime,
    pub metric_timestep: i64,
}

/// Everything one detail payload contributes to the relational store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailRows {
    pub accounts: Vec<AccountRow>,
    pub posts: Vec<PostRow>,
    pub post_metrics: Vec<PostMetricRow>,
}

/// One line of the score report, before and after compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub account_name: Option<String>,
    pub account_id: i64,
    pub platform_id: String,
    pub post_message: Option<String>,
    pub post_url: Option<String>,
    pub local_posting_date: String,
    pub local_as_of: String,
    pub score: f64,
    pub metric_timestep: i64,
}

impl ReportRow {
    /// Key used to drop exact duplicates; scores compare bitwise.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.account_name.as_deref().unwrap_or_default(),
            self.account_id,
            self.platform_id,
            self.post_message.as_deref().unwrap_or_default(),
            self.post_url.as_deref().unwrap_or_default(),
            self.local_posting_date,
            self.local_as_of,
            self.score.to_bits(),
            self.metric_timestep
        )
    }
}

impl Timestepped for ReportRow {
    fn timestep(&self) -> i64 {
        self.metric_timestep
    }

    fn with_timestep(&self, timestep: i64) -> Self {
        Self {
            metric_timestep: timestep,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("timestamp")
    }

    #[test]
    fn page_name_layout_is_stable() {
        let window = TimeWindow {
            start: ts("2023-12-10T05:00:00"),
            end: ts("2023-12-10T06:00:00"),
            as_of: ts("2024-01-02T03:04:05"),
        };
        let name = PageName::for_window(&window, 3);
        assert_eq!(
            name.to_string(),
            "2024-01-02T03:04:05_2023-12-10T06:00:00_2023-12-10T05:00:00_3.txt"
        );
        assert_eq!(name.to_string().parse::<PageName>().expect("parse"), name);
    }

    #[test]
    fn page_name_rejects_foreign_layouts() {
        assert!("notes.txt".parse::<PageName>().is_err());
        assert!("2024-01-02T03:04:05_2023-12-10T06:00:00_2023-12-10T05:00:00_1.json"
            .parse::<PageName>()
            .is_err());
        assert_eq!(
            "2024-01-02T03:04:05_2023-12-10T06:00:00_2023-12-10T05:00:00_x.txt"
                .parse::<PageName>(),
            Err(NameError::PageNumber { raw: "x".into() })
        );
    }

    #[test]
    fn detail_name_keeps_underscored_entity_ids() {
        let name: DetailName = "100044_9876543210_2024-01-02T03:04:05_.txt"
            .parse()
            .expect("parse");
        assert_eq!(name.entity_id, "100044_9876543210");
        assert_eq!(name.as_of, ts("2024-01-02T03:04:05"));
        assert_eq!(
            name.to_string(),
            "100044_9876543210_2024-01-02T03:04:05_.txt"
        );
    }

    #[test]
    fn detail_name_requires_trailing_marker() {
        assert!("100044_2024-01-02T03:04:05.txt".parse::<DetailName>().is_err());
        assert!("_2024-01-02T03:04:05_.txt".parse::<DetailName>().is_err());
    }

    #[test]
    fn utc_now_has_no_subsecond_part() {
        let now = utc_now_seconds();
        assert_eq!(now.and_utc().timestamp_subsec_nanos(), 0);
    }
}
