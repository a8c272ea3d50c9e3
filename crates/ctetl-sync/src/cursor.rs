//! Time-window cursor recovered from the raw page namespace.
//!
//! There is no checkpoint table: the next window starts where the window of
//! the lexicographically largest page name ended. Names that do not follow
//! the page layout are ignored.

use chrono::NaiveDateTime;
use ctetl_core::{PageName, TimeWindow};
use ctetl_storage::{ObjectStore, ObjectStoreError};
use thiserror::Error;
use tracing::debug;

use crate::config::CursorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDecision {
    Window(TimeWindow),
    /// The next window is still inside the freshness lag; nothing to do yet.
    CaughtUp {
        next_start: NaiveDateTime,
        start_limit: NaiveDateTime,
    },
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("reading the page namespace")]
    Store(#[from] ObjectStoreError),
    #[error("{what} is out of the supported date range (from {from})")]
    OutOfRange {
        what: &'static str,
        from: NaiveDateTime,
    },
}

/// The newest page by name, if the namespace holds any.
pub async fn latest_page<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
) -> Result<Option<PageName>, ObjectStoreError> {
    let names = store.list(bucket, None).await?;
    let latest = names
        .iter()
        .rev()
        .find_map(|name| name.parse::<PageName>().ok());
    debug!(bucket, objects = names.len(), latest = ?latest.as_ref().map(|p| p.to_string()), "scanned page namespace");
    Ok(latest)
}

/// Pure decision given the latest page and the run's `now`.
pub fn decide(
    latest: Option<&PageName>,
    settings: &CursorSettings,
    now: NaiveDateTime,
) -> Result<CursorDecision, CursorError> {
    let start = latest
        .map(|page| page.window_end)
        .unwrap_or(settings.maiden_start);
    let start_limit = now
        .checked_sub_signed(settings.freshness_lag)
        .ok_or(CursorError::OutOfRange {
            what: "freshness limit",
            from: now,
        })?;
    if start > start_limit {
        return Ok(CursorDecision::CaughtUp {
            next_start: start,
            start_limit,
        });
    }
    let end = start
        .checked_add_signed(settings.time_window)
        .ok_or(CursorError::OutOfRange {
            what: "window end",
            from: start,
        })?;
    Ok(CursorDecision::Window(TimeWindow {
        start,
        end,
        as_of: now,
    }))
}

pub async fn next_window<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    settings: &CursorSettings,
    now: NaiveDateTime,
) -> Result<CursorDecision, CursorError> {
    let latest = latest_page(store, bucket).await?;
    decide(latest.as_ref(), settings, now)
}

#[cfg(test)]
mod tests {
    use ctetl_core::parse_timestamp;
    use ctetl_storage::FsObjectStore;

    use super::*;

    const BUCKET: &str = "ct-posts";

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("timestamp")
    }

    fn settings() -> CursorSettings {
        CursorSettings {
            maiden_start: ts("2023-12-10T05:00:00"),
            time_window: chrono::Duration::hours(1),
            freshness_lag: chrono::Duration::hours(72),
        }
    }

    async fn store_with_bucket() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store.create_bucket(BUCKET).await.expect("bucket");
        (dir, store)
    }

    #[tokio::test]
    async fn empty_namespace_starts_at_maiden_start() {
        let (_dir, store) = store_with_bucket().await;
        let now = ts("2024-01-01T00:00:00");
        let decision = next_window(&store, BUCKET, &settings(), now)
            .await
            .expect("decision");
        assert_eq!(
            decision,
            CursorDecision::Window(TimeWindow {
                start: ts("2023-12-10T05:00:00"),
                end: ts("2023-12-10T06:00:00"),
                as_of: now,
            })
        );
    }

    #[tokio::test]
    async fn resumes_after_the_latest_persisted_window() {
        let (_dir, store) = store_with_bucket().await;
        let first = TimeWindow {
            start: ts("2023-12-10T05:00:00"),
            end: ts("2023-12-10T06:00:00"),
            as_of: ts("2023-12-20T00:00:00"),
        };
        for page in 1..=3 {
            let name = PageName::for_window(&first, page).to_string();
            store.put_text(BUCKET, &name, b"{}").await.expect("put");
        }
        store.put_text(BUCKET, "zz-notes.txt", b"x").await.expect("put");

        let now = ts("2024-01-01T00:00:00");
        let CursorDecision::Window(window) = next_window(&store, BUCKET, &settings(), now)
            .await
            .expect("decision")
        else {
            panic!("expected a window");
        };
        assert_eq!(window.start, ts("2023-12-10T06:00:00"));
        assert_eq!(window.end, ts("2023-12-10T07:00:00"));
        assert_eq!(window.as_of, now);
    }

    #[tokio::test]
    async fn latest_run_wins_over_older_pages() {
        let (_dir, store) = store_with_bucket().await;
        let older = PageName {
            as_of: ts("2023-12-20T00:00:00"),
            window_end: ts("2023-12-10T06:00:00"),
            window_start: ts("2023-12-10T05:00:00"),
            page: 9,
        };
        let newer = PageName {
            as_of: ts("2023-12-20T01:00:00"),
            window_end: ts("2023-12-10T07:00:00"),
            window_start: ts("2023-12-10T06:00:00"),
            page: 1,
        };
        for name in [&newer, &older] {
            store.put_text(BUCKET, &name.to_string(), b"{}").await.expect("put");
        }
        let latest = latest_page(&store, BUCKET).await.expect("latest");
        assert_eq!(latest, Some(newer));
    }

    #[test]
    fn freshness_gate_signals_caught_up() {
        let latest = PageName {
            as_of: ts("2024-01-04T00:00:00"),
            window_end: ts("2024-01-01T01:00:00"),
            window_start: ts("2024-01-01T00:00:00"),
            page: 1,
        };
        let now = ts("2024-01-04T00:30:00");
        assert_eq!(
            decide(Some(&latest), &settings(), now).expect("decision"),
            CursorDecision::CaughtUp {
                next_start: ts("2024-01-01T01:00:00"),
                start_limit: ts("2024-01-01T00:30:00"),
            }
        );

        // Exactly at the limit is still eligible.
        let now = ts("2024-01-04T01:00:00");
        assert!(matches!(
            decide(Some(&latest), &settings(), now),
            Ok(CursorDecision::Window(_))
        ));
    }

    #[test]
    fn unrepresentable_bounds_are_errors() {
        let huge_lag = CursorSettings {
            freshness_lag: chrono::TimeDelta::try_hours(10_000_000_000).expect("delta"),
            ..settings()
        };
        let err = decide(None, &huge_lag, ts("2024-01-01T00:00:00")).expect_err("underflow");
        assert!(matches!(err, CursorError::OutOfRange { what: "freshness limit", .. }));

        let huge_window = CursorSettings {
            time_window: chrono::TimeDelta::try_hours(10_000_000_000).expect("delta"),
            ..settings()
        };
        let err = decide(None, &huge_window, ts("2024-01-01T00:00:00")).expect_err("overflow");
        assert!(matches!(err, CursorError::OutOfRange { what: "window end", .. }));
    }
}
