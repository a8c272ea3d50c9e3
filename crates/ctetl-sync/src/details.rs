//! Detail fan-out: every post a stored listing page references is fetched
//! once through the shared budget and persisted as its own object. The page
//! is marked processed only after all of its details are stored. A page
//! whose body cannot be parsed is left unmarked and skipped.

use anyhow::{Context, Result};
use ctetl_core::{utc_now_seconds, DetailName, PageName};
use ctetl_storage::CompletionMarker;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::StageContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageOutcome {
    AlreadyProcessed,
    Unreadable,
    Processed { details: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetailsSummary {
    pub pages_seen: usize,
    pub pages_skipped: usize,
    pub pages_processed: usize,
    pub pages_unreadable: usize,
    pub details_written: usize,
}

pub async fn process_page(
    ctx: &StageContext,
    pages_bucket: &str,
    details_bucket: &str,
    page_name: &str,
) -> Result<PageOutcome> {
    if ctx
        .store
        .is_done(pages_bucket, page_name)
        .await
        .with_context(|| format!("reading tags of {pages_bucket}/{page_name}"))?
    {
        info!(page = page_name, "page already processed");
        return Ok(PageOutcome::AlreadyProcessed);
    }

    let body = ctx
        .store
        .get(pages_bucket, page_name)
        .await
        .with_context(|| format!("reading {pages_bucket}/{page_name}"))?;
    let ids = match ctx.source.post_ids(&body) {
        Ok(ids) => ids,
        Err(err) => {
            warn!(page = page_name, error = %err, "page body is unreadable; leaving it unmarked");
            return Ok(PageOutcome::Unreadable);
        }
    };
    info!(page = page_name, posts = ids.len(), "fanning out detail requests");

    for id in &ids {
        ctx.limiter
            .acquire()
            .await
            .context("waiting on the rate budget")?;
        let response = ctx
            .http
            .get(&ctx.source.detail_url(id))
            .await
            .with_context(|| format!("fetching detail for post {id}"))?;

        let name = DetailName {
            entity_id: id.clone(),
            as_of: utc_now_seconds(),
        }
        .to_string();
        ctx.store
            .put_text(details_bucket, &name, &response.body)
            .await
            .with_context(|| format!("persisting {details_bucket}/{name}"))?;
    }

    ctx.store
        .mark_done(pages_bucket, page_name)
        .await
        .with_context(|| format!("marking {pages_bucket}/{page_name} processed"))?;
    Ok(PageOutcome::Processed { details: ids.len() })
}

/// Run [`process_page`] over every page in `pages_bucket`, oldest first.
pub async fn process_pending_pages(
    ctx: &StageContext,
    pages_bucket: &str,
    details_bucket: &str,
) -> Result<DetailsSummary> {
    async {
        let names = ctx
            .store
            .list(pages_bucket, None)
            .await
            .with_context(|| format!("listing {pages_bucket}"))?;

        let mut summary = DetailsSummary::default();
        for name in &names {
            if name.parse::<PageName>().is_err() {
                warn!(object = %name, "skipping object outside the page layout");
                continue;
            }
            summary.pages_seen += 1;
            match process_page(ctx, pages_bucket, details_bucket, name).await? {
                PageOutcome::AlreadyProcessed => summary.pages_skipped += 1,
                PageOutcome::Unreadable => summary.pages_unreadable += 1,
                PageOutcome::Processed { details } => {
                    summary.pages_processed += 1;
                    summary.details_written += details;
                }
            }
        }
        info!(
            pages_processed = summary.pages_processed,
            pages_skipped = summary.pages_skipped,
            pages_unreadable = summary.pages_unreadable,
            details = summary.details_written,
            "detail fan-out finished"
        );
        Ok(summary)
    }
    .instrument(info_span!("details", source = ctx.source.source_id()))
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use ctetl_core::{parse_timestamp, TimeWindow};
    use ctetl_storage::ObjectStore;

    use super::*;
    use crate::test_support::{spawn_stub, test_context, DETAILS, PAGES};

    const FIRST_PAGE: &str = include_str!("../../../fixtures/crowdtangle/posts_page_first.json");

    #[derive(Clone, Default)]
    struct Counters {
        hits: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    async fn detail(
        State(counters): State<Counters>,
        Path(id): Path<String>,
    ) -> (StatusCode, String) {
        let seen = counters.hits.fetch_add(1, Ordering::SeqCst);
        if counters.fail_after.is_some_and(|limit| seen >= limit) {
            return (StatusCode::NOT_FOUND, String::new());
        }
        (
            StatusCode::OK,
            format!(r#"{{"result":{{"posts":[{{"platformId":"{id}"}}]}}}}"#),
        )
    }

    fn page_name_as_of(as_of: &str) -> String {
        let window = TimeWindow {
            start: parse_timestamp("2023-12-10T05:00:00").expect("ts"),
            end: parse_timestamp("2023-12-10T06:00:00").expect("ts"),
            as_of: parse_timestamp(as_of).expect("ts"),
        };
        PageName::for_window(&window, 1).to_string()
    }

    fn page_name() -> String {
        page_name_as_of("2024-01-01T00:00:00")
    }

    async fn details_for(store: &dyn ObjectStore, id: &str) -> usize {
        store
            .list(DETAILS, Some(id))
            .await
            .expect("list")
            .iter()
            .filter_map(|n| n.parse::<DetailName>().ok())
            .filter(|d| d.entity_id == id)
            .count()
    }

    #[tokio::test]
    async fn second_pass_over_a_marked_page_is_a_no_op() {
        let counters = Counters::default();
        let base = spawn_stub(
            Router::new()
                .route("/post/{id}", get(detail))
                .with_state(counters.clone()),
        )
        .await;
        let (_dir, ctx, _budgets) = test_context(&base).await;
        let page = page_name();
        ctx.store
            .put_text(PAGES, &page, FIRST_PAGE.as_bytes())
            .await
            .expect("seed page");

        let first = process_page(&ctx, PAGES, DETAILS, &page).await.expect("first pass");
        assert_eq!(first, PageOutcome::Processed { details: 2 });
        assert!(ctx.store.is_done(PAGES, &page).await.expect("tags"));
        assert_eq!(counters.hits.load(Ordering::SeqCst), 2);

        let second = process_page(&ctx, PAGES, DETAILS, &page).await.expect("second pass");
        assert_eq!(second, PageOutcome::AlreadyProcessed);
        assert_eq!(counters.hits.load(Ordering::SeqCst), 2);
        assert_eq!(details_for(ctx.store.as_ref(), "100044_9876543210").await, 1);
        assert_eq!(details_for(ctx.store.as_ref(), "100044_9876543299").await, 1);
    }

    #[tokio::test]
    async fn partial_failure_leaves_the_page_unmarked() {
        let counters = Counters {
            fail_after: Some(1),
            ..Counters::default()
        };
        let base = spawn_stub(
            Router::new()
                .route("/post/{id}", get(detail))
                .with_state(counters.clone()),
        )
        .await;
        let (_dir, ctx, _budgets) = test_context(&base).await;
        let page = page_name();
        ctx.store
            .put_text(PAGES, &page, FIRST_PAGE.as_bytes())
            .await
            .expect("seed page");

        process_page(&ctx, PAGES, DETAILS, &page)
            .await
            .expect_err("second detail fails");
        assert!(!ctx.store.is_done(PAGES, &page).await.expect("tags"));
        assert_eq!(details_for(ctx.store.as_ref(), "100044_9876543210").await, 1);
        assert_eq!(details_for(ctx.store.as_ref(), "100044_9876543299").await, 0);
    }

    #[tokio::test]
    async fn pending_pages_skip_foreign_objects() {
        let counters = Counters::default();
        let base = spawn_stub(
            Router::new()
                .route("/post/{id}", get(detail))
                .with_state(counters.clone()),
        )
        .await;
        let (_dir, ctx, _budgets) = test_context(&base).await;
        ctx.store
            .put_text(PAGES, &page_name(), FIRST_PAGE.as_bytes())
            .await
            .expect("seed page");
        ctx.store.put_text(PAGES, "readme.txt", b"hi").await.expect("seed");

        let summary = process_pending_pages(&ctx, PAGES, DETAILS).await.expect("run");
        assert_eq!(
            summary,
            DetailsSummary {
                pages_seen: 1,
                pages_skipped: 0,
                pages_processed: 1,
                pages_unreadable: 0,
                details_written: 2,
            }
        );

        let again = process_pending_pages(&ctx, PAGES, DETAILS).await.expect("rerun");
        assert_eq!(again.pages_skipped, 1);
        assert_eq!(counters.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreadable_page_does_not_block_later_pages() {
        let counters = Counters::default();
        let base = spawn_stub(
            Router::new()
                .route("/post/{id}", get(detail))
                .with_state(counters.clone()),
        )
        .await;
        let (_dir, ctx, _budgets) = test_context(&base).await;
        let broken = page_name_as_of("2023-12-31T00:00:00");
        let good = page_name();
        assert!(broken < good);
        ctx.store
            .put_text(PAGES, &broken, b"<html>maintenance</html>")
            .await
            .expect("seed broken page");
        ctx.store
            .put_text(PAGES, &good, FIRST_PAGE.as_bytes())
            .await
            .expect("seed page");

        for _ in 0..2 {
            let summary = process_pending_pages(&ctx, PAGES, DETAILS).await.expect("run");
            assert_eq!(summary.pages_unreadable, 1);
        }
        assert!(!ctx.store.is_done(PAGES, &broken).await.expect("tags"));
        assert!(ctx.store.is_done(PAGES, &good).await.expect("tags"));
        assert_eq!(counters.hits.load(Ordering::SeqCst), 2);
    }
}
