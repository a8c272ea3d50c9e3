//! Paginated extractor: one rate-limited GET per page, each page persisted
//! verbatim before its pagination token is followed.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use ctetl_core::{PageName, TimeWindow};
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::StageContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExtractOutcome {
    CaughtUp {
        next_start: NaiveDateTime,
        start_limit: NaiveDateTime,
    },
    Extracted {
        window: TimeWindow,
        pages: u32,
    },
}

/// Fetch and persist every page of `window` into `bucket`. Returns the page
/// count. Any fetch or storage failure aborts the window: skipping a page
/// would break the token chain.
pub async fn extract_window(ctx: &StageContext, bucket: &str, window: &TimeWindow) -> Result<u32> {
    let span = info_span!(
        "extract",
        source = ctx.source.source_id(),
        start = %window.start,
        end = %window.end
    );
    async {
        let mut next_url = Some(ctx.source.listing_url(window));
        let mut page = 0u32;

        while let Some(url) = next_url {
            page += 1;
            ctx.limiter
                .acquire()
                .await
                .context("waiting on the rate budget")?;
            let response = ctx
                .http
                .get(&url)
                .await
                .with_context(|| format!("fetching listing page {page}"))?;

            let name = PageName::for_window(window, page).to_string();
            let stored = ctx
                .store
                .put_text(bucket, &name, &response.body)
                .await
                .with_context(|| format!("persisting {bucket}/{name}"))?;
            info!(page, object = %stored.name, bytes = stored.byte_size, "page persisted");

            next_url = ctx.source.next_page_url(&response.body);
        }

        info!(pages = page, "pagination exhausted");
        Ok(page)
    }
    .instrument(span)
    .await
}
