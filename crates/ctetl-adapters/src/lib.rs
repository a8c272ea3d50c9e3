//! Provider adapter contract + the CrowdTangle adapter.
//!
//! Adapters are pure: they build request URLs and interpret response bodies.
//! Fetching, rate limiting and persistence belong to the sync pipeline.

use chrono::NaiveDateTime;
use ctetl_core::{
    format_timestamp, AccountRow, DetailName, DetailRows, PostMetricRow, PostRow, TimeWindow,
};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "ctetl-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.crowdtangle.com";

/// Posts requested per listing page; the provider maximum.
pub const PAGE_SIZE: u32 = 100;

/// History keys that describe the observation rather than a metric.
const OBSERVATION_KEYS: [&str; 3] = ["timestep", "date", "score"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("response is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("response is missing `{0}`")]
    Missing(String),
    #[error("field `{field}` has unexpected value `{value}`")]
    Invalid { field: String, value: String },
}

/// What the pipeline needs from a paginated provider.
pub trait PostSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// First listing page for `window`.
    fn listing_url(&self, window: &TimeWindow) -> String;

    fn detail_url(&self, platform_id: &str) -> String;

    /// Pagination token of a listing page. A missing token or an unparsable
    /// body both mean "no more pages".
    fn next_page_url(&self, page_body: &[u8]) -> Option<String>;

    /// Identifiers of the posts a listing page references, in page order.
    fn post_ids(&self, page_body: &[u8]) -> Result<Vec<String>, AdapterError>;

    /// Normalize one stored detail payload.
    fn parse_detail(&self, body: &[u8], name: &DetailName) -> Result<DetailRows, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct CrowdTangleAdapter {
    base_url: String,
    api_key: String,
}

impl CrowdTangleAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ListingResult {
    #[serde(default)]
    posts: Vec<ListingPost>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct ListingPost {
    #[serde(rename = "platformId", default)]
    platform_id: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(rename = "nextPage", default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailResult {
    #[serde(default)]
    posts: Vec<Map<String, JsonValue>>,
}

impl PostSource for CrowdTangleAdapter {
    fn source_id(&self) -> &'static str {
        "crowdtangle"
    }

    fn listing_url(&self, window: &TimeWindow) -> String {
        format!(
            "{}/posts?token={}&sortBy=date&startDate={}&endDate={}&count={PAGE_SIZE}",
            self.base_url,
            self.api_key,
            format_timestamp(window.start),
            format_timestamp(window.end),
        )
    }

    fn detail_url(&self, platform_id: &str) -> String {
        format!(
            "{}/post/{platform_id}?token={}&includeHistory=true",
            self.base_url, self.api_key
        )
    }

    fn next_page_url(&self, page_body: &[u8]) -> Option<String> {
        let page: Envelope<ListingResult> = serde_json::from_slice(page_body).ok()?;
        page.result
            .pagination
            .and_then(|p| p.next_page)
            .filter(|url| !url.trim().is_empty())
    }

    fn post_ids(&self, page_body: &[u8]) -> Result<Vec<String>, AdapterError> {
        let page: Envelope<ListingResult> = serde_json::from_slice(page_body)?;
        page.result
            .posts
            .iter()
            .enumerate()
            .map(|(i, post)| {
                post.platform_id
                    .as_ref()
                    .and_then(id_string)
                    .ok_or_else(|| AdapterError::Missing(format!("result.posts[{i}].platformId")))
            })
            .collect()
    }

    fn parse_detail(&self, body: &[u8], name: &DetailName) -> Result<DetailRows, AdapterError> {
        let detail: Envelope<DetailResult> = serde_json::from_slice(body)?;
        let mut rows = DetailRows::default();
        for (i, post) in detail.result.posts.iter().enumerate() {
            let path = format!("result.posts[{i}]");
            let account = post
                .get("account")
                .and_then(JsonValue::as_object)
                .ok_or_else(|| AdapterError::Missing(format!("{path}.account")))?;
            let account_row = account_row(account, &format!("{path}.account"))?;
            let post_row = post_row(post, account_row.account_id, &path)?;
            rows.post_metrics
                .extend(metric_rows(post, &post_row.platform_id, name.as_of, &path)?);
            rows.accounts.push(account_row);
            rows.posts.push(post_row);
        }
        Ok(rows)
    }
}

fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_string(obj: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_i64(obj: &Map<String, JsonValue>, key: &str, path: &str) -> Result<Option<i64>, AdapterError> {
    match obj.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n.as_i64().map(Some).ok_or_else(|| invalid(path, key, n)),
        Some(JsonValue::String(s)) => s.parse().map(Some).map_err(|_| invalid(path, key, s)),
        Some(other) => Err(invalid(path, key, other)),
    }
}

fn req_i64(obj: &Map<String, JsonValue>, key: &str, path: &str) -> Result<i64, AdapterError> {
    opt_i64(obj, key, path)?.ok_or_else(|| AdapterError::Missing(format!("{path}.{key}")))
}

fn invalid(path: &str, key: &str, value: impl ToString) -> AdapterError {
    AdapterError::Invalid {
        field: format!("{path}.{key}"),
        value: value.to_string(),
    }
}

/// Provider dates come as `YYYY-MM-DD HH:MM:SS`; the `T` form is accepted too.
pub fn parse_provider_date(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

fn opt_date(
    obj: &Map<String, JsonValue>,
    key: &str,
    path: &str,
) -> Result<Option<NaiveDateTime>, AdapterError> {
    match obj.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => parse_provider_date(s)
            .map(Some)
            .ok_or_else(|| invalid(path, key, s)),
        Some(other) => Err(invalid(path, key, other)),
    }
}

fn req_date(obj: &Map<String, JsonValue>, key: &str, path: &str) -> Result<NaiveDateTime, AdapterError> {
    opt_date(obj, key, path)?.ok_or_else(|| AdapterError::Missing(format!("{path}.{key}")))
}

fn account_row(account: &Map<String, JsonValue>, path: &str) -> Result<AccountRow, AdapterError> {
    let verified = match account.get("verified") {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("false") => false,
        Some(other) => return Err(invalid(path, "verified", other)),
    };
    Ok(AccountRow {
        account_id: req_i64(account, "id", path)?,
        account_name: opt_string(account, "name"),
        account_handle: opt_string(account, "handle"),
        account_url: opt_string(account, "url"),
        account_platform: opt_string(account, "platform"),
        account_platform_id: opt_i64(account, "platformId", path)?,
        account_type: opt_string(account, "accountType"),
        account_page_admin_top_country: opt_string(account, "pageAdminTopCountry"),
        account_page_description: opt_string(account, "pageDescription"),
        account_page_created_date: opt_date(account, "pageCreatedDate", path)?,
        account_page_category: opt_string(account, "pageCategory"),
        account_verified: verified,
    })
}

fn post_row(post: &Map<String, JsonValue>, account_id: i64, path: &str) -> Result<PostRow, AdapterError> {
    let platform_id = post
        .get("platformId")
        .and_then(id_string)
        .ok_or_else(|| AdapterError::Missing(format!("{path}.platformId")))?;
    Ok(PostRow {
        platform_id,
        platform: opt_string(post, "platform"),
        posting_date: req_date(post, "date", path)?,
        post_type: opt_string(post, "type"),
        post_message: opt_string(post, "message"),
        post_url: opt_string(post, "postUrl"),
        subscriber_count: opt_i64(post, "subscriberCount", path)?,
        account_id,
    })
}

/// Melt every history entry into one row per numeric metric. Nested objects
/// flatten to dotted names (`actual.likeCount`); nulls and non-numeric values
/// are dropped.
fn metric_rows(
    post: &Map<String, JsonValue>,
    platform_id: &str,
    as_of: NaiveDateTime,
    path: &str,
) -> Result<Vec<PostMetricRow>, AdapterError> {
    let Some(history) = post.get("history").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for (i, entry) in history.iter().enumerate() {
        let entry_path = format!("{path}.history[{i}]");
        let entry = entry
            .as_object()
            .ok_or_else(|| AdapterError::Missing(entry_path.clone()))?;
        let timestep = req_i64(entry, "timestep", &entry_path)?;
        let metric_timestamp = req_date(entry, "date", &entry_path)?;
        let score = entry
            .get("score")
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| AdapterError::Missing(format!("{entry_path}.score")))?;

        let mut metrics = Vec::new();
        for (key, value) in entry {
            if OBSERVATION_KEYS.contains(&key.as_str()) {
                continue;
            }
            flatten_metrics(key, value, &mut metrics);
        }

        rows.extend(metrics.into_iter().map(|(metric_name, metric_value)| PostMetricRow {
            platform_id: platform_id.to_string(),
            as_of,
            score,
            metric_name,
            metric_value,
            metric_timestamp,
            metric_timestep: timestep,
        }));
    }
    Ok(rows)
}

fn flatten_metrics(name: &str, value: &JsonValue, out: &mut Vec<(String, i64)>) {
    match value {
        JsonValue::Object(children) => {
            for (key, child) in children {
                flatten_metrics(&format!("{name}.{key}"), child, out);
            }
        }
        JsonValue::Number(n) => {
            // Fractional expectations truncate toward zero, as the integer column requires.
            if let Some(v) = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
                out.push((name.to_string(), v));
            }
        }
        _ => {}
    }
}
