//! Outbound I/O for the pipeline: the backoff HTTP client, object stores with
//! completion markers, and the shared sliding-window rate limiter.

pub mod http;
pub mod limiter;
pub mod objects;

pub use http::{
    classify_reqwest_error, classify_status, redact_query, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use limiter::{
    evaluate, Admission, BudgetStore, Clock, LimiterError, MemoryBudgetStore, PgBudgetStore,
    RateLimit, SlidingWindowLimiter, SystemClock, BOUNDARY_BUFFER_SECS,
};
pub use objects::{
    ensure_buckets, sha256_hex, CompletionMarker, FsObjectStore, ObjectStore, ObjectStoreError,
    S3ObjectStore, S3ObjectStoreConfig, StoredObject, Tags, PROCESSED_TAG_KEY,
    PROCESSED_TAG_VALUE,
};

pub const CRATE_NAME: &str = "ctetl-storage";
