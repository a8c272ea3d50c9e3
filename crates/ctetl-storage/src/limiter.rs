//! Sliding-window admission control shared across processes.
//!
//! A budget is an ordered list of epoch-second timestamps kept in an external
//! store under one key. Every store runs [`evaluate`] as a single atomic
//! read-modify-write, so concurrent workers can never both observe a
//! not-yet-full list and both append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Slack added to every computed wait so callers never wake on the boundary.
pub const BOUNDARY_BUFFER_SECS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub window_secs: i64,
}

impl RateLimit {
    pub fn new(max_requests: usize, window: Duration) -> Result<Self, LimiterError> {
        if max_requests == 0 {
            return Err(LimiterError::InvalidLimit(
                "max_requests must be at least 1".into(),
            ));
        }
        let window_secs = i64::try_from(window.as_secs())
            .map_err(|_| LimiterError::InvalidLimit("window is too large".into()))?;
        if window_secs == 0 {
            return Err(LimiterError::InvalidLimit(
                "window must be at least one second".into(),
            ));
        }
        Ok(Self {
            max_requests,
            window_secs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Budget exhausted; retry after `wait`.
    Exhausted { wait: Duration },
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("invalid rate limit: {0}")]
    InvalidLimit(String),
    #[error("rate limit store")]
    Store(#[from] sqlx::Error),
}

/// Apply one admission attempt at `now` to `timestamps`, mutating it in place.
///
/// An over-long list (left by a run with a larger limit) is first cut back to
/// its earliest `max_requests` entries, so repeated calls converge.
pub fn evaluate(timestamps: &mut Vec<i64>, now: i64, limit: RateLimit) -> Admission {
    timestamps.truncate(limit.max_requests);

    if timestamps.len() < limit.max_requests {
        timestamps.push(now);
        return Admission::Admitted;
    }

    let oldest = timestamps[0];
    let elapsed = now - oldest;
    if elapsed - BOUNDARY_BUFFER_SECS < limit.window_secs {
        let wait_secs = (limit.window_secs - elapsed + BOUNDARY_BUFFER_SECS)
            .clamp(0, limit.window_secs + BOUNDARY_BUFFER_SECS);
        return Admission::Exhausted {
            wait: Duration::from_secs(wait_secs as u64),
        };
    }

    timestamps.remove(0);
    timestamps.push(now);
    Admission::Admitted
}

/// Persisted budgets keyed by resource.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Run [`evaluate`] atomically against the list stored under `key`.
    async fn admit(&self, key: &str, limit: RateLimit, now: i64)
        -> Result<Admission, LimiterError>;
}

/// Process-local budgets; shares nothing across processes.
#[derive(Debug, Default)]
pub struct MemoryBudgetStore {
    budgets: Mutex<HashMap<String, Vec<i64>>>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, key: &str, timestamps: Vec<i64>) {
        self.budgets.lock().await.insert(key.to_string(), timestamps);
    }

    pub async fn snapshot(&self, key: &str) -> Vec<i64> {
        self.budgets
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn admit(
        &self,
        key: &str,
        limit: RateLimit,
        now: i64,
    ) -> Result<Admission, LimiterError> {
        let mut budgets = self.budgets.lock().await;
        let timestamps = budgets.entry(key.to_string()).or_default();
        Ok(evaluate(timestamps, now, limit))
    }
}

/// Budgets in the `rate_limit_budgets` table, serialized with a row lock.
#[derive(Debug, Clone)]
pub struct PgBudgetStore {
    pool: PgPool,
}

impl PgBudgetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BudgetStore for PgBudgetStore {
    async fn admit(
        &self,
        key: &str,
        limit: RateLimit,
        now: i64,
    ) -> Result<Admission, LimiterError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO rate_limit_budgets (budget_key, timestamps) VALUES ($1, '{}') \
             ON CONFLICT (budget_key) DO NOTHING",
        )
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let mut timestamps: Vec<i64> = sqlx::query_scalar(
            "SELECT timestamps FROM rate_limit_budgets WHERE budget_key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let admission = evaluate(&mut timestamps, now, limit);

        sqlx::query(
            "UPDATE rate_limit_budgets SET timestamps = $2, updated_at = now() \
             WHERE budget_key = $1",
        )
        .bind(key)
        .bind(&timestamps)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(admission)
    }
}

/// Source of epoch seconds for budget timestamps.
pub trait Clock: Send + Sync {
    fn now_epoch_secs(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Gatekeeper for one named budget. Every outbound call to the limited
/// resource goes through [`SlidingWindowLimiter::acquire`] first.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn BudgetStore>,
    clock: Arc<dyn Clock>,
    budget_key: String,
    limit: RateLimit,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("budget_key", &self.budget_key)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn BudgetStore>, budget_key: impl Into<String>, limit: RateLimit) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            budget_key: budget_key.into(),
            limit,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn budget_key(&self) -> &str {
        &self.budget_key
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// One admission attempt. When the budget is exhausted this sleeps for the
    /// computed wait before returning `false`; dropping the future cancels the
    /// sleep.
    pub async fn allow(&self) -> Result<bool, LimiterError> {
        let now = self.clock.now_epoch_secs();
        match self.store.admit(&self.budget_key, self.limit, now).await? {
            Admission::Admitted => {
                debug!(budget = %self.budget_key, "request admitted");
                Ok(true)
            }
            Admission::Exhausted { wait } => {
                info!(
                    budget = %self.budget_key,
                    wait_secs = wait.as_secs(),
                    "rate budget exhausted; waiting"
                );
                tokio::time::sleep(wait).await;
                Ok(false)
            }
        }
    }

    /// Loop on [`Self::allow`] until admitted.
    pub async fn acquire(&self) -> Result<(), LimiterError> {
        while !self.allow().await? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ratelimit:test";

    fn limit(max_requests: usize, window_secs: u64) -> RateLimit {
        RateLimit::new(max_requests, Duration::from_secs(window_secs)).expect("limit")
    }

    /// Epoch seconds derived from tokio's clock so paused tests advance it.
    struct TokioClock {
        origin_epoch: i64,
        started: tokio::time::Instant,
    }

    impl Clock for TokioClock {
        fn now_epoch_secs(&self) -> i64 {
            self.origin_epoch + self.started.elapsed().as_secs() as i64
        }
    }

    #[test]
    fn rejects_degenerate_limits() {
        assert!(RateLimit::new(0, Duration::from_secs(60)).is_err());
        assert!(RateLimit::new(6, Duration::from_millis(500)).is_err());
    }

    #[test]
    fn empty_budget_always_admits() {
        let mut ts = Vec::new();
        assert_eq!(evaluate(&mut ts, 1_000, limit(1, 60)), Admission::Admitted);
        assert_eq!(ts, vec![1_000]);
    }

    #[test]
    fn full_budget_inside_window_waits_for_oldest_to_expire() {
        let mut ts = vec![1_000, 1_010, 1_020];
        let admission = evaluate(&mut ts, 1_030, limit(3, 60));
        assert_eq!(
            admission,
            Admission::Exhausted {
                wait: Duration::from_secs(31)
            }
        );
        assert_eq!(ts, vec![1_000, 1_010, 1_020]);
    }

    #[test]
    fn full_budget_past_window_evicts_oldest() {
        let mut ts = vec![1_000, 1_010, 1_020];
        assert_eq!(evaluate(&mut ts, 1_061, limit(3, 60)), Admission::Admitted);
        assert_eq!(ts, vec![1_010, 1_020, 1_061]);
    }

    #[test]
    fn boundary_buffer_holds_one_extra_second() {
        let mut ts = vec![1_000];
        assert!(matches!(
            evaluate(&mut ts, 1_060, limit(1, 60)),
            Admission::Exhausted { wait } if wait == Duration::from_secs(1)
        ));
        assert_eq!(evaluate(&mut ts, 1_061, limit(1, 60)), Admission::Admitted);
    }

    #[test]
    fn oversized_lists_converge_to_the_limit() {
        let mut ts = vec![1_000, 1_001, 1_002, 1_003, 1_004, 1_005, 1_006, 1_007];
        evaluate(&mut ts, 1_008, limit(3, 60));
        assert_eq!(ts, vec![1_000, 1_001, 1_002]);

        let mut ts = vec![1_000, 1_001, 1_002, 1_003, 1_004];
        assert_eq!(evaluate(&mut ts, 2_000, limit(3, 60)), Admission::Admitted);
        assert_eq!(ts, vec![1_001, 1_002, 2_000]);
        for now in 2_001..2_010 {
            evaluate(&mut ts, now, limit(3, 60));
            assert!(ts.len() <= 3);
        }
    }

    #[tokio::test]
    async fn memory_store_persists_between_calls() {
        let store = MemoryBudgetStore::new();
        let lim = limit(2, 60);
        assert_eq!(store.admit(KEY, lim, 10).await.expect("admit"), Admission::Admitted);
        assert_eq!(store.admit(KEY, lim, 11).await.expect("admit"), Admission::Admitted);
        assert!(matches!(
            store.admit(KEY, lim, 12).await.expect("admit"),
            Admission::Exhausted { .. }
        ));
        assert_eq!(store.snapshot(KEY).await, vec![10, 11]);
        assert!(store.snapshot("other").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_blocks_for_the_window() {
        let store = Arc::new(MemoryBudgetStore::new());
        let clock = Arc::new(TokioClock {
            origin_epoch: 1_700_000_000,
            started: tokio::time::Instant::now(),
        });
        let limiter = SlidingWindowLimiter::new(store.clone(), KEY, limit(6, 60))
            .with_clock(clock);

        for _ in 0..6 {
            assert!(limiter.allow().await.expect("allow"));
        }

        let before = tokio::time::Instant::now();
        assert!(!limiter.allow().await.expect("allow"));
        assert!(before.elapsed() >= Duration::from_secs(59));

        assert!(limiter.allow().await.expect("allow"));
        assert_eq!(store.snapshot(KEY).await.len(), 6);
    }

    #[test]
    fn store_errors_name_their_cause_once() {
        let err = LimiterError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.to_string(), "rate limit store");
        assert!(std::error::Error::source(&err).is_some());
    }

    /// Database tests run only against an explicitly provided database.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("CTETL_TEST_DATABASE_URL").ok()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .expect("connect test database");
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .expect("migrate");
        Some(pool)
    }

    fn fresh_key() -> String {
        format!("ratelimit:test-{}", uuid::Uuid::new_v4().simple())
    }

    async fn stored_timestamps(pool: &PgPool, key: &str) -> Vec<i64> {
        sqlx::query_scalar("SELECT timestamps FROM rate_limit_budgets WHERE budget_key = $1")
            .bind(key)
            .fetch_one(pool)
            .await
            .expect("budget row")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_store_admits_exactly_the_limit_under_contention() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let store = Arc::new(PgBudgetStore::new(pool.clone()));
        let key = fresh_key();
        let lim = limit(6, 60);
        let now = 1_700_000_000;

        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.admit(&key, lim, now).await })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.expect("join").expect("admit") == Admission::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 6);
        assert_eq!(stored_timestamps(&pool, &key).await, vec![now; 6]);
    }

    #[tokio::test]
    async fn shared_store_trims_an_oversized_budget() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let store = PgBudgetStore::new(pool.clone());
        let key = fresh_key();
        let now = 1_700_000_000;
        let seeded: Vec<i64> = (0..10).map(|i| now - 5 + i).collect();
        sqlx::query("INSERT INTO rate_limit_budgets (budget_key, timestamps) VALUES ($1, $2)")
            .bind(&key)
            .bind(&seeded)
            .execute(&pool)
            .await
            .expect("seed budget");

        let lim = limit(3, 30);
        assert!(matches!(
            store.admit(&key, lim, now).await.expect("admit"),
            Admission::Exhausted { .. }
        ));
        assert_eq!(stored_timestamps(&pool, &key).await, seeded[..3].to_vec());

        assert_eq!(
            store.admit(&key, lim, now + 60).await.expect("admit"),
            Admission::Admitted
        );
        let after = stored_timestamps(&pool, &key).await;
        assert_eq!(after.len(), 3);
        assert_eq!(after.last(), Some(&(now + 60)));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_converges_from_an_oversized_budget() {
        let store = Arc::new(MemoryBudgetStore::new());
        let origin = 1_700_000_000;
        store
            .seed(KEY, (0..10).map(|i| origin - 5 + i).collect())
            .await;
        let clock = Arc::new(TokioClock {
            origin_epoch: origin,
            started: tokio::time::Instant::now(),
        });
        let limiter =
            SlidingWindowLimiter::new(store.clone(), KEY, limit(3, 30)).with_clock(clock);

        limiter.acquire().await.expect("acquire");
        let persisted = store.snapshot(KEY).await;
        assert_eq!(persisted.len(), 3);
        assert!(persisted.windows(2).all(|w| w[0] <= w[1]));
    }
}
