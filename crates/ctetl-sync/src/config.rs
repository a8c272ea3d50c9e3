use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use ctetl_adapters::DEFAULT_API_BASE;
use ctetl_core::parse_timestamp;
use ctetl_storage::{sha256_hex, BackoffPolicy, HttpClientConfig, RateLimit, S3ObjectStoreConfig};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub enum ObjectStoreSettings {
    S3(S3ObjectStoreConfig),
    Fs { root: PathBuf },
}

#[derive(Debug, Clone)]
pub enum BudgetStoreSettings {
    /// Budgets in Postgres; `None` shares the main database.
    Postgres(Option<PgConnectOptions>),
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSettings {
    pub maiden_start: NaiveDateTime,
    pub time_window: chrono::Duration,
    pub freshness_lag: chrono::Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    pub start_hours: i64,
    pub end_hours: i64,
    pub utc_offset_hours: i32,
    pub reports_dir: PathBuf,
    pub max_timesteps: u32,
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub api_key: String,
    pub api_base: String,
    pub http: HttpClientConfig,
    pub object_store: ObjectStoreSettings,
    pub posts_bucket: String,
    pub details_bucket: String,
    pub database: PgConnectOptions,
    pub budget_store: BudgetStoreSettings,
    pub rate_limit: RateLimit,
    pub cursor: CursorSettings,
    pub report: ReportSettings,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let api_key = env.required("CT_KEY")?;
        let api_base = env.or("CT_API_BASE", DEFAULT_API_BASE);

        let http = HttpClientConfig {
            timeout: Duration::from_secs(env.parsed("HTTP_TIMEOUT_SECS", 30u64)?),
            user_agent: Some(env.or("CT_USER_AGENT", DEFAULT_USER_AGENT)),
            backoff: BackoffPolicy {
                max_retries: env.parsed("HTTP_MAX_RETRIES", 5usize)?,
                base_delay: Duration::from_millis(env.parsed("HTTP_BACKOFF_FACTOR_MS", 2_000u64)?),
                ..BackoffPolicy::default()
            },
        };

        let object_store = match env.or("OBJECT_STORE", "s3").as_str() {
            "s3" => ObjectStoreSettings::S3(S3ObjectStoreConfig {
                host: env.required("MINIO_HOST")?,
                access_key: env.required("MINIO_ACCESS")?,
                secret_key: env.required("MINIO_SECRET")?,
                region: env.or("MINIO_REGION", "us-east-1"),
                secure: env.flag("MINIO_SECURE"),
            }),
            "fs" => ObjectStoreSettings::Fs {
                root: PathBuf::from(env.or("ARTIFACTS_DIR", "./artifacts")),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "OBJECT_STORE",
                    reason: format!("expected `s3` or `fs`, got `{other}`"),
                })
            }
        };

        let database = match env.get("DATABASE_URL") {
            Some(_) => env.connect_options("DATABASE_URL")?,
            None => {
                let user = env.get("PGUSER").ok_or(ConfigError::Missing("DATABASE_URL"))?;
                let host = env.get("PGHOST").ok_or(ConfigError::Missing("DATABASE_URL"))?;
                let options = PgConnectOptions::new()
                    .host(&host)
                    .port(env.parsed("PGPORT", 5432u16)?)
                    .username(&user)
                    .database(&env.or("PGDATABASE", "ct"));
                match env.get("PGPASSWD") {
                    Some(password) => options.password(&password),
                    None => options,
                }
            }
        };

        let budget_store = match env.or("RATE_LIMIT_STORE", "postgres").as_str() {
            "postgres" => BudgetStoreSettings::Postgres(match env.get("RATE_LIMIT_DATABASE_URL") {
                Some(_) => Some(env.connect_options("RATE_LIMIT_DATABASE_URL")?),
                None => None,
            }),
            "memory" => BudgetStoreSettings::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    var: "RATE_LIMIT_STORE",
                    reason: format!("expected `postgres` or `memory`, got `{other}`"),
                })
            }
        };

        let rate_limit = RateLimit::new(
            env.parsed("RATE_LIMIT_MAX_REQUESTS", 6usize)?,
            Duration::from_secs(env.parsed("RATE_LIMIT_WINDOW_SECS", 60u64)?),
        )
        .map_err(|err| ConfigError::Invalid {
            var: "RATE_LIMIT_MAX_REQUESTS",
            reason: err.to_string(),
        })?;

        let maiden_raw = env.or("MAIDEN_START", "2023-12-10T05:00:00");
        let cursor = CursorSettings {
            maiden_start: parse_timestamp(&maiden_raw).map_err(|err| ConfigError::Invalid {
                var: "MAIDEN_START",
                reason: err.to_string(),
            })?,
            time_window: env.span(
                "TIME_WINDOW_MINUTES",
                env.positive("TIME_WINDOW_MINUTES", 60)?,
                TimeDelta::try_minutes,
            )?,
            freshness_lag: env.span(
                "FRESHNESS_LAG_HOURS",
                env.parsed("FRESHNESS_LAG_HOURS", 72i64)?,
                TimeDelta::try_hours,
            )?,
        };
        if cursor.maiden_start.checked_add_signed(cursor.time_window).is_none() {
            return Err(ConfigError::Invalid {
                var: "TIME_WINDOW_MINUTES",
                reason: "window end is out of the supported date range".into(),
            });
        }

        let report = ReportSettings {
            start_hours: env.parsed("REPORT_START_HOURS", 96i64)?,
            end_hours: env.parsed("REPORT_END_HOURS", 72i64)?,
            utc_offset_hours: env.parsed("REPORT_UTC_OFFSET_HOURS", 8i32)?,
            reports_dir: PathBuf::from(env.or("REPORTS_DIR", "./reports")),
            max_timesteps: env.parsed("MAX_TIMESTEPS", 51u32)?,
        };
        if report.start_hours <= report.end_hours {
            return Err(ConfigError::Invalid {
                var: "REPORT_START_HOURS",
                reason: format!(
                    "must be greater than REPORT_END_HOURS ({} <= {})",
                    report.start_hours, report.end_hours
                ),
            });
        }
        for (var, hours) in [
            ("REPORT_START_HOURS", report.start_hours),
            ("REPORT_END_HOURS", report.end_hours),
        ] {
            env.span(var, hours, TimeDelta::try_hours)?;
        }
        if !(-23..=23).contains(&report.utc_offset_hours) {
            return Err(ConfigError::Invalid {
                var: "REPORT_UTC_OFFSET_HOURS",
                reason: "must be between -23 and 23".into(),
            });
        }

        Ok(Self {
            api_key,
            api_base,
            http,
            object_store,
            posts_bucket: env.or("POSTS_BUCKET", "ct-posts"),
            details_bucket: env.or("DETAILS_BUCKET", "ct-post-details"),
            database,
            budget_store,
            rate_limit,
            cursor,
            report,
            scheduler_enabled: env.flag("CTETL_SCHEDULER_ENABLED"),
            cron: env.or("CTETL_CRON", "5 * * * *"),
        })
    }

    /// Budget shared by every caller using this credential. The key is derived
    /// from a digest so the credential itself never reaches the limiter store.
    pub fn budget_key(&self) -> String {
        let digest = sha256_hex(self.api_key.as_bytes());
        format!("ratelimit:{}", &digest[..16])
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn or(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, var: &str) -> bool {
        self.get(var)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
                var,
                reason: format!("`{raw}`: {err}"),
            }),
        }
    }

    fn connect_options(&self, var: &'static str) -> Result<PgConnectOptions, ConfigError> {
        let raw = self.required(var)?;
        raw.parse().map_err(|err: sqlx::Error| ConfigError::Invalid {
            var,
            reason: err.to_string(),
        })
    }

    /// Checked conversion into a duration; chrono rejects spans beyond its range.
    fn span(
        &self,
        var: &'static str,
        value: i64,
        to_delta: fn(i64) -> Option<TimeDelta>,
    ) -> Result<TimeDelta, ConfigError> {
        to_delta(value).ok_or_else(|| ConfigError::Invalid {
            var,
            reason: format!("`{value}` is out of range"),
        })
    }

    fn positive(&self, var: &'static str, default: i64) -> Result<i64, ConfigError> {
        let value = self.parsed(var, default)?;
        if value <= 0 {
            return Err(ConfigError::Invalid {
                var,
                reason: "must be positive".into(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<EtlConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EtlConfig::from_lookup(|var| vars.get(var).cloned())
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("CT_KEY", "secret-token"),
        ("OBJECT_STORE", "fs"),
        ("DATABASE_URL", "postgres://ct:ct@localhost:5432/ct"),
    ];

    #[test]
    fn defaults_follow_the_deployed_pipeline() {
        let config = config_from(MINIMAL).expect("config");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.posts_bucket, "ct-posts");
        assert_eq!(config.details_bucket, "ct-post-details");
        assert_eq!(config.rate_limit, RateLimit { max_requests: 6, window_secs: 60 });
        assert_eq!(config.cursor.time_window, chrono::Duration::hours(1));
        assert_eq!(config.cursor.freshness_lag, chrono::Duration::hours(72));
        assert_eq!(
            config.cursor.maiden_start,
            parse_timestamp("2023-12-10T05:00:00").expect("ts")
        );
        assert_eq!(config.report.max_timesteps, 51);
        assert_eq!(config.http.backoff.max_retries, 5);
        assert_eq!(config.http.backoff.base_delay, Duration::from_secs(2));
        assert!(matches!(config.budget_store, BudgetStoreSettings::Postgres(None)));
        assert_eq!(config.database.get_host(), "localhost");
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn missing_credential_is_fatal() {
        let err = config_from(&[("OBJECT_STORE", "fs"), ("DATABASE_URL", "postgres://x")])
            .expect_err("no key");
        assert_eq!(err, ConfigError::Missing("CT_KEY"));
    }

    #[test]
    fn s3_store_requires_endpoint_credentials() {
        let err = config_from(&[("CT_KEY", "k"), ("DATABASE_URL", "postgres://x")])
            .expect_err("no minio host");
        assert_eq!(err, ConfigError::Missing("MINIO_HOST"));
    }

    #[test]
    fn pg_parts_survive_reserved_characters() {
        let config = config_from(&[
            ("CT_KEY", "k"),
            ("OBJECT_STORE", "fs"),
            ("PGUSER", "etl"),
            ("PGPASSWD", "p@ss/w#rd"),
            ("PGHOST", "db.internal"),
        ])
        .expect("config");
        assert_eq!(config.database.get_host(), "db.internal");
        assert_eq!(config.database.get_port(), 5432);
        assert_eq!(config.database.get_username(), "etl");
        assert_eq!(config.database.get_database(), Some("ct"));
    }

    #[test]
    fn database_urls_are_parsed_up_front() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RATE_LIMIT_DATABASE_URL", "postgres://limiter@budgets.internal:6543/rl"));
        let config = config_from(&pairs).expect("config");
        let BudgetStoreSettings::Postgres(Some(options)) = &config.budget_store else {
            panic!("expected a dedicated limiter database");
        };
        assert_eq!(options.get_host(), "budgets.internal");
        assert_eq!(options.get_port(), 6543);

        let err = config_from(&[
            ("CT_KEY", "k"),
            ("OBJECT_STORE", "fs"),
            ("DATABASE_URL", "not a url"),
        ])
        .expect_err("unparsable url");
        assert!(matches!(err, ConfigError::Invalid { var: "DATABASE_URL", .. }));
    }

    #[test]
    fn oversized_durations_are_configuration_errors() {
        for (var, value) in [
            ("FRESHNESS_LAG_HOURS", "3000000000000"),
            ("TIME_WINDOW_MINUTES", "9000000000000000"),
            ("REPORT_START_HOURS", "3000000000000"),
        ] {
            let mut pairs = MINIMAL.to_vec();
            pairs.push((var, value));
            let err = config_from(&pairs).expect_err("out of range");
            assert!(
                matches!(&err, ConfigError::Invalid { var: v, .. } if *v == var),
                "{var}: {err}"
            );
        }

        let mut pairs = MINIMAL.to_vec();
        pairs.push(("TIME_WINDOW_MINUTES", "9000000000000"));
        assert!(matches!(
            config_from(&pairs),
            Err(ConfigError::Invalid { var: "TIME_WINDOW_MINUTES", .. })
        ));
    }

    #[test]
    fn report_window_must_be_ordered() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("REPORT_START_HOURS", "72"));
        pairs.push(("REPORT_END_HOURS", "96"));
        assert!(matches!(
            config_from(&pairs),
            Err(ConfigError::Invalid { var: "REPORT_START_HOURS", .. })
        ));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RATE_LIMIT_MAX_REQUESTS", "six"));
        assert!(matches!(
            config_from(&pairs),
            Err(ConfigError::Invalid { var: "RATE_LIMIT_MAX_REQUESTS", .. })
        ));

        let mut pairs = MINIMAL.to_vec();
        pairs.push(("MAIDEN_START", "2023-12-10 05:00"));
        assert!(matches!(
            config_from(&pairs),
            Err(ConfigError::Invalid { var: "MAIDEN_START", .. })
        ));
    }

    #[test]
    fn budget_key_hides_the_credential() {
        let config = config_from(MINIMAL).expect("config");
        let key = config.budget_key();
        assert!(key.starts_with("ratelimit:"));
        assert!(!key.contains("secret-token"));
        assert_eq!(key.len(), "ratelimit:".len() + 16);
    }
}
