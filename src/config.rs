use std::env;

use crate::errors::{ServiceError, ServiceResult};

/// Relational store settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Work queue settings (Redis Streams).
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub stream_key: String,
    pub dlq_key: String,
    pub retry_key: String,
    pub consumer_group: String,
}

/// Object storage settings.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub force_path_style: bool,
    pub presigned_ttl_seconds: u64,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
}

/// Top-level configuration, assembled once at startup and handed to the
/// explicitly constructed clients. Nothing in the crate reads the
/// environment after this point.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub s3: S3Config,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from the environment, reading a `.env` file first
    /// when one is present.
    pub fn from_env() -> ServiceResult<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig {
                url: must_get_env("DATABASE_URL")?,
                max_connections: get_env_or("DB_MAX_CONNECTIONS", "5").parse().map_err(|_| {
                    ServiceError::Configuration("DB_MAX_CONNECTIONS must be a number".to_string())
                })?,
            },
            redis: RedisConfig {
                url: must_get_env("REDIS_URL")?,
                stream_key: get_env_or("REPORTS_STREAM_KEY", "reports:jobs"),
                dlq_key: get_env_or("REPORTS_DLQ_KEY", "reports:jobs:dlq"),
                retry_key: get_env_or("REPORTS_RETRY_KEY", "reports:jobs:retry"),
                consumer_group: get_env_or("REPORTS_CONSUMER_GROUP", "report-workers"),
            },
            s3: S3Config {
                endpoint: must_get_env("S3_ENDPOINT")?,
                region: must_get_env("S3_REGION")?,
                access_key: must_get_env("S3_ACCESS_KEY")?,
                secret_key: must_get_env("S3_SECRET_KEY")?,
                bucket: must_get_env("S3_BUCKET")?,
                force_path_style: get_env_or("S3_FORCE_PATH_STYLE", "true").trim() == "true",
                presigned_ttl_seconds: get_env_or("S3_PRESIGNED_TTL_SECONDS", "600")
                    .parse()
                    .map_err(|_| {
                        ServiceError::Configuration(
                            "S3_PRESIGNED_TTL_SECONDS must be a number".to_string(),
                        )
                    })?,
            },
            worker: WorkerConfig {
                concurrency: get_env_or("WORKER_CONCURRENCY", "3").parse().map_err(|_| {
                    ServiceError::Configuration("WORKER_CONCURRENCY must be a number".to_string())
                })?,
            },
        })
    }
}

fn must_get_env(name: &str) -> ServiceResult<String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ServiceError::Configuration(format!(
            "Env var {} is required",
            name
        ))),
    }
}

fn get_env_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_var_fails() {
        env::remove_var("CLASS_REPORTS_TEST_MISSING");
        assert!(must_get_env("CLASS_REPORTS_TEST_MISSING").is_err());
    }

    #[test]
    fn test_default_fallback() {
        env::remove_var("CLASS_REPORTS_TEST_DEFAULT");
        assert_eq!(get_env_or("CLASS_REPORTS_TEST_DEFAULT", "x"), "x");
    }
}
