//! Harness configuration.
//!
//! Values come from, in order of precedence: process environment (after
//! loading an optional `.env` file), an optional YAML file, built-in defaults.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{options::DEFAULT_RETRY_STATUSES, QaError, Result, RetryConfig, ServiceOptions};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
pub const DEFAULT_ENV_PATH: &str = ".env";

/// Where request/response attachments are written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportingConfig {
    pub artifacts_dir: PathBuf,
}

/// Pushgateway export settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub pushgateway_url: String,
    pub job_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub service: ServiceOptions,
    pub retry: RetryConfig,
    pub reporting: ReportingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    service: FileService,
    retry: FileRetry,
    reporting: FileReporting,
    metrics: FileMetrics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileService {
    base_url: Option<String>,
    timeout_s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileRetry {
    attempts: Option<u32>,
    backoff_s: Option<f64>,
    backoff_multiplier: Option<f64>,
    retry_on_statuses: Option<Vec<u16>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileReporting {
    artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileMetrics {
    enabled: Option<bool>,
    pushgateway_url: Option<String>,
    job_name: Option<String>,
}

impl AppConfig {
    /// Loads `config/config.yaml` and `.env` from the working directory, both optional.
    pub fn load_default() -> Result<Self> {
        Self::load(DEFAULT_CONFIG_PATH, Some(Path::new(DEFAULT_ENV_PATH)))
    }

    /// Loads the YAML file at `config_path` (if present), after importing
    /// `env_path` into the process environment (if present). Variables that
    /// are already set win over the `.env` file.
    pub fn load(config_path: impl AsRef<Path>, env_path: Option<&Path>) -> Result<Self> {
        if let Some(env_path) = env_path.filter(|path| path.exists()) {
            dotenvy::from_path(env_path).map_err(|err| {
                QaError::Config(format!("could not load {}: {err}", env_path.display()))
            })?;
        }

        let config_path = config_path.as_ref();
        let yaml = if config_path.exists() {
            Some(fs::read_to_string(config_path)?)
        } else {
            tracing::debug!("no config file at {}, using defaults", config_path.display());
            None
        };

        Self::from_sources(yaml.as_deref(), |key| std::env::var(key).ok())
    }

    /// Builds the configuration from YAML text and an environment lookup.
    pub fn from_sources(yaml: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: FileConfig = match yaml {
            Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text)
                .map_err(|err| QaError::Config(format!("invalid config yaml: {err}")))?,
            _ => FileConfig::default(),
        };
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let base_url = env("BASE_URL")
            .or(file.service.base_url)
            .unwrap_or_else(|| ServiceOptions::default().base_url);
        let timeout_s = match env("TIMEOUT_S") {
            Some(raw) => parse("TIMEOUT_S", &raw)?,
            None => file.service.timeout_s.unwrap_or(10.0),
        };
        if !(timeout_s.is_finite() && timeout_s > 0.0) {
            return Err(QaError::Config(format!(
                "TIMEOUT_S must be a positive number of seconds, got {timeout_s}"
            )));
        }

        let attempts = match env("RETRY_ATTEMPTS") {
            Some(raw) => parse("RETRY_ATTEMPTS", &raw)?,
            None => file.retry.attempts.unwrap_or(3),
        };
        let backoff_s = match env("RETRY_BACKOFF_S") {
            Some(raw) => parse("RETRY_BACKOFF_S", &raw)?,
            None => file.retry.backoff_s.unwrap_or(0.4),
        };
        let multiplier = match env("RETRY_BACKOFF_MULTIPLIER") {
            Some(raw) => parse("RETRY_BACKOFF_MULTIPLIER", &raw)?,
            None => file.retry.backoff_multiplier.unwrap_or(2.0),
        };
        let statuses = match env("RETRY_ON_STATUSES") {
            Some(raw) => parse_statuses(&raw)?,
            None => file
                .retry
                .retry_on_statuses
                .unwrap_or_else(|| DEFAULT_RETRY_STATUSES.to_vec()),
        };
        if let Some(bad) = statuses.iter().find(|status| !(100..=599).contains(*status)) {
            return Err(QaError::Config(format!(
                "RETRY_ON_STATUSES contains invalid HTTP status {bad}"
            )));
        }

        let retry = RetryConfig {
            attempts,
            backoff: seconds("RETRY_BACKOFF_S", backoff_s)?,
            multiplier,
            retry_on_statuses: statuses.into_iter().collect::<BTreeSet<_>>(),
        };
        retry.validate()?;

        let artifacts_dir = env("ARTIFACTS_DIR")
            .map(PathBuf::from)
            .or(file.reporting.artifacts_dir)
            .unwrap_or_else(|| PathBuf::from("artifacts/attachments"));

        let enabled = match env("METRICS_ENABLED") {
            Some(raw) => as_bool(&raw),
            None => file.metrics.enabled.unwrap_or(true),
        };
        let pushgateway_url = env("PUSHGATEWAY_URL")
            .or(file.metrics.pushgateway_url)
            .unwrap_or_else(|| "http://pushgateway:9091".to_owned());
        let job_name = env("METRICS_JOB_NAME")
            .or(file.metrics.job_name)
            .unwrap_or_else(|| "httpbin_tests".to_owned());

        Ok(Self {
            service: ServiceOptions::new(base_url, seconds("TIMEOUT_S", timeout_s)?),
            retry,
            reporting: ReportingConfig { artifacts_dir },
            metrics: MetricsConfig {
                enabled,
                pushgateway_url,
                job_name,
            },
        })
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| QaError::Config(format!("{key}: cannot parse '{raw}': {err}")))
}

fn parse_statuses(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse("RETRY_ON_STATUSES", part))
        .collect()
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|err| QaError::Config(format!("{key}: invalid duration {value}: {err}")))
}

fn as_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}
