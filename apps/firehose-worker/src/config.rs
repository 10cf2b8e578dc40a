use crate::pipeline::BatchSettings;
use crate::supervisor::SupervisorSettings;
use crate::upstream::UpstreamSettings;
use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UPSTREAM_URL: &str =
    "https://partners.dnaspaces.io/api/partners/v1/firehose/events";

fn overrides_path() -> Option<PathBuf> {
    env::var("FIREHOSE_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Optional JSON file whose keys fill in settings the environment leaves unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_path: Option<String>,
    #[serde(default)]
    upstream_url: Option<String>,
    #[serde(default)]
    api_key_header: Option<String>,
    #[serde(default)]
    line_filter: Option<String>,
    #[serde(default)]
    reconcile_interval_ms: Option<u64>,
    #[serde(default)]
    restart_backoff_ms: Option<u64>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    max_queue: Option<usize>,
    #[serde(default)]
    retention_hours: Option<u64>,
    #[serde(default)]
    cleanup_interval_secs: Option<u64>,
    #[serde(default)]
    query_page_limit: Option<i64>,
    #[serde(default)]
    push_tick_ms: Option<u64>,
}

fn load_overrides(path: &Path) -> Option<ConfigOverrides> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "firehose config file not found; using env defaults");
        return None;
    }
    let mut bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read firehose config file; using env defaults"
            );
            return None;
        }
    };
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse firehose config file; using env defaults"
            );
            None
        }
    }
}

fn env_allows(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_none()
}

fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    fn text(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    if env_allows("FIREHOSE_DATABASE_PATH") {
        if let Some(path) = text(&overrides.database_path) {
            config.database_path = PathBuf::from(path);
        }
    }
    if env_allows("FIREHOSE_UPSTREAM_URL") {
        if let Some(url) = text(&overrides.upstream_url) {
            config.upstream_url = url;
        }
    }
    if env_allows("FIREHOSE_API_KEY_HEADER") {
        if let Some(header) = text(&overrides.api_key_header) {
            config.api_key_header = header;
        }
    }
    // An empty filter is meaningful here: it disables the pre-filter.
    if env::var("FIREHOSE_LINE_FILTER").is_err() {
        if let Some(filter) = overrides.line_filter.as_deref() {
            config.line_filter = filter.trim().to_string();
        }
    }
    if env_allows("FIREHOSE_RECONCILE_INTERVAL_MS") {
        if let Some(value) = overrides.reconcile_interval_ms.filter(|v| *v != 0) {
            config.reconcile_interval_ms = value;
        }
    }
    if env_allows("FIREHOSE_RESTART_BACKOFF_MS") {
        if let Some(value) = overrides.restart_backoff_ms.filter(|v| *v != 0) {
            config.restart_backoff_ms = value;
        }
    }

    let mut batch_overridden = false;
    if env_allows("FIREHOSE_BATCH_SIZE") {
        if let Some(value) = overrides.batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if env_allows("FIREHOSE_FLUSH_INTERVAL_MS") {
        if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if env_allows("FIREHOSE_MAX_QUEUE") {
        if let Some(value) = overrides.max_queue.filter(|v| *v != 0) {
            config.max_queue = value;
        } else if batch_overridden {
            config.max_queue = config.batch_size.saturating_mul(100);
        }
    }

    if env_allows("FIREHOSE_RETENTION_HOURS") {
        if let Some(value) = overrides.retention_hours.filter(|v| *v != 0) {
            config.retention_hours = value;
        }
    }
    if env_allows("FIREHOSE_CLEANUP_INTERVAL_SECS") {
        if let Some(value) = overrides.cleanup_interval_secs.filter(|v| *v != 0) {
            config.cleanup_interval_secs = value;
        }
    }
    if env_allows("FIREHOSE_QUERY_PAGE_LIMIT") {
        if let Some(value) = overrides.query_page_limit.filter(|v| *v > 0) {
            config.query_page_limit = value;
        }
    }
    if env_allows("FIREHOSE_PUSH_TICK_MS") {
        if let Some(value) = overrides.push_tick_ms.filter(|v| *v != 0) {
            config.push_tick_ms = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub db_pool_size: u32,
    pub upstream_url: String,
    pub api_key_header: String,
    pub upstream_connect_timeout_ms: u64,
    pub line_filter: String,
    pub reconcile_interval_ms: u64,
    pub restart_backoff_ms: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub max_line_buffer_bytes: usize,
    pub retention_hours: u64,
    pub cleanup_interval_secs: u64,
    pub query_page_limit: i64,
    pub push_tick_ms: u64,
    pub pull_window_ms: i64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_path = env::var("FIREHOSE_DATABASE_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("firehose.db"));
        let db_pool_size = env::var("FIREHOSE_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(8);

        let upstream_url =
            env::var("FIREHOSE_UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
        let api_key_header =
            env::var("FIREHOSE_API_KEY_HEADER").unwrap_or_else(|_| "X-API-Key".to_string());
        let upstream_connect_timeout_ms = env::var("FIREHOSE_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(15_000);
        let line_filter = env::var("FIREHOSE_LINE_FILTER")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| "IOT_TELEMETRY".to_string());

        let reconcile_interval_ms = env::var("FIREHOSE_RECONCILE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000);
        let restart_backoff_ms = env::var("FIREHOSE_RESTART_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5_000);

        let batch_size = env::var("FIREHOSE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(50);
        let flush_interval_ms = env::var("FIREHOSE_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(200);
        let max_queue = env::var("FIREHOSE_MAX_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(batch_size.saturating_mul(100));
        let max_line_buffer_bytes = env::var("FIREHOSE_MAX_LINE_BUFFER_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10 * 1024 * 1024);

        let retention_hours = env::var("FIREHOSE_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(24);
        let cleanup_interval_secs = env::var("FIREHOSE_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3_600);
        let query_page_limit = env::var("FIREHOSE_QUERY_PAGE_LIMIT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(500);
        let push_tick_ms = env::var("FIREHOSE_PUSH_TICK_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1_000);
        let pull_window_ms = env::var("FIREHOSE_PULL_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(10_000);
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        let mut config = Self {
            database_path,
            db_pool_size,
            upstream_url,
            api_key_header,
            upstream_connect_timeout_ms,
            line_filter,
            reconcile_interval_ms,
            restart_backoff_ms,
            batch_size,
            flush_interval_ms,
            max_queue,
            max_line_buffer_bytes,
            retention_hours,
            cleanup_interval_secs,
            query_page_limit,
            push_tick_ms,
            pull_window_ms,
            otlp_endpoint,
        };

        if let Some(overrides) = overrides_path().and_then(|path| load_overrides(&path)) {
            apply_overrides(&mut config, &overrides);
        }

        Ok(config)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }

    pub fn retention_horizon(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3_600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn push_tick(&self) -> Duration {
        Duration::from_millis(self.push_tick_ms.max(1))
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            url: self.upstream_url.clone(),
            api_key_header: self.api_key_header.clone(),
            connect_timeout: self.connect_timeout(),
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval(),
            max_queue: self.max_queue,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            reconcile_interval: self.reconcile_interval(),
            restart_backoff: self.restart_backoff(),
            line_filter: self.line_filter.clone(),
            max_line_buffer: self.max_line_buffer_bytes,
            batch: self.batch_settings(),
        }
    }
}
