//! Service configuration.
//!
//! Loaded from the TOML file named by `PAYFLOW_CONFIG` (every key optional),
//! then overridden by `DATABASE_URL`, `HOST`, `PORT`, `REDIS_URL` and
//! `ACQUIRER_URL`, then validated as a whole.

use std::time::Duration;

use payflow_idempotency::IdempotencyConfig;
use payflow_outbox::DispatcherConfig;
use payflow_resilience::{BreakerConfig, ResilienceSettings, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_VAR: &str = "PAYFLOW_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Database connection. An empty URL selects the in-memory store.
    pub database: DatabaseConfig,
    /// Acquirer client.
    pub acquirer: AcquirerConfig,
    /// Breaker, retry and bulkhead around the acquirer.
    pub resilience: ResilienceConfig,
    /// Idempotency cache.
    pub idempotency: IdempotencySection,
    /// Outbox dispatcher and broker.
    pub outbox: OutboxSection,
    /// Reprocessing scheduler.
    pub reprocessing: ReprocessingSection,
    /// Logs, traces and metrics.
    pub telemetry: TelemetryConfig,
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Database connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `PostgreSQL` URL; empty for the in-memory store.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
        }
    }
}

/// Acquirer client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AcquirerConfig {
    /// Base URL of the acquirer API.
    pub base_url: String,
    /// Hard deadline per call.
    pub call_timeout_ms: u64,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            call_timeout_ms: 2000,
        }
    }
}

/// Breaker, retry and bulkhead around the acquirer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Failure rate in the window that opens the breaker, in (0, 1].
    pub failure_rate_threshold: f64,
    /// Number of recent calls the failure rate is computed over.
    pub sliding_window_size: usize,
    /// Calls required in the window before the rate is evaluated.
    pub minimum_calls: usize,
    /// How long the breaker stays open.
    pub open_duration_ms: u64,
    /// Attempts per authorization, first call included.
    pub retry_max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay_ms: u64,
    /// Concurrent acquirer calls.
    pub bulkhead_max_concurrent: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 10,
            minimum_calls: 10,
            open_duration_ms: 30_000,
            retry_max_attempts: 3,
            retry_delay_ms: 500,
            bulkhead_max_concurrent: 25,
        }
    }
}

/// Fast-tier backend of the idempotency cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FastTierKind {
    /// In-process map.
    Memory,
    /// Redis at `redis_url`.
    Redis,
}

/// Idempotency cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencySection {
    /// Replay window.
    pub ttl_secs: u64,
    /// Exclusive claim duration for an executing request.
    pub lock_lease_ms: u64,
    /// How long a concurrent request waits for the holder.
    pub wait_timeout_ms: u64,
    /// Delay between checks while waiting.
    pub poll_interval_ms: u64,
    /// Period of the expiry sweep.
    pub purge_period_secs: u64,
    /// Fast-tier backend.
    pub fast_tier: FastTierKind,
    /// Redis URL, used when `fast_tier` is `redis`.
    pub redis_url: String,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            lock_lease_ms: 30_000,
            wait_timeout_ms: 5000,
            poll_interval_ms: 100,
            purge_period_secs: 3600,
            fast_tier: FastTierKind::Memory,
            redis_url: "redis://127.0.0.1:6379/".to_string(),
        }
    }
}

/// Outbox dispatcher and broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboxSection {
    /// Records claimed per run.
    pub batch_size: usize,
    /// Period of the first-delivery job.
    pub dispatch_period_ms: u64,
    /// Period of the redelivery job.
    pub retry_period_ms: u64,
    /// Attempts before a record is dead-lettered.
    pub max_attempts: u32,
    /// How long dispatched records are kept.
    pub retention_hours: u64,
    /// Period of the purge and dead-letter report.
    pub housekeeping_period_secs: u64,
    /// Exclusive claim duration. Must cover `batch_size` broker calls at
    /// `broker_timeout_ms` each.
    pub claim_lease_secs: u64,
    /// Broker REST proxy URL; empty to log events instead.
    pub broker_url: String,
    /// Broker request deadline.
    pub broker_timeout_ms: u64,
    /// Topic for payment events.
    pub payment_topic: String,
    /// Topic for refund events.
    pub refund_topic: String,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            batch_size: 50,
            dispatch_period_ms: 1000,
            retry_period_ms: 15_000,
            max_attempts: 5,
            retention_hours: 72,
            housekeeping_period_secs: 3600,
            claim_lease_secs: 300,
            broker_url: String::new(),
            broker_timeout_ms: 5000,
            payment_topic: "payments.events".to_string(),
            refund_topic: "refunds.events".to_string(),
        }
    }
}

/// Reprocessing scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReprocessingSection {
    /// Period of each scheduler.
    pub period_ms: u64,
    /// Records claimed per run.
    pub batch_size: usize,
    /// Attempts after which a pending record is left alone, counting the one
    /// made when the payment or refund was created. The default of 5 leaves
    /// four scheduler attempts.
    pub max_attempts: u32,
    /// Exclusive claim duration. Must cover `batch_size` acquirer calls at
    /// their worst-case latency through the retry policy.
    pub claim_lease_secs: u64,
}

impl Default for ReprocessingSection {
    fn default() -> Self {
        Self {
            period_ms: 60_000,
            batch_size: 15,
            max_attempts: 5,
            claim_lease_secs: 120,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable.
    Pretty,
}

/// Logs, traces and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log output format.
    pub log_format: LogFormat,
    /// OTLP collector endpoint; traces are exported only when set.
    pub otlp_endpoint: Option<String>,
    /// Address of the Prometheus scrape listener.
    pub metrics_bind_address: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Json,
            otlp_endpoint: None,
            metrics_bind_address: "0.0.0.0:9000".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration file (if `PAYFLOW_CONFIG` is set), applies
    /// environment overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load() -> Result<Self, AppError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| AppError::Config(format!("cannot read {path}: {e}")))?;
                Self::from_toml(&content)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate().map_err(|errors| AppError::Config(errors.join(", ")))?;
        Ok(config)
    }

    /// Parses a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the document is not valid TOML for this
    /// schema.
    pub fn from_toml(content: &str) -> Result<Self, AppError> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("invalid config file: {e}")))
    }

    /// Applies the environment overrides read through `var`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `PORT` is not a valid port number.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), AppError> {
        if let Some(url) = var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| AppError::Config(format!("PORT must be a valid u16: {e}")))?;
        }
        if let Some(url) = var("REDIS_URL") {
            self.idempotency.redis_url = url;
            self.idempotency.fast_tier = FastTierKind::Redis;
        }
        if let Some(url) = var("ACQUIRER_URL") {
            self.acquirer.base_url = url;
        }
        Ok(())
    }

    /// Checks value ranges. Returns every violation, not just the first.
    ///
    /// # Errors
    ///
    /// Returns the list of violations.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut positive = |name: &str, value: u64| {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        };

        positive("acquirer.call_timeout_ms", self.acquirer.call_timeout_ms);
        positive("resilience.sliding_window_size", self.resilience.sliding_window_size as u64);
        positive("resilience.minimum_calls", self.resilience.minimum_calls as u64);
        positive("resilience.open_duration_ms", self.resilience.open_duration_ms);
        positive("resilience.retry_max_attempts", u64::from(self.resilience.retry_max_attempts));
        positive(
            "resilience.bulkhead_max_concurrent",
            self.resilience.bulkhead_max_concurrent as u64,
        );
        positive("idempotency.ttl_secs", self.idempotency.ttl_secs);
        positive("idempotency.lock_lease_ms", self.idempotency.lock_lease_ms);
        positive("idempotency.poll_interval_ms", self.idempotency.poll_interval_ms);
        positive("idempotency.purge_period_secs", self.idempotency.purge_period_secs);
        positive("outbox.batch_size", self.outbox.batch_size as u64);
        positive("outbox.dispatch_period_ms", self.outbox.dispatch_period_ms);
        positive("outbox.retry_period_ms", self.outbox.retry_period_ms);
        positive("outbox.max_attempts", u64::from(self.outbox.max_attempts));
        positive("outbox.housekeeping_period_secs", self.outbox.housekeeping_period_secs);
        positive("outbox.claim_lease_secs", self.outbox.claim_lease_secs);
        positive("outbox.broker_timeout_ms", self.outbox.broker_timeout_ms);
        positive("reprocessing.period_ms", self.reprocessing.period_ms);
        positive("reprocessing.batch_size", self.reprocessing.batch_size as u64);
        positive("reprocessing.max_attempts", u64::from(self.reprocessing.max_attempts));
        positive("reprocessing.claim_lease_secs", self.reprocessing.claim_lease_secs);

        let threshold = self.resilience.failure_rate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            errors.push(format!(
                "resilience.failure_rate_threshold must be in (0, 1], got {threshold}"
            ));
        }
        if self.resilience.minimum_calls > self.resilience.sliding_window_size {
            errors.push("resilience.minimum_calls must not exceed sliding_window_size".to_string());
        }
        if self.outbox.payment_topic.trim().is_empty() {
            errors.push("outbox.payment_topic must not be empty".to_string());
        }
        if self.outbox.refund_topic.trim().is_empty() {
            errors.push("outbox.refund_topic must not be empty".to_string());
        }
        if self.acquirer.base_url.trim().is_empty() {
            errors.push("acquirer.base_url must not be empty".to_string());
        }
        if self.idempotency.fast_tier == FastTierKind::Redis
            && self.idempotency.redis_url.trim().is_empty()
        {
            errors.push("idempotency.redis_url is required for the redis fast tier".to_string());
        }

        let reprocessing_work =
            (self.reprocessing.batch_size as u64).saturating_mul(self.worst_case_acquirer_call_ms());
        if self.reprocessing.claim_lease_secs.saturating_mul(1000) < reprocessing_work {
            errors.push(format!(
                "reprocessing.claim_lease_secs must cover a whole batch: {} records at up to \
                 {}ms each need {reprocessing_work}ms",
                self.reprocessing.batch_size,
                self.worst_case_acquirer_call_ms()
            ));
        }
        let outbox_work =
            (self.outbox.batch_size as u64).saturating_mul(self.outbox.broker_timeout_ms);
        if self.outbox.claim_lease_secs.saturating_mul(1000) < outbox_work {
            errors.push(format!(
                "outbox.claim_lease_secs must cover a whole batch: {} records at up to \
                 {}ms each need {outbox_work}ms",
                self.outbox.batch_size, self.outbox.broker_timeout_ms
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Longest one acquirer call can take through the retry policy: every
    /// attempt times out and every delay between attempts is served.
    #[must_use]
    pub fn worst_case_acquirer_call_ms(&self) -> u64 {
        let attempts = u64::from(self.resilience.retry_max_attempts);
        attempts
            .saturating_mul(self.acquirer.call_timeout_ms)
            .saturating_add(
                attempts
                    .saturating_sub(1)
                    .saturating_mul(self.resilience.retry_delay_ms),
            )
    }

    /// Breaker settings for the acquirer.
    #[must_use]
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_rate_threshold: self.resilience.failure_rate_threshold,
            sliding_window_size: self.resilience.sliding_window_size,
            minimum_calls: self.resilience.minimum_calls,
            open_duration: Duration::from_millis(self.resilience.open_duration_ms),
        }
    }

    /// Bulkhead, retry and timeout settings for the acquirer.
    #[must_use]
    pub fn resilience_settings(&self) -> ResilienceSettings {
        ResilienceSettings {
            bulkhead_max_concurrent: self.resilience.bulkhead_max_concurrent,
            retry: RetryPolicy {
                max_attempts: self.resilience.retry_max_attempts,
                delay: Duration::from_millis(self.resilience.retry_delay_ms),
            },
            call_timeout: Duration::from_millis(self.acquirer.call_timeout_ms),
        }
    }

    /// Idempotency cache settings.
    #[must_use]
    pub fn idempotency_cache(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            ttl: Duration::from_secs(self.idempotency.ttl_secs),
            lock_lease: Duration::from_millis(self.idempotency.lock_lease_ms),
            wait_timeout: Duration::from_millis(self.idempotency.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.idempotency.poll_interval_ms),
        }
    }

    /// Outbox dispatcher settings.
    #[must_use]
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.outbox.batch_size,
            max_attempts: self.outbox.max_attempts,
            claim_lease: Duration::from_secs(self.outbox.claim_lease_secs),
            retention: Duration::from_secs(self.outbox.retention_hours * 3600),
        }
    }
}
