//! Client configuration: recognized options, validation, and named profiles.
//!
//! Profiles bind the full option surface to ready-made value sets so callers
//! do not have to hand-tune polling, retry, circuit, cache, and queue knobs:
//!
//! - [`ClientConfig::minimal`]: no retries, no circuit, tiny cache
//! - [`ClientConfig::development`]: `webhook-test` base path, fast polling
//! - [`ClientConfig::production`]: the defaults
//! - [`ClientConfig::resilient`]: aggressive retry, eager circuit, long waits
//! - [`ClientConfig::high_performance`]: tight intervals, wide concurrency
//! - [`ClientConfig::battery_optimized`]: slow polling, infrequent probes

use crate::backoff::Backoff;
use crate::jitter::Jitter;
use crate::status::ExecutionStatus;
use std::collections::HashMap;
use std::time::Duration;

/// Errors raised when a configuration fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("base_url must not be empty")]
    EmptyBaseUrl,
    #[error("timeout_per_call must be > 0")]
    ZeroTimeout,
    #[error("polling.base_interval must be > 0")]
    ZeroPollInterval,
    #[error("retry.backoff_mult must be >= 1.0 (got {0})")]
    InvalidBackoffMult(f64),
    #[error("retry.max_delay {max:?} must be >= retry.initial_delay {initial:?}")]
    InvertedRetryDelays { initial: Duration, max: Duration },
    #[error("circuit.threshold must be > 0 when the circuit is enabled")]
    ZeroCircuitThreshold,
    #[error("cache.capacity must be > 0")]
    ZeroCacheCapacity,
    #[error("queue.max_size must be > 0")]
    ZeroQueueSize,
    #[error("queue.max_concurrent must be > 0")]
    ZeroQueueConcurrency,
    #[error("invalid header name or value: {0}")]
    InvalidHeader(String),
}

/// Polling intervals and failure tolerance for the watch streams.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval between polls for non-waiting, non-terminal statuses.
    pub base_interval: Duration,
    /// Per-status interval overrides; statuses not listed use the base.
    pub intervals_by_status: HashMap<ExecutionStatus, Duration>,
    /// Polls whose whole retry chain fails before the stream gives up.
    pub max_consecutive_errors: u32,
}

impl PollingConfig {
    /// Next polling interval for a status. Unknown statuses use the base.
    pub fn interval_for(&self, status: ExecutionStatus) -> Duration {
        self.intervals_by_status.get(&status).copied().unwrap_or(self.base_interval)
    }

    fn with_waiting(base: Duration, waiting: Duration, max_consecutive_errors: u32) -> Self {
        let mut intervals_by_status = HashMap::new();
        intervals_by_status.insert(ExecutionStatus::Waiting, waiting);
        Self { base_interval: base, intervals_by_status, max_consecutive_errors }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::with_waiting(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

/// Retry budget and backoff curve for retryable failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_mult: f64,
    /// Apply ±25% jitter to computed delays.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.backoff_mult, self.max_delay)
    }

    pub fn jitter_strategy(&self) -> Jitter {
        if self.jitter {
            Jitter::symmetric()
        } else {
            Jitter::None
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_mult: 2.0,
            jitter: true,
        }
    }
}

/// Sliding-window circuit breaker parameters.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Errors in the window that trip the circuit.
    pub threshold: usize,
    /// Width of the sliding error window.
    pub window: Duration,
    /// How long the circuit stays open before probing.
    pub timeout: Duration,
    pub enabled: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Execution snapshot cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
    /// Period of the background sweep that evicts expired entries.
    pub sweep_every: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 1000,
            sweep_every: Duration::from_secs(60),
        }
    }
}

/// Bulk submission queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Bound on queued items; `enqueue` fails beyond it.
    pub max_size: usize,
    /// Maximum in-flight dispatches.
    pub max_concurrent: usize,
    /// Minimum spacing between dispatches; zero disables throttling.
    pub throttle: Duration,
    /// Follow each started execution to a terminal state before reporting it.
    pub wait_for_completion: bool,
    /// Redispatch attempts for a failed item before marking it `Failed`.
    pub max_item_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_concurrent: 5,
            throttle: Duration::from_millis(100),
            wait_for_completion: true,
            max_item_retries: 0,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `https://flows.example.com`.
    pub base_url: String,
    /// Webhook path segment: `webhook` in production, `webhook-test` against
    /// a non-production server.
    pub webhook_base_path: String,
    /// Optional bearer token sent as `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    /// Additional headers attached to every request.
    pub extra_headers: Vec<(String, String)>,
    /// Deadline enforced by the transport on every call.
    pub timeout_per_call: Duration,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    /// Period of the connection health probe.
    pub health_probe_every: Duration,
}

impl ClientConfig {
    /// Start a validated configuration from a base URL and the defaults.
    pub fn builder(base_url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder { config: Self::production(base_url) }
    }

    /// Bare-bones profile: single attempts, no circuit, tiny cache. Good for
    /// scripts that would rather fail fast than recover.
    pub fn minimal(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            webhook_base_path: "webhook".into(),
            api_key: None,
            extra_headers: Vec::new(),
            timeout_per_call: Duration::from_secs(30),
            polling: PollingConfig::with_waiting(
                Duration::from_secs(1),
                Duration::from_secs(10),
                3,
            ),
            retry: RetryConfig {
                max_retries: 0,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                backoff_mult: 2.0,
                jitter: false,
            },
            circuit: CircuitConfig { enabled: false, ..CircuitConfig::default() },
            cache: CacheConfig {
                ttl: Duration::from_secs(30),
                capacity: 100,
                sweep_every: Duration::from_secs(30),
            },
            queue: QueueConfig {
                max_size: 100,
                max_concurrent: 1,
                throttle: Duration::ZERO,
                wait_for_completion: false,
                max_item_retries: 0,
            },
            health_probe_every: Duration::from_secs(60),
        }
    }

    /// Development profile: targets the server's `webhook-test` path, polls
    /// fast, and keeps a forgiving circuit so local flakiness does not trip it.
    pub fn development(base_url: impl Into<String>) -> Self {
        Self {
            webhook_base_path: "webhook-test".into(),
            timeout_per_call: Duration::from_secs(15),
            polling: PollingConfig::with_waiting(
                Duration::from_millis(500),
                Duration::from_secs(5),
                10,
            ),
            retry: RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                backoff_mult: 2.0,
                jitter: true,
            },
            circuit: CircuitConfig {
                threshold: 10,
                window: Duration::from_secs(60),
                timeout: Duration::from_secs(30),
                enabled: true,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(60),
                capacity: 200,
                sweep_every: Duration::from_secs(30),
            },
            health_probe_every: Duration::from_secs(30),
            ..Self::minimal(base_url)
        }
    }

    /// Production profile and the crate default: 3 retries with jittered
    /// exponential backoff, circuit at 5 errors / 60 s, 5-minute cache.
    pub fn production(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            webhook_base_path: "webhook".into(),
            api_key: None,
            extra_headers: Vec::new(),
            timeout_per_call: Duration::from_secs(30),
            polling: PollingConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            health_probe_every: Duration::from_secs(30),
        }
    }

    /// Resilient profile: five retries with long delays, an eager circuit,
    /// and patient polling. For flaky networks and overloaded servers.
    pub fn resilient(base_url: impl Into<String>) -> Self {
        Self {
            timeout_per_call: Duration::from_secs(120),
            polling: PollingConfig::with_waiting(
                Duration::from_secs(2),
                Duration::from_secs(60),
                10,
            ),
            retry: RetryConfig {
                max_retries: 5,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_mult: 2.0,
                jitter: true,
            },
            circuit: CircuitConfig {
                threshold: 3,
                window: Duration::from_secs(120),
                timeout: Duration::from_secs(120),
                enabled: true,
            },
            queue: QueueConfig {
                max_concurrent: 2,
                throttle: Duration::from_millis(500),
                max_item_retries: 2,
                ..QueueConfig::default()
            },
            ..Self::production(base_url)
        }
    }

    /// High-performance profile: tight intervals, short delays, and wide
    /// queue concurrency. Assumes a nearby, healthy server.
    pub fn high_performance(base_url: impl Into<String>) -> Self {
        Self {
            timeout_per_call: Duration::from_secs(10),
            polling: PollingConfig::with_waiting(
                Duration::from_millis(250),
                Duration::from_secs(2),
                5,
            ),
            retry: RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                backoff_mult: 2.0,
                jitter: true,
            },
            circuit: CircuitConfig {
                threshold: 10,
                window: Duration::from_secs(30),
                timeout: Duration::from_secs(30),
                enabled: true,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(30),
                capacity: 5000,
                sweep_every: Duration::from_secs(10),
            },
            queue: QueueConfig {
                max_size: 5000,
                max_concurrent: 20,
                throttle: Duration::ZERO,
                wait_for_completion: true,
                max_item_retries: 0,
            },
            health_probe_every: Duration::from_secs(15),
            ..Self::production(base_url)
        }
    }

    /// Battery-optimized profile: slow polling, rare health probes, and a
    /// long-lived cache, trading latency for radio silence.
    pub fn battery_optimized(base_url: impl Into<String>) -> Self {
        Self {
            polling: PollingConfig::with_waiting(
                Duration::from_secs(5),
                Duration::from_secs(120),
                5,
            ),
            retry: RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                backoff_mult: 2.0,
                jitter: true,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(600),
                capacity: 500,
                sweep_every: Duration::from_secs(300),
            },
            queue: QueueConfig {
                max_concurrent: 2,
                throttle: Duration::from_secs(1),
                ..QueueConfig::default()
            },
            health_probe_every: Duration::from_secs(300),
            ..Self::production(base_url)
        }
    }

    /// Validate the option surface.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        if self.timeout_per_call.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.polling.base_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.retry.backoff_mult < 1.0 {
            return Err(ConfigError::InvalidBackoffMult(self.retry.backoff_mult));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(ConfigError::InvertedRetryDelays {
                initial: self.retry.initial_delay,
                max: self.retry.max_delay,
            });
        }
        if self.circuit.enabled && self.circuit.threshold == 0 {
            return Err(ConfigError::ZeroCircuitThreshold);
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.queue.max_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::ZeroQueueConcurrency);
        }
        Ok(())
    }
}

/// Builder over [`ClientConfig`]; `build` runs [`ClientConfig::validate`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn webhook_base_path(mut self, path: impl Into<String>) -> Self {
        self.config.webhook_base_path = path.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout_per_call(mut self, timeout: Duration) -> Self {
        self.config.timeout_per_call = timeout;
        self
    }

    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.config.polling = polling;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    pub fn health_probe_every(mut self, period: Duration) -> Self {
        self.config.health_probe_every = period;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_valid_production_defaults() {
        let config = ClientConfig::builder("https://flows.example.com").build().unwrap();
        assert_eq!(config.webhook_base_path, "webhook");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit.threshold, 5);
        assert!(config.circuit.enabled);
    }

    #[test]
    fn empty_base_url_rejected() {
        let err = ClientConfig::builder("  ").build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyBaseUrl);
    }

    #[test]
    fn inverted_retry_delays_rejected() {
        let err = ClientConfig::builder("https://x")
            .retry(RetryConfig {
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(1),
                ..RetryConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvertedRetryDelays { .. }));
    }

    #[test]
    fn sub_unit_backoff_mult_rejected() {
        let err = ClientConfig::builder("https://x")
            .retry(RetryConfig { backoff_mult: 0.5, ..RetryConfig::default() })
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidBackoffMult(0.5));
    }

    #[test]
    fn development_targets_webhook_test() {
        let config = ClientConfig::development("https://x");
        assert_eq!(config.webhook_base_path, "webhook-test");
        config.validate().unwrap();
    }

    #[test]
    fn all_profiles_validate() {
        for config in [
            ClientConfig::minimal("https://x"),
            ClientConfig::development("https://x"),
            ClientConfig::production("https://x"),
            ClientConfig::resilient("https://x"),
            ClientConfig::high_performance("https://x"),
            ClientConfig::battery_optimized("https://x"),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn interval_lookup_defaults_to_base() {
        let polling = PollingConfig::default();
        assert_eq!(polling.interval_for(ExecutionStatus::Running), polling.base_interval);
        assert_eq!(polling.interval_for(ExecutionStatus::Unknown), polling.base_interval);
        assert_eq!(polling.interval_for(ExecutionStatus::Waiting), Duration::from_secs(30));
    }

    #[test]
    fn retry_config_derives_backoff_curve() {
        let retry = RetryConfig::default();
        let backoff = retry.backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(retry.jitter_strategy(), Jitter::symmetric());
    }

    #[test]
    fn minimal_profile_disables_recovery() {
        let config = ClientConfig::minimal("https://x");
        assert_eq!(config.retry.max_retries, 0);
        assert!(!config.circuit.enabled);
    }
}
