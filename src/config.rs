//! Configuration for the request engine.
//!
//! Every component takes its own config struct; [`EngineConfig`] groups them
//! for callers that load settings from a file. All structs deserialize with
//! per-field defaults, so a partial document is valid.
//!
//! # Quick Start
//!
//! ```rust
//! use request_engine::config::{EngineConfig, ProcessorConfig};
//!
//! let config = EngineConfig {
//!     processor: ProcessorConfig::for_service("CRUDServiceProvider.saveRecord"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── processor: ProcessorConfig   # On-demand batched writes
//! ├── paging: PagingConfig         # Paginated retrieval
//! └── retry: RetryConfig           # Delay table and attempt limit
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "processor": {
//!     "service": "CRUDServiceProvider.saveRecord",
//!     "throughput": 25,
//!     "allow_above_throughput": false,
//!     "wake_interval": "30s"
//!   },
//!   "paging": { "full_page_sizes": [150, 300], "default_timeout": "2m" },
//!   "retry": { "max_attempts": 5, "free_delay": "5s" }
//! }
//! ```

use crate::error::{EngineError, Result};
use crate::resilience::OperationKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// All engine settings in one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub paging: PagingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Fast timings for tests.
    pub fn testing() -> Self {
        Self {
            processor: ProcessorConfig::testing(),
            paging: PagingConfig::testing(),
            retry: RetryConfig::testing(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.processor.validate()?;
        self.paging.validate()?;
        self.retry.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProcessorConfig: on-demand batched writes
// ═══════════════════════════════════════════════════════════════════════════════

/// On-demand batch processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Service label, used for registry lookups, events and logs.
    #[serde(default = "default_service")]
    pub service: String,

    /// Maximum items per submitted group.
    #[serde(default = "default_throughput")]
    pub throughput: usize,

    /// Submit under-filled groups as soon as items are available.
    ///
    /// When false, the worker waits for a full group unless a flush or a
    /// shutdown forces the remainder out.
    #[serde(default = "default_true")]
    pub allow_above_throughput: bool,

    /// Periodic wake-up of the worker when no signal arrives (e.g., "60s").
    #[serde(default = "default_wake_interval")]
    pub wake_interval: String,

    /// How often the blocking worker re-checks cancellation while idle.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Upper bound on waiting for the worker during dispose.
    #[serde(default = "default_dispose_timeout")]
    pub dispose_timeout: String,

    /// Retry classification of submissions.
    #[serde(default)]
    pub operation: OperationKind,
}

fn default_service() -> String {
    "default".to_string()
}

fn default_throughput() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_wake_interval() -> String {
    "60s".to_string()
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_dispose_timeout() -> String {
    "30s".to_string()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            throughput: 10,
            allow_above_throughput: true,
            wake_interval: "60s".to_string(),
            poll_interval: "100ms".to_string(),
            dispose_timeout: "30s".to_string(),
            operation: OperationKind::Transactional,
        }
    }
}

impl ProcessorConfig {
    /// Default settings for a named service.
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    /// Short intervals so tests don't sit on timers.
    pub fn testing() -> Self {
        Self {
            service: "test.service".to_string(),
            throughput: 10,
            allow_above_throughput: true,
            wake_interval: "50ms".to_string(),
            poll_interval: "5ms".to_string(),
            dispose_timeout: "5s".to_string(),
            operation: OperationKind::Transactional,
        }
    }

    pub fn wake_interval_duration(&self) -> Duration {
        parse_or(&self.wake_interval, Duration::from_secs(60))
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_millis(100))
    }

    pub fn dispose_timeout_duration(&self) -> Duration {
        parse_or(&self.dispose_timeout, Duration::from_secs(30))
    }

    pub fn validate(&self) -> Result<()> {
        if self.throughput == 0 {
            return Err(EngineError::Config(
                "processor.throughput must be at least 1".into(),
            ));
        }
        if self.service.trim().is_empty() {
            return Err(EngineError::Config("processor.service must not be empty".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PagingConfig: paginated retrieval
// ═══════════════════════════════════════════════════════════════════════════════

/// Paginator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingConfig {
    /// Page sizes the server returns when more pages follow.
    /// Any other size marks the last page.
    #[serde(default = "default_full_page_sizes")]
    pub full_page_sizes: Vec<usize>,

    /// Items per `process` sink invocation.
    #[serde(default = "default_process_batch_size")]
    pub process_batch_size: usize,

    /// Timeout applied when a fetch does not set its own.
    #[serde(default = "default_fetch_timeout")]
    pub default_timeout: String,

    /// Upper bound on waiting for running loaders during dispose.
    #[serde(default = "default_loader_dispose_timeout")]
    pub dispose_timeout: String,
}

fn default_full_page_sizes() -> Vec<usize> {
    vec![150, 300]
}

fn default_process_batch_size() -> usize {
    50
}

fn default_fetch_timeout() -> String {
    "5m".to_string()
}

fn default_loader_dispose_timeout() -> String {
    "5s".to_string()
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            full_page_sizes: default_full_page_sizes(),
            process_batch_size: 50,
            default_timeout: "5m".to_string(),
            dispose_timeout: default_loader_dispose_timeout(),
        }
    }
}

impl PagingConfig {
    /// Small pages and a short timeout for tests.
    pub fn testing() -> Self {
        Self {
            full_page_sizes: vec![3],
            process_batch_size: 2,
            default_timeout: "2s".to_string(),
            dispose_timeout: "1s".to_string(),
        }
    }

    pub fn default_timeout_duration(&self) -> Duration {
        parse_or(&self.default_timeout, Duration::from_secs(300))
    }

    pub fn dispose_timeout_duration(&self) -> Duration {
        parse_or(&self.dispose_timeout, Duration::from_secs(5))
    }

    /// Whether a page of `len` items means more pages may follow.
    pub fn is_full_page(&self, len: usize) -> bool {
        self.full_page_sizes.contains(&len)
    }

    pub fn validate(&self) -> Result<()> {
        if self.process_batch_size == 0 {
            return Err(EngineError::Config(
                "paging.process_batch_size must be at least 1".into(),
            ));
        }
        if self.full_page_sizes.iter().any(|&s| s == 0) {
            return Err(EngineError::Config(
                "paging.full_page_sizes must not contain 0".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryConfig: staged delay table
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry limits and the four-stage delay table.
///
/// ```text
/// Attempts so far  Stage       Default delay
/// ---------------  ----------  -------------
/// 0                free        10s
/// 1                stable      15s
/// 2                unstable    30s
/// 3+               breakdown   90s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_free_delay")]
    pub free_delay: String,

    #[serde(default = "default_stable_delay")]
    pub stable_delay: String,

    #[serde(default = "default_unstable_delay")]
    pub unstable_delay: String,

    #[serde(default = "default_breakdown_delay")]
    pub breakdown_delay: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_free_delay() -> String {
    "10s".to_string()
}

fn default_stable_delay() -> String {
    "15s".to_string()
}

fn default_unstable_delay() -> String {
    "30s".to_string()
}

fn default_breakdown_delay() -> String {
    "90s".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            free_delay: default_free_delay(),
            stable_delay: default_stable_delay(),
            unstable_delay: default_unstable_delay(),
            breakdown_delay: default_breakdown_delay(),
        }
    }
}

impl RetryConfig {
    /// Millisecond delays so retry paths run quickly in tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            free_delay: "1ms".to_string(),
            stable_delay: "2ms".to_string(),
            unstable_delay: "3ms".to_string(),
            breakdown_delay: "4ms".to_string(),
        }
    }

    /// Never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::testing()
        }
    }

    /// Delay for the stage reached after `attempts` prior retries.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        match attempts {
            0 => parse_or(&self.free_delay, Duration::from_secs(10)),
            1 => parse_or(&self.stable_delay, Duration::from_secs(15)),
            2 => parse_or(&self.unstable_delay, Duration::from_secs(30)),
            _ => parse_or(&self.breakdown_delay, Duration::from_secs(90)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("free_delay", &self.free_delay),
            ("stable_delay", &self.stable_delay),
            ("unstable_delay", &self.unstable_delay),
            ("breakdown_delay", &self.breakdown_delay),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                EngineError::Config(format!("retry.{name} '{value}' is not a duration: {e}"))
            })?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
