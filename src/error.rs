//! Typed errors
//!
//! Matchable failures for configuration, collection and the control plane.
//! Everything else travels as `anyhow::Error` with context attached.

use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Platform name is empty
    #[error("platform name is empty")]
    EmptyPlatformName,

    /// Platform has no resources to collect
    #[error("platform {0} has no resources")]
    NoResources(String),

    /// Platform has no default regions
    #[error("platform {0} has no default regions")]
    NoDefaultRegions(String),

    /// Account concurrency outside the supported range
    #[error("cloud_account_max_concurrent must be between 1 and {max}, got {got}")]
    InvalidConcurrency { got: usize, max: usize },

    /// Account queue smaller than the worker count
    #[error("account_queue_size ({queue}) must be at least cloud_account_max_concurrent ({workers})")]
    QueueTooSmall { queue: usize, workers: usize },

    /// Zero where a positive value is required
    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    /// Cron expression failed to parse
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    /// Server URL failed to parse
    #[error("invalid server url {0:?}")]
    InvalidServerUrl(String),
}

/// Failures raised inside a single region pass
#[derive(Debug, Error)]
pub enum CollectError {
    /// The raw-item channel was closed by the idle timeout while the
    /// collector was still writing.
    #[error("result channel closed after {0:?} without new data")]
    ChannelClosed(Duration),

    /// The hard per-region deadline elapsed.
    #[error("collection exceeded deadline of {0:?}")]
    Deadline(Duration),

    /// Provider client initialization failed.
    #[error("init client error: {0}")]
    Init(String),

    /// An item could not be projected into a resource instance.
    #[error("transform error: {0}")]
    Transform(String),
}

impl CollectError {
    /// Whether this error is a timeout rather than a provider failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::Deadline(_))
    }
}

/// Control-plane call failures
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Non-2xx HTTP status
    #[error("server returned status {0}")]
    Status(u16),

    /// 2xx response whose envelope code is not success
    #[error("server rejected request (code {code}): {msg}")]
    Rejected { code: i64, msg: String },

    /// A session-scoped call was made before registration
    #[error("agent is not registered")]
    NotRegistered,
}
