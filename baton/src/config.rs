//! Configuration for the engine and the external compute client.
//!
//! Plain structs with documented defaults. Loading them from the process
//! environment or a config file is the embedding application's concern.

use std::time::Duration;

/// Endpoints and credentials for the external generation service.
///
/// One endpoint per generation mode; the admission step picks which one a
/// request is routed to. The auth header pair is sent on every call
/// (Modal-style `Modal-Key` / `Modal-Secret` by default, but the header
/// names are configurable for other deployments).
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Endpoint for full-description requests
    pub description_endpoint: String,

    /// Endpoint for lyrics + prompt requests
    pub lyrics_endpoint: String,

    /// Endpoint for described-lyrics + prompt requests
    pub described_lyrics_endpoint: String,

    /// Name of the auth key header
    pub auth_key_header: String,

    /// Value of the auth key header
    pub auth_key: String,

    /// Name of the auth secret header
    pub auth_secret_header: String,

    /// Value of the auth secret header
    pub auth_secret: String,

    /// Timeout for each generation call in milliseconds. Generation takes
    /// minutes, so the ceiling is generous.
    pub timeout_ms: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            description_endpoint: String::new(),
            lyrics_endpoint: String::new(),
            described_lyrics_endpoint: String::new(),
            auth_key_header: "Modal-Key".to_string(),
            auth_key: String::new(),
            auth_secret_header: "Modal-Secret".to_string(),
            auth_secret: String::new(),
            timeout_ms: 600000,
        }
    }
}

impl ComputeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry behavior for durable steps.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts per step before recording a terminal
    /// failure (the first attempt counts)
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry, exponentially increased and capped.
    /// `retry` is zero-based: the delay before the first retry is
    /// `backoff_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let ms = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration for the workflow engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Retry behavior for durable steps
    pub retry: RetryPolicy,

    /// Interval for logging engine status (instances in flight) in
    /// milliseconds. Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}
