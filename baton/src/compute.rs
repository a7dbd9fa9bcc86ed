//! Client abstraction for the external song generation service.
//!
//! This module defines the `ComputeClient` trait to abstract the generation
//! call, enabling testability with mock implementations.
//!
//! The service's contract treats status codes as part of the business
//! outcome: a non-2xx response or a timeout means "the generation failed"
//! and comes back as `ComputeOutcome { ok: false, .. }`. Only transport
//! failures that never produced a response (DNS, refused connections,
//! unparseable URLs) surface as errors, which the step executor retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ComputeConfig;
use crate::error::Result;
use crate::song::ComputePayload;

/// Outcome of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeOutcome {
    /// Whether the status code was in the 2xx range
    pub ok: bool,
    /// HTTP status code (408 for a client-side timeout)
    pub status: u16,
    /// Response body, when one was present and parsed as JSON
    pub body: Option<serde_json::Value>,
}

impl ComputeOutcome {
    /// The outcome recorded for a call that timed out before responding.
    pub fn timed_out() -> Self {
        ComputeOutcome {
            ok: false,
            status: 408,
            body: None,
        }
    }
}

/// Trait for invoking the generation service.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the workflow logic testable without real HTTP calls.
#[async_trait]
pub trait ComputeClient: Send + Sync + Clone {
    /// Execute one generation call: `POST` the payload to the endpoint.
    ///
    /// # Errors
    /// Returns an error only for transport failures that never produced a
    /// response. Non-2xx statuses and timeouts are `Ok` outcomes with
    /// `ok = false`.
    async fn execute(&self, endpoint: &str, payload: &ComputePayload) -> Result<ComputeOutcome>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production compute client using reqwest.
#[derive(Clone)]
pub struct ReqwestComputeClient {
    client: reqwest::Client,
    config: ComputeConfig,
}

impl ReqwestComputeClient {
    /// Create a new reqwest-based compute client.
    pub fn new(config: ComputeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ComputeClient for ReqwestComputeClient {
    #[tracing::instrument(skip(self, payload), fields(endpoint = %endpoint))]
    async fn execute(&self, endpoint: &str, payload: &ComputePayload) -> Result<ComputeOutcome> {
        tracing::debug!(
            timeout_ms = self.config.timeout_ms,
            "Calling generation service"
        );

        let mut req = self
            .client
            .post(endpoint)
            .timeout(self.config.timeout())
            .json(payload);

        // Only add auth headers when configured
        if !self.config.auth_key.is_empty() {
            req = req.header(
                self.config.auth_key_header.as_str(),
                self.config.auth_key.as_str(),
            );
        }
        if !self.config.auth_secret.is_empty() {
            req = req.header(
                self.config.auth_secret_header.as_str(),
                self.config.auth_secret.as_str(),
            );
        }

        let response = match req.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::warn!(error = %e, "Generation call timed out");
                return Ok(ComputeOutcome::timed_out());
            }
            Err(e) => {
                tracing::error!(error = %e, "Generation call failed");
                return Err(e.into());
            }
        };

        let status = response.status().as_u16();
        let ok = response.status().is_success();

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => {
                tracing::warn!(error = %e, "Generation response body timed out");
                return Ok(ComputeOutcome::timed_out());
            }
            Err(e) => return Err(e.into()),
        };
        let body = serde_json::from_str(&text).ok();

        tracing::info!(
            status = status,
            ok = ok,
            response_len = text.len(),
            "Generation call completed"
        );

        Ok(ComputeOutcome { ok, status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Mock compute client for testing.
///
/// Allows configuring predetermined outcomes per endpoint without making
/// actual HTTP calls. Outcomes for the same endpoint are returned in FIFO
/// order. A response can be held back behind a trigger to observe what the
/// engine does while a call is still in flight.
#[derive(Clone)]
pub struct MockComputeClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockComputeCall>>>,
    in_flight: Arc<AtomicUsize>,
}

struct MockResponse {
    trigger: Option<oneshot::Receiver<()>>,
    outcome: Result<ComputeOutcome>,
}

/// Record of a call made to the mock compute client.
#[derive(Debug, Clone)]
pub struct MockComputeCall {
    pub endpoint: String,
    pub payload: ComputePayload,
}

impl MockComputeClient {
    /// Create a new mock compute client.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a predetermined outcome for an endpoint.
    pub fn add_response(&self, endpoint: &str, outcome: Result<ComputeOutcome>) {
        self.responses
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(MockResponse {
                trigger: None,
                outcome,
            });
    }

    /// Add an outcome that is only returned once the returned trigger is
    /// fired. The call is recorded (and counts as in-flight) while it waits.
    pub fn add_response_with_trigger(
        &self,
        endpoint: &str,
        outcome: Result<ComputeOutcome>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(MockResponse {
                trigger: Some(rx),
                outcome,
            });
        tx
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockComputeCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls currently waiting on a trigger or caller.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for MockComputeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeClient for MockComputeClient {
    async fn execute(&self, endpoint: &str, payload: &ComputePayload) -> Result<ComputeOutcome> {
        self.calls.lock().push(MockComputeCall {
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
        });

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        // Pop the next response while locked, then await the trigger with
        // the lock released.
        let next = {
            let mut responses = self.responses.lock();
            responses.get_mut(endpoint).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };

        match next {
            Some(MockResponse { trigger, outcome }) => {
                if let Some(rx) = trigger {
                    let _ = rx.await;
                }
                outcome
            }
            None => Err(crate::error::Error::Internal(anyhow::anyhow!(
                "no mock response configured for {}",
                endpoint
            ))),
        }
    }
}
