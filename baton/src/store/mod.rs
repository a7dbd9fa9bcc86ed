//! Persistence for song requests, owners, categories, and step results.
//!
//! Two traits live here:
//! - [`SongStore`]: the gateway the workflow uses for domain reads and
//!   writes. Implementations must make each operation atomic; the workflow
//!   layers no transactions on top.
//! - [`StepLog`]: the per-instance durable record of step results that
//!   makes workflow execution resumable.
//!
//! Both have an in-memory implementation for tests and embedding, and a
//! SQLite implementation for durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::song::{Category, NewSongRequest, Owner, OwnerId, SongId, SongRequest, SongStatus};
use crate::workflow::InstanceId;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;


/// Result fields persisted by [`SongStore::apply_result`].
///
/// `None` fields leave the stored value untouched, so a failed generation
/// updates the status without clearing keys from an earlier attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultUpdate {
    pub audio_key: Option<String>,
    pub thumbnail_key: Option<String>,
    pub status: SongStatus,
}

/// Storage gateway for the song generation domain.
///
/// Every mutation is a single atomic operation. The workflow relies on that
/// for crash safety: a step either committed its write or it did not.
#[async_trait]
pub trait SongStore: Send + Sync {
    /// Insert a new request. Rows start in `Queued` status with no result
    /// fields set.
    ///
    /// # Errors
    /// - If a request with the same ID already exists
    async fn insert_request(&self, request: NewSongRequest) -> Result<()>;

    /// Insert an owner with an initial credit balance.
    ///
    /// # Errors
    /// - If an owner with the same ID already exists
    async fn insert_owner(&self, owner: Owner) -> Result<()>;

    /// Get a request by ID.
    ///
    /// # Errors
    /// - `RequestNotFound` - if the request doesn't exist
    async fn get_request(&self, id: SongId) -> Result<SongRequest>;

    /// Get an owner by ID.
    ///
    /// # Errors
    /// - `OwnerNotFound` - if the owner doesn't exist
    async fn get_owner(&self, id: OwnerId) -> Result<Owner>;

    /// Load a request together with its owner in one read.
    ///
    /// # Errors
    /// - `RequestNotFound` / `OwnerNotFound` - if either row is missing
    async fn load_request_and_owner(&self, id: SongId) -> Result<(SongRequest, Owner)>;

    /// All requests belonging to an owner, newest first.
    async fn list_requests_for_owner(&self, owner_id: OwnerId) -> Result<Vec<SongRequest>>;

    /// Set the lifecycle status of a request.
    ///
    /// # Errors
    /// - `RequestNotFound` - if the request doesn't exist
    async fn set_status(&self, id: SongId, status: SongStatus) -> Result<()>;

    /// Persist the generation result. A keyed write: re-running it with the
    /// same update leaves the row in the same state.
    ///
    /// # Errors
    /// - `RequestNotFound` - if the request doesn't exist
    async fn apply_result(&self, id: SongId, update: ResultUpdate) -> Result<()>;

    /// Find or create each category by its unique name and link it to the
    /// request. Idempotent: existing categories are reused and existing
    /// links are left alone, so replays cannot create duplicates.
    ///
    /// Returns the categories now linked for the given names.
    ///
    /// # Errors
    /// - `RequestNotFound` - if the request doesn't exist
    async fn upsert_and_link_categories(
        &self,
        id: SongId,
        names: &[String],
    ) -> Result<Vec<Category>>;

    /// Atomically decrement an owner's credit balance, refusing to go below
    /// zero. Returns the remaining balance.
    ///
    /// # Errors
    /// - `OwnerNotFound` - if the owner doesn't exist
    /// - `InsufficientCredits` - if the balance is smaller than `amount`
    async fn decrement_credits(&self, owner_id: OwnerId, amount: u32) -> Result<u32>;

    /// Categories currently linked to a request, sorted by name.
    async fn categories_for_request(&self, id: SongId) -> Result<Vec<Category>>;

    /// All categories in the store, sorted by name.
    async fn list_categories(&self) -> Result<Vec<Category>>;
}

/// Outcome persisted for a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The step finished and returned this JSON value
    Ok(serde_json::Value),
    /// The step failed terminally with this message
    Failed(String),
}

/// A recorded step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub outcome: StepOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Durable per-instance log of step results.
///
/// The log is what makes execution resumable: a step whose result is
/// recorded is never executed again for that instance.
#[async_trait]
pub trait StepLog: Send + Sync {
    /// Recorded result for a step of an instance, if any.
    async fn get_step(&self, instance: &InstanceId, step: &str) -> Result<Option<StepRecord>>;

    /// Record the result of a step. The first write wins: re-recording an
    /// already-recorded step is a no-op, so a replay cannot rewrite
    /// history.
    async fn record_step(
        &self,
        instance: &InstanceId,
        step: &str,
        outcome: StepOutcome,
    ) -> Result<()>;

    /// All recorded steps for an instance, in recording order.
    async fn list_steps(&self, instance: &InstanceId) -> Result<Vec<(String, StepRecord)>>;
}
