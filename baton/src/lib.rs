//! Durable workflow orchestration for credit-gated song generation.
//!
//! This crate drives persisted generation requests through a small state
//! machine with distributed-job guarantees:
//! - Credit-based admission control with exactly-once accounting
//! - At most one in-flight workflow instance per owner, in arrival order
//! - Named, memoized steps with bounded exponential-backoff retry, so an
//!   instance resumes after a crash instead of repeating its effects
//! - A terminal status (`Processed`, `Failed`, or `NoCredits`) for every
//!   execution path, enforced by a failure handler of last resort
//!
//! # Example
//! ```ignore
//! use baton::{ComputeConfig, Engine, GenerateSong, GenerateSongTrigger, ReqwestComputeClient};
//!
//! let store = Arc::new(SqliteStore::connect("sqlite://songs.db").await?);
//! let compute = Arc::new(ReqwestComputeClient::new(config.clone()));
//! let workflow = Arc::new(GenerateSong::new(store.clone(), compute, config));
//!
//! let engine = Engine::builder(store).register(workflow).build();
//!
//! // Hand triggers to the engine; duplicates are deduplicated by instance
//! engine.trigger(GenerateSongTrigger::new(song_id, owner_id).into_event())?;
//!
//! // Observe terminal outcomes
//! let mut updates = engine.updates();
//! ```

pub mod compute;
pub mod config;
pub mod engine;
pub mod error;
pub mod lanes;
pub mod song;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use compute::{ComputeClient, ComputeOutcome, MockComputeClient, ReqwestComputeClient};
pub use config::{ComputeConfig, EngineConfig, RetryPolicy};
pub use engine::{Engine, EngineBuilder, InstanceNotice, InstanceOutcome};
pub use error::{Error, Result};
pub use lanes::KeyedLanes;
pub use song::*;
pub use store::memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use store::sqlite::SqliteStore;
pub use store::{SongStore, StepLog, StepOutcome, StepRecord};
pub use workflow::generate::{GenerateSong, GenerateSongTrigger, GENERATE_SONG_EVENT};
pub use workflow::step::StepRunner;
pub use workflow::{FailureContext, InstanceId, TriggerEvent, Workflow};
