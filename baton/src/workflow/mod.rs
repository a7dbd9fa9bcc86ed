//! Workflow abstractions: triggers, instances, and the handler seam.
//!
//! A [`Workflow`] is a named, durable unit of work. The engine routes each
//! [`TriggerEvent`] to the workflow registered for its name, derives a
//! stable [`InstanceId`] from the trigger, and drives the workflow's `run`
//! through the step executor. Unrecovered errors are handed back to the
//! workflow as a [`FailureContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::step::StepRunner;

pub mod generate;
pub mod step;

/// An event that triggers a workflow.
///
/// Events are delivered at least once; workflows must tolerate duplicate
/// deliveries. `data` is an opaque JSON document whose shape is owned by
/// the sender and the receiving workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Name routing the event to a registered workflow
    pub name: String,
    /// Event payload
    pub data: serde_json::Value,
}

impl TriggerEvent {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        TriggerEvent {
            name: name.into(),
            data,
        }
    }
}

/// Identity of one durable execution of a workflow.
///
/// Derived from the trigger rather than freshly generated, so duplicate
/// deliveries of the same logical event share one step log and therefore
/// one set of effects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        InstanceId(s)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical failure envelope handed to [`Workflow::on_failure`].
///
/// One shape regardless of which stage failed, carrying the originating
/// trigger verbatim so the handler can recover identifiers from it.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    /// The trigger that started the failed instance
    pub event: TriggerEvent,
    /// Description of the error that ended it
    pub error: String,
}

/// A named, durable workflow.
///
/// Implementations are registered with the engine at startup. The engine
/// calls the methods in this order for each trigger: `instance_id`,
/// `concurrency_key`, then `run` on the instance's lane; `on_failure` runs
/// whenever `run` errors or the trigger cannot be routed to an instance.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Event name this workflow handles.
    fn event_name(&self) -> &str;

    /// Stable instance identity for a trigger. Duplicate deliveries of the
    /// same logical event must map to the same ID.
    ///
    /// # Errors
    /// - `MalformedTrigger` - if the event data does not identify an
    ///   instance
    fn instance_id(&self, event: &TriggerEvent) -> Result<InstanceId>;

    /// Key serializing instances against each other. Instances sharing a
    /// key run one at a time in arrival order; `None` opts out of
    /// serialization.
    fn concurrency_key(&self, event: &TriggerEvent) -> Option<String>;

    /// Run the workflow for one trigger. All effects must go through
    /// `steps` so that re-entering the instance (duplicate delivery,
    /// crash resume) skips work that already happened.
    async fn run(
        &self,
        instance: &InstanceId,
        event: &TriggerEvent,
        steps: &StepRunner,
    ) -> Result<()>;

    /// Invoked with the canonical failure envelope when `run` returns an
    /// error. Must be idempotent and must tolerate contexts it cannot
    /// make sense of.
    async fn on_failure(&self, ctx: FailureContext);
}
