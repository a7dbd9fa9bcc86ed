//! The workflow engine.
//!
//! [`Engine`] owns the handler table (event name → workflow), the per-owner
//! lanes, and the durable step runner. [`Engine::trigger`] is the intake:
//! it routes an event to its registered workflow, derives the instance
//! identity, and queues the execution on the owner's lane. When a run
//! returns an unrecovered error the engine hands the originating trigger to
//! the workflow's failure handler, so every execution path still reaches a
//! terminal state.
//!
//! The handler table is built once by [`EngineBuilder`] before any trigger
//! is accepted; there is no ambient registry to mutate later.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lanes::KeyedLanes;
use crate::store::StepLog;
use crate::workflow::step::StepRunner;
use crate::workflow::{FailureContext, InstanceId, TriggerEvent, Workflow};

/// Terminal outcome of one workflow instance.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOutcome {
    /// `run` returned without error (handled business failures included)
    Completed,
    /// `run` errored; the failure handler has been invoked
    Failed(String),
}

/// Lifecycle notice broadcast when an instance reaches its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceNotice {
    pub instance: InstanceId,
    pub outcome: InstanceOutcome,
}

/// Builds an [`Engine`] with an explicit handler table.
pub struct EngineBuilder {
    step_log: Arc<dyn StepLog>,
    config: EngineConfig,
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl EngineBuilder {
    pub fn new(step_log: Arc<dyn StepLog>) -> Self {
        Self {
            step_log,
            config: EngineConfig::default(),
            workflows: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a workflow under its event name. Later registrations for
    /// the same name replace earlier ones.
    pub fn register(mut self, workflow: Arc<dyn Workflow>) -> Self {
        let name = workflow.event_name().to_string();
        if self.workflows.insert(name.clone(), workflow).is_some() {
            tracing::warn!(event = %name, "Replacing workflow registered for event");
        }
        self
    }

    pub fn build(self) -> Engine {
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (notices_tx, _) = broadcast::channel(1000);

        // Periodic status logging, as a background task the shutdown token
        // stops
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let in_flight = in_flight.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            tracing::debug!(
                                instances_in_flight = in_flight.load(Ordering::Relaxed),
                                "Engine status"
                            );
                        }
                    }
                }
            });
        }

        Engine {
            workflows: self.workflows,
            steps: StepRunner::new(self.step_log, self.config.retry),
            lanes: KeyedLanes::new(cancel.clone()),
            cancel,
            in_flight,
            notices_tx,
        }
    }
}

/// Routes triggers to registered workflows and drives their instances.
pub struct Engine {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    steps: StepRunner,
    lanes: KeyedLanes,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    notices_tx: broadcast::Sender<InstanceNotice>,
}

impl Engine {
    pub fn builder(step_log: Arc<dyn StepLog>) -> EngineBuilder {
        EngineBuilder::new(step_log)
    }

    /// Take in one trigger event.
    ///
    /// The returned instance ID identifies the execution; the execution
    /// itself runs in the background, serialized against other instances
    /// sharing its concurrency key. Duplicate deliveries of the same
    /// logical event map to the same instance and replay its step log.
    ///
    /// # Errors
    /// - `UnknownWorkflow` - no workflow is registered for the event name
    /// - `MalformedTrigger` - the workflow cannot derive an instance from
    ///   the event; the failure handler is still invoked with the trigger
    #[tracing::instrument(skip(self, event), fields(event = %event.name))]
    pub fn trigger(&self, event: TriggerEvent) -> Result<InstanceId> {
        let workflow = self
            .workflows
            .get(&event.name)
            .cloned()
            .ok_or_else(|| Error::UnknownWorkflow(event.name.clone()))?;

        let instance = match workflow.instance_id(&event) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(error = %e, "Trigger cannot be routed to an instance");
                let ctx = FailureContext {
                    error: e.to_string(),
                    event,
                };
                tokio::spawn(async move { workflow.on_failure(ctx).await });
                return Err(e);
            }
        };

        let key = workflow.concurrency_key(&event);
        tracing::debug!(instance = %instance, key = ?key, "Trigger accepted");

        // The gauge counts queued and running instances; the guard lives
        // outside the job so a job dropped on shutdown still decrements
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let gauge = scopeguard::guard(self.in_flight.clone(), |gauge| {
            gauge.fetch_sub(1, Ordering::Relaxed);
        });

        let steps = self.steps.clone();
        let notices_tx = self.notices_tx.clone();
        let job_instance = instance.clone();
        let job = async move {
            let _gauge = gauge;

            tracing::info!(instance = %job_instance, "Instance started");
            let outcome = match workflow.run(&job_instance, &event, &steps).await {
                Ok(()) => {
                    tracing::info!(instance = %job_instance, "Instance completed");
                    InstanceOutcome::Completed
                }
                Err(e) => {
                    tracing::warn!(
                        instance = %job_instance,
                        error = %e,
                        "Instance failed, invoking failure handler"
                    );
                    workflow
                        .on_failure(FailureContext {
                            event,
                            error: e.to_string(),
                        })
                        .await;
                    InstanceOutcome::Failed(e.to_string())
                }
            };

            // No receivers is fine; notices are observation, not control
            // flow
            let _ = notices_tx.send(InstanceNotice {
                instance: job_instance,
                outcome,
            });
        };

        match key {
            Some(key) => self.lanes.submit(&key, job),
            None => {
                tokio::spawn(job);
            }
        }

        Ok(instance)
    }

    /// Stream of terminal-outcome notices for all instances.
    ///
    /// Backed by a broadcast channel: a slow reader may miss notices, and
    /// only outcomes after subscription are seen.
    pub fn updates(&self) -> Pin<Box<dyn Stream<Item = InstanceNotice> + Send>> {
        let rx = self.notices_tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|result| result.ok()))
    }

    /// Number of instances currently queued or running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Stop the lane workers and background tasks. In-flight instances
    /// finish their current job; queued jobs are dropped.
    pub fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeOutcome, MockComputeClient};
    use crate::config::{ComputeConfig, RetryPolicy};
    use crate::song::{NewSongRequest, Owner, OwnerId, SongId, SongStatus};
    use crate::store::memory::MemoryStore;
    use crate::store::SongStore;
    use crate::workflow::generate::{GenerateSong, GenerateSongTrigger, GENERATE_SONG_EVENT};
    use uuid::Uuid;

    const ENDPOINT: &str = "https://gen.example.com/describe";

    struct Harness {
        engine: Engine,
        store: Arc<MemoryStore>,
        compute: Arc<MockComputeClient>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let compute = Arc::new(MockComputeClient::new());
        let workflow = Arc::new(GenerateSong::new(
            store.clone(),
            compute.clone(),
            ComputeConfig {
                description_endpoint: ENDPOINT.to_string(),
                lyrics_endpoint: "https://gen.example.com/lyrics".to_string(),
                described_lyrics_endpoint: "https://gen.example.com/described-lyrics".to_string(),
                ..Default::default()
            },
        ));
        let engine = Engine::builder(store.clone())
            .with_config(EngineConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    backoff_ms: 1,
                    backoff_factor: 2,
                    max_backoff_ms: 5,
                },
                status_log_interval_ms: None,
            })
            .register(workflow)
            .build();

        Harness {
            engine,
            store,
            compute,
        }
    }

    async fn seed_owner(store: &MemoryStore, credits: u32) -> OwnerId {
        let owner_id = OwnerId::from(Uuid::new_v4());
        store
            .insert_owner(Owner {
                id: owner_id,
                credits,
            })
            .await
            .unwrap();
        owner_id
    }

    async fn seed_song(store: &MemoryStore, owner_id: OwnerId, description: Option<&str>) -> SongId {
        let song_id = SongId::from(Uuid::new_v4());
        let mut request = NewSongRequest::new(song_id, owner_id);
        request.full_described_song = description.map(|s| s.to_string());
        store.insert_request(request).await.unwrap();
        song_id
    }

    fn success_outcome() -> ComputeOutcome {
        ComputeOutcome {
            ok: true,
            status: 200,
            body: Some(serde_json::json!({
                "s3_key": "songs/a.mp3",
                "cover_image_s3_key": "covers/a.png",
                "categories": ["Epic"],
            })),
        }
    }

    async fn wait_for_status(store: &MemoryStore, id: SongId, status: SongStatus) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if store.get_request(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "song {id} never reached {status}, stuck at {}",
            store.get_request(id).await.unwrap().status
        );
    }

    #[test_log::test(tokio::test)]
    async fn trigger_drives_song_to_processed() {
        let h = harness();
        let owner_id = seed_owner(&h.store, 5).await;
        let song_id = seed_song(&h.store, owner_id, Some("epic battle theme")).await;
        h.compute.add_response(ENDPOINT, Ok(success_outcome()));

        let mut updates = h.engine.updates();
        let instance = h
            .engine
            .trigger(GenerateSongTrigger::new(song_id, owner_id).into_event())
            .unwrap();

        wait_for_status(&h.store, song_id, SongStatus::Processed).await;
        assert_eq!(h.store.get_owner(owner_id).await.unwrap().credits, 4);

        let notice = tokio::time::timeout(Duration::from_secs(2), updates.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.instance, instance);
        assert_eq!(notice.outcome, InstanceOutcome::Completed);
    }

    #[test_log::test(tokio::test)]
    async fn unknown_event_names_are_rejected() {
        let h = harness();
        let result = h
            .engine
            .trigger(TriggerEvent::new("mystery-event", serde_json::json!({})));
        assert!(matches!(result, Err(Error::UnknownWorkflow(_))));
    }

    #[test_log::test(tokio::test)]
    async fn unroutable_triggers_error_without_crashing() {
        let h = harness();
        let result = h.engine.trigger(TriggerEvent::new(
            GENERATE_SONG_EVENT,
            serde_json::json!({ "songId": "not-a-uuid" }),
        ));
        assert!(matches!(result, Err(Error::MalformedTrigger(_))));

        // The spawned failure handler has nothing to mark and must not
        // disturb anything
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.in_flight_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn unrecovered_step_error_reaches_failed_via_the_handler() {
        let h = harness();
        let owner_id = seed_owner(&h.store, 5).await;
        // No generation mode: admission passes through an empty endpoint,
        // which the (unconfigured) compute client rejects as an error
        let song_id = seed_song(&h.store, owner_id, None).await;

        let mut updates = h.engine.updates();
        h.engine
            .trigger(GenerateSongTrigger::new(song_id, owner_id).into_event())
            .unwrap();

        wait_for_status(&h.store, song_id, SongStatus::Failed).await;
        assert_eq!(h.store.get_owner(owner_id).await.unwrap().credits, 5);

        let notice = tokio::time::timeout(Duration::from_secs(2), updates.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice.outcome, InstanceOutcome::Failed(_)));
    }

    #[test_log::test(tokio::test)]
    async fn same_owner_instances_run_one_at_a_time() {
        let h = harness();
        let owner_id = seed_owner(&h.store, 2).await;
        let first = seed_song(&h.store, owner_id, Some("first song")).await;
        let second = seed_song(&h.store, owner_id, Some("second song")).await;

        let gate = h
            .compute
            .add_response_with_trigger(ENDPOINT, Ok(success_outcome()));
        h.compute.add_response(ENDPOINT, Ok(success_outcome()));

        h.engine
            .trigger(GenerateSongTrigger::new(first, owner_id).into_event())
            .unwrap();
        h.engine
            .trigger(GenerateSongTrigger::new(second, owner_id).into_event())
            .unwrap();

        // Wait until the first call is held in flight
        let start = tokio::time::Instant::now();
        while h.compute.in_flight_count() == 0 && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.compute.in_flight_count(), 1);

        // The second instance has not started processing while the first
        // is still in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.compute.call_count(), 1);
        assert_eq!(
            h.store.get_request(second).await.unwrap().status,
            SongStatus::Queued
        );

        gate.send(()).unwrap();
        wait_for_status(&h.store, first, SongStatus::Processed).await;
        wait_for_status(&h.store, second, SongStatus::Processed).await;
        assert_eq!(h.compute.call_count(), 2);
        assert_eq!(h.store.get_owner(owner_id).await.unwrap().credits, 0);
    }

    #[test_log::test(tokio::test)]
    async fn distinct_owners_run_in_parallel() {
        let h = harness();
        let owner_a = seed_owner(&h.store, 1).await;
        let owner_b = seed_owner(&h.store, 1).await;
        let song_a = seed_song(&h.store, owner_a, Some("song a")).await;
        let song_b = seed_song(&h.store, owner_b, Some("song b")).await;

        let gate_a = h
            .compute
            .add_response_with_trigger(ENDPOINT, Ok(success_outcome()));
        let gate_b = h
            .compute
            .add_response_with_trigger(ENDPOINT, Ok(success_outcome()));

        h.engine
            .trigger(GenerateSongTrigger::new(song_a, owner_a).into_event())
            .unwrap();
        h.engine
            .trigger(GenerateSongTrigger::new(song_b, owner_b).into_event())
            .unwrap();

        // Both calls in flight at once proves the lanes do not serialize
        // across owners
        let start = tokio::time::Instant::now();
        while h.compute.in_flight_count() < 2 && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.compute.in_flight_count(), 2);

        gate_a.send(()).unwrap();
        gate_b.send(()).unwrap();
        wait_for_status(&h.store, song_a, SongStatus::Processed).await;
        wait_for_status(&h.store, song_b, SongStatus::Processed).await;
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_delivery_replays_the_same_instance() {
        let h = harness();
        let owner_id = seed_owner(&h.store, 5).await;
        let song_id = seed_song(&h.store, owner_id, Some("epic battle theme")).await;
        h.compute.add_response(ENDPOINT, Ok(success_outcome()));

        let event = GenerateSongTrigger::new(song_id, owner_id).into_event();
        let first = h.engine.trigger(event.clone()).unwrap();
        wait_for_status(&h.store, song_id, SongStatus::Processed).await;

        // At-least-once delivery: the duplicate maps to the same instance
        // and replays the recorded steps without new effects
        let second = h.engine.trigger(event).unwrap();
        assert_eq!(first, second);

        let start = tokio::time::Instant::now();
        while h.engine.in_flight_count() > 0 && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.compute.call_count(), 1);
        assert_eq!(h.store.get_owner(owner_id).await.unwrap().credits, 4);
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_drops_queued_work() {
        let h = harness();
        let owner_id = seed_owner(&h.store, 2).await;
        let first = seed_song(&h.store, owner_id, Some("first song")).await;
        let second = seed_song(&h.store, owner_id, Some("second song")).await;

        let gate = h
            .compute
            .add_response_with_trigger(ENDPOINT, Ok(success_outcome()));
        h.compute.add_response(ENDPOINT, Ok(success_outcome()));

        h.engine
            .trigger(GenerateSongTrigger::new(first, owner_id).into_event())
            .unwrap();
        h.engine
            .trigger(GenerateSongTrigger::new(second, owner_id).into_event())
            .unwrap();

        let start = tokio::time::Instant::now();
        while h.compute.in_flight_count() == 0 && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.engine.shutdown();
        gate.send(()).unwrap();

        // The in-flight instance finishes; the queued one never starts
        wait_for_status(&h.store, first, SongStatus::Processed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.compute.call_count(), 1);
        assert_eq!(
            h.store.get_request(second).await.unwrap().status,
            SongStatus::Queued
        );
    }
}
