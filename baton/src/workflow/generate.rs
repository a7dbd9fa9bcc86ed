//! The song generation workflow.
//!
//! Drives a persisted request through admission, the external generation
//! call, result persistence, and credit deduction as durable steps:
//!
//! - `check-admission`: load request + owner, pick the mode, build the
//!   endpoint and payload
//! - with credits: `mark-processing`, `call-external-compute`,
//!   `apply-result`, `deduct-credit`
//! - without credits: `mark-no-credits`
//!
//! The external call's outcome is part of the business flow: `ok = false`
//! marks the song failed without charging a credit, and the instance still
//! completes normally. Only unrecovered errors (missing rows, exhausted
//! store retries) reach the failure handler, which forces the song to
//! `Failed`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compute::{ComputeClient, ComputeOutcome};
use crate::config::ComputeConfig;
use crate::error::{Error, Result};
use crate::song::{
    ComputePayload, GenerationMode, GenerationResult, Owner, OwnerId, SongId, SongRequest,
    SongStatus,
};
use crate::store::{ResultUpdate, SongStore};
use crate::workflow::step::StepRunner;
use crate::workflow::{FailureContext, InstanceId, TriggerEvent, Workflow};

/// Event name that triggers this workflow.
pub const GENERATE_SONG_EVENT: &str = "generate-song-event";

/// Typed builder for the trigger this workflow consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateSongTrigger {
    pub song_id: SongId,
    pub user_id: OwnerId,
}

impl GenerateSongTrigger {
    pub fn new(song_id: SongId, user_id: OwnerId) -> Self {
        Self { song_id, user_id }
    }

    /// The event that enqueues this workflow for a request.
    pub fn into_event(self) -> TriggerEvent {
        TriggerEvent::new(
            GENERATE_SONG_EVENT,
            serde_json::json!({ "songId": self.song_id, "userId": self.user_id }),
        )
    }
}

/// Output of the `check-admission` step.
///
/// When the request matches no generation mode, `endpoint` and `payload`
/// stay empty and the compute step fails the instance; the request still
/// ends in a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub owner_id: OwnerId,
    pub credits: u32,
    pub endpoint: String,
    pub payload: ComputePayload,
}

/// The generate-song workflow over a store and a compute client.
pub struct GenerateSong<S, C> {
    store: Arc<S>,
    compute: Arc<C>,
    config: ComputeConfig,
}

impl<S, C> GenerateSong<S, C>
where
    S: SongStore,
    C: ComputeClient,
{
    pub fn new(store: Arc<S>, compute: Arc<C>, config: ComputeConfig) -> Self {
        Self {
            store,
            compute,
            config,
        }
    }
}

/// Build the admission outcome for a loaded request.
fn admission(request: &SongRequest, owner: &Owner, config: &ComputeConfig) -> Admission {
    let (endpoint, payload) = match request.generation_mode() {
        Some(mode) => {
            let endpoint = match &mode {
                GenerationMode::FullDescription { .. } => config.description_endpoint.clone(),
                GenerationMode::Lyrics { .. } => config.lyrics_endpoint.clone(),
                GenerationMode::DescribedLyrics { .. } => config.described_lyrics_endpoint.clone(),
            };
            (endpoint, build_payload(request, mode))
        }
        // No populated mode: pass through with an empty endpoint and
        // payload, which the compute step cannot deliver
        None => (String::new(), ComputePayload::default()),
    };

    Admission {
        owner_id: owner.id,
        credits: owner.credits,
        endpoint,
        payload,
    }
}

fn build_payload(request: &SongRequest, mode: GenerationMode) -> ComputePayload {
    let mut payload = ComputePayload {
        guidance_scale: request.guidance_scale,
        infer_step: request.infer_step,
        audio_duration: request.audio_duration,
        seed: request.seed,
        instrumental: request.instrumental,
        ..Default::default()
    };

    match mode {
        GenerationMode::FullDescription { description } => {
            payload.full_described_song = Some(description);
        }
        GenerationMode::Lyrics { lyrics, prompt } => {
            payload.lyrics = Some(lyrics);
            payload.prompt = Some(prompt);
        }
        GenerationMode::DescribedLyrics {
            described_lyrics,
            prompt,
        } => {
            payload.described_lyrics = Some(described_lyrics);
            payload.prompt = Some(prompt);
        }
    }

    payload
}

/// Persist the external outcome: keys and `Processed` for a parseable
/// success, `Failed` for everything else. Category linking is idempotent,
/// so replaying this step cannot create duplicates.
///
/// Returns whether the song was marked `Processed`. The deduction step
/// charges only on that value: a 2xx response with an unusable body ends
/// in `Failed` and must stay free, like any other failed generation.
async fn apply_outcome<S: SongStore + ?Sized>(
    store: &S,
    song_id: SongId,
    outcome: &ComputeOutcome,
) -> Result<bool> {
    let parsed: Option<GenerationResult> = if outcome.ok {
        outcome
            .body
            .clone()
            .and_then(|body| serde_json::from_value(body).ok())
    } else {
        None
    };

    match parsed {
        Some(result) => {
            store
                .apply_result(
                    song_id,
                    ResultUpdate {
                        audio_key: Some(result.s3_key.clone()),
                        thumbnail_key: Some(result.cover_image_s3_key.clone()),
                        status: SongStatus::Processed,
                    },
                )
                .await?;
            if !result.categories.is_empty() {
                store
                    .upsert_and_link_categories(song_id, &result.categories)
                    .await?;
            }
            tracing::info!(
                song_id = %song_id,
                categories = result.categories.len(),
                "Generation result applied"
            );
            Ok(true)
        }
        None => {
            // Covers non-2xx outcomes, timeouts, and 2xx bodies that do
            // not parse as a generation result
            store
                .apply_result(
                    song_id,
                    ResultUpdate {
                        audio_key: None,
                        thumbnail_key: None,
                        status: SongStatus::Failed,
                    },
                )
                .await?;
            tracing::warn!(
                song_id = %song_id,
                status = outcome.status,
                "Generation did not succeed, song marked failed"
            );
            Ok(false)
        }
    }
}

/// Strict extraction for routing: the trigger must carry a parseable
/// `songId`.
fn song_id_from(event: &TriggerEvent) -> Result<SongId> {
    parse_song_id(&event.data).ok_or_else(|| {
        Error::MalformedTrigger(format!("no usable songId in event data: {}", event.data))
    })
}

/// Field lookup shared by routing and the failure handler. Tolerates the
/// doubly nested shape older failure events carried
/// (`data.event.data.songId`).
fn parse_song_id(data: &serde_json::Value) -> Option<SongId> {
    let direct = data.get("songId");
    let nested = data
        .get("event")
        .and_then(|event| event.get("data"))
        .and_then(|data| data.get("songId"));

    direct
        .or(nested)?
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(SongId::from)
}

fn owner_key(event: &TriggerEvent) -> Option<String> {
    event
        .data
        .get("userId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl<S, C> Workflow for GenerateSong<S, C>
where
    S: SongStore + 'static,
    C: ComputeClient + 'static,
{
    fn event_name(&self) -> &str {
        GENERATE_SONG_EVENT
    }

    fn instance_id(&self, event: &TriggerEvent) -> Result<InstanceId> {
        let song_id = song_id_from(event)?;
        Ok(InstanceId::from(format!("generate-song/{}", song_id.0)))
    }

    fn concurrency_key(&self, event: &TriggerEvent) -> Option<String> {
        owner_key(event)
    }

    #[tracing::instrument(skip(self, event, steps), fields(instance = %instance))]
    async fn run(
        &self,
        instance: &InstanceId,
        event: &TriggerEvent,
        steps: &StepRunner,
    ) -> Result<()> {
        let song_id = song_id_from(event)?;

        let store = self.store.clone();
        let config = self.config.clone();
        let checked: Admission = steps
            .run(instance, "check-admission", move || {
                let store = store.clone();
                let config = config.clone();
                async move {
                    let (request, owner) = store.load_request_and_owner(song_id).await?;
                    Ok(admission(&request, &owner, &config))
                }
            })
            .await?;

        tracing::debug!(
            song_id = %song_id,
            credits = checked.credits,
            endpoint = %checked.endpoint,
            "Admission checked"
        );

        if checked.credits > 0 {
            let store = self.store.clone();
            steps
                .run(instance, "mark-processing", move || {
                    let store = store.clone();
                    async move { store.set_status(song_id, SongStatus::Processing).await }
                })
                .await?;

            let compute = self.compute.clone();
            let endpoint = checked.endpoint.clone();
            let payload = checked.payload.clone();
            let outcome: ComputeOutcome = steps
                .run(instance, "call-external-compute", move || {
                    let compute = compute.clone();
                    let endpoint = endpoint.clone();
                    let payload = payload.clone();
                    async move { compute.execute(&endpoint, &payload).await }
                })
                .await?;

            let store = self.store.clone();
            let applied = outcome.clone();
            let processed: bool = steps
                .run(instance, "apply-result", move || {
                    let store = store.clone();
                    let outcome = applied.clone();
                    async move { apply_outcome(store.as_ref(), song_id, &outcome).await }
                })
                .await?;

            let store = self.store.clone();
            let owner_id = checked.owner_id;
            // The recorded apply-result value, so a crash replay charges
            // the same answer it applied
            let charge = processed;
            steps
                .run(instance, "deduct-credit", move || {
                    let store = store.clone();
                    async move {
                        if !charge {
                            return Ok(());
                        }
                        let remaining = store.decrement_credits(owner_id, 1).await?;
                        tracing::info!(
                            owner_id = %owner_id,
                            remaining = remaining,
                            "Deducted one credit"
                        );
                        Ok(())
                    }
                })
                .await?;
        } else {
            let store = self.store.clone();
            steps
                .run(instance, "mark-no-credits", move || {
                    let store = store.clone();
                    async move { store.set_status(song_id, SongStatus::NoCredits).await }
                })
                .await?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, ctx))]
    async fn on_failure(&self, ctx: FailureContext) {
        let Some(song_id) = parse_song_id(&ctx.event.data) else {
            tracing::warn!(
                error = %ctx.error,
                "Failure context carries no song id, nothing to mark"
            );
            return;
        };

        tracing::warn!(song_id = %song_id, error = %ctx.error, "Marking song failed");
        if let Err(e) = self.store.set_status(song_id, SongStatus::Failed).await {
            tracing::error!(song_id = %song_id, error = %e, "Could not mark song failed");
        }
    }
}
