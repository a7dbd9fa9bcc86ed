//! Domain types for song generation.
//!
//! This module defines:
//! - Identifiers for songs, owners, and categories
//! - The persisted generation request and its status machine
//! - The wire types exchanged with the generation service
//!
//! See workflow/ for the orchestration logic that drives these types
//! through the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a song generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SongId(pub Uuid);

impl From<Uuid> for SongId {
    fn from(uuid: Uuid) -> Self {
        SongId(uuid)
    }
}

impl std::ops::Deref for SongId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SongId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for the owner of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

impl From<Uuid> for OwnerId {
    fn from(uuid: Uuid) -> Self {
        OwnerId(uuid)
    }
}

impl std::ops::Deref for OwnerId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub Uuid);

impl From<Uuid> for CategoryId {
    fn from(uuid: Uuid) -> Self {
        CategoryId(uuid)
    }
}

impl std::ops::Deref for CategoryId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for CategoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle status of a generation request.
///
/// `Processed`, `Failed`, and `NoCredits` are terminal; the workflow never
/// moves a request out of a terminal state (the failure handler may rewrite
/// `Failed` over another status, which is the one sanctioned override).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SongStatus {
    Queued,
    Processing,
    Processed,
    Failed,
    #[serde(rename = "no credits")]
    NoCredits,
}

impl SongStatus {
    /// The string persisted in the store and observed by clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            SongStatus::Queued => "queued",
            SongStatus::Processing => "processing",
            SongStatus::Processed => "processed",
            SongStatus::Failed => "failed",
            SongStatus::NoCredits => "no credits",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SongStatus::Processed | SongStatus::Failed | SongStatus::NoCredits
        )
    }
}

impl std::fmt::Display for SongStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SongStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SongStatus::Queued),
            "processing" => Ok(SongStatus::Processing),
            "processed" => Ok(SongStatus::Processed),
            "failed" => Ok(SongStatus::Failed),
            "no credits" => Ok(SongStatus::NoCredits),
            other => Err(crate::error::Error::Internal(anyhow::anyhow!(
                "unknown song status: {other}"
            ))),
        }
    }
}

/// A persisted song generation request.
///
/// Exactly one mode combination is expected to be populated: a full
/// description, lyrics plus a prompt, or described lyrics plus a prompt.
/// Rows are created in `Queued`; the workflow owns every later transition.
#[derive(Debug, Clone, Serialize)]
pub struct SongRequest {
    pub id: SongId,
    pub owner_id: OwnerId,
    pub full_described_song: Option<String>,
    pub lyrics: Option<String>,
    pub prompt: Option<String>,
    pub described_lyrics: Option<String>,
    pub guidance_scale: Option<f64>,
    pub infer_step: Option<i64>,
    pub audio_duration: Option<f64>,
    pub seed: Option<i64>,
    pub instrumental: Option<bool>,
    pub status: SongStatus,
    pub audio_key: Option<String>,
    pub thumbnail_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SongRequest {
    /// Selects the generation mode for this request, in priority order:
    /// full description, then lyrics + prompt, then described lyrics +
    /// prompt. Empty strings count as absent. Returns `None` when no
    /// combination is populated.
    pub fn generation_mode(&self) -> Option<GenerationMode> {
        fn filled(field: &Option<String>) -> Option<&str> {
            field.as_deref().filter(|s| !s.is_empty())
        }

        if let Some(description) = filled(&self.full_described_song) {
            Some(GenerationMode::FullDescription {
                description: description.to_string(),
            })
        } else if let (Some(lyrics), Some(prompt)) = (filled(&self.lyrics), filled(&self.prompt)) {
            Some(GenerationMode::Lyrics {
                lyrics: lyrics.to_string(),
                prompt: prompt.to_string(),
            })
        } else if let (Some(described_lyrics), Some(prompt)) =
            (filled(&self.described_lyrics), filled(&self.prompt))
        {
            Some(GenerationMode::DescribedLyrics {
                described_lyrics: described_lyrics.to_string(),
                prompt: prompt.to_string(),
            })
        } else {
            None
        }
    }
}

/// The three ways a request can describe the song to generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationMode {
    /// One free-text description of the whole song
    FullDescription { description: String },
    /// Caller-written lyrics plus a style prompt
    Lyrics { lyrics: String, prompt: String },
    /// A free-text description of the lyrics plus a style prompt
    DescribedLyrics {
        described_lyrics: String,
        prompt: String,
    },
}

/// Fields for inserting a new request. The store fills in status
/// (`Queued`) and timestamps.
#[derive(Debug, Clone)]
pub struct NewSongRequest {
    pub id: SongId,
    pub owner_id: OwnerId,
    pub full_described_song: Option<String>,
    pub lyrics: Option<String>,
    pub prompt: Option<String>,
    pub described_lyrics: Option<String>,
    pub guidance_scale: Option<f64>,
    pub infer_step: Option<i64>,
    pub audio_duration: Option<f64>,
    pub seed: Option<i64>,
    pub instrumental: Option<bool>,
}

impl NewSongRequest {
    /// A request with no mode inputs or tuning parameters set.
    pub fn new(id: SongId, owner_id: OwnerId) -> Self {
        NewSongRequest {
            id,
            owner_id,
            full_described_song: None,
            lyrics: None,
            prompt: None,
            described_lyrics: None,
            guidance_scale: None,
            infer_step: None,
            audio_duration: None,
            seed: None,
            instrumental: None,
        }
    }
}

/// An account that owns generation requests and pays for them in credits.
///
/// The balance is unsigned on purpose: the store's guarded decrement is the
/// only mutation and refuses to go below zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub id: OwnerId,
    pub credits: u32,
}

/// A category attached to generated songs, unique by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
}

/// JSON body sent to the generation service.
///
/// Field names follow the service's wire format. Unset tuning parameters
/// are omitted entirely rather than sent as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infer_step: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrumental: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_described_song: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub described_lyrics: Option<String>,
}

/// Success body returned by the generation service.
///
/// All fields are required; a 2xx response whose body does not match this
/// shape is treated as a failed generation, not a transport error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub s3_key: String,
    pub cover_image_s3_key: String,
    pub categories: Vec<String>,
}
