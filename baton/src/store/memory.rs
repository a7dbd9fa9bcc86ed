//! In-memory store implementation.
//!
//! Stores everything behind one lock, which keeps multi-map operations
//! (request + owner loads, category upsert + link) atomic without
//! transactions. Suitable for tests and single-process embedding; data is
//! lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::song::{
    Category, CategoryId, NewSongRequest, Owner, OwnerId, SongId, SongRequest, SongStatus,
};
use crate::workflow::InstanceId;

use super::{ResultUpdate, SongStore, StepLog, StepOutcome, StepRecord};

#[derive(Default)]
struct Inner {
    requests: HashMap<SongId, SongRequest>,
    owners: HashMap<OwnerId, Owner>,
    categories: HashMap<CategoryId, Category>,
    links: HashMap<SongId, Vec<CategoryId>>,
    steps: HashMap<InstanceId, Vec<(String, StepRecord)>>,
}

impl Inner {
    fn category_by_name(&self, name: &str) -> Option<Category> {
        self.categories.values().find(|c| c.name == name).cloned()
    }
}

/// In-memory implementation of [`SongStore`] and [`StepLog`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SongStore for MemoryStore {
    async fn insert_request(&self, request: NewSongRequest) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.requests.contains_key(&request.id) {
            return Err(Error::AlreadyExists(format!("request {}", request.id)));
        }

        let now = Utc::now();
        inner.requests.insert(
            request.id,
            SongRequest {
                id: request.id,
                owner_id: request.owner_id,
                full_described_song: request.full_described_song,
                lyrics: request.lyrics,
                prompt: request.prompt,
                described_lyrics: request.described_lyrics,
                guidance_scale: request.guidance_scale,
                infer_step: request.infer_step,
                audio_duration: request.audio_duration,
                seed: request.seed,
                instrumental: request.instrumental,
                status: SongStatus::Queued,
                audio_key: None,
                thumbnail_key: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn insert_owner(&self, owner: Owner) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.owners.contains_key(&owner.id) {
            return Err(Error::AlreadyExists(format!("owner {}", owner.id)));
        }

        inner.owners.insert(owner.id, owner);
        Ok(())
    }

    async fn get_request(&self, id: SongId) -> Result<SongRequest> {
        self.inner
            .read()
            .requests
            .get(&id)
            .cloned()
            .ok_or(Error::RequestNotFound(id))
    }

    async fn get_owner(&self, id: OwnerId) -> Result<Owner> {
        self.inner
            .read()
            .owners
            .get(&id)
            .cloned()
            .ok_or(Error::OwnerNotFound(id))
    }

    async fn load_request_and_owner(&self, id: SongId) -> Result<(SongRequest, Owner)> {
        let inner = self.inner.read();

        let request = inner
            .requests
            .get(&id)
            .cloned()
            .ok_or(Error::RequestNotFound(id))?;
        let owner = inner
            .owners
            .get(&request.owner_id)
            .cloned()
            .ok_or(Error::OwnerNotFound(request.owner_id))?;

        Ok((request, owner))
    }

    async fn list_requests_for_owner(&self, owner_id: OwnerId) -> Result<Vec<SongRequest>> {
        let inner = self.inner.read();

        let mut requests: Vec<SongRequest> = inner
            .requests
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(requests)
    }

    async fn set_status(&self, id: SongId, status: SongStatus) -> Result<()> {
        let mut inner = self.inner.write();

        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(Error::RequestNotFound(id))?;
        request.status = status;
        request.updated_at = Utc::now();

        Ok(())
    }

    async fn apply_result(&self, id: SongId, update: ResultUpdate) -> Result<()> {
        let mut inner = self.inner.write();

        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(Error::RequestNotFound(id))?;
        if let Some(audio_key) = update.audio_key {
            request.audio_key = Some(audio_key);
        }
        if let Some(thumbnail_key) = update.thumbnail_key {
            request.thumbnail_key = Some(thumbnail_key);
        }
        request.status = update.status;
        request.updated_at = Utc::now();

        Ok(())
    }

    async fn upsert_and_link_categories(
        &self,
        id: SongId,
        names: &[String],
    ) -> Result<Vec<Category>> {
        let mut inner = self.inner.write();

        if !inner.requests.contains_key(&id) {
            return Err(Error::RequestNotFound(id));
        }

        let mut linked = Vec::with_capacity(names.len());
        for name in names {
            let category = match inner.category_by_name(name) {
                Some(existing) => existing,
                None => {
                    let category = Category {
                        id: CategoryId::from(Uuid::new_v4()),
                        name: name.clone(),
                    };
                    inner.categories.insert(category.id, category.clone());
                    category
                }
            };

            let links = inner.links.entry(id).or_default();
            if !links.contains(&category.id) {
                links.push(category.id);
            }
            linked.push(category);
        }

        Ok(linked)
    }

    async fn decrement_credits(&self, owner_id: OwnerId, amount: u32) -> Result<u32> {
        let mut inner = self.inner.write();

        let owner = inner
            .owners
            .get_mut(&owner_id)
            .ok_or(Error::OwnerNotFound(owner_id))?;
        if owner.credits < amount {
            return Err(Error::InsufficientCredits {
                owner_id,
                available: owner.credits,
                requested: amount,
            });
        }
        owner.credits -= amount;

        Ok(owner.credits)
    }

    async fn categories_for_request(&self, id: SongId) -> Result<Vec<Category>> {
        let inner = self.inner.read();

        let mut categories: Vec<Category> = inner
            .links
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|cid| inner.categories.get(cid).cloned())
                    .collect()
            })
            .unwrap_or_default();
        categories.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(categories)
    }

    async fn list_categories(&self) -> Result<Vec<Category>> {
        let inner = self.inner.read();

        let mut categories: Vec<Category> = inner.categories.values().cloned().collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(categories)
    }
}

#[async_trait]
impl StepLog for MemoryStore {
    async fn get_step(&self, instance: &InstanceId, step: &str) -> Result<Option<StepRecord>> {
        let inner = self.inner.read();

        Ok(inner.steps.get(instance).and_then(|steps| {
            steps
                .iter()
                .find(|(name, _)| name == step)
                .map(|(_, record)| record.clone())
        }))
    }

    async fn record_step(
        &self,
        instance: &InstanceId,
        step: &str,
        outcome: StepOutcome,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        let steps = inner.steps.entry(instance.clone()).or_default();
        // First write wins: a replay must not rewrite history
        if steps.iter().any(|(name, _)| name == step) {
            return Ok(());
        }
        steps.push((
            step.to_string(),
            StepRecord {
                outcome,
                recorded_at: Utc::now(),
            },
        ));

        Ok(())
    }

    async fn list_steps(&self, instance: &InstanceId) -> Result<Vec<(String, StepRecord)>> {
        let inner = self.inner.read();

        Ok(inner.steps.get(instance).cloned().unwrap_or_default())
    }
}
