//! SQLite store implementation.
//!
//! Uses the runtime query API with `?`-binds throughout; ids are stored as
//! TEXT uuids and timestamps as RFC 3339 TEXT. The schema is installed by
//! [`SqliteStore::init`], which is idempotent and safe to call on every
//! startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::song::{
    Category, CategoryId, NewSongRequest, Owner, OwnerId, SongId, SongRequest, SongStatus,
};
use crate::workflow::InstanceId;

use super::{ResultUpdate, SongStore, StepLog, StepOutcome, StepRecord};

/// SQLite implementation of [`SongStore`] and [`StepLog`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`init`](Self::init) before first use
    /// unless the schema is already installed.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Open (or create) a database at `url` and install the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().connect(url).await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// An isolated in-memory database, for tests.
    ///
    /// The pool is capped at one connection: every connection to
    /// `sqlite::memory:` gets its own database, so a larger pool would
    /// scatter the tables.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Install the schema. Idempotent.
    pub async fn init(&self) -> Result<()> {
        tracing::debug!("Installing song store schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS songs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                full_described_song TEXT,
                lyrics TEXT,
                prompt TEXT,
                described_lyrics TEXT,
                guidance_scale REAL,
                infer_step INTEGER,
                audio_duration REAL,
                seed INTEGER,
                instrumental INTEGER,
                status TEXT NOT NULL DEFAULT 'queued',
                audio_key TEXT,
                thumbnail_key TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS owners (
                id TEXT PRIMARY KEY,
                credits INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS song_categories (
                song_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                PRIMARY KEY (song_id, category_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_results (
                instance_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                outcome TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (instance_id, step_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_songs_owner ON songs(owner_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn request_exists(&self, id: SongId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM songs WHERE id = ?)")
            .bind(id.0.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(anyhow::anyhow!("invalid uuid in {column}: {e}")))
}

fn song_from_row(row: &SqliteRow) -> Result<SongRequest> {
    let id: String = row.try_get("id")?;
    let owner_id: String = row.try_get("owner_id")?;
    let status: String = row.try_get("status")?;

    Ok(SongRequest {
        id: SongId::from(parse_uuid("songs.id", &id)?),
        owner_id: OwnerId::from(parse_uuid("songs.owner_id", &owner_id)?),
        full_described_song: row.try_get("full_described_song")?,
        lyrics: row.try_get("lyrics")?,
        prompt: row.try_get("prompt")?,
        described_lyrics: row.try_get("described_lyrics")?,
        guidance_scale: row.try_get("guidance_scale")?,
        infer_step: row.try_get("infer_step")?,
        audio_duration: row.try_get("audio_duration")?,
        seed: row.try_get("seed")?,
        instrumental: row.try_get("instrumental")?,
        status: status.parse()?,
        audio_key: row.try_get("audio_key")?,
        thumbnail_key: row.try_get("thumbnail_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn owner_from_row(row: &SqliteRow) -> Result<Owner> {
    let id: String = row.try_get("id")?;
    let credits: i64 = row.try_get("credits")?;

    Ok(Owner {
        id: OwnerId::from(parse_uuid("owners.id", &id)?),
        credits: u32::try_from(credits)
            .map_err(|_| Error::Internal(anyhow::anyhow!("negative credit balance: {credits}")))?,
    })
}

fn category_from_row(row: &SqliteRow) -> Result<Category> {
    let id: String = row.try_get("id")?;

    Ok(Category {
        id: CategoryId::from(parse_uuid("categories.id", &id)?),
        name: row.try_get("name")?,
    })
}

#[async_trait]
impl SongStore for SqliteStore {
    async fn insert_request(&self, request: NewSongRequest) -> Result<()> {
        if self.request_exists(request.id).await? {
            return Err(Error::AlreadyExists(format!("request {}", request.id)));
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO songs (
                id, owner_id, full_described_song, lyrics, prompt,
                described_lyrics, guidance_scale, infer_step, audio_duration,
                seed, instrumental, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.0.to_string())
        .bind(request.owner_id.0.to_string())
        .bind(request.full_described_song)
        .bind(request.lyrics)
        .bind(request.prompt)
        .bind(request.described_lyrics)
        .bind(request.guidance_scale)
        .bind(request.infer_step)
        .bind(request.audio_duration)
        .bind(request.seed)
        .bind(request.instrumental)
        .bind(SongStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_owner(&self, owner: Owner) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM owners WHERE id = ?)")
            .bind(owner.id.0.to_string())
            .fetch_one(&self.pool)
            .await?;
        if exists {
            return Err(Error::AlreadyExists(format!("owner {}", owner.id)));
        }

        sqlx::query("INSERT INTO owners (id, credits) VALUES (?, ?)")
            .bind(owner.id.0.to_string())
            .bind(owner.credits as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_request(&self, id: SongId) -> Result<SongRequest> {
        let row = sqlx::query("SELECT * FROM songs WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::RequestNotFound(id))?;

        song_from_row(&row)
    }

    async fn get_owner(&self, id: OwnerId) -> Result<Owner> {
        let row = sqlx::query("SELECT id, credits FROM owners WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::OwnerNotFound(id))?;

        owner_from_row(&row)
    }

    async fn load_request_and_owner(&self, id: SongId) -> Result<(SongRequest, Owner)> {
        let request = self.get_request(id).await?;
        let owner = self.get_owner(request.owner_id).await?;
        Ok((request, owner))
    }

    async fn list_requests_for_owner(&self, owner_id: OwnerId) -> Result<Vec<SongRequest>> {
        let rows = sqlx::query(
            "SELECT * FROM songs WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(owner_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(song_from_row).collect()
    }

    async fn set_status(&self, id: SongId, status: SongStatus) -> Result<()> {
        let result = sqlx::query("UPDATE songs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RequestNotFound(id));
        }
        Ok(())
    }

    async fn apply_result(&self, id: SongId, update: ResultUpdate) -> Result<()> {
        // COALESCE keeps the stored value when the update carries None
        let result = sqlx::query(
            r#"
            UPDATE songs
            SET audio_key = COALESCE(?, audio_key),
                thumbnail_key = COALESCE(?, thumbnail_key),
                status = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.audio_key)
        .bind(update.thumbnail_key)
        .bind(update.status.as_str())
        .bind(Utc::now())
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RequestNotFound(id));
        }
        Ok(())
    }

    async fn upsert_and_link_categories(
        &self,
        id: SongId,
        names: &[String],
    ) -> Result<Vec<Category>> {
        if !self.request_exists(id).await? {
            return Err(Error::RequestNotFound(id));
        }

        let mut linked = Vec::with_capacity(names.len());
        for name in names {
            sqlx::query("INSERT INTO categories (id, name) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
                .bind(Uuid::new_v4().to_string())
                .bind(name)
                .execute(&self.pool)
                .await?;

            let row = sqlx::query("SELECT id, name FROM categories WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
            let category = category_from_row(&row)?;

            sqlx::query(
                "INSERT INTO song_categories (song_id, category_id) VALUES (?, ?) \
                 ON CONFLICT(song_id, category_id) DO NOTHING",
            )
            .bind(id.0.to_string())
            .bind(category.id.0.to_string())
            .execute(&self.pool)
            .await?;

            linked.push(category);
        }

        Ok(linked)
    }

    async fn decrement_credits(&self, owner_id: OwnerId, amount: u32) -> Result<u32> {
        // Guarded in SQL so the balance can never go below zero, even with
        // concurrent writers
        let result = sqlx::query(
            "UPDATE owners SET credits = credits - ?1 WHERE id = ?2 AND credits >= ?1",
        )
        .bind(amount as i64)
        .bind(owner_id.0.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let owner = self.get_owner(owner_id).await?;
            return Err(Error::InsufficientCredits {
                owner_id,
                available: owner.credits,
                requested: amount,
            });
        }

        Ok(self.get_owner(owner_id).await?.credits)
    }

    async fn categories_for_request(&self, id: SongId) -> Result<Vec<Category>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name
            FROM categories c
            JOIN song_categories sc ON sc.category_id = c.id
            WHERE sc.song_id = ?
            ORDER BY c.name
            "#,
        )
        .bind(id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(category_from_row).collect()
    }

    async fn list_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query("SELECT id, name FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(category_from_row).collect()
    }
}

#[async_trait]
impl StepLog for SqliteStore {
    async fn get_step(&self, instance: &InstanceId, step: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query(
            "SELECT outcome, recorded_at FROM step_results \
             WHERE instance_id = ? AND step_name = ?",
        )
        .bind(instance.as_str())
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let outcome: String = row.try_get("outcome")?;
                let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
                Ok(Some(StepRecord {
                    outcome: serde_json::from_str(&outcome)?,
                    recorded_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn record_step(
        &self,
        instance: &InstanceId,
        step: &str,
        outcome: StepOutcome,
    ) -> Result<()> {
        // First write wins: a replay must not rewrite history
        sqlx::query(
            "INSERT INTO step_results (instance_id, step_name, outcome, recorded_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT(instance_id, step_name) DO NOTHING",
        )
        .bind(instance.as_str())
        .bind(step)
        .bind(serde_json::to_string(&outcome)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_steps(&self, instance: &InstanceId) -> Result<Vec<(String, StepRecord)>> {
        let rows = sqlx::query(
            "SELECT step_name, outcome, recorded_at FROM step_results \
             WHERE instance_id = ? ORDER BY rowid",
        )
        .bind(instance.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("step_name")?;
                let outcome: String = row.try_get("outcome")?;
                let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
                Ok((
                    name,
                    StepRecord {
                        outcome: serde_json::from_str(&outcome)?,
                        recorded_at,
                    },
                ))
            })
            .collect()
    }
}
