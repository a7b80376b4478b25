//! # vt-db-sqlite Implementation
//!
//! This module implements the data mapping between the SQLite relational model
//! and the `vt-core` domain models. Photos reference their pin through a
//! `ON DELETE CASCADE` foreign key, and `(pin_id, remote_id)` is unique so
//! that concurrent inserts of the same search hit collapse into one row.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;
use vt_core::error::{AppError, Result};
use vt_core::models::{Coordinate, Photo, PhotoDescriptor, PhotoId, Pin, PinId, StoreEvent};
use vt_core::traits::MetadataStore;

/// Upper bound on bound parameters per bulk statement.
const DELETE_CHUNK: usize = 500;
const EVENT_CAPACITY: usize = 256;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pins (
        id          BLOB PRIMARY KEY NOT NULL,
        latitude    REAL NOT NULL,
        longitude   REAL NOT NULL,
        created_at  TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pins_coordinate ON pins(latitude, longitude)",
    "CREATE TABLE IF NOT EXISTS photos (
        id          BLOB PRIMARY KEY NOT NULL,
        pin_id      BLOB NOT NULL REFERENCES pins(id) ON DELETE CASCADE,
        remote_id   TEXT NOT NULL,
        image_url   TEXT NOT NULL,
        image_size  INTEGER,
        created_at  TEXT NOT NULL,
        UNIQUE(pin_id, remote_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_photos_pin_id ON photos(pin_id)",
];

pub struct SqliteMetadataStore {
    pool: SqlitePool,
    events: broadcast::Sender<StoreEvent>,
}

// Helpers for UUID conversion
fn uuid_to_blob(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

fn blob_to_uuid(blob: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(blob).map_err(|e| AppError::Persistence(format!("corrupt id column: {e}")))
}

fn persistence(err: sqlx::Error) -> AppError {
    AppError::Persistence(err.to_string())
}

fn pin_from_row(row: &SqliteRow) -> Result<Pin> {
    Ok(Pin {
        id: PinId(blob_to_uuid(&row.try_get::<Vec<u8>, _>("id").map_err(persistence)?)?),
        latitude: row.try_get("latitude").map_err(persistence)?,
        longitude: row.try_get("longitude").map_err(persistence)?,
        created_at: row.try_get("created_at").map_err(persistence)?,
    })
}

fn photo_from_row(row: &SqliteRow) -> Result<Photo> {
    let image_size: Option<i64> = row.try_get("image_size").map_err(persistence)?;
    Ok(Photo {
        id: PhotoId(blob_to_uuid(&row.try_get::<Vec<u8>, _>("id").map_err(persistence)?)?),
        pin_id: PinId(blob_to_uuid(&row.try_get::<Vec<u8>, _>("pin_id").map_err(persistence)?)?),
        remote_id: row.try_get("remote_id").map_err(persistence)?,
        image_url: row.try_get("image_url").map_err(persistence)?,
        image_size: image_size.map(|n| n as u64),
        created_at: row.try_get("created_at").map_err(persistence)?,
    })
}

fn photo_ids_from_rows(rows: &[SqliteRow]) -> Result<Vec<PhotoId>> {
    rows.iter()
        .map(|row| {
            let blob: Vec<u8> = row.try_get("id").map_err(persistence)?;
            Ok(PhotoId(blob_to_uuid(&blob)?))
        })
        .collect()
}

impl SqliteMetadataStore {
    /// Opens (or creates) the database at `url` and applies the schema.
    ///
    /// Any failure here is an [`AppError::Initialization`]: the store is
    /// unusable without its backing engine.
    pub async fn new(url: &str) -> Result<Self> {
        let init = |e: sqlx::Error| AppError::Initialization(format!("{url}: {e}"));

        let options = SqliteConnectOptions::from_str(url)
            .map_err(init)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await.map_err(init)?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(init)?;
        }

        info!(%url, "metadata store initialized");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { pool, events })
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Reads back the row a find-or-create just inserted or collided with.
    /// A missing row means the pin, and with it the photo, was deleted in
    /// between.
    async fn fetch_photo_by_remote_id(&self, pin: PinId, remote_id: &str) -> Result<Photo> {
        let row = sqlx::query("SELECT * FROM photos WHERE pin_id = ? AND remote_id = ?")
            .bind(uuid_to_blob(pin.0))
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;

        match row {
            Some(row) => photo_from_row(&row),
            None => Err(AppError::NotFound("Pin".into(), pin.to_string())),
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_pin(&self, coordinate: Coordinate) -> Result<Pin> {
        let pin = Pin {
            id: PinId::new(),
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO pins (id, latitude, longitude, created_at) VALUES (?, ?, ?, ?)")
            .bind(uuid_to_blob(pin.id.0))
            .bind(pin.latitude)
            .bind(pin.longitude)
            .bind(pin.created_at)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;

        debug!(pin = %pin.id, %coordinate, "pin created");
        self.publish(StoreEvent::PinCreated(pin.id));
        Ok(pin)
    }

    async fn get_pin(&self, id: PinId) -> Result<Option<Pin>> {
        let row = sqlx::query("SELECT * FROM pins WHERE id = ?")
            .bind(uuid_to_blob(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;

        row.as_ref().map(pin_from_row).transpose()
    }

    async fn find_pin_at(&self, coordinate: Coordinate) -> Result<Option<Pin>> {
        let row = sqlx::query(
            "SELECT * FROM pins WHERE latitude = ? AND longitude = ? ORDER BY created_at, id LIMIT 1",
        )
        .bind(coordinate.latitude)
        .bind(coordinate.longitude)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;

        row.as_ref().map(pin_from_row).transpose()
    }

    async fn list_pins(&self) -> Result<Vec<Pin>> {
        let rows = sqlx::query("SELECT * FROM pins ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        rows.iter().map(pin_from_row).collect()
    }

    /// Removes the pin in one transaction. The foreign key cascades to its
    /// photos; their IDs are read first so the caller can sweep cached bytes.
    async fn delete_pin(&self, id: PinId) -> Result<Vec<PhotoId>> {
        let mut tx = self.pool.begin().await.map_err(persistence)?;

        let rows = sqlx::query("SELECT id FROM photos WHERE pin_id = ?")
            .bind(uuid_to_blob(id.0))
            .fetch_all(&mut *tx)
            .await
            .map_err(persistence)?;
        let photo_ids = photo_ids_from_rows(&rows)?;

        let deleted = sqlx::query("DELETE FROM pins WHERE id = ?")
            .bind(uuid_to_blob(id.0))
            .execute(&mut *tx)
            .await
            .map_err(persistence)?
            .rows_affected();

        if deleted == 0 {
            return Err(AppError::NotFound("Pin".into(), id.to_string()));
        }

        tx.commit().await.map_err(persistence)?;

        info!(pin = %id, photos = photo_ids.len(), "pin deleted");
        if !photo_ids.is_empty() {
            self.publish(StoreEvent::PhotosDeleted(photo_ids.clone()));
        }
        self.publish(StoreEvent::PinDeleted(id));
        Ok(photo_ids)
    }

    /// The unique `(pin_id, remote_id)` constraint is the critical section:
    /// of any number of concurrent callers exactly one insert takes effect.
    async fn find_or_create_photo(
        &self,
        pin: PinId,
        descriptor: &PhotoDescriptor,
    ) -> Result<(Photo, bool)> {
        let result = sqlx::query(
            "INSERT INTO photos (id, pin_id, remote_id, image_url, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(pin_id, remote_id) DO NOTHING",
        )
        .bind(uuid_to_blob(PhotoId::new().0))
        .bind(uuid_to_blob(pin.0))
        .bind(&descriptor.remote_id)
        .bind(&descriptor.url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        let created = match result {
            Ok(done) => done.rows_affected() == 1,
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(AppError::NotFound("Pin".into(), pin.to_string()));
            }
            Err(e) => return Err(persistence(e)),
        };

        let photo = self.fetch_photo_by_remote_id(pin, &descriptor.remote_id).await?;
        if created {
            self.publish(StoreEvent::PhotoInserted { pin, photo: photo.id });
        }
        Ok((photo, created))
    }

    async fn get_photo(&self, id: PhotoId) -> Result<Option<Photo>> {
        let row = sqlx::query("SELECT * FROM photos WHERE id = ?")
            .bind(uuid_to_blob(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;

        row.as_ref().map(photo_from_row).transpose()
    }

    async fn list_photos(&self, pin: PinId) -> Result<Vec<Photo>> {
        let rows = sqlx::query("SELECT * FROM photos WHERE pin_id = ? ORDER BY created_at, id")
            .bind(uuid_to_blob(pin.0))
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        rows.iter().map(photo_from_row).collect()
    }

    async fn list_photo_ids(&self) -> Result<Vec<PhotoId>> {
        let rows = sqlx::query("SELECT id FROM photos")
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        photo_ids_from_rows(&rows)
    }

    async fn delete_photos(&self, ids: &HashSet<PhotoId>) -> Result<Vec<PhotoId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<PhotoId> = ids.iter().copied().collect();
        let mut tx = self.pool.begin().await.map_err(persistence)?;
        let mut removed = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM photos WHERE id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(uuid_to_blob(id.0));
            }
            separated.push_unseparated(") RETURNING id");

            let rows = query.build().fetch_all(&mut *tx).await.map_err(persistence)?;
            removed.extend(photo_ids_from_rows(&rows)?);
        }

        tx.commit().await.map_err(persistence)?;

        info!(requested = ids.len(), removed = removed.len(), "photos deleted");
        if !removed.is_empty() {
            self.publish(StoreEvent::PhotosDeleted(removed.clone()));
        }
        Ok(removed)
    }

    async fn delete_all_photos_for_pin(&self, pin: PinId) -> Result<Vec<PhotoId>> {
        let rows = sqlx::query("DELETE FROM photos WHERE pin_id = ? RETURNING id")
            .bind(uuid_to_blob(pin.0))
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;
        let removed = photo_ids_from_rows(&rows)?;

        info!(pin = %pin, removed = removed.len(), "photos for pin deleted");
        if !removed.is_empty() {
            self.publish(StoreEvent::PhotosDeleted(removed.clone()));
        }
        Ok(removed)
    }

    async fn delete_all_photos(&self) -> Result<Vec<PhotoId>> {
        let rows = sqlx::query("DELETE FROM photos RETURNING id")
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;
        let removed = photo_ids_from_rows(&rows)?;

        if !removed.is_empty() {
            info!(removed = removed.len(), "all photos deleted");
            self.publish(StoreEvent::PhotosDeleted(removed.clone()));
        }
        Ok(removed)
    }

    async fn set_image_data(&self, id: PhotoId, bytes: &[u8]) -> Result<bool> {
        let updated = sqlx::query("UPDATE photos SET image_size = ? WHERE id = ?")
            .bind(bytes.len() as i64)
            .bind(uuid_to_blob(id.0))
            .execute(&self.pool)
            .await
            .map_err(persistence)?
            .rows_affected();

        if updated == 0 {
            debug!(photo = %id, "image data for a deleted photo ignored");
            return Ok(false);
        }

        self.publish(StoreEvent::ImageCached(id));
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
