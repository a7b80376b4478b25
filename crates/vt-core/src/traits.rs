//! # Core Traits (Ports)
//!
//! Every adapter implements one of these traits; the coordinator only ever
//! talks to the ports, so tests can swap in fakes or the `testing` mocks.

use crate::error::Result;
use crate::models::{Coordinate, Photo, PhotoDescriptor, PhotoId, PhotoPage, Pin, PinId, StoreEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use tokio::sync::broadcast;

/// Durable store for pins, photos and the relationship between them.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Pin Operations
    async fn create_pin(&self, coordinate: Coordinate) -> Result<Pin>;
    async fn get_pin(&self, id: PinId) -> Result<Option<Pin>>;
    /// Earliest-created pin stored at exactly this coordinate.
    async fn find_pin_at(&self, coordinate: Coordinate) -> Result<Option<Pin>>;
    async fn list_pins(&self) -> Result<Vec<Pin>>;
    /// Deletes the pin and its photos. Returns the IDs of the removed photos.
    async fn delete_pin(&self, id: PinId) -> Result<Vec<PhotoId>>;

    // Photo Operations
    /// Looks up `(pin, descriptor.remote_id)` and inserts it when absent.
    /// The boolean is `true` only for the call that inserted the row.
    async fn find_or_create_photo(
        &self,
        pin: PinId,
        descriptor: &PhotoDescriptor,
    ) -> Result<(Photo, bool)>;
    async fn get_photo(&self, id: PhotoId) -> Result<Option<Photo>>;
    async fn list_photos(&self, pin: PinId) -> Result<Vec<Photo>>;
    /// Every photo ID in the store, across all pins.
    async fn list_photo_ids(&self) -> Result<Vec<PhotoId>>;
    /// Returns the IDs that actually existed and were removed.
    async fn delete_photos(&self, ids: &HashSet<PhotoId>) -> Result<Vec<PhotoId>>;
    async fn delete_all_photos_for_pin(&self, pin: PinId) -> Result<Vec<PhotoId>>;
    async fn delete_all_photos(&self) -> Result<Vec<PhotoId>>;
    /// Records that the photo's bytes are cached. Only the size is kept here;
    /// the bytes belong to the content store. Returns `false` when the photo
    /// no longer exists.
    async fn set_image_data(&self, id: PhotoId, bytes: &[u8]) -> Result<bool>;

    /// Observer hook for record-set changes.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Key-addressed byte cache for image payloads.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    /// Overwrites any existing value. Readers never observe a partial write.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()>;
    /// Idempotent: deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Keys of every durable entry.
    async fn keys(&self) -> Result<Vec<String>>;
    /// Removes leftovers of interrupted writes.
    async fn cleanup_temp_files(&self) -> Result<usize>;
}

/// Remote photo search keyed by coordinate.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PhotoSearch: Send + Sync {
    /// With `page: None` the client probes the page count first and picks a
    /// random page from the capped pool.
    async fn search(&self, coordinate: Coordinate, page: Option<u32>) -> Result<PhotoPage>;
}

/// Remote image download.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Bytes>;
}
