//! # FetchCoordinator
//!
//! Decides per pin whether photos must be searched for or can be served
//! from the metadata store, persists search hits, and drives image
//! downloads through the content store.
//!
//! Per pin the coordinator moves through `Empty -> Fetching -> Populated`;
//! a refresh that keeps nothing goes back through `Fetching`. Calls for the
//! same pin are serialized, calls for different pins run in parallel.

use crate::materialize::ImageMaterializer;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use vt_core::error::{AppError, Result};
use vt_core::models::{Photo, PhotoId, Pin, PinId};
use vt_core::traits::{ContentStore, ImageSource, MetadataStore, PhotoSearch};

/// Where a pin is in its fetch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Empty,
    Fetching,
    Populated,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Download every new photo's bytes right after a successful fetch
    /// instead of waiting for the grid to ask for them.
    pub prefetch_images: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            prefetch_images: true,
        }
    }
}

/// Result of [`FetchCoordinator::ensure_photos`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    /// The pin already had photos; no search was made.
    Cached(Vec<Photo>),
    /// A search ran and its hits were persisted.
    Fetched { photos: Vec<Photo>, created: usize },
}

impl EnsureOutcome {
    pub fn photos(&self) -> &[Photo] {
        match self {
            EnsureOutcome::Cached(photos) | EnsureOutcome::Fetched { photos, .. } => photos,
        }
    }
}

/// Result of [`FetchCoordinator::refresh`].
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The selected photos were removed and nothing was fetched.
    Removed(Vec<PhotoId>),
    /// The whole collection was replaced by a fresh search.
    Replaced { removed: Vec<PhotoId>, outcome: EnsureOutcome },
}

pub struct FetchCoordinator {
    metadata: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    search: Arc<dyn PhotoSearch>,
    materializer: ImageMaterializer,
    options: FetchOptions,
    states: DashMap<PinId, FetchState>,
    pin_locks: DashMap<PinId, Arc<Mutex<()>>>,
}

impl FetchCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        search: Arc<dyn PhotoSearch>,
        images: Arc<dyn ImageSource>,
        options: FetchOptions,
    ) -> Self {
        let materializer = ImageMaterializer::new(metadata.clone(), content.clone(), images);
        Self {
            metadata,
            content,
            search,
            materializer,
            options,
            states: DashMap::new(),
            pin_locks: DashMap::new(),
        }
    }

    pub fn state(&self, pin: PinId) -> FetchState {
        self.states.get(&pin).map(|s| *s).unwrap_or(FetchState::Empty)
    }

    fn set_state(&self, pin: PinId, state: FetchState) {
        self.states.insert(pin, state);
    }

    fn pin_lock(&self, pin: PinId) -> Arc<Mutex<()>> {
        self.pin_locks.entry(pin).or_default().clone()
    }

    /// Marks a pin whose photos were removed externally as `Empty`. The pin
    /// lock stays, so a fetch already running for it keeps serializing
    /// later callers, and an in-flight `Fetching` state is left alone.
    pub fn reset_pin(&self, pin: PinId) {
        if let Some(mut state) = self.states.get_mut(&pin) {
            if *state == FetchState::Populated {
                *state = FetchState::Empty;
            }
        }
    }

    /// Drops the bookkeeping for a deleted pin.
    pub fn forget_pin(&self, pin: PinId) {
        self.states.remove(&pin);
        self.pin_locks.remove(&pin);
    }

    async fn require_pin(&self, id: PinId) -> Result<Pin> {
        self.metadata
            .get_pin(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Pin".into(), id.to_string()))
    }

    /// Serves the pin's photos, searching only when it has none.
    ///
    /// Any local photo suppresses the search. A failed search leaves the pin
    /// `Empty` and is not retried automatically.
    #[instrument(level = "info", skip(self))]
    pub async fn ensure_photos(&self, pin: PinId) -> Result<EnsureOutcome> {
        let lock = self.pin_lock(pin);
        let _serialized = lock.lock().await;

        let pin = self.require_pin(pin).await?;
        let existing = self.metadata.list_photos(pin.id).await?;
        if !existing.is_empty() {
            debug!(photos = existing.len(), "serving photos from the store");
            self.set_state(pin.id, FetchState::Populated);
            return Ok(EnsureOutcome::Cached(existing));
        }

        self.fetch_locked(&pin).await
    }

    /// Runs a search for a pin whose lock is held and which has no photos.
    async fn fetch_locked(&self, pin: &Pin) -> Result<EnsureOutcome> {
        self.set_state(pin.id, FetchState::Fetching);

        // `None` makes the client roll a fresh random page every time.
        let page = match self.search.search(pin.coordinate(), None).await {
            Ok(page) => page,
            Err(e) => {
                warn!(pin = %pin.id, error = %e, "photo search failed");
                self.set_state(pin.id, FetchState::Empty);
                return Err(AppError::FetchFailed(Box::new(e)));
            }
        };

        if page.photos.is_empty() {
            info!(pin = %pin.id, "no photos near this pin");
            self.set_state(pin.id, FetchState::Empty);
            return Err(AppError::NoPhotosFound);
        }

        // The pin may have been deleted while the search was in flight.
        if self.metadata.get_pin(pin.id).await?.is_none() {
            self.forget_pin(pin.id);
            return Err(AppError::NotFound("Pin".into(), pin.id.to_string()));
        }

        let mut created = 0;
        for descriptor in &page.photos {
            match self.metadata.find_or_create_photo(pin.id, descriptor).await {
                Ok((_, inserted)) => created += usize::from(inserted),
                Err(e) => {
                    let state = if created > 0 {
                        FetchState::Populated
                    } else {
                        FetchState::Empty
                    };
                    self.set_state(pin.id, state);
                    return Err(e);
                }
            }
        }

        let photos = self.metadata.list_photos(pin.id).await?;
        self.set_state(pin.id, FetchState::Populated);
        info!(pin = %pin.id, page = page.page, created, total = photos.len(), "photos persisted");

        if self.options.prefetch_images {
            self.spawn_prefetch(photos.clone());
        }
        Ok(EnsureOutcome::Fetched { photos, created })
    }

    /// Replaces or trims a pin's collection.
    ///
    /// With an empty `selection` every photo is removed and a new random
    /// page is fetched. Otherwise exactly the selected photos of this pin
    /// are removed and nothing is fetched.
    #[instrument(level = "info", skip(self, selection), fields(selected = selection.len()))]
    pub async fn refresh(&self, pin: PinId, selection: &HashSet<PhotoId>) -> Result<RefreshOutcome> {
        let lock = self.pin_lock(pin);
        let _serialized = lock.lock().await;

        let pin = self.require_pin(pin).await?;

        if selection.is_empty() {
            let removed = self.metadata.delete_all_photos_for_pin(pin.id).await?;
            self.purge_content(&removed).await;
            self.set_state(pin.id, FetchState::Empty);
            let outcome = self.fetch_locked(&pin).await?;
            return Ok(RefreshOutcome::Replaced { removed, outcome });
        }

        let owned: HashSet<PhotoId> = self
            .metadata
            .list_photos(pin.id)
            .await?
            .into_iter()
            .map(|photo| photo.id)
            .filter(|id| selection.contains(id))
            .collect();
        let removed = self.metadata.delete_photos(&owned).await?;
        self.purge_content(&removed).await;

        let remaining = self.metadata.list_photos(pin.id).await?;
        let state = if remaining.is_empty() {
            FetchState::Empty
        } else {
            FetchState::Populated
        };
        self.set_state(pin.id, state);
        Ok(RefreshOutcome::Removed(removed))
    }

    /// Returns the photo's bytes, downloading them at most once no matter
    /// how many callers ask concurrently.
    pub async fn materialize_image(&self, photo: &Photo) -> Result<Bytes> {
        self.materializer.materialize(photo).await
    }

    /// Photos of the pin whose bytes are not (or no longer) cached.
    pub async fn photos_missing_images(&self, pin: PinId) -> Result<Vec<Photo>> {
        let mut missing = Vec::new();
        for photo in self.metadata.list_photos(pin).await? {
            if !photo.has_image() || self.content.get(&photo.cache_key()).await?.is_none() {
                missing.push(photo);
            }
        }
        Ok(missing)
    }

    /// Materializes every photo concurrently. Failures stay per photo.
    pub async fn prefetch_images(&self, photos: Vec<Photo>) -> Vec<(PhotoId, Result<Bytes>)> {
        prefetch(self.materializer.clone(), photos).await
    }

    fn spawn_prefetch(&self, photos: Vec<Photo>) {
        let materializer = self.materializer.clone();
        tokio::spawn(async move {
            let results = prefetch(materializer, photos).await;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            debug!(total = results.len(), failed, "prefetch finished");
        });
    }

    /// Best effort: a failure leaves an orphan for the next sweep.
    async fn purge_content(&self, photos: &[PhotoId]) {
        for id in photos {
            if let Err(e) = self.content.delete(&id.to_string()).await {
                warn!(photo = %id, error = %e, "cached image not deleted");
            }
        }
    }
}

async fn prefetch(
    materializer: ImageMaterializer,
    photos: Vec<Photo>,
) -> Vec<(PhotoId, Result<Bytes>)> {
    let mut tasks = JoinSet::new();
    for photo in photos {
        let materializer = materializer.clone();
        tasks.spawn(async move {
            let result = materializer.materialize(&photo).await;
            (photo.id, result)
        });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "prefetch task panicked"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use vt_core::models::{Coordinate, PhotoPage};
    use vt_core::traits::{MockContentStore, MockImageSource, MockMetadataStore, MockPhotoSearch};

    fn pin() -> Pin {
        Pin {
            id: PinId::new(),
            latitude: 37.7749,
            longitude: -122.4194,
            created_at: chrono::Utc::now(),
        }
    }

    fn photo_of(pin: &Pin, remote_id: &str) -> Photo {
        Photo {
            id: PhotoId::new(),
            pin_id: pin.id,
            remote_id: remote_id.to_string(),
            image_url: format!("https://example.com/{remote_id}.jpg"),
            image_size: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn coordinator(metadata: MockMetadataStore, search: MockPhotoSearch) -> FetchCoordinator {
        FetchCoordinator::new(
            Arc::new(metadata),
            Arc::new(MockContentStore::new()),
            Arc::new(search),
            Arc::new(MockImageSource::new()),
            FetchOptions {
                prefetch_images: false,
            },
        )
    }

    #[tokio::test]
    async fn test_local_photos_suppress_the_search() {
        let pin = pin();
        let stored = vec![photo_of(&pin, "1")];

        let mut metadata = MockMetadataStore::new();
        let found = pin.clone();
        metadata
            .expect_get_pin()
            .with(eq(pin.id))
            .returning(move |_| Ok(Some(found.clone())));
        let listed = stored.clone();
        metadata
            .expect_list_photos()
            .returning(move |_| Ok(listed.clone()));

        let mut search = MockPhotoSearch::new();
        search.expect_search().times(0);

        let coordinator = coordinator(metadata, search);
        let outcome = coordinator.ensure_photos(pin.id).await.unwrap();

        assert_eq!(outcome, EnsureOutcome::Cached(stored));
        assert_eq!(coordinator.state(pin.id), FetchState::Populated);
    }

    #[tokio::test]
    async fn test_search_failure_is_fetch_failed_and_resets_state() {
        let pin = pin();
        let mut metadata = MockMetadataStore::new();
        let found = pin.clone();
        metadata
            .expect_get_pin()
            .returning(move |_| Ok(Some(found.clone())));
        metadata.expect_list_photos().returning(|_| Ok(Vec::new()));
        metadata.expect_find_or_create_photo().times(0);

        let mut search = MockPhotoSearch::new();
        search
            .expect_search()
            .with(eq(Coordinate::new(37.7749, -122.4194)), eq(None))
            .times(1)
            .returning(|_, _| Err(AppError::Network("connection reset".into())));

        let coordinator = coordinator(metadata, search);
        let err = coordinator.ensure_photos(pin.id).await.unwrap_err();

        assert!(matches!(&err, AppError::FetchFailed(inner) if matches!(**inner, AppError::Network(_))));
        assert_eq!(coordinator.state(pin.id), FetchState::Empty);
    }

    #[tokio::test]
    async fn test_empty_search_result_is_no_photos_found() {
        let pin = pin();
        let mut metadata = MockMetadataStore::new();
        let found = pin.clone();
        metadata
            .expect_get_pin()
            .returning(move |_| Ok(Some(found.clone())));
        metadata.expect_list_photos().returning(|_| Ok(Vec::new()));

        let mut search = MockPhotoSearch::new();
        search.expect_search().times(1).returning(|_, _| {
            Ok(PhotoPage {
                page: 1,
                pages: 0,
                photos: Vec::new(),
            })
        });

        let coordinator = coordinator(metadata, search);
        let err = coordinator.ensure_photos(pin.id).await.unwrap_err();

        assert!(matches!(err, AppError::NoPhotosFound));
        assert_eq!(coordinator.state(pin.id), FetchState::Empty);
    }

    #[tokio::test]
    async fn test_unknown_pin_is_not_found() {
        let mut metadata = MockMetadataStore::new();
        metadata.expect_get_pin().returning(|_| Ok(None));
        let mut search = MockPhotoSearch::new();
        search.expect_search().times(0);

        let coordinator = coordinator(metadata, search);
        let err = coordinator.ensure_photos(PinId::new()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(..)));
    }
}
