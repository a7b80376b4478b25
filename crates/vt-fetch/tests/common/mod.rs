//! Shared fixtures: a real sqlite + disk stack with counting fakes standing
//! in for the remote provider.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use vt_core::error::{AppError, Result};
use vt_core::models::{Coordinate, PhotoDescriptor, PhotoPage};
use vt_core::traits::{ContentStore, ImageSource, MetadataStore, PhotoSearch};
use vt_db_sqlite::SqliteMetadataStore;
use vt_fetch::{FetchCoordinator, FetchOptions, PinLifecycleManager};
use vt_storage_local::LocalContentStore;

pub const SAN_FRANCISCO: Coordinate = Coordinate {
    latitude: 37.7749,
    longitude: -122.4194,
};

pub fn descriptors(prefix: &str, count: usize) -> Vec<PhotoDescriptor> {
    (0..count)
        .map(|n| PhotoDescriptor {
            remote_id: format!("{prefix}{n}"),
            url: format!("https://images.test/{prefix}{n}.jpg"),
        })
        .collect()
}

/// Serves a fresh batch per call (`r<call>-<n>`) unless told otherwise.
pub struct CountingSearch {
    calls: AtomicUsize,
    batch: usize,
    delay: Duration,
    failure: Mutex<Option<AppError>>,
}

impl CountingSearch {
    pub fn new(batch: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            batch,
            delay: Duration::ZERO,
            failure: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next call fails with `err`; later calls succeed again.
    pub fn fail_next(&self, err: AppError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhotoSearch for CountingSearch {
    async fn search(&self, _coordinate: Coordinate, _page: Option<u32>) -> Result<PhotoPage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(PhotoPage {
            page: 1,
            pages: 1,
            photos: descriptors(&format!("r{call}-"), self.batch),
        })
    }
}

/// Returns the URL's bytes after an optional delay; URLs listed as failing
/// produce a network error.
pub struct CountingImages {
    calls: AtomicUsize,
    delay: Duration,
    failing: Mutex<HashSet<String>>,
}

impl CountingImages {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for CountingImages {
    async fn fetch_image(&self, url: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().unwrap().contains(url) {
            return Err(AppError::Network(format!("{url}: 404 Not Found")));
        }
        Ok(Bytes::from(url.as_bytes().to_vec()))
    }
}

pub struct Harness {
    pub metadata: Arc<SqliteMetadataStore>,
    pub content: Arc<LocalContentStore>,
    pub search: Arc<CountingSearch>,
    pub images: Arc<CountingImages>,
    pub coordinator: Arc<FetchCoordinator>,
    pub lifecycle: PinLifecycleManager,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(search: CountingSearch, images: CountingImages) -> Self {
        Self::with_content_wrapper(search, images, |content| content as Arc<dyn ContentStore>).await
    }

    /// Same stack, but the lifecycle manager deletes cached bytes through
    /// `content` instead of the real store.
    pub async fn with_content_wrapper(
        search: CountingSearch,
        images: CountingImages,
        wrap: impl FnOnce(Arc<LocalContentStore>) -> Arc<dyn ContentStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(SqliteMetadataStore::new("sqlite::memory:").await.unwrap());
        let content = Arc::new(LocalContentStore::new(dir.path().to_path_buf(), 1024 * 1024).await.unwrap());
        let search = Arc::new(search);
        let images = Arc::new(images);

        let coordinator = Arc::new(FetchCoordinator::new(
            metadata.clone(),
            content.clone(),
            search.clone(),
            images.clone(),
            FetchOptions {
                prefetch_images: false,
            },
        ));

        let lifecycle = PinLifecycleManager::new(metadata.clone(), wrap(content.clone()), coordinator.clone());

        Self {
            metadata,
            content,
            search,
            images,
            coordinator,
            lifecycle,
            _dir: dir,
        }
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }
}
