//! Download-once image materialization.

use crate::single_flight::SingleFlight;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vt_core::error::{AppError, Result};
use vt_core::models::{Photo, PhotoId};
use vt_core::traits::{ContentStore, ImageSource, MetadataStore};

/// Turns a photo's `image_url` into cached bytes.
///
/// Cheap to clone, so eager prefetches can move a copy into a spawned task.
#[derive(Clone)]
pub(crate) struct ImageMaterializer {
    metadata: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    images: Arc<dyn ImageSource>,
    downloads: Arc<SingleFlight<PhotoId, Result<Bytes>>>,
}

impl ImageMaterializer {
    pub(crate) fn new(
        metadata: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            metadata,
            content,
            images,
            downloads: Arc::new(SingleFlight::new()),
        }
    }

    /// Unreadable cache entries are treated as misses; the URL can always
    /// reproduce the bytes.
    async fn cached(&self, key: &str) -> Option<Bytes> {
        match self.content.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key, error = %e, "content store read failed, downloading instead");
                None
            }
        }
    }

    #[instrument(level = "debug", skip(self, photo), fields(photo = %photo.id))]
    pub(crate) async fn materialize(&self, photo: &Photo) -> Result<Bytes> {
        if let Some(bytes) = self.cached(&photo.cache_key()).await {
            debug!("image cache hit");
            return Ok(bytes);
        }

        let (result, leader) = self
            .downloads
            .run(photo.id, || self.download(photo.clone()))
            .await;
        if !leader {
            debug!("joined an in-flight download");
        }
        result
    }

    async fn download(&self, photo: Photo) -> Result<Bytes> {
        let key = photo.cache_key();

        // Another download may have finished between the first check and
        // this one becoming the leader.
        if let Some(bytes) = self.cached(&key).await {
            return Ok(bytes);
        }

        let bytes = self
            .images
            .fetch_image(&photo.image_url)
            .await
            .map_err(|e| {
                warn!(photo = %photo.id, error = %e, "image download failed");
                AppError::ImageUnavailable {
                    photo: photo.id,
                    reason: e.to_string(),
                }
            })?;

        // Never resurrect state for a photo deleted while we were downloading.
        if self.metadata.get_photo(photo.id).await?.is_none() {
            debug!(photo = %photo.id, "photo deleted during download, not caching");
            return Ok(bytes);
        }

        self.content.put(&key, bytes.clone()).await?;
        if !self.metadata.set_image_data(photo.id, &bytes).await? {
            // Lost the race against a delete after all.
            self.content.delete(&key).await?;
            return Ok(bytes);
        }

        info!(photo = %photo.id, size = bytes.len(), "image cached");
        Ok(bytes)
    }
}
