//! # PinLifecycleManager
//!
//! Creation and deletion of pins. Deletion removes metadata first and then
//! sweeps the matching cache entries, so a crash in between leaves at worst
//! orphaned bytes, which [`PinLifecycleManager::sweep_orphans`] reclaims.

use crate::coordinator::FetchCoordinator;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use vt_core::error::{AppError, Result};
use vt_core::models::{Coordinate, PhotoId, Pin, PinId};
use vt_core::traits::{ContentStore, MetadataStore};

/// What a delete call removed, plus every error it skipped past.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub pins: usize,
    pub photos: usize,
    pub errors: Vec<AppError>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub orphans_removed: usize,
    pub temp_files_removed: usize,
}

pub struct PinLifecycleManager {
    metadata: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    coordinator: Arc<FetchCoordinator>,
}

impl PinLifecycleManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        coordinator: Arc<FetchCoordinator>,
    ) -> Self {
        Self {
            metadata,
            content,
            coordinator,
        }
    }

    /// Pins are not unique by coordinate; two calls with the same point
    /// produce two pins.
    #[instrument(level = "info", skip(self))]
    pub async fn create_pin(&self, coordinate: Coordinate) -> Result<Pin> {
        let pin = self.metadata.create_pin(coordinate).await?;
        info!(pin = %pin.id, %coordinate, "pin created");
        Ok(pin)
    }

    pub async fn find_pin_at(&self, coordinate: Coordinate) -> Result<Option<Pin>> {
        self.metadata.find_pin_at(coordinate).await
    }

    pub async fn list_pins(&self) -> Result<Vec<Pin>> {
        self.metadata.list_pins().await
    }

    /// Removes the pin, its photos and their cached bytes.
    ///
    /// Fails only if the metadata delete fails. Cache misses are recorded in
    /// the report and left for the next sweep.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_pin(&self, pin: PinId) -> Result<DeleteReport> {
        let photos = self.metadata.delete_pin(pin).await?;
        self.coordinator.forget_pin(pin);

        let mut report = DeleteReport {
            pins: 1,
            photos: photos.len(),
            errors: Vec::new(),
        };
        self.purge(&photos, &mut report).await;
        info!(photos = report.photos, "pin deleted");
        Ok(report)
    }

    /// Deletes every pin, continuing past individual failures.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_all_pins(&self) -> Result<DeleteReport> {
        let mut report = DeleteReport::default();
        for pin in self.metadata.list_pins().await? {
            match self.delete_pin(pin.id).await {
                Ok(deleted) => {
                    report.pins += deleted.pins;
                    report.photos += deleted.photos;
                    report.errors.extend(deleted.errors);
                }
                Err(e) => {
                    warn!(pin = %pin.id, error = %e, "pin not deleted");
                    report.errors.push(e);
                }
            }
        }
        info!(
            pins = report.pins,
            photos = report.photos,
            errors = report.errors.len(),
            "all pins deleted"
        );
        Ok(report)
    }

    /// Deletes every photo of every pin; pins stay.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_all_photos(&self) -> Result<DeleteReport> {
        let photos = self.metadata.delete_all_photos().await?;
        let mut report = DeleteReport {
            pins: 0,
            photos: photos.len(),
            errors: Vec::new(),
        };
        self.purge(&photos, &mut report).await;

        for pin in self.metadata.list_pins().await? {
            self.coordinator.reset_pin(pin.id);
        }
        Ok(report)
    }

    /// Removes cached bytes with no owning photo and leftovers of
    /// interrupted writes. Meant to run once at startup.
    #[instrument(level = "info", skip(self))]
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let temp_files_removed = self.content.cleanup_temp_files().await?;

        let live: HashSet<String> = self
            .metadata
            .list_photo_ids()
            .await?
            .into_iter()
            .map(|id| id.to_string())
            .collect();

        let mut orphans_removed = 0;
        for key in self.content.keys().await? {
            if live.contains(&key) {
                continue;
            }
            match self.content.delete(&key).await {
                Ok(()) => orphans_removed += 1,
                Err(e) => warn!(key, error = %e, "orphaned image not deleted"),
            }
        }

        if orphans_removed > 0 || temp_files_removed > 0 {
            info!(orphans_removed, temp_files_removed, "content store swept");
        }
        Ok(SweepReport {
            orphans_removed,
            temp_files_removed,
        })
    }

    async fn purge(&self, photos: &[PhotoId], report: &mut DeleteReport) {
        for id in photos {
            if let Err(e) = self.content.delete(&id.to_string()).await {
                warn!(photo = %id, error = %e, "cached image not deleted");
                report.errors.push(e);
            }
        }
    }
}
