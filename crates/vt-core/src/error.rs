//! # AppError
//!
//! Centralized error handling for the Virtual Tourist pipeline.
//! Adapters translate their library errors into these variants at the
//! port boundary; the coordinator decides whether a failure is pin-wide
//! or scoped to a single photo.

use crate::models::PhotoId;
use thiserror::Error;

/// The primary error type for all vt-core operations.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Transport-level failure talking to the photo provider.
    #[error("network error: {0}")]
    Network(String),

    /// The provider answered with something that is not the expected envelope.
    #[error("invalid response shape: {0}")]
    InvalidResponseShape(String),

    /// A single photo's bytes could not be downloaded.
    #[error("image unavailable for photo {photo}: {reason}")]
    ImageUnavailable { photo: PhotoId, reason: String },

    /// I/O failure of the metadata store or the content store.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A backing store could not be opened at all.
    #[error("initialization failure: {0}")]
    Initialization(String),

    /// Entity not found (e.g., a pin deleted while its fetch was in flight)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// The search for a pin's photos failed.
    #[error("photo search failed: {0}")]
    FetchFailed(#[source] Box<AppError>),

    /// The search succeeded but nothing was taken near the pin.
    #[error("no photos found for this location")]
    NoPhotosFound,
}

impl AppError {
    /// The advisory the UI shows for this failure, if any.
    ///
    /// Item-scoped failures have none: the grid keeps its placeholder.
    /// `NotFound` has none either; its message names the missing entity.
    pub fn advisory(&self) -> Option<&'static str> {
        match self {
            AppError::FetchFailed(_) | AppError::Network(_) | AppError::InvalidResponseShape(_) => {
                Some("Unable to load images, let's try a new location!")
            }
            AppError::NoPhotosFound => {
                Some("No images for this location - let's try a new location!")
            }
            AppError::Persistence(_) => Some("Something went wrong saving your data."),
            AppError::Initialization(_) => Some("The photo library could not be opened."),
            AppError::ImageUnavailable { .. } | AppError::NotFound(..) => None,
        }
    }

    /// Whether repeating the same user action may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::Persistence(_) | AppError::ImageUnavailable { .. } => {
                true
            }
            AppError::FetchFailed(inner) => inner.is_retryable(),
            AppError::InvalidResponseShape(_)
            | AppError::Initialization(_)
            | AppError::NotFound(..)
            | AppError::NoPhotosFound => false,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Persistence(err.to_string())
    }
}

/// A specialized Result type for Virtual Tourist logic.
pub type Result<T> = std::result::Result<T, AppError>;
