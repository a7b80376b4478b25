//! # Domain Models
//!
//! These structs represent the core entities of Virtual Tourist.
//! Local records use UUID v7 surrogate keys so that pins never have to be
//! identified by floating-point equality. Provider identifiers are kept as
//! opaque strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Surrogate identifier of a [`Pin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub Uuid);

/// Surrogate identifier of a local [`Photo`] record.
///
/// Its string form doubles as the photo's content store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(pub Uuid);

macro_rules! uuid_newtype {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_newtype!(PinId);
uuid_newtype!(PhotoId);

/// A point on the map, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// A user-placed marker. Owns zero or more [`Photo`] records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: PinId,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
}

impl Pin {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Metadata for a single remote image found near a [`Pin`].
///
/// The bytes themselves live in the content store under [`Photo::cache_key`];
/// this record only remembers whether they have been downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub pin_id: PinId,
    /// Provider-assigned photo ID. Unique per pin, not globally.
    pub remote_id: String,
    /// Source URL; also the recovery path when cached bytes are missing.
    pub image_url: String,
    /// Size of the cached payload, `None` until the first successful download.
    pub image_size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Photo {
    pub fn cache_key(&self) -> String {
        self.id.to_string()
    }

    pub fn has_image(&self) -> bool {
        self.image_size.is_some()
    }
}

/// One search hit as returned by the remote provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoDescriptor {
    pub remote_id: String,
    pub url: String,
}

/// A single page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoPage {
    /// The page that was served.
    pub page: u32,
    /// Total page count reported by the provider.
    pub pages: u32,
    pub photos: Vec<PhotoDescriptor>,
}

/// Change notifications published by the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    PinCreated(PinId),
    PinDeleted(PinId),
    PhotoInserted { pin: PinId, photo: PhotoId },
    PhotosDeleted(Vec<PhotoId>),
    ImageCached(PhotoId),
}
