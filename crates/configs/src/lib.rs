//! Layered runtime settings for Virtual Tourist.
//!
//! Sources, later ones winning: built-in defaults, an optional
//! `virtual-tourist.toml` in the working directory, then environment
//! variables prefixed with `VT` and nested with `__`. A `.env` file is
//! loaded into the environment first.
//!
//! | Variable                             | Default                                | Description                      |
//! |--------------------------------------|----------------------------------------|----------------------------------|
//! | `VT__DATABASE__URL`                  | `sqlite://virtual_tourist.db`          | metadata store location          |
//! | `VT__STORAGE__CACHE_DIR`             | `./data/images`                        | image cache directory            |
//! | `VT__STORAGE__MEMORY_CAPACITY_BYTES` | `33554432`                             | in-memory image tier bound       |
//! | `VT__FLICKR__ENDPOINT`               | `https://api.flickr.com/services/rest` | search endpoint                  |
//! | `VT__FLICKR__API_KEY`                | none                                   | provider key                     |
//! | `VT__FLICKR__PER_PAGE`               | `25`                                   | photos per result page           |
//! | `VT__FLICKR__MAX_PAGE`               | `40`                                   | highest page a random pick hits  |
//! | `VT__FLICKR__TIMEOUT_SECS`           | `30`                                   | HTTP timeout                     |
//! | `VT__FETCH__PREFETCH_IMAGES`         | `true`                                 | download images right after a fetch |
//! | `VT__LOG__FORMAT`                    | `pretty`                               | `pretty` or `json`               |
//! | `VT__LOG__FILTER`                    | `info`                                 | default tracing filter           |

use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE: &str = "virtual-tourist.toml";
pub const ENV_PREFIX: &str = "VT";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("flickr.api_key is not set (VT__FLICKR__API_KEY)")]
    MissingApiKey,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub flickr: FlickrSettings,
    pub fetch: FetchSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageSettings {
    pub cache_dir: PathBuf,
    pub memory_capacity_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct FlickrSettings {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    pub per_page: u32,
    pub max_page: u32,
    pub timeout_secs: u64,
}

impl FlickrSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchSettings {
    pub prefetch_images: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    pub format: LogFormat,
    pub filter: String,
}

impl Settings {
    /// Loads `.env`, then every layer from the working directory and the
    /// process environment.
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::from_sources(Some(Path::new(CONFIG_FILE)), Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Builds settings from an optional file and an environment source.
    /// A missing file is skipped.
    pub fn from_sources(file: Option<&Path>, env: Environment) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            .set_default("database.url", "sqlite://virtual_tourist.db")?
            .set_default("storage.cache_dir", "./data/images")?
            .set_default("storage.memory_capacity_bytes", 32_i64 * 1024 * 1024)?
            .set_default("flickr.endpoint", "https://api.flickr.com/services/rest")?
            .set_default("flickr.per_page", 25)?
            .set_default("flickr.max_page", 40)?
            .set_default("flickr.timeout_secs", 30)?
            .set_default("fetch.prefetch_images", true)?
            .set_default("log.format", "pretty")?
            .set_default("log.filter", "info")?;

        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }

        let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.flickr.per_page == 0 {
            return Err(SettingsError::Invalid("flickr.per_page must be at least 1".into()));
        }
        if self.flickr.max_page == 0 {
            return Err(SettingsError::Invalid("flickr.max_page must be at least 1".into()));
        }
        if self.storage.memory_capacity_bytes == 0 {
            return Err(SettingsError::Invalid(
                "storage.memory_capacity_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Only commands that talk to the provider need the key.
    pub fn require_api_key(&self) -> Result<&SecretString, SettingsError> {
        self.flickr.api_key.as_ref().ok_or(SettingsError::MissingApiKey)
    }
}
