//! # vt-flickr
//!
//! Flickr-backed implementation of `PhotoSearch` and `ImageSource`.
//! Stateless apart from the pooled HTTP client: no local writes happen here.

mod envelope;

pub use envelope::choose_page;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, info, instrument};
use vt_core::error::{AppError, Result};
use vt_core::models::{Coordinate, PhotoPage};
use vt_core::traits::{ImageSource, PhotoSearch};

pub const DEFAULT_ENDPOINT: &str = "https://api.flickr.com/services/rest";
pub const SEARCH_METHOD: &str = "flickr.photos.search";
pub const DEFAULT_PER_PAGE: u32 = 25;
/// Deep pages are skewed and slow; random picks never go past this one.
pub const DEFAULT_MAX_PAGE: u32 = 40;

/// Connection settings for [`FlickrClient`].
#[derive(Debug)]
pub struct FlickrConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    pub per_page: u32,
    pub max_page: u32,
    pub timeout: Duration,
}

impl FlickrConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            per_page: DEFAULT_PER_PAGE,
            max_page: DEFAULT_MAX_PAGE,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct FlickrClient {
    http: reqwest::Client,
    config: FlickrConfig,
}

fn network(err: reqwest::Error) -> AppError {
    AppError::Network(err.to_string())
}

impl FlickrClient {
    pub fn new(config: FlickrConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Initialization(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Fixed parameters plus the coordinate. `page: None` leaves the page
    /// out, which the provider serves as page 1 together with the page count.
    fn search_params(&self, coordinate: Coordinate, page: Option<u32>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("method", SEARCH_METHOD.to_string()),
            ("api_key", self.config.api_key.expose_secret().to_string()),
            ("lat", coordinate.latitude.to_string()),
            ("lon", coordinate.longitude.to_string()),
            ("per_page", self.config.per_page.to_string()),
            ("safe_search", "1".to_string()),
            ("extras", "url_m".to_string()),
            ("format", "json".to_string()),
            ("nojsoncallback", "1".to_string()),
        ];
        if let Some(page) = page {
            params.push(("page", page.to_string()));
        }
        params
    }

    #[instrument(level = "debug", skip(self))]
    async fn request_page(&self, coordinate: Coordinate, page: Option<u32>) -> Result<PhotoPage> {
        let response = self
            .http
            .get(&self.config.endpoint)
            .query(&self.search_params(coordinate, page))
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Network(format!("search request failed with status {status}")));
        }

        let body = response.bytes().await.map_err(network)?;
        envelope::parse_page(&body)
    }
}

#[async_trait]
impl PhotoSearch for FlickrClient {
    /// Without an explicit page this is a two-phase request: probe for the
    /// page count, then fetch a random page from the capped pool.
    #[instrument(level = "info", skip(self))]
    async fn search(&self, coordinate: Coordinate, page: Option<u32>) -> Result<PhotoPage> {
        if let Some(page) = page {
            return self.request_page(coordinate, Some(page)).await;
        }

        let probe = self.request_page(coordinate, None).await?;
        let chosen = {
            let mut rng = rand::rng();
            choose_page(probe.pages, self.config.max_page, &mut rng)
        };
        let Some(chosen) = chosen else {
            debug!("no result pages near this coordinate");
            return Ok(probe);
        };

        let result = self.request_page(coordinate, Some(chosen)).await?;
        info!(
            page = chosen,
            pages = probe.pages,
            photos = result.photos.len(),
            "search complete"
        );
        Ok(result)
    }
}

#[async_trait]
impl ImageSource for FlickrClient {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_image(&self, url: &str) -> Result<Bytes> {
        let response = self.http.get(url).send().await.map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Network(format!("image request failed with status {status}")));
        }

        response.bytes().await.map_err(network)
    }
}
