//! Parsing of the `flickr.photos.search` JSON envelope.
//!
//! Individual malformed items are skipped. The page as a whole is only
//! rejected when the envelope itself is wrong, or when it lists items and
//! none of them is usable.

use rand::Rng;
use reqwest::Url;
use serde_json::Value;
use tracing::warn;
use vt_core::error::{AppError, Result};
use vt_core::models::{PhotoDescriptor, PhotoPage};

fn shape(message: impl Into<String>) -> AppError {
    AppError::InvalidResponseShape(message.into())
}

/// Counts arrive as integers, and occasionally as numeric strings.
fn as_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn descriptor(item: &Value) -> Option<PhotoDescriptor> {
    let remote_id = item.get("id")?.as_str()?;
    let url = item.get("url_m")?.as_str()?;
    if remote_id.is_empty() || Url::parse(url).is_err() {
        return None;
    }
    Some(PhotoDescriptor {
        remote_id: remote_id.to_string(),
        url: url.to_string(),
    })
}

pub(crate) fn parse_page(body: &[u8]) -> Result<PhotoPage> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| shape(format!("body is not JSON: {e}")))?;

    if value.get("stat").and_then(Value::as_str) == Some("fail") {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = value.get("message").and_then(Value::as_str).unwrap_or("unknown");
        return Err(shape(format!("provider error {code}: {message}")));
    }

    let photos = value
        .get("photos")
        .and_then(Value::as_object)
        .ok_or_else(|| shape("missing key 'photos'"))?;
    let pages = photos
        .get("pages")
        .and_then(as_count)
        .ok_or_else(|| shape("missing key 'photos.pages'"))?;
    let page = photos.get("page").and_then(as_count).unwrap_or(1);
    let items = photos
        .get("photo")
        .and_then(Value::as_array)
        .ok_or_else(|| shape("missing key 'photos.photo'"))?;

    let descriptors: Vec<PhotoDescriptor> = items.iter().filter_map(descriptor).collect();
    if descriptors.is_empty() && !items.is_empty() {
        return Err(shape(format!("none of {} items has an id and url_m", items.len())));
    }
    if descriptors.len() < items.len() {
        warn!(
            skipped = items.len() - descriptors.len(),
            "search items without enough info to construct a photo"
        );
    }

    Ok(PhotoPage {
        page,
        pages,
        photos: descriptors,
    })
}

/// Picks a page uniformly from `[1, min(total_pages, max_page)]`.
/// Returns `None` when there is nothing to pick from.
pub fn choose_page<R: Rng + ?Sized>(total_pages: u32, max_page: u32, rng: &mut R) -> Option<u32> {
    let limit = total_pages.min(max_page);
    if limit == 0 {
        return None;
    }
    Some(rng.random_range(1..=limit))
}
