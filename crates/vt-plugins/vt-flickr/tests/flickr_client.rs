//! End-to-end tests of `FlickrClient` against a local axum server that
//! plays the provider and records every query it receives.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vt_core::error::AppError;
use vt_core::models::Coordinate;
use vt_core::traits::{ImageSource, PhotoSearch};
use vt_flickr::{FlickrClient, FlickrConfig};

type Params = HashMap<String, String>;

#[derive(Clone)]
struct Provider {
    requests: Arc<Mutex<Vec<Params>>>,
    envelope: Arc<dyn Fn(&Params) -> Value + Send + Sync>,
}

impl Provider {
    fn new(envelope: impl Fn(&Params) -> Value + Send + Sync + 'static) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            envelope: Arc::new(envelope),
        }
    }

    fn requests(&self) -> Vec<Params> {
        self.requests.lock().unwrap().clone()
    }
}

async fn rest(State(provider): State<Provider>, Query(params): Query<Params>) -> Json<Value> {
    let body = (provider.envelope)(&params);
    provider.requests.lock().unwrap().push(params);
    Json(body)
}

async fn image() -> Response {
    (StatusCode::OK, vec![0xFF_u8, 0xD8, 0xFF, 0xD9]).into_response()
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

async fn client_for(provider: &Provider) -> (FlickrClient, String) {
    let base = serve(
        Router::new()
            .route("/services/rest", get(rest))
            .route("/images/ok.jpg", get(image))
            .with_state(provider.clone()),
    )
    .await;

    let mut config = FlickrConfig::new(SecretString::from("test-key".to_string()));
    config.endpoint = format!("{base}/services/rest");
    config.timeout = Duration::from_secs(5);
    (FlickrClient::new(config).unwrap(), base)
}

fn photos(page: u32, pages: u32, count: usize) -> Value {
    let photo: Vec<Value> = (0..count)
        .map(|n| {
            json!({
                "id": format!("{page}-{n}"),
                "url_m": format!("https://live.staticflickr.com/65535/{page}_{n}_m.jpg"),
            })
        })
        .collect();
    json!({ "photos": { "page": page, "pages": pages, "perpage": 25, "photo": photo }, "stat": "ok" })
}

fn page_of(params: &Params) -> u32 {
    params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1)
}

const ROME: Coordinate = Coordinate {
    latitude: 41.9028,
    longitude: 12.4964,
};

#[tokio::test]
async fn test_unpaged_search_probes_then_fetches_a_capped_random_page() {
    let provider = Provider::new(|params| photos(page_of(params), 120, 25));
    let (client, _) = client_for(&provider).await;

    for _ in 0..25 {
        let result = client.search(ROME, None).await.unwrap();
        assert!((1..=40).contains(&result.page));
        assert_eq!(result.photos.len(), 25);
    }

    let requests = provider.requests();
    assert_eq!(requests.len(), 50);
    for pair in requests.chunks(2) {
        assert!(!pair[0].contains_key("page"), "probe must not pick a page");
        let page = page_of(&pair[1]);
        assert!((1..=40).contains(&page), "page {page} is outside the pool");
    }
}

#[tokio::test]
async fn test_search_sends_the_fixed_parameters() {
    let provider = Provider::new(|params| photos(page_of(params), 1, 1));
    let (client, _) = client_for(&provider).await;

    client.search(ROME, Some(1)).await.unwrap();

    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    let params = &requests[0];
    assert_eq!(params["method"], "flickr.photos.search");
    assert_eq!(params["api_key"], "test-key");
    assert_eq!(params["lat"], "41.9028");
    assert_eq!(params["lon"], "12.4964");
    assert_eq!(params["per_page"], "25");
    assert_eq!(params["page"], "1");
    assert_eq!(params["safe_search"], "1");
    assert_eq!(params["extras"], "url_m");
    assert_eq!(params["format"], "json");
    assert_eq!(params["nojsoncallback"], "1");
}

#[tokio::test]
async fn test_explicit_page_skips_the_probe() {
    let provider = Provider::new(|params| photos(page_of(params), 60, 3));
    let (client, _) = client_for(&provider).await;

    let result = client.search(ROME, Some(7)).await.unwrap();

    assert_eq!(result.page, 7);
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_no_pages_means_a_single_request_and_no_photos() {
    let provider = Provider::new(|_| json!({ "photos": { "page": 1, "pages": 0, "photo": [] } }));
    let (client, _) = client_for(&provider).await;

    let result = client.search(ROME, None).await.unwrap();

    assert!(result.photos.is_empty());
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_missing_page_count_is_invalid_shape() {
    let provider = Provider::new(|_| json!({ "photos": { "photo": [] } }));
    let (client, _) = client_for(&provider).await;

    let err = client.search(ROME, None).await.unwrap_err();

    assert!(matches!(err, AppError::InvalidResponseShape(_)));
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_http_failure_is_a_network_error() {
    let base = serve(Router::new().route(
        "/services/rest",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    ))
    .await;
    let mut config = FlickrConfig::new(SecretString::from("k".to_string()));
    config.endpoint = format!("{base}/services/rest");
    let client = FlickrClient::new(config).unwrap();

    assert!(matches!(client.search(ROME, None).await, Err(AppError::Network(_))));
}

#[tokio::test]
async fn test_unreachable_provider_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = FlickrConfig::new(SecretString::from("k".to_string()));
    config.endpoint = format!("http://{addr}/services/rest");
    config.timeout = Duration::from_secs(2);
    let client = FlickrClient::new(config).unwrap();

    assert!(matches!(client.search(ROME, None).await, Err(AppError::Network(_))));
}

#[tokio::test]
async fn test_fetch_image_returns_the_body() {
    let provider = Provider::new(|_| json!({}));
    let (client, base) = client_for(&provider).await;

    let bytes = client.fetch_image(&format!("{base}/images/ok.jpg")).await.unwrap();
    assert_eq!(bytes.as_ref(), &[0xFF, 0xD8, 0xFF, 0xD9]);

    let missing = client.fetch_image(&format!("{base}/images/missing.jpg")).await;
    assert!(matches!(missing, Err(AppError::Network(msg)) if msg.contains("404")));
}
