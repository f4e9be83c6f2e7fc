//! Integration tests for the client caching worker: version upgrades,
//! offline navigation and stale-while-revalidate refreshes

use async_trait::async_trait;
use pingora_seo::client_cache::{
    CacheStorage, CachedResponse, FetchRequest, Network, RequestClass, ResponseSource,
};
use pingora_seo::config::ClientCacheConfig;
use pingora_seo::{ClientCacheAgent, LifecycleState, MemoryCacheStorage, SeoError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

/// Network double whose responses can be swapped between requests
#[derive(Default)]
struct SiteNetwork {
    pages: Mutex<HashMap<String, CachedResponse>>,
    offline: AtomicBool,
    fetches: AtomicUsize,
}

impl SiteNetwork {
    fn serve(&self, path: &str, status: u16, body: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(path.to_string(), CachedResponse::new(status, body.to_string()));
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for SiteNetwork {
    async fn fetch(&self, url: &Url) -> pingora_seo::Result<CachedResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(SeoError::HttpError("network unreachable".to_string()));
        }
        self.pages
            .lock()
            .unwrap()
            .get(url.path())
            .cloned()
            .ok_or_else(|| SeoError::HttpError(format!("connection refused for {}", url)))
    }
}

fn scope() -> Url {
    Url::parse("https://lists.example.com/").unwrap()
}

fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

fn config(version: &str) -> ClientCacheConfig {
    ClientCacheConfig {
        version: version.to_string(),
        static_manifest: vec!["/".to_string(), "/app.js".to_string()],
        ..ClientCacheConfig::default()
    }
}

fn site() -> Arc<SiteNetwork> {
    let network = Arc::new(SiteNetwork::default());
    network.serve("/", 200, "<html>home</html>");
    network.serve("/app.js", 200, "console.log(1)");
    network.serve("/records", 200, r#"{"records":[]}"#);
    network
}

async fn activated(
    version: &str,
    storage: Arc<MemoryCacheStorage>,
    network: Arc<SiteNetwork>,
) -> ClientCacheAgent {
    let mut agent = ClientCacheAgent::new(config(version), scope(), storage, network);
    agent.install().await.unwrap();
    agent.activate().await.unwrap();
    agent
}

#[tokio::test]
async fn test_offline_navigation_serves_cached_root() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let agent = activated("v1", storage, network.clone()).await;

    network.go_offline();
    let response = agent
        .handle_fetch(&FetchRequest::navigate(url("/resources/top-investor-lists/ai")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.class, RequestClass::Navigation);
    assert_eq!(response.source, ResponseSource::OfflineFallback);
    assert_eq!(&response.response.body[..], b"<html>home</html>");
}

#[tokio::test]
async fn test_offline_navigation_to_root_serves_precached_document() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let agent = activated("v1", storage.clone(), network.clone()).await;

    network.go_offline();
    let response = agent
        .handle_fetch(&FetchRequest::navigate(url("/")))
        .await
        .expect("offline navigation to the root must not fail")
        .expect("the agent must answer for the root document");

    assert_eq!(response.response.status, 200);
    assert_eq!(&response.response.body[..], b"<html>home</html>");
    assert_ne!(response.source, ResponseSource::Network);

    // The failed background refresh leaves the precached copy in place
    if let Some(handle) = response.revalidation {
        handle.await.unwrap();
    }
    let stored = storage.lookup("static-v1", url("/").as_str()).await.unwrap();
    assert_eq!(&stored.unwrap().body[..], b"<html>home</html>");
}

#[tokio::test]
async fn test_offline_navigation_without_cached_root_fails() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let mut agent = ClientCacheAgent::new(
        ClientCacheConfig {
            static_manifest: vec!["/app.js".to_string()],
            ..ClientCacheConfig::default()
        },
        scope(),
        storage,
        network.clone(),
    );
    agent.install().await.unwrap();
    agent.activate().await.unwrap();

    network.go_offline();
    let result = agent.handle_fetch(&FetchRequest::navigate(url("/about"))).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_data_is_served_stale_then_refreshed() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let agent = activated("v1", storage.clone(), network.clone()).await;
    let request = FetchRequest::get(url("/records?view=AI"));

    // Miss goes to the network and is stored
    let first = agent.handle_fetch(&request).await.unwrap().unwrap();
    assert_eq!(first.class, RequestClass::Data);
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(storage.len("data-v1"), 1);

    // The site changes; the next request still sees the cached copy
    network.serve("/records", 200, r#"{"records":[{"fund":"A"}]}"#);
    let second = agent.handle_fetch(&request).await.unwrap().unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(&second.response.body[..], br#"{"records":[]}"#);
    second.revalidation.unwrap().await.unwrap();

    // The background refresh updated the stored copy
    let third = agent.handle_fetch(&request).await.unwrap().unwrap();
    assert_eq!(third.source, ResponseSource::Cache);
    assert_eq!(&third.response.body[..], br#"{"records":[{"fund":"A"}]}"#);
    if let Some(handle) = third.revalidation {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_failed_refresh_keeps_cached_copy() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let agent = activated("v1", storage.clone(), network.clone()).await;
    let request = FetchRequest::get(url("/app.js"));

    network.serve("/app.js", 503, "unavailable");
    let cached = agent.handle_fetch(&request).await.unwrap().unwrap();
    assert_eq!(cached.class, RequestClass::Static);
    assert_eq!(cached.source, ResponseSource::Cache);
    cached.revalidation.unwrap().await.unwrap();

    let stored = storage.lookup("static-v1", url("/app.js").as_str()).await.unwrap();
    assert_eq!(&stored.unwrap().body[..], b"console.log(1)");
}

#[tokio::test]
async fn test_version_upgrade_discards_old_namespaces() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let mut old = activated("v1", storage.clone(), network.clone()).await;
    old.handle_fetch(&FetchRequest::get(url("/records")))
        .await
        .unwrap();
    assert_eq!(storage.len("data-v1"), 1);

    let mut next = ClientCacheAgent::new(config("v2"), scope(), storage.clone(), network);
    next.install().await.unwrap();
    old.supersede();
    let mut deleted = next.activate().await.unwrap();
    deleted.sort();

    assert_eq!(deleted, vec!["data-v1".to_string(), "static-v1".to_string()]);
    assert_eq!(storage.len("static-v2"), 2);
    assert_eq!(old.state(), LifecycleState::Superseded);
    assert!(old
        .handle_fetch(&FetchRequest::get(url("/app.js")))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cross_origin_and_other_requests_are_not_intercepted() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = site();
    let agent = activated("v1", storage, network.clone()).await;
    let before = network.fetches();

    let cross = FetchRequest::get(Url::parse("https://cdn.example.net/app.js").unwrap());
    assert!(agent.handle_fetch(&cross).await.unwrap().is_none());

    let mut post = FetchRequest::get(url("/records"));
    post.method = http::Method::POST;
    assert!(agent.handle_fetch(&post).await.unwrap().is_none());

    let plain = FetchRequest::get(url("/api/other"));
    assert!(agent.handle_fetch(&plain).await.unwrap().is_none());

    assert_eq!(network.fetches(), before);
}
