//! Client cache agent
//!
//! Models the browser-side caching worker that sits between the list pages
//! and the network. The worker moves through `Installing -> Active ->
//! Superseded`. While active it intercepts same-origin GET requests:
//!
//! - data endpoint requests and static assets are served
//!   stale-while-revalidate from versioned namespaces
//!   (`data-{version}` / `static-{version}`)
//! - navigations go to the network first and fall back to the cached `/`
//! - everything else is left to the network untouched
//!
//! Storage and network are traits so the agent can run against an
//! in-memory store in tests and against `reqwest` in tooling.

use crate::config::ClientCacheConfig;
use crate::error::{Result, SeoError};
use crate::metrics::SeoMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Stored (or freshly fetched) response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// 2xx; only these are written to a namespace
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request seen by the fetch handler
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    /// Browser is loading a top-level document
    pub navigate: bool,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            navigate: false,
        }
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            navigate: true,
        }
    }
}

/// Named cache namespaces holding responses keyed by URL
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the namespace if it does not exist
    async fn open(&self, namespace: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Returns whether the namespace existed
    async fn delete(&self, namespace: &str) -> Result<bool>;

    async fn lookup(&self, namespace: &str, url: &str) -> Result<Option<CachedResponse>>;

    async fn put(&self, namespace: &str, url: &str, response: CachedResponse) -> Result<()>;
}

/// Network access used by the agent
#[async_trait]
pub trait Network: Send + Sync {
    /// Err means the request never produced a response (offline, DNS,
    /// reset). HTTP error statuses are returned as responses.
    async fn fetch(&self, url: &Url) -> Result<CachedResponse>;
}

/// `CacheStorage` kept in process memory
#[derive(Default)]
pub struct MemoryCacheStorage {
    namespaces: RwLock<HashMap<String, HashMap<String, CachedResponse>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a namespace (0 when missing)
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .map(|n| n.get(namespace).map(|entries| entries.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn poisoned<T>(_: T) -> SeoError {
        SeoError::CacheError("cache storage lock poisoned".to_string())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(Self::poisoned)?;
        namespaces.entry(namespace.to_string()).or_default();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let namespaces = self.namespaces.read().map_err(Self::poisoned)?;
        let mut keys: Vec<String> = namespaces.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, namespace: &str) -> Result<bool> {
        let mut namespaces = self.namespaces.write().map_err(Self::poisoned)?;
        Ok(namespaces.remove(namespace).is_some())
    }

    async fn lookup(&self, namespace: &str, url: &str) -> Result<Option<CachedResponse>> {
        let namespaces = self.namespaces.read().map_err(Self::poisoned)?;
        Ok(namespaces
            .get(namespace)
            .and_then(|entries| entries.get(url))
            .cloned())
    }

    async fn put(&self, namespace: &str, url: &str, response: CachedResponse) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(Self::poisoned)?;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(url.to_string(), response);
        Ok(())
    }
}

/// `Network` backed by `reqwest`
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SeoError::HttpError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, url: &Url) -> Result<CachedResponse> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;
        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Installing,
    Active,
    Superseded,
}

/// Interception class of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Data,
    Static,
    Navigation,
    Other,
}

impl RequestClass {
    pub fn label(&self) -> &'static str {
        match self {
            RequestClass::Data => "data",
            RequestClass::Static => "static",
            RequestClass::Navigation => "navigation",
            RequestClass::Other => "other",
        }
    }
}

/// Where the returned response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// Navigation fell back to the cached root document
    OfflineFallback,
}

/// Response produced by the fetch handler
#[derive(Debug)]
pub struct FetchResponse {
    pub class: RequestClass,
    pub source: ResponseSource,
    pub response: CachedResponse,
    /// Background refresh started when a cached copy was returned
    pub revalidation: Option<JoinHandle<()>>,
}

/// The caching worker
pub struct ClientCacheAgent {
    config: ClientCacheConfig,
    scope: Url,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    state: LifecycleState,
    controls_clients: bool,
    metrics: Option<Arc<SeoMetrics>>,
}

impl ClientCacheAgent {
    /// Create a worker for the site at `scope` (only its origin is used)
    pub fn new(
        config: ClientCacheConfig,
        scope: Url,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            config,
            scope,
            storage,
            network,
            state: LifecycleState::Installing,
            controls_clients: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SeoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether open pages are routed through this worker
    pub fn controls_clients(&self) -> bool {
        self.controls_clients
    }

    pub fn static_namespace(&self) -> String {
        format!("static-{}", self.config.version)
    }

    pub fn data_namespace(&self) -> String {
        format!("data-{}", self.config.version)
    }

    /// Pre-populate the static namespace with the manifest, then skip
    /// waiting. The manifest is stored all-or-nothing: any failed or
    /// non-2xx fetch leaves the namespace untouched and the worker in
    /// `Installing`.
    pub async fn install(&mut self) -> Result<()> {
        if self.state != LifecycleState::Installing {
            return Err(SeoError::CacheError(format!(
                "install called in state {:?}",
                self.state
            )));
        }

        let namespace = self.static_namespace();
        self.storage.open(&namespace).await?;

        let mut fetched = Vec::with_capacity(self.config.static_manifest.len());
        for path in &self.config.static_manifest {
            let url = self.resolve(path)?;
            let response = self.network.fetch(&url).await?;
            if !response.is_ok() {
                return Err(SeoError::UpstreamError {
                    status: response.status,
                    message: format!("manifest asset {} not cacheable", url),
                });
            }
            fetched.push((url, response));
        }

        for (url, response) in fetched {
            self.storage.put(&namespace, url.as_str(), response).await?;
        }

        info!(
            "Client cache installed: {} assets in {}",
            self.config.static_manifest.len(),
            namespace
        );
        self.state = LifecycleState::Active;
        Ok(())
    }

    /// Delete every namespace other than the current static and data
    /// namespaces, then claim open clients. Returns the deleted names.
    pub async fn activate(&mut self) -> Result<Vec<String>> {
        if self.state != LifecycleState::Active {
            return Err(SeoError::CacheError(format!(
                "activate called in state {:?}",
                self.state
            )));
        }

        let keep = [self.static_namespace(), self.data_namespace()];
        let mut deleted = Vec::new();
        for namespace in self.storage.keys().await? {
            if keep.contains(&namespace) {
                continue;
            }
            if self.storage.delete(&namespace).await? {
                debug!("Deleted stale cache namespace {}", namespace);
                deleted.push(namespace);
            }
        }

        self.controls_clients = true;
        info!(
            "Client cache {} active, removed {} stale namespaces",
            self.config.version,
            deleted.len()
        );
        Ok(deleted)
    }

    /// Mark this worker as replaced by a newer version
    pub fn supersede(&mut self) {
        self.state = LifecycleState::Superseded;
        self.controls_clients = false;
    }

    /// Classify a request. Cross-origin and non-GET requests are `Other`.
    pub fn classify(&self, request: &FetchRequest) -> RequestClass {
        if request.method != Method::GET || request.url.origin() != self.scope.origin() {
            return RequestClass::Other;
        }

        let path = request.url.path();
        if path.starts_with(&self.config.data_path_prefix) {
            RequestClass::Data
        } else if self.is_static_asset(path) {
            RequestClass::Static
        } else if request.navigate {
            RequestClass::Navigation
        } else {
            RequestClass::Other
        }
    }

    fn is_static_asset(&self, path: &str) -> bool {
        if self.config.static_manifest.iter().any(|p| p == path) {
            return true;
        }
        let file = path.rsplit('/').next().unwrap_or("");
        match file.rsplit_once('.') {
            Some((_, ext)) => self
                .config
                .static_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Handle one intercepted fetch.
    ///
    /// `Ok(None)` means the worker does not respond and the request goes
    /// to the network as if no worker were installed.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<Option<FetchResponse>> {
        if self.state != LifecycleState::Active || !self.controls_clients {
            return Ok(None);
        }

        let class = self.classify(request);
        let response = match class {
            RequestClass::Data => {
                let namespace = self.data_namespace();
                self.stale_while_revalidate(class, &namespace, &request.url)
                    .await?
            }
            RequestClass::Static => {
                let namespace = self.static_namespace();
                self.stale_while_revalidate(class, &namespace, &request.url)
                    .await?
            }
            RequestClass::Navigation => self.network_first(&request.url).await?,
            RequestClass::Other => return Ok(None),
        };
        Ok(Some(response))
    }

    async fn stale_while_revalidate(
        &self,
        class: RequestClass,
        namespace: &str,
        url: &Url,
    ) -> Result<FetchResponse> {
        let cached = match self.storage.lookup(namespace, url.as_str()).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", url, e);
                None
            }
        };

        match cached {
            Some(response) => {
                self.record(class, "cache_hit");
                let revalidation = tokio::spawn(revalidate(
                    Arc::clone(&self.storage),
                    Arc::clone(&self.network),
                    namespace.to_string(),
                    url.clone(),
                    self.metrics.clone(),
                    class,
                ));
                Ok(FetchResponse {
                    class,
                    source: ResponseSource::Cache,
                    response,
                    revalidation: Some(revalidation),
                })
            }
            None => {
                self.record(class, "cache_miss");
                let response = self.network.fetch(url).await.map_err(|e| {
                    self.record(class, "network_error");
                    e
                })?;
                if response.is_ok() {
                    store(&*self.storage, namespace, url, response.clone(), &self.metrics, class)
                        .await;
                }
                Ok(FetchResponse {
                    class,
                    source: ResponseSource::Network,
                    response,
                    revalidation: None,
                })
            }
        }
    }

    async fn network_first(&self, url: &Url) -> Result<FetchResponse> {
        let class = RequestClass::Navigation;
        match self.network.fetch(url).await {
            Ok(response) => {
                self.record(class, "network");
                Ok(FetchResponse {
                    class,
                    source: ResponseSource::Network,
                    response,
                    revalidation: None,
                })
            }
            Err(e) => {
                warn!("Navigation to {} failed, trying cached root: {}", url, e);
                let root = self.resolve("/")?;
                match self.lookup_any(root.as_str()).await {
                    Some(response) => {
                        self.record(class, "offline_fallback");
                        Ok(FetchResponse {
                            class,
                            source: ResponseSource::OfflineFallback,
                            response,
                            revalidation: None,
                        })
                    }
                    None => {
                        self.record(class, "network_error");
                        Err(e)
                    }
                }
            }
        }
    }

    /// Search every namespace, current static namespace first
    async fn lookup_any(&self, url: &str) -> Option<CachedResponse> {
        let mut namespaces = vec![self.static_namespace(), self.data_namespace()];
        if let Ok(keys) = self.storage.keys().await {
            for key in keys {
                if !namespaces.contains(&key) {
                    namespaces.push(key);
                }
            }
        }

        for namespace in namespaces {
            if let Ok(Some(response)) = self.storage.lookup(&namespace, url).await {
                return Some(response);
            }
        }
        None
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.scope
            .join(path)
            .map_err(|e| SeoError::ConfigError(format!("Invalid cache path '{}': {}", path, e)))
    }

    fn record(&self, class: RequestClass, event: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_client_cache_event(class.label(), event);
        }
    }
}

/// Background refresh for a cached entry. A failed or non-2xx fetch keeps
/// the cached copy.
async fn revalidate(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    namespace: String,
    url: Url,
    metrics: Option<Arc<SeoMetrics>>,
    class: RequestClass,
) {
    match network.fetch(&url).await {
        Ok(response) if response.is_ok() => {
            store(&*storage, &namespace, &url, response, &metrics, class).await;
            if let Some(ref metrics) = metrics {
                metrics.record_client_cache_event(class.label(), "revalidated");
            }
        }
        Ok(response) => {
            debug!("Revalidation of {} returned {}, keeping cached copy", url, response.status);
        }
        Err(e) => {
            debug!("Revalidation of {} failed, keeping cached copy: {}", url, e);
            if let Some(ref metrics) = metrics {
                metrics.record_client_cache_event(class.label(), "revalidation_failed");
            }
        }
    }
}

/// Write failures never affect the response being served
async fn store(
    storage: &dyn CacheStorage,
    namespace: &str,
    url: &Url,
    response: CachedResponse,
    metrics: &Option<Arc<SeoMetrics>>,
    class: RequestClass,
) {
    if let Err(e) = storage.put(namespace, url.as_str(), response).await {
        warn!("Failed to cache {} in {}: {}", url, namespace, e);
        if let Some(ref metrics) = metrics {
            metrics.record_client_cache_event(class.label(), "write_failed");
        }
    }
}
