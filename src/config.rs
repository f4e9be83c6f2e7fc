//! Configuration management for the Pingora SEO module

use crate::cache_control::CachePolicy;
use crate::error::{Result, SeoError};
use crate::html_rewriter::Selector;
use crate::slug::{AliasEntry, AliasTable, SlugResolver};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Configuration for the SEO edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeoConfig {
    /// Site name appended to titles and used in structured data (default: "Spacecadet")
    #[serde(default = "default_site_name")]
    pub site_name: String,

    /// Public origin, e.g. "https://lists.example.com".
    /// When unset the origin is derived from the request Host header.
    #[serde(default)]
    pub public_origin: Option<String>,

    /// Path prefix of list pages (default: "/resources/top-investor-lists")
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Address the edge proxy listens on (default: "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen_address: String,

    /// Upstream server serving the static site
    #[serde(default = "default_upstream")]
    pub upstream_address: String,

    /// Whether the upstream speaks TLS (default: false)
    #[serde(default)]
    pub upstream_tls: bool,

    /// Path of the record-listing data endpoint (default: "/records")
    #[serde(default = "default_data_endpoint_path")]
    pub data_endpoint_path: String,

    /// Request header that disables rewriting for internal calls (default: "x-skip-seo")
    #[serde(default = "default_skip_header")]
    pub skip_header: String,

    #[serde(default)]
    pub count_lookup: CountLookupConfig,

    /// Inline slug -> view alias table
    #[serde(default)]
    pub aliases: AliasTable,

    /// Optional YAML alias file overlaid on `aliases` and re-read periodically
    #[serde(default)]
    pub alias_file: Option<String>,

    /// Alias file re-read interval in seconds (default: 60)
    #[serde(default = "default_alias_reload_secs")]
    pub alias_reload_secs: u64,

    /// Serve only alias-table slugs on the embedding page endpoint (default: false)
    #[serde(default)]
    pub strict_slugs: bool,

    #[serde(default)]
    pub images: ImageConfig,

    #[serde(default)]
    pub selectors: SelectorConfig,

    /// Cache directives for data endpoint responses
    #[serde(default = "CachePolicy::data")]
    pub data_cache: CachePolicy,

    /// Cache directives for rewritten and rendered pages
    #[serde(default = "CachePolicy::page")]
    pub page_cache: CachePolicy,

    #[serde(default)]
    pub origin_server: OriginServerConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,

    #[serde(default)]
    pub client_cache: ClientCacheConfig,

    /// Slugs enumerated by the sitemap
    #[serde(default = "default_sitemap_slugs")]
    pub sitemap_slugs: Vec<String>,

    /// Largest incomplete tag the rewriter will carry between chunks (default: 64KB)
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

/// Record count lookup performed before a page is rewritten
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountLookupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Timeout in milliseconds (default: 8000)
    #[serde(default = "default_count_timeout_ms")]
    pub timeout_ms: u64,

    /// Record provider base id passed to the data endpoint (env: AIRTABLE_BASE)
    #[serde(default)]
    pub data_base: String,

    /// Record provider table passed to the data endpoint (env: AIRTABLE_TABLE)
    #[serde(default)]
    pub data_table: String,
}

/// Social card images
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    /// Directory holding per-category images (default: "/Assets")
    #[serde(default = "default_image_dir")]
    pub dir: String,

    /// File extension of per-category images (default: "png")
    #[serde(default = "default_image_extension")]
    pub extension: String,

    /// View names that have a dedicated image
    #[serde(default)]
    pub categories: Vec<String>,

    /// Image used when a view has no dedicated image
    #[serde(default = "default_image")]
    pub default: String,
}

/// Selectors of the hero elements rewritten with count-aware copy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorConfig {
    #[serde(default = "default_hero_heading")]
    pub hero_heading: String,

    #[serde(default = "default_hero_copy")]
    pub hero_copy: String,
}

/// Origin HTTP server hosting the data, page and sitemap endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginServerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind (default: "127.0.0.1:8081")
    #[serde(default = "default_origin_address")]
    pub address: String,

    /// Record provider API root (default: "https://api.airtable.com/v0")
    #[serde(default = "default_airtable_api")]
    pub airtable_api: String,

    /// Record provider token (env: AIRTABLE_TOKEN)
    #[serde(default)]
    pub airtable_token: Option<String>,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Client cache agent settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCacheConfig {
    /// Namespace version; changing it discards every older namespace (default: "v1")
    #[serde(default = "default_client_cache_version")]
    pub version: String,

    /// Path prefix identifying data endpoint requests (default: "/records")
    #[serde(default = "default_data_endpoint_path")]
    pub data_path_prefix: String,

    /// Assets pre-populated on install
    #[serde(default = "default_static_manifest")]
    pub static_manifest: Vec<String>,

    /// File extensions treated as static assets
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,
}

impl Default for CountLookupConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            timeout_ms: default_count_timeout_ms(),
            data_base: String::new(),
            data_table: String::new(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            dir: default_image_dir(),
            extension: default_image_extension(),
            categories: Vec::new(),
            default: default_image(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hero_heading: default_hero_heading(),
            hero_copy: default_hero_copy(),
        }
    }
}

impl Default for OriginServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_origin_address(),
            airtable_api: default_airtable_api(),
            airtable_token: None,
        }
    }
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for ClientCacheConfig {
    fn default() -> Self {
        Self {
            version: default_client_cache_version(),
            data_path_prefix: default_data_endpoint_path(),
            static_manifest: default_static_manifest(),
            static_extensions: default_static_extensions(),
        }
    }
}

// Default value functions for serde
fn default_site_name() -> String {
    "Spacecadet".to_string()
}

fn default_base_path() -> String {
    "/resources/top-investor-lists".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_data_endpoint_path() -> String {
    "/records".to_string()
}

fn default_skip_header() -> String {
    "x-skip-seo".to_string()
}

fn default_true() -> bool {
    true
}

fn default_count_timeout_ms() -> u64 {
    8000
}

fn default_alias_reload_secs() -> u64 {
    60
}

fn default_image_dir() -> String {
    "/Assets".to_string()
}

fn default_image_extension() -> String {
    "png".to_string()
}

fn default_image() -> String {
    "/Assets/handshake.jpg".to_string()
}

fn default_hero_heading() -> String {
    "h1.hero-headline".to_string()
}

fn default_hero_copy() -> String {
    "p.hero-copy".to_string()
}

fn default_origin_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_airtable_api() -> String {
    "https://api.airtable.com/v0".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_client_cache_version() -> String {
    "v1".to_string()
}

fn default_static_manifest() -> Vec<String> {
    [
        "/",
        "/styles.css",
        "/Assets/handshake.jpg",
        "/Assets/union.svg",
        "/Fonts/NBArchitekt-Regular.otf",
        "/Fonts/NBArchitekt-Bold.otf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_static_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "svg", "webp", "gif", "otf", "ttf", "woff", "woff2", "css", "js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sitemap_slugs() -> Vec<String> {
    ["seed", "pre-seed", "aerospace", "ai", "bio", "energy", "robotics"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_pending_bytes() -> usize {
    64 * 1024 // 64KB
}

impl Default for SeoConfig {
    fn default() -> Self {
        SeoConfig {
            site_name: default_site_name(),
            public_origin: None,
            base_path: default_base_path(),
            listen_address: default_listen(),
            upstream_address: default_upstream(),
            upstream_tls: false,
            data_endpoint_path: default_data_endpoint_path(),
            skip_header: default_skip_header(),
            count_lookup: CountLookupConfig::default(),
            aliases: AliasTable::new(),
            alias_file: None,
            alias_reload_secs: default_alias_reload_secs(),
            strict_slugs: false,
            images: ImageConfig::default(),
            selectors: SelectorConfig::default(),
            data_cache: CachePolicy::data(),
            page_cache: CachePolicy::page(),
            origin_server: OriginServerConfig::default(),
            metrics_endpoint: None,
            client_cache: ClientCacheConfig::default(),
            sitemap_slugs: default_sitemap_slugs(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

impl SeoConfig {
    /// Load configuration from a YAML file
    ///
    /// Environment overrides are applied before validation.
    ///
    /// # Returns
    /// * `Ok(SeoConfig)` if loading and validation succeed
    /// * `Err(SeoError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            SeoError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let mut config: SeoConfig = serde_yaml::from_str(&content).map_err(|e| {
            SeoError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply deployment values from the environment
    ///
    /// `SITE_ORIGIN`, `AIRTABLE_BASE`, `AIRTABLE_TABLE` and `AIRTABLE_TOKEN`
    /// override the file when set and non-empty.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(origin) = get("SITE_ORIGIN") {
            debug!("SITE_ORIGIN override: {}", origin);
            self.public_origin = Some(origin);
        }
        if let Some(base) = get("AIRTABLE_BASE") {
            self.count_lookup.data_base = base;
        }
        if let Some(table) = get("AIRTABLE_TABLE") {
            self.count_lookup.data_table = table;
        }
        if let Some(token) = get("AIRTABLE_TOKEN") {
            self.origin_server.airtable_token = Some(token);
        }
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - site_name must not be empty
    /// - base_path and data_endpoint_path must start with '/'
    /// - public_origin, when set, must be an absolute http(s) URL
    /// - count_lookup.timeout_ms must be between 1 and 60000
    /// - skip_header must be a valid header name
    /// - cache policies and selectors must be well-formed
    /// - client_cache.version must not be empty
    /// - max_pending_bytes must be at least 1KB
    pub fn validate(&self) -> Result<()> {
        const MAX_TIMEOUT_MS: u64 = 60_000;
        const MIN_PENDING_BYTES: usize = 1024;

        if self.site_name.trim().is_empty() {
            return Err(SeoError::ConfigError("site_name must not be empty".to_string()));
        }

        if !self.base_path.starts_with('/') {
            return Err(SeoError::ConfigError(format!(
                "base_path must start with '/', got '{}'",
                self.base_path
            )));
        }

        if !self.data_endpoint_path.starts_with('/') {
            return Err(SeoError::ConfigError(format!(
                "data_endpoint_path must start with '/', got '{}'",
                self.data_endpoint_path
            )));
        }

        if let Some(ref origin) = self.public_origin {
            let parsed = url::Url::parse(origin).map_err(|e| {
                SeoError::ConfigError(format!("public_origin '{}' is invalid: {}", origin, e))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(SeoError::ConfigError(format!(
                    "public_origin must be http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }

        if self.count_lookup.timeout_ms == 0 || self.count_lookup.timeout_ms > MAX_TIMEOUT_MS {
            return Err(SeoError::ConfigError(format!(
                "count_lookup.timeout_ms must be between 1 and {}, got {}",
                MAX_TIMEOUT_MS, self.count_lookup.timeout_ms
            )));
        }

        if http::HeaderName::from_bytes(self.skip_header.as_bytes()).is_err() {
            return Err(SeoError::ConfigError(format!(
                "skip_header '{}' is not a valid header name",
                self.skip_header
            )));
        }

        self.data_cache
            .validate()
            .map_err(|e| SeoError::ConfigError(format!("data_cache: {}", e)))?;
        self.page_cache
            .validate()
            .map_err(|e| SeoError::ConfigError(format!("page_cache: {}", e)))?;

        for (name, raw) in [
            ("hero_heading", &self.selectors.hero_heading),
            ("hero_copy", &self.selectors.hero_copy),
        ] {
            Selector::parse(raw).map_err(|e| {
                SeoError::ConfigError(format!("selectors.{}: {}", name, e))
            })?;
        }

        if self.client_cache.version.trim().is_empty() {
            return Err(SeoError::ConfigError(
                "client_cache.version must not be empty".to_string(),
            ));
        }

        if self.max_pending_bytes < MIN_PENDING_BYTES {
            return Err(SeoError::ConfigError(format!(
                "max_pending_bytes must be at least {}, got {}",
                MIN_PENDING_BYTES, self.max_pending_bytes
            )));
        }

        Ok(())
    }

    /// Build the effective alias table (inline aliases overlaid with the alias file)
    pub fn effective_aliases(&self) -> Result<AliasTable> {
        match self.alias_file {
            Some(ref path) => {
                let overlay = AliasTable::from_file(path)?;
                info!("Loaded {} aliases from {}", overlay.len(), path);
                Ok(self.aliases.merged(&overlay))
            }
            None => Ok(self.aliases.clone()),
        }
    }

    /// Add one inline alias
    pub fn with_alias(mut self, slug: &str, view: &str) -> Self {
        self.aliases.insert(slug, AliasEntry::View(view.to_string()));
        self
    }

    /// Update configuration from another config
    ///
    /// # Returns
    /// * `Ok(ConfigChanges)` - Description of what changed
    /// * `Err(SeoError)` - If the new configuration is invalid
    pub fn update_from(&mut self, new_config: &SeoConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let mut changes = ConfigChanges::default();

        if self.site_name != new_config.site_name
            || self.public_origin != new_config.public_origin
            || self.base_path != new_config.base_path
            || self.images != new_config.images
            || self.strict_slugs != new_config.strict_slugs
        {
            changes.site_changed = true;
            self.site_name = new_config.site_name.clone();
            self.public_origin = new_config.public_origin.clone();
            self.base_path = new_config.base_path.clone();
            self.images = new_config.images.clone();
            self.strict_slugs = new_config.strict_slugs;
        }

        if self.aliases != new_config.aliases || self.alias_file != new_config.alias_file {
            changes.aliases_changed = true;
            self.aliases = new_config.aliases.clone();
            self.alias_file = new_config.alias_file.clone();
        }

        if self.count_lookup != new_config.count_lookup {
            changes.count_lookup_changed = true;
            self.count_lookup = new_config.count_lookup.clone();
        }

        if self.selectors != new_config.selectors {
            changes.selectors_changed = true;
            self.selectors = new_config.selectors.clone();
        }

        if self.data_cache != new_config.data_cache || self.page_cache != new_config.page_cache {
            changes.cache_policy_changed = true;
            self.data_cache = new_config.data_cache.clone();
            self.page_cache = new_config.page_cache.clone();
        }

        if self.client_cache != new_config.client_cache {
            changes.client_cache_changed = true;
            self.client_cache = new_config.client_cache.clone();
        }

        if self.listen_address != new_config.listen_address
            || self.upstream_address != new_config.upstream_address
            || self.upstream_tls != new_config.upstream_tls
        {
            changes.upstream_changed = true;
            self.listen_address = new_config.listen_address.clone();
            self.upstream_address = new_config.upstream_address.clone();
            self.upstream_tls = new_config.upstream_tls;
        }

        if self.origin_server != new_config.origin_server
            || self.metrics_endpoint != new_config.metrics_endpoint
        {
            changes.servers_changed = true;
            self.origin_server = new_config.origin_server.clone();
            self.metrics_endpoint = new_config.metrics_endpoint.clone();
        }

        Ok(changes)
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }

    /// Reload from file and push the alias table into `resolver`.
    ///
    /// The alias file is re-read on every call since its contents can change
    /// without the config changing. On error the resolver keeps its table.
    pub fn reload_aliases_into<P: AsRef<Path>>(
        &mut self,
        path: P,
        resolver: &SlugResolver,
    ) -> Result<ConfigChanges> {
        let changes = self.reload_from_file(path)?;
        match self.alias_file {
            Some(ref file) => {
                resolver.reload_from_file(&self.aliases, file)?;
            }
            None if changes.aliases_changed => {
                resolver.swap_aliases(self.aliases.clone());
            }
            None => {}
        }
        Ok(changes)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub site_changed: bool,
    pub aliases_changed: bool,
    pub count_lookup_changed: bool,
    pub selectors_changed: bool,
    pub cache_policy_changed: bool,
    pub client_cache_changed: bool,
    pub upstream_changed: bool,
    pub servers_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        self.site_changed
            || self.aliases_changed
            || self.count_lookup_changed
            || self.selectors_changed
            || self.cache_policy_changed
            || self.client_cache_changed
            || self.upstream_changed
            || self.servers_changed
    }

    /// Only alias changes are applied live; the rest is read at startup
    pub fn requires_restart(&self) -> bool {
        self.site_changed
            || self.count_lookup_changed
            || self.selectors_changed
            || self.cache_policy_changed
            || self.client_cache_changed
            || self.upstream_changed
            || self.servers_changed
    }

    /// Get a summary of changes
    pub fn summary(&self) -> Vec<String> {
        let mut changes = Vec::new();

        if self.site_changed {
            changes.push("site".to_string());
        }
        if self.aliases_changed {
            changes.push("aliases".to_string());
        }
        if self.count_lookup_changed {
            changes.push("count_lookup".to_string());
        }
        if self.selectors_changed {
            changes.push("selectors".to_string());
        }
        if self.cache_policy_changed {
            changes.push("cache_policy".to_string());
        }
        if self.client_cache_changed {
            changes.push("client_cache".to_string());
        }
        if self.upstream_changed {
            changes.push("upstream".to_string());
        }
        if self.servers_changed {
            changes.push("servers".to_string());
        }

        changes
    }
}
