//! Pingora SEO Edge
//!
//! An edge proxy for a directory of curated investor list pages. Each list
//! page URL carries a slug that selects a category ("view"). The edge
//! resolves the slug, synthesizes crawler-visible metadata (title,
//! description, canonical URL, Open Graph and Twitter tags, JSON-LD) and
//! rewrites the HTML response while it streams, so crawlers and social card
//! scrapers see category-specific metadata without running any script.
//!
//! # Overview
//!
//! ```text
//! request -> slug resolver -> count lookup (best effort, bounded)
//!         -> metadata synthesizer -> upstream -> streaming rewriter
//!         -> cache headers -> client
//! ```
//!
//! Three cache layers keep this fast: browser `Cache-Control`, a separate
//! CDN directive header, and a client-side cache agent applying
//! stale-while-revalidate per resource class.
//!
//! # Components
//!
//! - [`SlugResolver`]: slug to view name, alias table hot-swappable
//! - [`MetadataSynthesizer`]: view plus optional count to [`PageMetadata`]
//! - [`CountLookup`]: timeout-bounded record count from the data endpoint
//! - [`HtmlRewriter`]: chunked HTML tokenizer that injects and replaces
//! - [`EdgePipeline`]: request planning and fail-open response handling
//! - [`CachePolicy`]: validators and cache-control stamping
//! - [`RecordsHandler`], [`ViewPage`], [`sitemap`]: origin endpoints
//! - [`ClientCacheAgent`]: browser-side caching worker model
//! - [`SeoProxy`]: Pingora `ProxyHttp` service
//!
//! # Configuration
//!
//! ```yaml
//! site_name: "Spacecadet"
//! public_origin: "https://lists.example.com"
//! base_path: "/resources/top-investor-lists"
//! upstream_address: "127.0.0.1:8081"
//! count_lookup:
//!   timeout_ms: 8000
//! aliases:
//!   ai: "AI Seed"
//! ```
//!
//! See [`SeoConfig`] for every option.
//!
//! # Error Handling
//!
//! ```rust,no_run
//! use pingora_seo::{SeoConfig, SeoError};
//!
//! match SeoConfig::from_file("pingora_seo.yaml") {
//!     Ok(_) => println!("Config loaded"),
//!     Err(SeoError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

pub mod cache_control;
pub mod client_cache;
pub mod config;
pub mod count_lookup;
pub mod edge;
pub mod error;
pub mod html_rewriter;
pub mod metadata;
pub mod metrics;
pub mod metrics_endpoint;
pub mod proxy;
pub mod records;
pub mod server;
pub mod sitemap;
pub mod slug;
pub mod view_page;

// Re-export commonly used types
pub use cache_control::{CachePolicy, Validator};
pub use client_cache::{ClientCacheAgent, LifecycleState, MemoryCacheStorage, RequestClass};
pub use config::SeoConfig;
pub use count_lookup::CountLookup;
pub use edge::{EdgePipeline, PagePlan, PassthroughReason, RewriteOutcome};
pub use error::{Result, SeoError};
pub use html_rewriter::{HtmlRewriter, RewriteStats};
pub use metadata::{MetadataSynthesizer, PageMetadata};
pub use metrics::SeoMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use proxy::{SeoContext, SeoProxy};
pub use records::{AirtableSource, RecordSource, RecordsHandler};
pub use server::{OriginRoutes, OriginServer};
pub use slug::{ResolvedView, SlugResolver};
pub use view_page::ViewPage;
