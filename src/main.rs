//! Pingora SEO Edge Server
//!
//! Loads configuration, sets up logging and starts the edge proxy together
//! with the optional origin and metrics servers.

use pingora::prelude::*;
use pingora::proxy::http_proxy_service;
use pingora_seo::{
    AirtableSource, EdgePipeline, MetricsEndpoint, OriginRoutes, OriginServer, SeoConfig,
    SeoMetrics, SeoProxy, SlugResolver,
};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default config (pingora_seo.yaml)
/// pingora-seo
///
/// # Start with custom config
/// pingora-seo /path/to/config.yaml
/// ```
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Pingora SEO Edge");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "pingora_seo.yaml".to_string());
    info!("Loading configuration from: {}", config_path);

    let config = match SeoConfig::from_file(&config_path) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  - Site: {}", cfg.site_name);
            info!("  - Base path: {}", cfg.base_path);
            info!("  - Upstream: {} (tls: {})", cfg.upstream_address, cfg.upstream_tls);
            info!("  - Count lookup: {} ({} ms)", cfg.count_lookup.enabled, cfg.count_lookup.timeout_ms);
            info!("  - Inline aliases: {}", cfg.aliases.len());
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, config_path) {
        error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

fn run(
    config: SeoConfig,
    config_path: String,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let aliases = config.effective_aliases()?;
    let resolver = Arc::new(SlugResolver::new(aliases));
    let metrics = Arc::new(SeoMetrics::new()?);

    start_background(&config, config_path, Arc::clone(&resolver), Arc::clone(&metrics))?;

    let pipeline = Arc::new(
        EdgePipeline::new(&config, Arc::clone(&resolver))?.with_metrics(Arc::clone(&metrics)),
    );
    let proxy = SeoProxy::new(&config, pipeline).with_metrics(metrics);

    let mut server = Server::new(None)?;
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&config.listen_address);
    info!("Edge proxy listening on http://{}", config.listen_address);

    server.add_service(proxy_service);
    server.run_forever();
}

/// Origin server, metrics endpoint and config reloading run on their own
/// runtime next to Pingora's.
fn start_background(
    config: &SeoConfig,
    config_path: String,
    resolver: Arc<SlugResolver>,
    metrics: Arc<SeoMetrics>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let origin = if config.origin_server.enabled {
        let addr: SocketAddr = config.origin_server.address.parse()?;
        let source = Arc::new(AirtableSource::from_config(config)?);
        let routes = OriginRoutes::new(config, Arc::clone(&resolver), source)?
            .with_metrics(Arc::clone(&metrics));
        Some(OriginServer::new(Arc::new(routes), addr))
    } else {
        None
    };

    let metrics_endpoint = match config.metrics_endpoint {
        Some(ref endpoint) if endpoint.enabled => {
            let addr: SocketAddr = endpoint.address.parse()?;
            Some(MetricsEndpoint::new(Arc::clone(&metrics), addr))
        }
        _ => None,
    };

    let mut current = config.clone();
    let period = Duration::from_secs(config.alias_reload_secs.max(1));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("seo-background")
        .enable_all()
        .build()?;

    std::thread::spawn(move || {
        runtime.block_on(async move {
            if let Some(server) = origin {
                tokio::spawn(async move {
                    if let Err(e) = server.start().await {
                        error!("Origin server error: {}", e);
                    }
                });
            }

            if let Some(endpoint) = metrics_endpoint {
                tokio::spawn(async move {
                    if let Err(e) = endpoint.start().await {
                        error!("Metrics endpoint error: {}", e);
                    }
                });
            }

            info!("Reloading {} every {:?}", config_path, period);
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately; the config was just loaded
            interval.tick().await;
            loop {
                interval.tick().await;
                match current.reload_aliases_into(&config_path, &resolver) {
                    Ok(changes) if changes.has_changes() => {
                        info!("Configuration changed: {}", changes.summary().join(", "));
                        if changes.requires_restart() {
                            warn!("Only alias changes apply live; restart to apply the rest");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Config reload failed, keeping current settings: {}", e),
                }
            }
        });
    });

    Ok(())
}
