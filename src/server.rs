//! Origin HTTP server
//!
//! Hosts the data endpoint, the embedding page endpoint and the sitemap.
//! The edge proxy sits in front of it (or in front of a static site that
//! reverse-proxies these routes).

use crate::config::SeoConfig;
use crate::edge::{list_page_slug, request_origin};
use crate::error::Result;
use crate::metrics::SeoMetrics;
use crate::records::{RecordSource, RecordsHandler};
use crate::sitemap;
use crate::slug::SlugResolver;
use crate::view_page::ViewPage;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Routing and handlers shared by every connection
pub struct OriginRoutes {
    records: RecordsHandler,
    view_page: ViewPage,
    data_path: String,
    base_path: String,
    public_origin: Option<String>,
    sitemap_slugs: Vec<String>,
    metrics: Option<Arc<SeoMetrics>>,
}

impl OriginRoutes {
    pub fn new(
        config: &SeoConfig,
        resolver: Arc<SlugResolver>,
        source: Arc<dyn RecordSource>,
    ) -> Result<Self> {
        Ok(OriginRoutes {
            records: RecordsHandler::new(source, config.data_cache.clone()),
            view_page: ViewPage::new(config, resolver)?,
            data_path: config.data_endpoint_path.clone(),
            base_path: config.base_path.clone(),
            public_origin: config.public_origin.clone(),
            sitemap_slugs: config.sitemap_slugs.clone(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<SeoMetrics>) -> Self {
        self.records = self.records.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Route one request. Never fails: handler errors become plain-text
    /// 5xx responses.
    pub async fn route<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        // No route reads a request body
        let (parts, _) = req.into_parts();
        let req = Request::from_parts(parts, ());

        let path = req.uri().path().to_string();
        debug!("Origin request: {} {}", req.method(), path);

        let (route, result) = if path == self.data_path {
            ("records", self.records.handle(req).await)
        } else if path == "/sitemap.xml" {
            let origin = request_origin(self.public_origin.as_deref(), req.headers());
            ("sitemap", sitemap::response(&origin, &self.base_path, &self.sitemap_slugs))
        } else {
            match list_page_slug(&self.base_path, &path) {
                Some(slug) if req.method() == Method::GET || req.method() == Method::HEAD => {
                    ("page", self.view_page.handle(&req, &slug).await)
                }
                Some(_) => ("page", Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"))),
                None => ("other", Ok(plain(StatusCode::NOT_FOUND, "Not found"))),
            }
        };

        let response = result.unwrap_or_else(|e| {
            error!("Origin handler failed for {}: {}", path, e);
            let status = StatusCode::from_u16(e.to_http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            plain(status, &e.to_string())
        });

        if let Some(ref metrics) = self.metrics {
            metrics.record_origin_response(route, response.status().as_u16());
        }
        response
    }
}

fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Origin server bound to one address
pub struct OriginServer {
    routes: Arc<OriginRoutes>,
    addr: SocketAddr,
}

impl OriginServer {
    pub fn new(routes: Arc<OriginRoutes>, addr: SocketAddr) -> Self {
        Self { routes, addr }
    }

    /// Serve until the process exits
    pub async fn start(self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Origin server listening on http://{}", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let routes = Arc::clone(&self.routes);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let routes = Arc::clone(&routes);
                    async move { Ok::<_, Infallible>(routes.route(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}
