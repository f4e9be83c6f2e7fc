//! Edge proxy
//!
//! `SeoProxy` implements Pingora's `ProxyHttp` for the static site. List page
//! responses are rewritten while they stream through; every other response
//! is proxied untouched.
//!
//! Per request:
//! 1. `upstream_request_filter` plans the page (slug, count, metadata) and
//!    asks the upstream for an identity-encoded, unconditional body
//! 2. `upstream_response_filter` decides between rewriting and passthrough
//!    and fixes up the response headers
//! 3. `response_body_filter` feeds each chunk through the rewriter
//! 4. `logging` records the outcome

use crate::config::SeoConfig;
use crate::edge::{
    EdgePipeline, HeaderEdits, PagePlan, PageRewrite, PassthroughReason, RewriteOutcome,
};
use crate::metrics::SeoMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Pingora proxy service for list pages
pub struct SeoProxy {
    pipeline: Arc<EdgePipeline>,
    upstream_host: String,
    upstream_port: u16,
    upstream_tls: bool,
    metrics: Option<Arc<SeoMetrics>>,
}

/// Per-request state
#[derive(Default)]
pub struct SeoContext {
    url: String,
    plan: Option<PagePlan>,
    rewrite: PageRewrite,
    not_modified: bool,
    upstream_failed: bool,
    bytes_in: u64,
}

impl SeoContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn plan(&self) -> Option<&PagePlan> {
        self.plan.as_ref()
    }

    pub fn is_not_modified(&self) -> bool {
        self.not_modified
    }

    pub fn is_upstream_failed(&self) -> bool {
        self.upstream_failed
    }

    pub fn outcome(&self) -> RewriteOutcome {
        self.rewrite.outcome()
    }
}

impl SeoProxy {
    pub fn new(config: &SeoConfig, pipeline: Arc<EdgePipeline>) -> Self {
        let default_port = if config.upstream_tls { 443 } else { 80 };
        let (upstream_host, upstream_port) = parse_upstream(&config.upstream_address, default_port);
        Self {
            pipeline,
            upstream_host,
            upstream_port,
            upstream_tls: config.upstream_tls,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SeoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn upstream(&self) -> (&str, u16) {
        (&self.upstream_host, self.upstream_port)
    }
}

/// Split "host:port" (or a bare host) into parts
pub fn parse_upstream(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => {
                warn!("Invalid upstream port in '{}', using {}", address, default_port);
                (host.to_string(), default_port)
            }
        },
        _ => (address.to_string(), default_port),
    }
}

/// Apply header edits for a rewritten page. A not-modified answer turns the
/// response into a bodiless 304.
///
/// Edits are all-or-nothing: on error `response` keeps the upstream headers.
pub fn apply_header_edits(response: &mut ResponseHeader, edits: &HeaderEdits) -> Result<()> {
    let mut edited = response.clone();
    for name in &edits.remove {
        edited.remove_header(name);
    }
    for (name, value) in &edits.insert {
        edited
            .insert_header(name.clone(), value.as_str())
            .map_err(|e| {
                warn!("Failed to insert {} header: {}", name, e);
                Error::new(ErrorType::InternalError)
            })?;
    }

    if edits.not_modified {
        edited.set_status(304).map_err(|e| {
            warn!("Failed to set status: {}", e);
            Error::new(ErrorType::InternalError)
        })?;
        edited.remove_header("content-type");
        edited.remove_header("transfer-encoding");
    }

    *response = edited;
    Ok(())
}

#[async_trait]
impl ProxyHttp for SeoProxy {
    type CTX = SeoContext;

    fn new_ctx(&self) -> Self::CTX {
        SeoContext::new()
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        debug!("Upstream peer: {}:{}", self.upstream_host, self.upstream_port);
        let peer = Box::new(HttpPeer::new(
            (self.upstream_host.as_str(), self.upstream_port),
            self.upstream_tls,
            self.upstream_host.clone(),
        ));
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let req = session.req_header();
        ctx.url = req.uri.to_string();
        let path = req.uri.path().to_string();
        let headers = req.headers.clone();

        ctx.plan = self.pipeline.plan(&path, &headers).await;
        if ctx.plan.is_none() {
            debug!("Not a list page, proxying as is: {}", ctx.url);
            return Ok(());
        }

        for name in EdgePipeline::upstream_request_removals() {
            upstream_request.remove_header(&name);
        }
        info!("List page request: {}", ctx.url);
        Ok(())
    }

    fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let plan = match ctx.plan {
            Some(ref plan) => plan,
            None => return Ok(()),
        };

        let status = upstream_response.status.as_u16();
        let (rewrite, edits) = self
            .pipeline
            .start_response(plan, status, &upstream_response.headers);

        let rewrite = match apply_header_edits(upstream_response, &edits) {
            Ok(()) => {
                ctx.not_modified = edits.not_modified;
                rewrite
            }
            Err(e) => {
                warn!("Keeping upstream headers for {}, page passes through: {}", ctx.url, e);
                PageRewrite::passthrough(PassthroughReason::SetupFailed(
                    "response headers could not be edited".to_string(),
                ))
            }
        };
        if !rewrite.is_rewriting() {
            debug!("Passing through {}: {}", ctx.url, rewrite.outcome().kind());
        }
        ctx.rewrite = rewrite;
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<std::time::Duration>> {
        if let Some(ref chunk) = body {
            ctx.bytes_in += chunk.len() as u64;
        }

        if ctx.not_modified {
            *body = None;
            return Ok(None);
        }

        if ctx.rewrite.is_rewriting() {
            *body = ctx.rewrite.on_chunk(body.take(), end_of_stream);
        }
        Ok(None)
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        error!("Failed to connect to upstream for {}: {}", ctx.url, e);
        ctx.upstream_failed = true;
        e
    }

    fn error_while_proxy(
        &self,
        _peer: &HttpPeer,
        _session: &mut Session,
        e: Box<Error>,
        ctx: &mut Self::CTX,
        _client_reused: bool,
    ) -> Box<Error> {
        ctx.upstream_failed = true;
        match e.etype() {
            ErrorType::ConnectTimedout | ErrorType::ReadTimedout | ErrorType::WriteTimedout => {
                error!("Upstream timeout for {}: {:?}", ctx.url, e.etype());
            }
            _ => {
                error!("Proxy error for {}: {}", ctx.url, e);
            }
        }
        e
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        if let Some(error) = e {
            error!(
                "Request failed for {} after {} upstream bytes: {}",
                ctx.url, ctx.bytes_in, error
            );
        }

        if ctx.plan.is_none() {
            return;
        }

        let outcome = ctx.rewrite.outcome();
        match outcome {
            RewriteOutcome::Transformed(ref stats) | RewriteOutcome::Recovered(ref stats) => {
                info!(
                    "Page {} {}: {} -> {} bytes, {} elements rewritten, {} element errors",
                    ctx.url,
                    outcome.kind(),
                    stats.bytes_in,
                    stats.bytes_out,
                    stats.elements_rewritten,
                    stats.element_errors
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_page_outcome(outcome.kind(), None);
                    metrics.record_element_errors(stats.element_errors);
                }
            }
            RewriteOutcome::Passthrough(ref reason) => {
                info!("Page {} passed through: {}", ctx.url, reason);
                if let Some(ref metrics) = self.metrics {
                    metrics.record_page_outcome(outcome.kind(), Some(reason.label()));
                }
            }
        }
    }
}
