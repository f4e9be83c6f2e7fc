//! Edge rewriting pipeline
//!
//! Framework-independent part of the edge layer. [`EdgePipeline`] decides
//! whether a request is a list page, resolves its view, looks up the record
//! count and synthesizes metadata. [`PageRewrite`] then carries one response
//! body through the [`HtmlRewriter`] and reports a [`RewriteOutcome`].
//!
//! Every decision here fails open: anything that prevents a safe rewrite
//! turns into a passthrough of the upstream response.

use crate::cache_control::{derive_validator, is_not_modified, CachePolicy, Validator};
use crate::config::{SelectorConfig, SeoConfig};
use crate::count_lookup::CountLookup;
use crate::error::Result;
use crate::html_rewriter::{HtmlRewriter, RewriteStats};
use crate::metadata::{MetadataSynthesizer, PageMetadata};
use crate::metrics::SeoMetrics;
use crate::slug::{normalize_slug, ResolvedView, SlugResolver};
use bytes::Bytes;
use http::header::{
    HeaderName, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    ETAG, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, RANGE,
};
use http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Why a response was passed through untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassthroughReason {
    /// The inbound request carried the skip header
    SkipRequested,
    /// The path is not a list page
    NotListPage,
    /// The response is not `text/html`
    NotHtml,
    /// The response body is compressed
    Encoded(String),
    /// The upstream status is not 200
    Status(u16),
    /// The rewriter could not be built
    SetupFailed(String),
    /// Rewriting gave up before changing a single byte
    Aborted(String),
}

impl PassthroughReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            PassthroughReason::SkipRequested => "skip",
            PassthroughReason::NotListPage => "not_list_page",
            PassthroughReason::NotHtml => "not_html",
            PassthroughReason::Encoded(_) => "encoded",
            PassthroughReason::Status(304) => "not_modified",
            PassthroughReason::Status(_) => "status",
            PassthroughReason::SetupFailed(_) => "setup_failed",
            PassthroughReason::Aborted(_) => "aborted",
        }
    }
}

impl fmt::Display for PassthroughReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassthroughReason::SkipRequested => write!(f, "skip requested"),
            PassthroughReason::NotListPage => write!(f, "not a list page"),
            PassthroughReason::NotHtml => write!(f, "not html"),
            PassthroughReason::Encoded(enc) => write!(f, "content-encoding {}", enc),
            PassthroughReason::Status(s) => write!(f, "upstream status {}", s),
            PassthroughReason::SetupFailed(e) => write!(f, "setup failed: {}", e),
            PassthroughReason::Aborted(e) => write!(f, "aborted: {}", e),
        }
    }
}

/// Result of carrying one response through the edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// The body was rewritten without incident
    Transformed(RewriteStats),
    /// The upstream response was returned byte for byte
    Passthrough(PassthroughReason),
    /// The body was rewritten, but some elements were left unchanged or
    /// the tail of the document was passed through
    Recovered(RewriteStats),
}

impl RewriteOutcome {
    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            RewriteOutcome::Transformed(_) => "transformed",
            RewriteOutcome::Passthrough(_) => "passthrough",
            RewriteOutcome::Recovered(_) => "recovered",
        }
    }

    fn from_stats(stats: &RewriteStats) -> Self {
        match stats.aborted {
            Some(ref reason) if !stats.modified => {
                RewriteOutcome::Passthrough(PassthroughReason::Aborted(reason.clone()))
            }
            Some(_) => RewriteOutcome::Recovered(stats.clone()),
            None if stats.element_errors > 0 => RewriteOutcome::Recovered(stats.clone()),
            None => RewriteOutcome::Transformed(stats.clone()),
        }
    }
}

/// Everything known about a list page before the upstream responds
#[derive(Debug, Clone)]
pub struct PagePlan {
    pub view: ResolvedView,
    pub count: Option<usize>,
    pub metadata: PageMetadata,
    /// The client's `If-None-Match`, kept before it is stripped upstream
    pub if_none_match: Option<String>,
}

/// Header changes for a response that is about to be rewritten
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderEdits {
    pub remove: Vec<HeaderName>,
    pub insert: Vec<(String, String)>,
    /// The client already holds this exact page
    pub not_modified: bool,
}

/// Request-side decisions and per-page setup
pub struct EdgePipeline {
    base_path: String,
    skip_header: String,
    public_origin: Option<String>,
    count_enabled: bool,
    strict_slugs: bool,
    resolver: Arc<SlugResolver>,
    synthesizer: MetadataSynthesizer,
    count_lookup: CountLookup,
    selectors: SelectorConfig,
    page_cache: CachePolicy,
    max_pending: usize,
    metrics: Option<Arc<SeoMetrics>>,
}

impl EdgePipeline {
    pub fn new(config: &SeoConfig, resolver: Arc<SlugResolver>) -> Result<Self> {
        Ok(EdgePipeline {
            base_path: config.base_path.trim_end_matches('/').to_string(),
            skip_header: config.skip_header.to_ascii_lowercase(),
            public_origin: config.public_origin.clone(),
            count_enabled: config.count_lookup.enabled,
            strict_slugs: config.strict_slugs,
            resolver,
            synthesizer: MetadataSynthesizer::from_config(config),
            count_lookup: CountLookup::new(config)?,
            selectors: config.selectors.clone(),
            page_cache: config.page_cache.clone(),
            max_pending: config.max_pending_bytes,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<SeoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn resolver(&self) -> &SlugResolver {
        &self.resolver
    }

    /// Whether the inbound request asks the edge to stay out of the way
    pub fn skip_requested(&self, headers: &HeaderMap) -> bool {
        headers.contains_key(self.skip_header.as_str())
    }

    /// Slug of a list page path under the configured base path
    pub fn page_slug(&self, path: &str) -> Option<String> {
        list_page_slug(&self.base_path, path)
    }

    /// Origin used in absolute URLs for this request
    pub fn request_origin(&self, headers: &HeaderMap) -> String {
        request_origin(self.public_origin.as_deref(), headers)
    }

    /// Resolve, count and synthesize for a list page request.
    ///
    /// `None` when the request is not a rewritable page.
    pub async fn plan(&self, path: &str, headers: &HeaderMap) -> Option<PagePlan> {
        if self.skip_requested(headers) {
            debug!("Skip header present, not planning {}", path);
            return None;
        }
        let slug = self.page_slug(path)?;
        let view = self.resolve(&slug)?;
        let origin = self.request_origin(headers);

        let count = if self.count_enabled && !view.is_all_categories() {
            let started = Instant::now();
            let count = self.count_lookup.fetch_count(&origin, &view.view_name).await;
            if let Some(ref metrics) = self.metrics {
                metrics.record_count_lookup(count, started.elapsed().as_secs_f64());
            }
            count
        } else {
            if let Some(ref metrics) = self.metrics {
                metrics.record_count_skipped();
            }
            None
        };

        let if_none_match = headers
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Some(self.plan_for(view, count, &origin, path, if_none_match))
    }

    /// With strict slugs, pages whose slug is not in the alias table are
    /// left alone. The listing index is always planned.
    fn resolve(&self, slug: &str) -> Option<ResolvedView> {
        if !self.strict_slugs || normalize_slug(slug).is_empty() {
            return Some(self.resolver.resolve(slug));
        }
        let view = self.resolver.resolve_strict(slug);
        if view.is_none() {
            debug!("Slug '{}' not in alias table, passing page through", slug);
        }
        view
    }

    /// Synthesize a plan for an already resolved view
    pub fn plan_for(
        &self,
        view: ResolvedView,
        count: Option<usize>,
        origin: &str,
        path: &str,
        if_none_match: Option<String>,
    ) -> PagePlan {
        let metadata = self.synthesizer.synthesize(&view, count, origin, path);
        info!(
            "Planned page: slug='{}' view='{}' source={:?} count={:?}",
            view.slug, view.view_name, view.source, count
        );
        PagePlan {
            view,
            count,
            metadata,
            if_none_match,
        }
    }

    /// Request headers to drop before going upstream so the body arrives
    /// uncompressed and complete
    pub fn upstream_request_removals() -> [HeaderName; 5] {
        [ACCEPT_ENCODING, IF_NONE_MATCH, IF_MODIFIED_SINCE, RANGE, IF_RANGE]
    }

    /// Decide how to handle an upstream response for a planned page
    pub fn start_response(
        &self,
        plan: &PagePlan,
        status: u16,
        headers: &HeaderMap,
    ) -> (PageRewrite, HeaderEdits) {
        if status != 200 {
            return (
                PageRewrite::passthrough(PassthroughReason::Status(status)),
                HeaderEdits::default(),
            );
        }

        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if !is_html(content_type) {
            return (
                PageRewrite::passthrough(PassthroughReason::NotHtml),
                HeaderEdits::default(),
            );
        }

        if let Some(encoding) = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
            if !encoding.trim().eq_ignore_ascii_case("identity") {
                return (
                    PageRewrite::passthrough(PassthroughReason::Encoded(encoding.to_string())),
                    HeaderEdits::default(),
                );
            }
        }

        let rewriter = match HtmlRewriter::new(&plan.metadata, &self.selectors, self.max_pending) {
            Ok(r) => r,
            Err(e) => {
                warn!("Cannot build rewriter, passing page through: {}", e);
                return (
                    PageRewrite::passthrough(PassthroughReason::SetupFailed(e.to_string())),
                    HeaderEdits::default(),
                );
            }
        };

        let validator = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.starts_with("W/"))
            .map(|upstream| page_validator(upstream, &plan.metadata));

        let mut edits = HeaderEdits {
            remove: vec![
                CONTENT_LENGTH,
                ETAG,
                CACHE_CONTROL,
                HeaderName::from_bytes(self.page_cache.cdn_header.as_bytes())
                    .unwrap_or(CACHE_CONTROL),
            ],
            insert: self.page_cache.header_pairs().to_vec(),
            not_modified: false,
        };

        match validator {
            Some(ref v) => {
                edits
                    .insert
                    .push((ETAG.as_str().to_string(), v.as_header().to_string()));
                edits.not_modified = is_not_modified(plan.if_none_match.as_deref(), v);
            }
            None => debug!(
                "No strong upstream ETag for slug='{}', rewritten page sent without a validator",
                plan.view.slug
            ),
        }

        if edits.not_modified {
            debug!("Client validator matches rewritten page");
            return (
                PageRewrite::passthrough(PassthroughReason::Status(304)),
                edits,
            );
        }

        (PageRewrite::rewriting(rewriter), edits)
    }
}

/// Slug of a list page path, `Some("")` for the listing root, `None` for
/// anything outside `base_path`
pub fn list_page_slug(base_path: &str, path: &str) -> Option<String> {
    let base_path = base_path.trim_end_matches('/');
    let path = path.split(|c| c == '?' || c == '#').next().unwrap_or("");
    if path.len() < base_path.len()
        || !path.is_char_boundary(base_path.len())
        || !path[..base_path.len()].eq_ignore_ascii_case(base_path)
    {
        return None;
    }

    let rest = &path[base_path.len()..];
    if rest.is_empty() {
        return Some(String::new());
    }
    let rest = rest.strip_prefix('/')?;
    let slug = rest.strip_suffix('/').unwrap_or(rest);
    if slug.contains('/') || slug.ends_with(".html") {
        return None;
    }
    Some(slug.to_string())
}

/// The configured public origin, or one derived from `Host` and
/// `X-Forwarded-Proto`. Empty when neither is available.
pub fn request_origin(public_origin: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(origin) = public_origin {
        return origin.to_string();
    }
    let host = match headers.get(HOST).and_then(|h| h.to_str().ok()) {
        Some(h) if !h.is_empty() => h,
        _ => return String::new(),
    };
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v == "http" || v == "https")
        .unwrap_or_else(|| "http".to_string());
    format!("{}://{}", scheme, host)
}

/// Validator of a rewritten page; a pure function of the upstream body
/// (through its strong ETag) and the injected metadata
pub fn page_validator(upstream_etag: &str, metadata: &PageMetadata) -> Validator {
    let fingerprint = metadata.fingerprint();
    derive_validator(&[upstream_etag.as_bytes(), &fingerprint])
}

/// Content-type guard
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
        .unwrap_or(false)
}

/// One response body on its way through the edge
pub struct PageRewrite {
    rewriter: Option<HtmlRewriter>,
    reason: Option<PassthroughReason>,
}

impl PageRewrite {
    pub fn passthrough(reason: PassthroughReason) -> Self {
        PageRewrite {
            rewriter: None,
            reason: Some(reason),
        }
    }

    pub fn rewriting(rewriter: HtmlRewriter) -> Self {
        PageRewrite {
            rewriter: Some(rewriter),
            reason: None,
        }
    }

    pub fn is_rewriting(&self) -> bool {
        self.rewriter.is_some()
    }

    /// Transform one body chunk. Passthrough leaves the chunk as it is.
    pub fn on_chunk(&mut self, chunk: Option<Bytes>, end_of_stream: bool) -> Option<Bytes> {
        let rewriter = match self.rewriter {
            Some(ref mut r) => r,
            None => return chunk,
        };

        let mut out = match chunk {
            Some(ref data) => rewriter.write(data).to_vec(),
            None => Vec::new(),
        };
        if end_of_stream {
            out.extend_from_slice(&rewriter.end());
        }

        if out.is_empty() && chunk.is_none() {
            None
        } else {
            Some(Bytes::from(out))
        }
    }

    pub fn outcome(&self) -> RewriteOutcome {
        match (&self.rewriter, &self.reason) {
            (Some(r), _) => RewriteOutcome::from_stats(r.stats()),
            (None, Some(reason)) => RewriteOutcome::Passthrough(reason.clone()),
            (None, None) => RewriteOutcome::Passthrough(PassthroughReason::NotListPage),
        }
    }
}

impl Default for PageRewrite {
    fn default() -> Self {
        PageRewrite::passthrough(PassthroughReason::NotListPage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn pipeline() -> EdgePipeline {
        let config = SeoConfig::default().with_alias("ai-seed", "AI");
        let resolver = Arc::new(SlugResolver::new(config.effective_aliases().unwrap()));
        EdgePipeline::new(&config, resolver).unwrap()
    }

    fn html_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        h.insert(CONTENT_LENGTH, HeaderValue::from_static("120"));
        h.insert(ETAG, HeaderValue::from_static("\"abc\""));
        h
    }

    fn plan(p: &EdgePipeline, slug: &str) -> PagePlan {
        let view = p.resolver().resolve(slug);
        p.plan_for(
            view,
            None,
            "https://lists.example.com",
            &format!("/resources/top-investor-lists/{}", slug),
            None,
        )
    }

    fn run(rewrite: &mut PageRewrite, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, c) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            if let Some(b) = rewrite.on_chunk(Some(Bytes::copy_from_slice(c)), last) {
                out.extend_from_slice(&b);
            }
        }
        out
    }

    #[test]
    fn test_page_slug() {
        let p = pipeline();
        assert_eq!(p.page_slug("/resources/top-investor-lists/ai-seed").as_deref(), Some("ai-seed"));
        assert_eq!(p.page_slug("/resources/top-investor-lists/ai-seed/").as_deref(), Some("ai-seed"));
        assert_eq!(p.page_slug("/Resources/Top-Investor-Lists/AI?x=1").as_deref(), Some("AI"));
        assert_eq!(p.page_slug("/resources/top-investor-lists").as_deref(), Some(""));
        assert_eq!(p.page_slug("/resources/top-investor-lists/").as_deref(), Some(""));
        assert_eq!(p.page_slug("/resources/top-investor-listsx"), None);
        assert_eq!(p.page_slug("/resources/top-investor-lists/a/b"), None);
        assert_eq!(p.page_slug("/styles.css"), None);
    }

    #[test]
    fn test_request_origin() {
        let p = pipeline();
        let mut h = HeaderMap::new();
        assert_eq!(p.request_origin(&h), "");
        h.insert(HOST, HeaderValue::from_static("lists.example.com"));
        assert_eq!(p.request_origin(&h), "http://lists.example.com");
        h.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));
        assert_eq!(p.request_origin(&h), "https://lists.example.com");
    }

    #[test]
    fn test_skip_header() {
        let p = pipeline();
        let mut h = HeaderMap::new();
        assert!(!p.skip_requested(&h));
        h.insert("x-skip-seo", HeaderValue::from_static("1"));
        assert!(p.skip_requested(&h));
    }

    #[test]
    fn test_weak_or_missing_upstream_etag_gives_no_validator() {
        let p = pipeline();
        let mut page = plan(&p, "bio");
        page.if_none_match = Some("*".to_string());

        let mut weak = html_headers();
        weak.insert(ETAG, HeaderValue::from_static("W/\"abc\""));
        let mut missing = html_headers();
        missing.remove(ETAG);

        for headers in [weak, missing] {
            let (rewrite, edits) = p.start_response(&page, 200, &headers);
            assert!(rewrite.is_rewriting());
            assert!(!edits.not_modified);
            assert!(edits.insert.iter().all(|(name, _)| name != "etag"));
            assert!(edits.remove.contains(&ETAG));
        }
    }

    #[tokio::test]
    async fn test_strict_slugs_pass_unknown_pages_through() {
        let mut config = SeoConfig::default().with_alias("ai-seed", "AI");
        config.strict_slugs = true;
        config.count_lookup.enabled = false;
        let resolver = Arc::new(SlugResolver::new(config.effective_aliases().unwrap()));
        let p = EdgePipeline::new(&config, resolver).unwrap();
        let h = HeaderMap::new();

        assert!(p.plan("/resources/top-investor-lists/ai-seed", &h).await.is_some());
        assert!(p.plan("/resources/top-investor-lists/", &h).await.is_some());
        assert!(p.plan("/resources/top-investor-lists/quantum", &h).await.is_none());
    }

    #[tokio::test]
    async fn test_plan_skips_when_requested() {
        let p = pipeline();
        let mut h = HeaderMap::new();
        h.insert("x-skip-seo", HeaderValue::from_static("1"));
        assert!(p.plan("/resources/top-investor-lists/ai-seed", &h).await.is_none());
        assert!(p.plan("/about", &HeaderMap::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_plan_without_provider_has_no_count() {
        let p = pipeline();
        let mut h = HeaderMap::new();
        h.insert(HOST, HeaderValue::from_static("lists.example.com"));
        let plan = p.plan("/resources/top-investor-lists/ai-seed", &h).await.unwrap();
        assert_eq!(plan.count, None);
        assert_eq!(plan.metadata.title, "Top AI Investors - Spacecadet");
    }

    #[test]
    fn test_is_html() {
        assert!(is_html(Some("text/html")));
        assert!(is_html(Some("Text/HTML; charset=utf-8")));
        assert!(!is_html(Some("application/json")));
        assert!(!is_html(Some("application/xhtml+xml")));
        assert!(!is_html(None));
    }

    #[test]
    fn test_json_response_is_untouched() {
        let p = pipeline();
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let (mut rw, edits) = p.start_response(&plan(&p, "ai-seed"), 200, &h);
        assert_eq!(edits, HeaderEdits::default());
        let body: &[u8] = b"{\"records\":[\"<title>\"]}";
        assert_eq!(run(&mut rw, &[body]), body);
        assert_eq!(rw.outcome(), RewriteOutcome::Passthrough(PassthroughReason::NotHtml));
    }

    #[test]
    fn test_non_200_and_encoded_pass_through() {
        let p = pipeline();
        let (rw, _) = p.start_response(&plan(&p, "ai-seed"), 404, &html_headers());
        assert_eq!(rw.outcome().kind(), "passthrough");

        let mut h = html_headers();
        h.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let (rw, _) = p.start_response(&plan(&p, "ai-seed"), 200, &h);
        assert_eq!(
            rw.outcome(),
            RewriteOutcome::Passthrough(PassthroughReason::Encoded("gzip".to_string()))
        );
    }

    #[test]
    fn test_html_is_rewritten_with_new_headers() {
        let p = pipeline();
        let pl = plan(&p, "ai-seed");
        let (mut rw, edits) = p.start_response(&pl, 200, &html_headers());
        assert!(rw.is_rewriting());
        assert!(edits.remove.contains(&CONTENT_LENGTH));
        assert!(edits.remove.contains(&ETAG));
        assert!(edits
            .insert
            .iter()
            .any(|(k, v)| k == "cache-control" && v.contains("max-age=60")));
        let etag = edits.insert.iter().find(|(k, _)| k == "etag").unwrap();
        assert_eq!(etag.1, page_validator("\"abc\"", &pl.metadata).as_header());

        let out = run(&mut rw, &[b"<html><head><ti", b"tle>x</title></he", b"ad><body></body></html>"]);
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("<title>Top AI Investors - Spacecadet</title>"));
        assert!(matches!(rw.outcome(), RewriteOutcome::Transformed(_)));
    }

    #[test]
    fn test_weak_upstream_etag_yields_no_validator() {
        let p = pipeline();
        let mut h = html_headers();
        h.insert(ETAG, HeaderValue::from_static("W/\"abc\""));
        let (_, edits) = p.start_response(&plan(&p, "ai-seed"), 200, &h);
        assert!(edits.insert.iter().all(|(k, _)| k != "etag"));
    }

    #[test]
    fn test_matching_client_validator_is_not_modified() {
        let p = pipeline();
        let mut pl = plan(&p, "ai-seed");
        let v = page_validator("\"abc\"", &pl.metadata);
        pl.if_none_match = Some(v.as_header().to_string());
        let (rw, edits) = p.start_response(&pl, 200, &html_headers());
        assert!(edits.not_modified);
        assert!(!rw.is_rewriting());
    }

    #[test]
    fn test_abort_before_change_is_passthrough() {
        let mut config = SeoConfig::default();
        config.max_pending_bytes = 16;
        let p = EdgePipeline::new(&config, Arc::new(SlugResolver::default())).unwrap();
        let (mut rw, _) = p.start_response(&plan(&p, "bio"), 200, &html_headers());
        let body = b"<div data-long=\"0123456789012345678901234567890\"><title>x</title>";
        let out = run(&mut rw, &[&body[..20], &body[20..40], &body[40..]]);
        assert_eq!(out, body.to_vec());
        assert!(matches!(
            rw.outcome(),
            RewriteOutcome::Passthrough(PassthroughReason::Aborted(_))
        ));
    }
}
