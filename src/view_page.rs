//! Embedding document for list pages
//!
//! Served by the origin server at `{base_path}/{slug}`. The document carries
//! the same metadata the edge would inject, plus an iframe that loads the
//! interactive app keyed by slug. Useful when no static page is deployed
//! behind the edge.

use crate::cache_control::{compute_validator, is_not_modified, CachePolicy};
use crate::config::SeoConfig;
use crate::count_lookup::CountLookup;
use crate::edge::request_origin;
use crate::error::{Result, SeoError};
use crate::html_rewriter::escape_html;
use crate::metadata::{MetadataSynthesizer, PageMetadata};
use crate::slug::SlugResolver;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, IF_NONE_MATCH};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::sync::Arc;
use tracing::{debug, info};

/// Renders and serves embedding documents
pub struct ViewPage {
    resolver: Arc<SlugResolver>,
    synthesizer: MetadataSynthesizer,
    count_lookup: Option<CountLookup>,
    policy: CachePolicy,
    strict: bool,
    public_origin: Option<String>,
}

impl ViewPage {
    pub fn new(config: &SeoConfig, resolver: Arc<SlugResolver>) -> Result<Self> {
        let count_lookup = if config.count_lookup.enabled {
            Some(CountLookup::new(config)?)
        } else {
            None
        };
        Ok(ViewPage {
            resolver,
            synthesizer: MetadataSynthesizer::from_config(config),
            count_lookup,
            policy: config.page_cache.clone(),
            strict: config.strict_slugs,
            public_origin: config.public_origin.clone(),
        })
    }

    /// Serve the document for `slug`
    pub async fn handle<B>(&self, req: &Request<B>, slug: &str) -> Result<Response<Full<Bytes>>> {
        let view = if self.strict {
            self.resolver.resolve_strict(slug)
        } else {
            Some(self.resolver.resolve(slug))
        };
        let view = match view {
            Some(v) if !v.is_all_categories() => v,
            _ => {
                debug!("No view page for slug '{}'", slug);
                return text_response(StatusCode::NOT_FOUND, "Not found");
            }
        };

        let origin = request_origin(self.public_origin.as_deref(), req.headers());
        let count = match self.count_lookup {
            Some(ref lookup) => lookup.fetch_count(&origin, &view.view_name).await,
            None => None,
        };

        let metadata = self
            .synthesizer
            .synthesize(&view, count, &origin, req.uri().path());
        let html = render(&metadata, &view.slug);
        let validator = compute_validator(html.as_bytes());

        let if_none_match = req
            .headers()
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok());
        let (status, body) = if is_not_modified(if_none_match, &validator) {
            (StatusCode::NOT_MODIFIED, Bytes::new())
        } else {
            (StatusCode::OK, Bytes::from(html))
        };

        info!("View page slug='{}' view='{}' status={}", view.slug, view.view_name, status);

        self.policy
            .stamp(Response::builder(), Some(&validator))
            .status(status)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(body))
            .map_err(|e| SeoError::InternalError(format!("Failed to build response: {}", e)))
    }
}

/// Render the embedding document
pub fn render(meta: &PageMetadata, slug: &str) -> String {
    let title = escape_html(&meta.title);
    let description = escape_html(&meta.description);
    let canonical = escape_html(&meta.canonical_url);
    let image = escape_html(&meta.image_url);
    let app = format!("/index.html?v={}", utf8_percent_encode(slug, NON_ALPHANUMERIC));

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<meta name="description" content="{description}">
<link rel="canonical" href="{canonical}">
<meta property="og:type" content="website">
<meta property="og:title" content="{title}">
<meta property="og:description" content="{description}">
<meta property="og:url" content="{canonical}">
<meta property="og:image" content="{image}">
<meta name="twitter:card" content="summary_large_image">
<meta name="twitter:title" content="{title}">
<meta name="twitter:description" content="{description}">
<meta name="twitter:image" content="{image}">
<meta name="robots" content="index,follow">
<script type="application/ld+json" id="ld-collection">{json_ld}</script>
<style>html,body,.frame{{height:100%;margin:0;border:0;padding:0}}.frame{{width:100%;display:block}}</style>
</head>
<body>
<iframe class="frame" src="{app}" title="{title}"></iframe>
</body>
</html>"#,
        title = title,
        description = description,
        canonical = canonical,
        image = image,
        json_ld = meta.json_ld_script_body(),
        app = escape_html(&app),
    )
}

/// Plain-text response used for errors
pub fn text_response(status: StatusCode, message: &str) -> Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .map_err(|e| SeoError::InternalError(format!("Failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn config(strict: bool) -> SeoConfig {
        let mut config = SeoConfig::default().with_alias("ai", "AI Seed");
        config.strict_slugs = strict;
        config.public_origin = Some("https://lists.example.com".to_string());
        config
    }

    fn page(strict: bool) -> ViewPage {
        let config = config(strict);
        let resolver = Arc::new(SlugResolver::new(config.effective_aliases().unwrap()));
        ViewPage::new(&config, resolver).unwrap()
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_renders_document() {
        let response = page(false)
            .handle(&get("/resources/top-investor-lists/ai"), "ai")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("etag").is_some());
        assert!(response.headers().get("cdn-cache-control").is_some());
        let html = text(response).await;
        assert!(html.contains("<title>Top AI Seed Investors - Spacecadet</title>"));
        assert!(html.contains("<iframe class=\"frame\" src=\"/index.html?v=ai\""));
        assert!(html.contains("<meta name=\"robots\" content=\"index,follow\">"));
        assert!(html.contains(
            "href=\"https://lists.example.com/resources/top-investor-lists/ai-seed\""
        ));
    }

    #[tokio::test]
    async fn test_not_modified() {
        let p = page(false);
        let first = p.handle(&get("/x"), "bio").await.unwrap();
        let etag = first.headers().get("etag").unwrap().clone();
        let req = Request::builder()
            .uri("/x")
            .header("if-none-match", etag)
            .body(())
            .unwrap();
        let second = p.handle(&req, "bio").await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
        assert!(text(second).await.is_empty());
    }

    #[tokio::test]
    async fn test_strict_slugs() {
        let p = page(true);
        let found = p.handle(&get("/x"), "AI").await.unwrap();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = p.handle(&get("/x"), "bio").await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.headers().get("content-type").unwrap(), "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn test_empty_slug_not_found() {
        let response = page(false).handle(&get("/x"), "").await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_render_escapes() {
        let mut t = crate::slug::AliasTable::new();
        t.insert("x", crate::slug::AliasEntry::View("<b>&".to_string()));
        let view = SlugResolver::new(t).resolve("x");
        let meta = MetadataSynthesizer::from_config(&SeoConfig::default()).synthesize(
            &view,
            None,
            "https://lists.example.com",
            "/x",
        );
        let html = render(&meta, "x\"y");
        assert!(html.contains("Top &lt;b&gt;&amp; Investors"));
        assert!(html.contains("src=\"/index.html?v=x%22y\""));
    }
}
