//! Static sitemap of the known list pages

use crate::error::{Result, SeoError};
use crate::html_rewriter::escape_html;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::Full;

const CHANGEFREQ: &str = "daily";
const PRIORITY: &str = "0.8";
const SITEMAP_CACHE_CONTROL: &str = "public, max-age=3600";

/// Render `<urlset>` for `slugs` under `{origin}{base_path}/`
pub fn render(origin: &str, base_path: &str, slugs: &[String]) -> String {
    let origin = origin.trim_end_matches('/');
    let base_path = base_path.trim_end_matches('/');

    let urls: Vec<String> = slugs
        .iter()
        .map(|slug| {
            format!(
                "  <url><loc>{}</loc><changefreq>{}</changefreq><priority>{}</priority></url>",
                escape_html(&format!("{}{}/{}", origin, base_path, slug)),
                CHANGEFREQ,
                PRIORITY
            )
        })
        .collect();

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n{}\n</urlset>",
        urls.join("\n")
    )
}

pub fn response(origin: &str, base_path: &str, slugs: &[String]) -> Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/xml")
        .header(CACHE_CONTROL, SITEMAP_CACHE_CONTROL)
        .body(Full::new(Bytes::from(render(origin, base_path, slugs))))
        .map_err(|e| SeoError::InternalError(format!("Failed to build response: {}", e)))
}
