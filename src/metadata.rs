//! Page metadata synthesis
//!
//! Builds the crawler-visible metadata of a list page from its resolved view
//! and an optional record count. Synthesis never fails: a malformed origin
//! degrades to the generic metadata with relative URLs, and a missing count
//! only drops the number from the copy.

use crate::config::{ImageConfig, SeoConfig};
use crate::slug::ResolvedView;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

/// Characters left alone when a view name becomes an image file name
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Metadata injected into a list page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageMetadata {
    pub title: String,
    pub description: String,
    pub canonical_url: String,
    pub image_url: String,
    /// `CollectionPage` structured data
    pub json_ld: serde_json::Value,
    /// Replacement text for the hero heading, when a view was resolved
    pub hero_heading: Option<String>,
    /// Replacement text for the hero paragraph, when a view was resolved
    pub hero_copy: Option<String>,
}

impl PageMetadata {
    /// Stable serialization used when deriving validators
    pub fn fingerprint(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// JSON-LD payload safe to embed inside a `<script>` element
    pub fn json_ld_script_body(&self) -> String {
        self.json_ld.to_string().replace("</", "<\\/")
    }
}

/// Synthesizes [`PageMetadata`] for a resolved view
#[derive(Debug, Clone)]
pub struct MetadataSynthesizer {
    site_name: String,
    base_path: String,
    images: ImageConfig,
}

impl MetadataSynthesizer {
    pub fn new(site_name: impl Into<String>, base_path: impl Into<String>, images: ImageConfig) -> Self {
        MetadataSynthesizer {
            site_name: site_name.into(),
            base_path: base_path.into().trim_end_matches('/').to_string(),
            images,
        }
    }

    pub fn from_config(config: &SeoConfig) -> Self {
        Self::new(&config.site_name, &config.base_path, config.images.clone())
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    /// Heading copy: `Top 12 Pre-Seed Investors` or `Top Pre-Seed Investors`
    pub fn headline(view: &ResolvedView, count: Option<usize>) -> String {
        if view.is_all_categories() {
            return "Top Investors".to_string();
        }
        match count {
            Some(n) => format!("Top {} {} Investors", n, view.display_name),
            None => format!("Top {} Investors", view.display_name),
        }
    }

    pub fn title(&self, view: &ResolvedView, count: Option<usize>) -> String {
        format!("{} - {}", Self::headline(view, count), self.site_name)
    }

    pub fn description(view: &ResolvedView) -> String {
        if view.is_all_categories() {
            "Curated lists of top investors by category. Export to Google Sheets.".to_string()
        } else {
            format!(
                "Curated list of {} investors who lead rounds. Export to Google Sheets.",
                view.display_name
            )
        }
    }

    fn hero_copy(view: &ResolvedView) -> String {
        format!(
            "Identifying appropriate investors is hard. Here's a curated list of {} investors (in alphabetical order) who actually lead rounds.",
            view.display_name
        )
    }

    /// Canonical path: the configured base path plus the slug derived from
    /// the view. Pages outside the base path keep their own path.
    pub fn canonical_path(&self, view: &ResolvedView, request_path: &str) -> String {
        let path = request_path
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or("");
        let under_base = path
            .to_ascii_lowercase()
            .starts_with(&self.base_path.to_ascii_lowercase());

        if !under_base && view.is_all_categories() && path.starts_with('/') {
            return path.to_string();
        }

        let slug = view.canonical_slug();
        if slug.is_empty() {
            self.base_path.clone()
        } else {
            format!("{}/{}", self.base_path, slug)
        }
    }

    /// Image path for a view: a per-category file when one exists, the
    /// default asset otherwise
    pub fn image_path(&self, view: &ResolvedView) -> String {
        let dedicated = !view.is_all_categories()
            && self
                .images
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&view.view_name));

        if dedicated {
            format!(
                "{}/{}.{}",
                self.images.dir.trim_end_matches('/'),
                utf8_percent_encode(&view.view_name, FILE_NAME),
                self.images.extension
            )
        } else {
            self.images.default.clone()
        }
    }

    /// Build page metadata. Never fails.
    pub fn synthesize(
        &self,
        view: &ResolvedView,
        count: Option<usize>,
        origin: &str,
        request_path: &str,
    ) -> PageMetadata {
        let origin = match normalize_origin(origin) {
            Some(o) => o,
            None => {
                warn!("Malformed origin '{}', using generic metadata", origin);
                return self.fallback();
            }
        };

        let title = self.title(view, count);
        let description = Self::description(view);
        let canonical_url = format!("{}{}", origin, self.canonical_path(view, request_path));
        let image_url = format!("{}{}", origin, self.image_path(view));

        let (hero_heading, hero_copy) = if view.is_all_categories() {
            (None, None)
        } else {
            (Some(Self::headline(view, count)), Some(Self::hero_copy(view)))
        };

        debug!(
            "Synthesized metadata: view={}, count={:?}, canonical={}",
            view.view_name, count, canonical_url
        );

        PageMetadata {
            json_ld: self.collection_json_ld(&title, &description, &canonical_url, &origin),
            title,
            description,
            canonical_url,
            image_url,
            hero_heading,
            hero_copy,
        }
    }

    /// Generic metadata with origin-relative URLs
    pub fn fallback(&self) -> PageMetadata {
        let view = ResolvedView::all_categories();
        let title = self.title(&view, None);
        let description = Self::description(&view);
        let canonical_url = self.base_path.clone();
        let canonical_url = if canonical_url.is_empty() {
            "/".to_string()
        } else {
            canonical_url
        };

        PageMetadata {
            json_ld: self.collection_json_ld(&title, &description, &canonical_url, "/"),
            title,
            description,
            canonical_url,
            image_url: self.images.default.clone(),
            hero_heading: None,
            hero_copy: None,
        }
    }

    fn collection_json_ld(
        &self,
        title: &str,
        description: &str,
        canonical_url: &str,
        origin: &str,
    ) -> serde_json::Value {
        json!({
            "@context": "https://schema.org",
            "@type": "CollectionPage",
            "name": title,
            "description": description,
            "url": canonical_url,
            "isPartOf": {
                "@type": "WebSite",
                "name": self.site_name,
                "url": origin,
            },
        })
    }
}

/// Reduce an origin-ish string to `scheme://host[:port]`; `None` when it is
/// not an absolute http(s) URL.
pub fn normalize_origin(origin: &str) -> Option<String> {
    let parsed = url::Url::parse(origin.trim()).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str()?;
    let serialized = parsed.origin().ascii_serialization();
    if serialized == "null" {
        return None;
    }
    Some(serialized)
}
