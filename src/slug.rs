//! Slug resolution
//!
//! Turns the raw `{slug}` path segment of a list page into the canonical
//! view name used to query the record provider, plus the display name used
//! in page copy.
//!
//! Resolution is total: an alias table is consulted first (exact match on the
//! normalized slug), then the view name is derived from the slug tokens, and
//! an empty slug resolves to the "all categories" view.
//!
//! The alias table is data, not code. [`SlugResolver`] keeps it behind an
//! [`ArcSwap`] so a deployment can replace it while requests are in flight.

use crate::error::{Result, SeoError};
use arc_swap::ArcSwap;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// View name used when the slug carries no category at all
pub const ALL_CATEGORIES_VIEW: &str = "All";

/// One alias table value.
///
/// Either a bare view name (display name equals the view name) or an
/// explicit pair:
///
/// ```yaml
/// ai-seed: "AI Seed"
/// ai:
///   view: "AI Seed"
///   display: "AI"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AliasEntry {
    View(String),
    Detailed {
        view: String,
        #[serde(default)]
        display: Option<String>,
    },
}

impl AliasEntry {
    pub fn view_name(&self) -> &str {
        match self {
            AliasEntry::View(view) => view,
            AliasEntry::Detailed { view, .. } => view,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            AliasEntry::View(view) => view,
            AliasEntry::Detailed { view, display } => display.as_deref().unwrap_or(view),
        }
    }
}

/// Mapping of normalized slugs to canonical views.
///
/// Keys are normalized on construction, so `"AI-Seed"` and `"ai-seed"` in a
/// config file address the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, AliasEntry>", into = "BTreeMap<String, AliasEntry>")]
pub struct AliasTable {
    entries: BTreeMap<String, AliasEntry>,
}

impl From<BTreeMap<String, AliasEntry>> for AliasTable {
    fn from(raw: BTreeMap<String, AliasEntry>) -> Self {
        let mut table = AliasTable::new();
        for (slug, entry) in raw {
            table.insert(&slug, entry);
        }
        table
    }
}

impl From<AliasTable> for BTreeMap<String, AliasEntry> {
    fn from(table: AliasTable) -> Self {
        table.entries
    }
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an alias; the key is normalized first. Keys that normalize to
    /// nothing are ignored.
    pub fn insert(&mut self, slug: &str, entry: AliasEntry) {
        let key = normalize_slug(slug);
        if key.is_empty() {
            return;
        }
        self.entries.insert(key, entry);
    }

    /// Look up an already-normalized slug
    pub fn get(&self, normalized: &str) -> Option<&AliasEntry> {
        self.entries.get(normalized)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AliasEntry)> {
        self.entries.iter()
    }

    /// Entries of `overlay` replace entries of `self` with the same key.
    pub fn merged(&self, overlay: &AliasTable) -> AliasTable {
        let mut entries = self.entries.clone();
        for (slug, entry) in &overlay.entries {
            entries.insert(slug.clone(), entry.clone());
        }
        AliasTable { entries }
    }

    /// Load an alias table from a YAML mapping file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            SeoError::ConfigError(format!("Failed to read alias file: {}", e))
        })?;

        serde_yaml::from_str(&content)
            .map_err(|e| SeoError::ConfigError(format!("Failed to parse alias file: {}", e)))
    }
}

/// Where a resolved view came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSource {
    /// Empty slug: the page lists every category
    AllCategories,
    /// Matched the alias table
    Alias,
    /// Derived from the slug tokens
    Derived,
}

/// Outcome of resolving a slug
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedView {
    /// The normalized request slug
    pub slug: String,
    /// Canonical view name used against the record provider
    pub view_name: String,
    /// Human-facing name used in copy
    pub display_name: String,
    pub source: ViewSource,
}

impl ResolvedView {
    pub fn all_categories() -> Self {
        ResolvedView {
            slug: String::new(),
            view_name: ALL_CATEGORIES_VIEW.to_string(),
            display_name: ALL_CATEGORIES_VIEW.to_string(),
            source: ViewSource::AllCategories,
        }
    }

    pub fn is_all_categories(&self) -> bool {
        self.source == ViewSource::AllCategories
    }

    /// Slug used in canonical URLs, derived from the view rather than copied
    /// from the request.
    pub fn canonical_slug(&self) -> String {
        if self.is_all_categories() {
            return String::new();
        }
        slugify(&self.view_name)
    }
}

/// Normalize a raw path segment: percent-decode, lowercase, drop everything
/// outside `[a-z0-9-]`, collapse hyphen runs and trim edge hyphens.
pub fn normalize_slug(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let mut out = String::with_capacity(decoded.len());

    for c in decoded.trim().chars().flat_map(char::to_lowercase) {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            '-' => {
                if !out.is_empty() && !out.ends_with('-') {
                    out.push('-');
                }
            }
            _ => {}
        }
    }

    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Render a view or display name as a slug (`"AI Pre-Seed"` -> `"ai-pre-seed"`)
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Derive a view name from a normalized slug.
///
/// A trailing `pre-seed` pair becomes the fixed `Pre-Seed` suffix; other
/// tokens are title-cased, and tokens of one or two characters are treated
/// as acronyms.
pub fn derive_view_name(normalized: &str) -> Option<String> {
    let tokens: Vec<&str> = normalized.split('-').filter(|t| !t.is_empty()).collect();
    if tokens.is_empty() {
        return None;
    }

    let n = tokens.len();
    if n >= 2 && tokens[n - 2] == "pre" && tokens[n - 1] == "seed" {
        let head: Vec<String> = tokens[..n - 2].iter().map(|t| title_token(t)).collect();
        if head.is_empty() {
            return Some("Pre-Seed".to_string());
        }
        return Some(format!("{} Pre-Seed", head.join(" ")));
    }

    Some(
        tokens
            .iter()
            .map(|t| title_token(t))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn title_token(token: &str) -> String {
    if token.chars().count() <= 2 {
        return token.to_uppercase();
    }
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// What changed when a new alias table was swapped in
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AliasChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl AliasChanges {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.changed.is_empty()
    }
}

/// Slug resolver with a hot-swappable alias table
pub struct SlugResolver {
    aliases: ArcSwap<AliasTable>,
}

impl SlugResolver {
    pub fn new(aliases: AliasTable) -> Self {
        SlugResolver {
            aliases: ArcSwap::from_pointee(aliases),
        }
    }

    /// Current alias table snapshot
    pub fn aliases(&self) -> Arc<AliasTable> {
        self.aliases.load_full()
    }

    /// Resolve a raw slug. Never fails.
    pub fn resolve(&self, raw: &str) -> ResolvedView {
        let slug = normalize_slug(raw);
        if slug.is_empty() {
            return ResolvedView::all_categories();
        }

        if let Some(view) = self.lookup_alias(&slug) {
            return view;
        }

        match derive_view_name(&slug) {
            Some(view_name) => {
                debug!("Derived view for slug={}: {}", slug, view_name);
                ResolvedView {
                    slug,
                    display_name: view_name.clone(),
                    view_name,
                    source: ViewSource::Derived,
                }
            }
            None => ResolvedView::all_categories(),
        }
    }

    /// Resolve only through the alias table
    pub fn resolve_strict(&self, raw: &str) -> Option<ResolvedView> {
        let slug = normalize_slug(raw);
        if slug.is_empty() {
            return None;
        }
        self.lookup_alias(&slug)
    }

    fn lookup_alias(&self, slug: &str) -> Option<ResolvedView> {
        let table = self.aliases.load();
        table.get(slug).map(|entry| {
            debug!("Alias hit for slug={}: {}", slug, entry.view_name());
            ResolvedView {
                slug: slug.to_string(),
                view_name: entry.view_name().to_string(),
                display_name: entry.display_name().to_string(),
                source: ViewSource::Alias,
            }
        })
    }

    /// Atomically replace the alias table
    pub fn swap_aliases(&self, next: AliasTable) -> AliasChanges {
        let previous = self.aliases.load_full();
        let mut changes = AliasChanges::default();

        for (slug, entry) in next.iter() {
            match previous.get(slug) {
                None => changes.added.push(slug.clone()),
                Some(old) if old != entry => changes.changed.push(slug.clone()),
                Some(_) => {}
            }
        }
        for (slug, _) in previous.iter() {
            if next.get(slug).is_none() {
                changes.removed.push(slug.clone());
            }
        }

        self.aliases.store(Arc::new(next));
        if changes.has_changes() {
            info!(
                "Alias table updated: {} added, {} removed, {} changed",
                changes.added.len(),
                changes.removed.len(),
                changes.changed.len()
            );
        }
        changes
    }

    /// Reload `base` overlaid with the aliases in `path`
    pub fn reload_from_file<P: AsRef<Path>>(
        &self,
        base: &AliasTable,
        path: P,
    ) -> Result<AliasChanges> {
        let overlay = AliasTable::from_file(path)?;
        Ok(self.swap_aliases(base.merged(&overlay)))
    }
}

impl Default for SlugResolver {
    fn default() -> Self {
        Self::new(AliasTable::new())
    }
}
