//! Streaming HTML rewriter
//!
//! A minimal tag scanner that rewrites an HTML document chunk by chunk
//! without ever holding more than one incomplete token in memory. It
//! understands just enough HTML for the fixed selector set it serves:
//! start and end tags with attributes, comments, doctype and processing
//! instructions, and raw-text elements (`script`, `style`, `title`,
//! `textarea`) whose content is never scanned for markup.
//!
//! Every matched element is rewritten independently. A failure while
//! mutating one element is logged, the element is emitted unchanged and
//! scanning continues. If a token cannot be completed within the pending
//! byte limit the rewriter stops rewriting and passes the rest of the
//! document through byte for byte.

use crate::config::SelectorConfig;
use crate::error::{Result, SeoError};
use crate::metadata::PageMetadata;
use bytes::Bytes;
use tracing::{debug, warn};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "title", "textarea"];

/// Open elements tracked outside replaced content; deeper nesting is not recorded
const MAX_OPEN_ELEMENTS: usize = 256;

/// Start tags that implicitly close an open `<p>`
const P_CLOSERS: &[&str] = &[
    "address", "article", "aside", "blockquote", "div", "dl", "fieldset", "footer", "form",
    "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "main", "nav", "ol", "p", "pre",
    "section", "table", "ul",
];

/// Escape text for use in HTML content or a double-quoted attribute
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

fn is_raw_text(name: &str) -> bool {
    RAW_TEXT_ELEMENTS.contains(&name)
}

/// A single attribute as it appeared in the source. `value` keeps its
/// entity encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

/// A parsed start tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag {
    pub name: String,
    pub attrs: Vec<Attribute>,
    pub self_closing: bool,
}

impl StartTag {
    /// Parse `<name attr="v" ...>`; `None` if `raw` is not a start tag
    pub fn parse(raw: &str) -> Option<StartTag> {
        let inner = raw.strip_prefix('<')?.strip_suffix('>')?;
        let bytes = inner.as_bytes();
        let mut i = 0;

        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'/' {
            i += 1;
        }
        let name = inner[..i].to_ascii_lowercase();
        if name.is_empty() || !name.as_bytes()[0].is_ascii_alphabetic() {
            return None;
        }

        let mut attrs = Vec::new();
        let mut self_closing = false;

        loop {
            while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
                if bytes[i] == b'/' {
                    self_closing = true;
                }
                i += 1;
            }
            if i >= bytes.len() {
                break;
            }
            self_closing = false;

            let start = i;
            while i < bytes.len()
                && !bytes[i].is_ascii_whitespace()
                && bytes[i] != b'='
                && bytes[i] != b'/'
            {
                i += 1;
            }
            let attr_name = inner[start..i].to_ascii_lowercase();

            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }

            let value = if j < bytes.len() && bytes[j] == b'=' {
                j += 1;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == b'"' || bytes[j] == b'\'') {
                    let quote = bytes[j];
                    let vstart = j + 1;
                    let mut k = vstart;
                    while k < bytes.len() && bytes[k] != quote {
                        k += 1;
                    }
                    let v = inner[vstart..k].to_string();
                    i = (k + 1).min(bytes.len());
                    Some(v)
                } else {
                    let vstart = j;
                    let mut k = vstart;
                    while k < bytes.len() && !bytes[k].is_ascii_whitespace() {
                        k += 1;
                    }
                    i = k;
                    Some(inner[vstart..k].to_string())
                }
            } else {
                None
            };

            if !attr_name.is_empty() {
                attrs.push(Attribute {
                    name: attr_name,
                    value,
                });
            }
        }

        Some(StartTag {
            name,
            attrs,
            self_closing,
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }

    /// Set an attribute to an already-escaped value, adding it if absent
    pub fn set_attr_escaped(&mut self, name: &str, escaped: String) {
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(a) => a.value = Some(escaped),
            None => self.attrs.push(Attribute {
                name: name.to_string(),
                value: Some(escaped),
            }),
        }
    }

    /// Serialize back to markup with double-quoted attribute values
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(16 + self.attrs.len() * 24);
        out.push('<');
        out.push_str(&self.name);
        for attr in &self.attrs {
            out.push(' ');
            out.push_str(&attr.name);
            if let Some(ref v) = attr.value {
                out.push_str("=\"");
                out.push_str(&v.replace('"', "&quot;"));
                out.push('"');
            }
        }
        if self.self_closing {
            out.push_str(" /");
        }
        out.push('>');
        out
    }
}

/// Simple selector: `tag`, `tag.class` or `tag[attr="value"]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    tag: String,
    class: Option<String>,
    attr: Option<(String, String)>,
}

impl Selector {
    pub fn tag(tag: &str) -> Self {
        Selector {
            tag: tag.to_ascii_lowercase(),
            class: None,
            attr: None,
        }
    }

    pub fn attr_eq(tag: &str, attr: &str, value: &str) -> Self {
        Selector {
            tag: tag.to_ascii_lowercase(),
            class: None,
            attr: Some((attr.to_ascii_lowercase(), value.to_string())),
        }
    }

    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let input = input.trim();
        let tag_end = input
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(input.len());
        let tag = &input[..tag_end];
        if tag.is_empty() {
            return Err(format!("selector '{}' must start with a tag name", input));
        }
        let rest = &input[tag_end..];

        if rest.is_empty() {
            return Ok(Selector::tag(tag));
        }

        if let Some(class) = rest.strip_prefix('.') {
            let valid = !class.is_empty()
                && class
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(format!("selector '{}' has an invalid class", input));
            }
            return Ok(Selector {
                tag: tag.to_ascii_lowercase(),
                class: Some(class.to_string()),
                attr: None,
            });
        }

        if let Some(body) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let (name, value) = body
                .split_once('=')
                .ok_or_else(|| format!("selector '{}' needs attr=\"value\"", input))?;
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .ok_or_else(|| format!("selector '{}' value must be quoted", input))?;
            if name.trim().is_empty() {
                return Err(format!("selector '{}' has an empty attribute name", input));
            }
            return Ok(Selector::attr_eq(tag, name.trim(), unquoted));
        }

        Err(format!("unsupported selector '{}'", input))
    }

    pub fn matches(&self, tag: &StartTag) -> bool {
        if tag.name != self.tag {
            return false;
        }
        if let Some(ref class) = self.class {
            let has_class = tag
                .attr("class")
                .map(|c| c.split_ascii_whitespace().any(|x| x == class))
                .unwrap_or(false);
            if !has_class {
                return false;
            }
        }
        if let Some((ref name, ref value)) = self.attr {
            if tag.attr(name) != Some(value.as_str()) {
                return false;
            }
        }
        true
    }
}

/// What to do with a matched element
#[derive(Debug, Clone)]
enum Action {
    /// Replace the element's content with escaped text
    ReplaceContent(String),
    /// Overwrite an attribute in place
    SetAttribute { attr: &'static str, value: String },
    /// The page description; remembered so it is not injected twice
    Description(String),
}

#[derive(Debug, Clone)]
struct Rule {
    selector: Selector,
    action: Action,
}

fn rules_for(meta: &PageMetadata, selectors: &SelectorConfig) -> Result<Vec<Rule>> {
    let set = |tag: &str, key: &str, value: &str, attr: &'static str, content: &str| Rule {
        selector: Selector::attr_eq(tag, key, value),
        action: Action::SetAttribute {
            attr,
            value: content.to_string(),
        },
    };

    let mut rules = vec![
        Rule {
            selector: Selector::tag("title"),
            action: Action::ReplaceContent(meta.title.clone()),
        },
        set("meta", "property", "og:type", "content", "website"),
        set("meta", "property", "og:title", "content", &meta.title),
        set("meta", "property", "og:description", "content", &meta.description),
        set("meta", "property", "og:url", "content", &meta.canonical_url),
        set("meta", "property", "og:image", "content", &meta.image_url),
        set("meta", "name", "twitter:card", "content", "summary_large_image"),
        set("meta", "name", "twitter:title", "content", &meta.title),
        set("meta", "name", "twitter:description", "content", &meta.description),
        set("meta", "name", "twitter:image", "content", &meta.image_url),
        set("link", "rel", "canonical", "href", &meta.canonical_url),
        Rule {
            selector: Selector::attr_eq("meta", "name", "description"),
            action: Action::Description(meta.description.clone()),
        },
    ];

    if let Some(ref heading) = meta.hero_heading {
        rules.push(Rule {
            selector: Selector::parse(&selectors.hero_heading).map_err(SeoError::ConfigError)?,
            action: Action::ReplaceContent(heading.clone()),
        });
    }
    if let Some(ref copy) = meta.hero_copy {
        rules.push(Rule {
            selector: Selector::parse(&selectors.hero_copy).map_err(SeoError::ConfigError)?,
            action: Action::ReplaceContent(copy.clone()),
        });
    }

    Ok(rules)
}

/// Markup appended to `<head>`
fn head_block(meta: &PageMetadata) -> String {
    let title = escape_html(&meta.title);
    let description = escape_html(&meta.description);
    let canonical = escape_html(&meta.canonical_url);
    let image = escape_html(&meta.image_url);

    let mut out = String::with_capacity(1024);
    out.push_str(&format!("<link rel=\"canonical\" href=\"{}\">\n", canonical));
    out.push_str("<meta property=\"og:type\" content=\"website\">\n");
    out.push_str(&format!("<meta property=\"og:title\" content=\"{}\">\n", title));
    out.push_str(&format!(
        "<meta property=\"og:description\" content=\"{}\">\n",
        description
    ));
    out.push_str(&format!("<meta property=\"og:url\" content=\"{}\">\n", canonical));
    out.push_str(&format!("<meta property=\"og:image\" content=\"{}\">\n", image));
    out.push_str("<meta name=\"twitter:card\" content=\"summary_large_image\">\n");
    out.push_str(&format!("<meta name=\"twitter:title\" content=\"{}\">\n", title));
    out.push_str(&format!(
        "<meta name=\"twitter:description\" content=\"{}\">\n",
        description
    ));
    out.push_str(&format!("<meta name=\"twitter:image\" content=\"{}\">\n", image));
    out.push_str(&format!(
        "<script type=\"application/ld+json\" id=\"ld-collection\">{}</script>\n",
        meta.json_ld_script_body()
    ));
    out
}

/// Counters describing what a rewrite did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elements_rewritten: usize,
    pub element_errors: usize,
    pub head_injected: bool,
    pub description_injected: bool,
    /// Set when the rewriter gave up and switched to passthrough
    pub aborted: Option<String>,
    /// Whether any emitted byte differs from the input
    pub modified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Data,
    Comment,
    RawText(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Rewriting,
    Passthrough,
}

/// Content of a replaced element being dropped
#[derive(Debug, Clone)]
struct Suppress {
    tag: String,
    /// Elements opened inside the replaced element and not yet closed
    inner: Vec<String>,
}

enum Step {
    Advance(usize),
    NeedMore,
}

enum EndTagSearch {
    Found(usize),
    Partial(usize),
    NotFound,
}

/// Find the `>` closing a tag that starts at `rest[0] == '<'`, skipping
/// quoted attribute values.
fn find_tag_end(rest: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut last_significant = b'<';
    for (i, &b) in rest.iter().enumerate().skip(1) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                    last_significant = b;
                }
            }
            None => {
                if (b == b'"' || b == b'\'') && last_significant == b'=' {
                    quote = Some(b);
                } else if b == b'>' {
                    return Some(i);
                }
                if !b.is_ascii_whitespace() {
                    last_significant = b;
                }
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locate `</name` followed by whitespace, `/` or `>`
fn find_raw_text_end(rest: &[u8], name: &str) -> EndTagSearch {
    let name = name.as_bytes();
    let mut from = 0;
    while let Some(off) = rest[from..].iter().position(|&b| b == b'<') {
        let i = from + off;
        let candidate = &rest[i..];
        let needed = 2 + name.len() + 1;
        if candidate.len() < needed {
            let prefix_ok = candidate.len() < 2 || candidate[1] == b'/';
            let name_part = &candidate[2.min(candidate.len())..];
            let name_ok = name_part
                .iter()
                .zip(name.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b));
            if prefix_ok && name_ok {
                return EndTagSearch::Partial(i);
            }
            return EndTagSearch::NotFound;
        }
        if candidate[1] == b'/'
            && candidate[2..2 + name.len()].eq_ignore_ascii_case(name)
            && matches!(candidate[2 + name.len()], b'>' | b'/' | b' ' | b'\t' | b'\n' | b'\r' | b'\x0c')
        {
            return EndTagSearch::Found(i);
        }
        from = i + 1;
    }
    EndTagSearch::NotFound
}

fn tag_name_of(raw: &[u8], skip: usize) -> String {
    raw.iter()
        .skip(skip)
        .take_while(|b| !b.is_ascii_whitespace() && **b != b'>' && **b != b'/')
        .map(|b| b.to_ascii_lowercase() as char)
        .collect()
}

/// Incremental rewriter for one HTML response body
pub struct HtmlRewriter {
    rules: Vec<Rule>,
    description_tag: String,
    head_block: String,
    buf: Vec<u8>,
    state: ScanState,
    mode: Mode,
    suppress: Option<Suppress>,
    /// Elements open around the current position, outermost first
    open: Vec<String>,
    head_open: bool,
    description_seen: bool,
    max_pending: usize,
    stats: RewriteStats,
}

impl HtmlRewriter {
    /// Build a rewriter for `meta`
    ///
    /// Fails only when a configured selector is malformed.
    pub fn new(meta: &PageMetadata, selectors: &SelectorConfig, max_pending: usize) -> Result<Self> {
        Ok(HtmlRewriter {
            rules: rules_for(meta, selectors)?,
            description_tag: format!(
                "<meta name=\"description\" content=\"{}\">\n",
                escape_html(&meta.description)
            ),
            head_block: head_block(meta),
            buf: Vec::new(),
            state: ScanState::Data,
            mode: Mode::Rewriting,
            suppress: None,
            open: Vec::new(),
            head_open: false,
            description_seen: false,
            max_pending,
            stats: RewriteStats::default(),
        })
    }

    pub fn stats(&self) -> &RewriteStats {
        &self.stats
    }

    pub fn is_passthrough(&self) -> bool {
        self.mode == Mode::Passthrough
    }

    /// Feed one chunk and return whatever output is ready
    pub fn write(&mut self, chunk: &[u8]) -> Bytes {
        self.stats.bytes_in += chunk.len() as u64;
        let mut out = Vec::with_capacity(chunk.len() + 64);

        if self.mode == Mode::Passthrough {
            out.extend_from_slice(chunk);
        } else {
            self.buf.extend_from_slice(chunk);
            self.process(&mut out, false);
            if self.buf.len() > self.max_pending {
                let reason = format!(
                    "token exceeds {} pending bytes",
                    self.max_pending
                );
                self.abort(&mut out, reason);
            }
        }

        self.stats.bytes_out += out.len() as u64;
        Bytes::from(out)
    }

    /// Signal end of input and return the remaining output
    pub fn end(&mut self) -> Bytes {
        let mut out = Vec::new();
        if self.mode == Mode::Rewriting {
            self.process(&mut out, true);
        }
        if !self.buf.is_empty() {
            out.extend_from_slice(&self.buf);
            self.buf.clear();
        }
        self.stats.bytes_out += out.len() as u64;
        Bytes::from(out)
    }

    /// Rewrite a complete document in one call
    pub fn rewrite_all(&mut self, document: &[u8]) -> Bytes {
        let mut out = self.write(document).to_vec();
        out.extend_from_slice(&self.end());
        Bytes::from(out)
    }

    fn abort(&mut self, out: &mut Vec<u8>, reason: String) {
        warn!("HTML rewrite aborted, passing remainder through: {}", reason);
        out.extend_from_slice(&self.buf);
        self.buf.clear();
        self.mode = Mode::Passthrough;
        self.stats.aborted = Some(reason);
    }

    fn process(&mut self, out: &mut Vec<u8>, eof: bool) {
        let mut pos = 0;
        while pos < self.buf.len() {
            let step = match self.state.clone() {
                ScanState::Data => self.step_data(pos, out, eof),
                ScanState::Comment => self.step_comment(pos, out, eof),
                ScanState::RawText(name) => self.step_raw_text(pos, &name, out, eof),
            };
            match step {
                Step::Advance(next) => pos = next,
                Step::NeedMore => break,
            }
        }
        self.buf.drain(..pos);
    }

    fn emit_source(&mut self, out: &mut Vec<u8>, from: usize, to: usize) {
        if self.suppress.is_none() {
            out.extend_from_slice(&self.buf[from..to]);
        } else if to > from {
            self.stats.modified = true;
        }
    }

    fn step_data(&mut self, pos: usize, out: &mut Vec<u8>, eof: bool) -> Step {
        let len = self.buf.len();
        let lt = match self.buf[pos..].iter().position(|&b| b == b'<') {
            Some(0) => pos,
            Some(off) => {
                self.emit_source(out, pos, pos + off);
                return Step::Advance(pos + off);
            }
            None => {
                self.emit_source(out, pos, len);
                return Step::Advance(len);
            }
        };

        let rest_len = len - lt;
        if rest_len < 2 {
            return self.incomplete(lt, out, eof);
        }

        match self.buf[lt + 1] {
            b'!' => {
                if self.buf[lt..].starts_with(b"<!--") {
                    self.emit_source(out, lt, lt + 4);
                    self.state = ScanState::Comment;
                    return Step::Advance(lt + 4);
                }
                if rest_len < 4 && b"<!--".starts_with(&self.buf[lt..]) {
                    return self.incomplete(lt, out, eof);
                }
                self.step_declaration(lt, out, eof)
            }
            b'?' => self.step_declaration(lt, out, eof),
            b'/' => match self.buf[lt..].iter().position(|&b| b == b'>') {
                Some(end) => {
                    let raw = self.buf[lt..=lt + end].to_vec();
                    self.handle_end_tag(&raw, out);
                    Step::Advance(lt + end + 1)
                }
                None => self.incomplete(lt, out, eof),
            },
            c if c.is_ascii_alphabetic() => match find_tag_end(&self.buf[lt..]) {
                Some(end) => {
                    let raw = self.buf[lt..=lt + end].to_vec();
                    self.handle_start_tag(raw, out);
                    Step::Advance(lt + end + 1)
                }
                None => self.incomplete(lt, out, eof),
            },
            _ => {
                self.emit_source(out, lt, lt + 1);
                Step::Advance(lt + 1)
            }
        }
    }

    fn step_declaration(&mut self, lt: usize, out: &mut Vec<u8>, eof: bool) -> Step {
        match self.buf[lt..].iter().position(|&b| b == b'>') {
            Some(end) => {
                self.emit_source(out, lt, lt + end + 1);
                Step::Advance(lt + end + 1)
            }
            None => self.incomplete(lt, out, eof),
        }
    }

    /// A token starting at `at` is cut off by the end of the buffer
    fn incomplete(&mut self, at: usize, out: &mut Vec<u8>, eof: bool) -> Step {
        if eof {
            let len = self.buf.len();
            self.emit_source(out, at, len);
            Step::Advance(len)
        } else {
            Step::NeedMore
        }
    }

    fn step_comment(&mut self, pos: usize, out: &mut Vec<u8>, eof: bool) -> Step {
        let len = self.buf.len();
        match find_subslice(&self.buf[pos..], b"-->") {
            Some(off) => {
                self.emit_source(out, pos, pos + off + 3);
                self.state = ScanState::Data;
                Step::Advance(pos + off + 3)
            }
            None if eof => {
                self.emit_source(out, pos, len);
                Step::Advance(len)
            }
            None => {
                let safe = len.saturating_sub(2).max(pos);
                if safe == pos {
                    return Step::NeedMore;
                }
                self.emit_source(out, pos, safe);
                Step::Advance(safe)
            }
        }
    }

    fn step_raw_text(&mut self, pos: usize, name: &str, out: &mut Vec<u8>, eof: bool) -> Step {
        let len = self.buf.len();
        match find_raw_text_end(&self.buf[pos..], name) {
            EndTagSearch::Found(off) => {
                self.emit_source(out, pos, pos + off);
                self.state = ScanState::Data;
                Step::Advance(pos + off)
            }
            EndTagSearch::Partial(off) if !eof => {
                if off == 0 {
                    return Step::NeedMore;
                }
                self.emit_source(out, pos, pos + off);
                Step::Advance(pos + off)
            }
            _ => {
                self.emit_source(out, pos, len);
                Step::Advance(len)
            }
        }
    }

    fn handle_start_tag(&mut self, raw: Vec<u8>, out: &mut Vec<u8>) {
        let name = tag_name_of(&raw, 1);
        let lossy = String::from_utf8_lossy(&raw).into_owned();
        let tag = match StartTag::parse(&lossy) {
            Some(t) => t,
            None => {
                if self.suppress.is_none() {
                    out.extend_from_slice(&raw);
                }
                return;
            }
        };
        let opens_raw_text = is_raw_text(&name) && !tag.self_closing;

        if let Some(ref mut s) = self.suppress {
            if s.tag == "p" && s.inner.is_empty() && P_CLOSERS.contains(&name.as_str()) {
                debug!("<p> implicitly closed by <{}>", name);
                self.suppress = None;
            } else {
                if !tag.self_closing && !is_void(&name) && s.inner.len() < MAX_OPEN_ELEMENTS {
                    s.inner.push(name.clone());
                }
                if opens_raw_text {
                    self.state = ScanState::RawText(name);
                }
                self.stats.modified = true;
                return;
            }
        }

        if name == "head" {
            self.head_open = true;
        } else if name == "body" && self.head_open {
            self.inject(out);
            self.head_open = false;
        }

        let rule = self.rules.iter().find(|r| r.selector.matches(&tag)).cloned();
        match rule {
            Some(rule) => self.apply(rule, &raw, &tag, out),
            None => out.extend_from_slice(&raw),
        }

        // The replaced element itself is not tracked; it closes with its suppression
        if self.suppress.is_none()
            && !tag.self_closing
            && !is_void(&name)
            && self.open.len() < MAX_OPEN_ELEMENTS
        {
            self.open.push(name.clone());
        }

        if opens_raw_text {
            self.state = ScanState::RawText(name);
        }
    }

    fn apply(&mut self, rule: Rule, raw: &[u8], tag: &StartTag, out: &mut Vec<u8>) {
        let result = match rule.action {
            Action::ReplaceContent(text) => {
                out.extend_from_slice(raw);
                out.extend_from_slice(escape_html(&text).as_bytes());
                if !tag.self_closing && !is_void(&tag.name) {
                    self.suppress = Some(Suppress {
                        tag: tag.name.clone(),
                        inner: Vec::new(),
                    });
                }
                Ok(())
            }
            Action::SetAttribute { attr, value } => Self::set_attribute(raw, attr, &value, out),
            Action::Description(value) => {
                self.description_seen = true;
                Self::set_attribute(raw, "content", &value, out)
            }
        };

        match result {
            Ok(()) => {
                self.stats.elements_rewritten += 1;
                self.stats.modified = true;
                debug!("Rewrote <{}>", tag.name);
            }
            Err(e) => {
                self.stats.element_errors += 1;
                warn!("Leaving <{}> unchanged: {}", tag.name, e);
                out.extend_from_slice(raw);
            }
        }
    }

    fn set_attribute(raw: &[u8], attr: &str, value: &str, out: &mut Vec<u8>) -> Result<()> {
        let source = std::str::from_utf8(raw)
            .map_err(|e| SeoError::RewriteError(format!("tag is not valid UTF-8: {}", e)))?;
        let mut tag = StartTag::parse(source)
            .ok_or_else(|| SeoError::RewriteError("unparseable start tag".to_string()))?;
        tag.set_attr_escaped(attr, escape_html(value));
        out.extend_from_slice(tag.serialize().as_bytes());
        Ok(())
    }

    fn handle_end_tag(&mut self, raw: &[u8], out: &mut Vec<u8>) {
        let name = tag_name_of(raw, 2);

        if let Some(ref mut s) = self.suppress {
            if let Some(i) = s.inner.iter().rposition(|n| *n == name) {
                s.inner.truncate(i);
                self.stats.modified = true;
                return;
            }
            if s.tag == name {
                self.suppress = None;
                out.extend_from_slice(raw);
                return;
            }
            let closes_ancestor =
                name == "body" || name == "html" || self.open.iter().any(|n| *n == name);
            if !closes_ancestor {
                self.stats.modified = true;
                return;
            }
            // An ancestor closing ends the replaced element implicitly
            debug!("Replaced <{}> left open at </{}>", s.tag, name);
            self.suppress = None;
        }

        if let Some(i) = self.open.iter().rposition(|n| *n == name) {
            self.open.truncate(i);
        }

        if name == "head" && self.head_open {
            self.inject(out);
            self.head_open = false;
        }
        out.extend_from_slice(raw);
    }

    fn inject(&mut self, out: &mut Vec<u8>) {
        if self.stats.head_injected {
            return;
        }
        if !self.description_seen {
            out.extend_from_slice(self.description_tag.as_bytes());
            self.stats.description_injected = true;
        }
        out.extend_from_slice(self.head_block.as_bytes());
        self.stats.head_injected = true;
        self.stats.modified = true;
        debug!(
            "Injected head block (description injected: {})",
            self.stats.description_injected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;
    use crate::metadata::MetadataSynthesizer;
    use crate::slug::SlugResolver;

    fn meta(slug: &str, count: Option<usize>) -> PageMetadata {
        let view = SlugResolver::default().resolve(slug);
        MetadataSynthesizer::new("Spacecadet", "/resources/top-investor-lists", ImageConfig::default())
            .synthesize(&view, count, "https://lists.example.com", "/resources/top-investor-lists/x")
    }

    fn rewriter(m: &PageMetadata) -> HtmlRewriter {
        HtmlRewriter::new(m, &SelectorConfig::default(), 64 * 1024).unwrap()
    }

    fn rewrite(doc: &str, m: &PageMetadata) -> (String, RewriteStats) {
        let mut r = rewriter(m);
        let out = r.rewrite_all(doc.as_bytes());
        (String::from_utf8(out.to_vec()).unwrap(), r.stats().clone())
    }

    const DOC: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Old</title></head>\
<body><h1 class=\"hero-headline big\">Loading <em>...</em></h1><p class=\"hero-copy\">Default copy</p></body></html>";

    #[test]
    fn test_injects_description_once_when_missing() {
        let m = meta("pre-seed", Some(12));
        let (out, stats) = rewrite(DOC, &m);
        assert_eq!(out.matches("<meta name=\"description\"").count(), 1);
        assert_eq!(out.matches("rel=\"canonical\"").count(), 1);
        assert_eq!(out.matches("property=\"og:title\"").count(), 1);
        assert_eq!(out.matches("name=\"twitter:image\"").count(), 1);
        assert_eq!(out.matches("application/ld+json").count(), 1);
        assert!(stats.description_injected);
        assert!(stats.head_injected);
        // Injected inside the head
        let head_end = out.find("</head>").unwrap();
        assert!(out.find("ld-collection").unwrap() < head_end);
    }

    #[test]
    fn test_replaces_title_and_hero() {
        let m = meta("pre-seed", Some(12));
        let (out, _) = rewrite(DOC, &m);
        assert!(out.contains("<title>Top 12 Pre-Seed Investors - Spacecadet</title>"));
        assert!(out.contains(
            "<h1 class=\"hero-headline big\">Top 12 Pre-Seed Investors</h1>"
        ));
        assert!(out.contains("Here&#39;s a curated list of Pre-Seed investors"));
        assert!(!out.contains("Loading"));
        assert!(!out.contains("Default copy"));
        assert!(out.ends_with("</body></html>"));
    }

    #[test]
    fn test_existing_description_overwritten_not_injected() {
        let doc = "<html><head><meta name=\"description\" content=\"old\"></head><body></body></html>";
        let m = meta("bio", None);
        let (out, stats) = rewrite(doc, &m);
        assert_eq!(out.matches("name=\"description\"").count(), 1);
        assert!(out.contains("content=\"Curated list of Bio investors who lead rounds. Export to Google Sheets.\""));
        assert!(!stats.description_injected);
    }

    #[test]
    fn test_existing_social_tags_overwritten() {
        let doc = "<head><meta property='og:title' content='x'><link rel=canonical href=/old></head>";
        let m = meta("ai", None);
        let (out, _) = rewrite(doc, &m);
        assert!(out.contains("<meta property=\"og:title\" content=\"Top AI Investors - Spacecadet\">"));
        assert!(out.contains(
            "<link rel=\"canonical\" href=\"https://lists.example.com/resources/top-investor-lists/ai\">"
        ));
        assert!(!out.contains("/old"));
    }

    #[test]
    fn test_chunking_is_transparent() {
        let m = meta("pre-seed", Some(3));
        let (whole, _) = rewrite(DOC, &m);

        let mut r = rewriter(&m);
        let mut out = Vec::new();
        for b in DOC.as_bytes() {
            out.extend_from_slice(&r.write(std::slice::from_ref(b)));
        }
        out.extend_from_slice(&r.end());
        assert_eq!(String::from_utf8(out).unwrap(), whole);
    }

    #[test]
    fn test_script_content_not_matched() {
        let doc = "<head><script>var s = \"<title>x</title>\";</script><title>Old</title></head>";
        let m = meta("ai", None);
        let (out, _) = rewrite(doc, &m);
        assert!(out.contains("<script>var s = \"<title>x</title>\";</script>"));
        assert!(out.contains("<title>Top AI Investors - Spacecadet</title>"));
    }

    #[test]
    fn test_comments_pass_through() {
        let doc = "<head><!-- <title>no</title> --><title>Old</title></head>";
        let m = meta("ai", None);
        let (out, _) = rewrite(doc, &m);
        assert!(out.contains("<!-- <title>no</title> -->"));
        assert_eq!(out.matches("Top AI Investors - Spacecadet</title>").count(), 1);
    }

    #[test]
    fn test_injects_before_body_without_head_end() {
        let doc = "<html><head><title>Old</title><body><p>x</p></body></html>";
        let m = meta("ai", None);
        let (out, stats) = rewrite(doc, &m);
        assert!(stats.head_injected);
        assert!(out.find("ld-collection").unwrap() < out.find("<body>").unwrap());
    }

    #[test]
    fn test_unclosed_hero_paragraph_closed_by_block() {
        let doc = "<body><p class=\"hero-copy\">Default<div>kept</div></body>";
        let m = meta("ai", None);
        let (out, _) = rewrite(doc, &m);
        assert!(out.contains("<div>kept</div>"));
        assert!(!out.contains("Default"));
    }

    #[test]
    fn test_unclosed_hero_paragraph_closed_by_parent() {
        let doc = "<body><div class=\"hero\"><p class=\"hero-copy\">Default</div>\
                   <a href=\"/x\">KEEP-LINK</a><span>KEEP-SPAN</span></body>";
        let m = meta("ai", None);
        let (out, stats) = rewrite(doc, &m);
        assert!(!out.contains("Default"));
        assert!(out.contains("who actually lead rounds.</div>"));
        assert!(out.contains("<a href=\"/x\">KEEP-LINK</a>"));
        assert!(out.contains("<span>KEEP-SPAN</span></body>"));
        assert_eq!(stats.element_errors, 0);
    }

    #[test]
    fn test_unclosed_hero_heading_closed_by_section() {
        let doc = "<body><section><h1 class=\"hero-headline\">Old <em>x</em></section><p>after</p></body>";
        let m = meta("ai", Some(4));
        let (out, _) = rewrite(doc, &m);
        assert!(out.contains("<h1 class=\"hero-headline\">Top 4 AI Investors</section>"));
        assert!(out.contains("<p>after</p></body>"));
        assert!(!out.contains("Old"));
    }

    #[test]
    fn test_stray_end_tag_inside_hero_is_dropped() {
        let doc = "<body><div><h1 class=\"hero-headline\">Old</span> more</h1><p>kept</p></div></body>";
        let m = meta("ai", None);
        let (out, _) = rewrite(doc, &m);
        assert!(out.contains("<h1 class=\"hero-headline\">Top AI Investors</h1><p>kept</p></div>"));
    }

    #[test]
    fn test_all_categories_leaves_hero() {
        let m = meta("", None);
        let (out, _) = rewrite(DOC, &m);
        assert!(out.contains("Default copy"));
        assert!(out.contains("<title>Top Investors - Spacecadet</title>"));
    }

    #[test]
    fn test_invalid_utf8_element_is_left_unchanged() {
        let mut doc = b"<head><meta property=\"og:title\" content=\"".to_vec();
        doc.extend_from_slice(&[0xff, 0xfe]);
        doc.extend_from_slice(b"\"><title>Old</title></head>");
        let m = meta("ai", None);
        let mut r = rewriter(&m);
        let out = r.rewrite_all(&doc);
        assert_eq!(r.stats().element_errors, 1);
        // The bad element is emitted byte for byte; the rest is still rewritten
        assert!(out.windows(2).any(|w| w == [0xff, 0xfe]));
        assert!(String::from_utf8_lossy(&out).contains("Top AI Investors - Spacecadet</title>"));
    }

    #[test]
    fn test_oversized_token_aborts_to_passthrough() {
        let m = meta("ai", None);
        let mut r = HtmlRewriter::new(&m, &SelectorConfig::default(), 1024).unwrap();
        let mut doc = b"<div data-x=\"".to_vec();
        doc.extend(std::iter::repeat(b'a').take(4096));
        doc.extend_from_slice(b"\"><title>Old</title>");

        let mut out = Vec::new();
        for chunk in doc.chunks(512) {
            out.extend_from_slice(&r.write(chunk));
        }
        out.extend_from_slice(&r.end());
        assert!(r.is_passthrough());
        assert!(r.stats().aborted.is_some());
        assert_eq!(out, doc);
    }

    #[test]
    fn test_text_with_angle_bracket() {
        let doc = "<body>1 < 2 and 3 <4</body>";
        let m = meta("ai", None);
        let (out, _) = rewrite(doc, &m);
        assert_eq!(out, doc);
    }

    #[test]
    fn test_start_tag_parse() {
        let tag = StartTag::parse("<META Name=\"twitter:card\" content='a \"b\"' data-x=y disabled/>").unwrap();
        assert_eq!(tag.name, "meta");
        assert_eq!(tag.attr("name"), Some("twitter:card"));
        assert_eq!(tag.attr("content"), Some("a \"b\""));
        assert_eq!(tag.attr("data-x"), Some("y"));
        assert!(tag.attrs.iter().any(|a| a.name == "disabled" && a.value.is_none()));
        assert!(tag.self_closing);
        assert_eq!(
            tag.serialize(),
            "<meta name=\"twitter:card\" content=\"a &quot;b&quot;\" data-x=\"y\" disabled />"
        );
    }

    #[test]
    fn test_selector_parse_and_match() {
        let s = Selector::parse("h1.hero-headline").unwrap();
        assert!(s.matches(&StartTag::parse("<h1 class=\"a hero-headline\">").unwrap()));
        assert!(!s.matches(&StartTag::parse("<h2 class=\"hero-headline\">").unwrap()));

        let s = Selector::parse("meta[property=\"og:url\"]").unwrap();
        assert!(s.matches(&StartTag::parse("<meta property=\"og:url\">").unwrap()));

        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("p.").is_err());
        assert!(Selector::parse("p..").is_err());
        assert!(Selector::parse("div > p").is_err());
        assert!(Selector::parse("meta[name=x]").is_err());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a&b<c>\"d'"), "a&amp;b&lt;c&gt;&quot;d&#39;");
    }
}
