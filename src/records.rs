//! Record-listing data endpoint
//!
//! `GET {data_endpoint_path}?base&table&view` returns every record of a view
//! as `{"records": [...]}`, shaped for the list page. Responses carry a
//! content-derived ETag plus browser and CDN cache directives, and a
//! matching `If-None-Match` is answered with `304 Not Modified`.

use crate::cache_control::{compute_validator, is_not_modified, CachePolicy};
use crate::config::SeoConfig;
use crate::error::{Result, SeoError};
use crate::metrics::SeoMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, IF_NONE_MATCH};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Characters `encodeURIComponent` leaves alone
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const PAGE_SIZE: &str = "100";

/// Upper bound on provider pages fetched for one request
const MAX_PAGES: usize = 1000;

const CORS_HEADERS: [(&str, &str); 3] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, OPTIONS"),
    ("access-control-allow-headers", "Authorization, Content-Type"),
];

/// Which records to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub base: String,
    pub table: String,
    pub view: String,
}

impl RecordQuery {
    /// Parse `base`, `table` and `view` from a query string. Empty values
    /// count as missing.
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let mut base = None;
        let mut table = None;
        let mut view = None;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "base" => base = Some(value.into_owned()),
                "table" => table = Some(value.into_owned()),
                "view" => view = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(RecordQuery {
            base: base?,
            table: table?,
            view: view?,
        })
    }
}

/// One investor as served to the list page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorRecord {
    pub contact_name: String,
    pub fund: String,
    pub link: String,
    pub check_size: String,
    pub focus: String,
    pub pitch_advice: String,
    pub image_url: String,
}

fn field_text(fields: &Map<String, Value>, name: &str) -> String {
    match fields.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => String::new(),
    }
}

fn image_url(fields: &Map<String, Value>) -> String {
    let image = match fields.get("Image").and_then(|v| v.as_array()).and_then(|a| a.first()) {
        Some(image) => image,
        None => return String::new(),
    };
    [
        image.get("url"),
        image.pointer("/thumbnails/large/url"),
        image.pointer("/thumbnails/small/url"),
    ]
    .into_iter()
    .flatten()
    .filter_map(|v| v.as_str())
    .find(|s| !s.is_empty())
    .unwrap_or_default()
    .to_string()
}

impl InvestorRecord {
    /// Shape a raw provider record (`{"id", "fields": {...}}`)
    pub fn from_provider(record: &Value) -> Self {
        let empty = Map::new();
        let fields = record
            .get("fields")
            .and_then(|f| f.as_object())
            .unwrap_or(&empty);

        InvestorRecord {
            contact_name: field_text(fields, "Contact Name"),
            fund: field_text(fields, "Fund"),
            link: field_text(fields, "Link"),
            check_size: field_text(fields, "Check Size"),
            focus: field_text(fields, "Focus"),
            pitch_advice: field_text(fields, "Pitch Advice"),
            image_url: image_url(fields),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordsBody {
    pub records: Vec<InvestorRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Provider of raw records
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch every record of a view, following pagination to the end
    async fn fetch_all(&self, query: &RecordQuery) -> Result<Vec<Value>>;
}

#[derive(Debug, Deserialize)]
struct ProviderPage {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    offset: Option<String>,
}

/// Airtable-style REST source: `{api}/{base}/{table}?view&pageSize&offset`
pub struct AirtableSource {
    client: Client,
    api_root: String,
    token: Option<String>,
}

impl AirtableSource {
    pub fn new(api_root: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| SeoError::HttpError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(AirtableSource {
            client,
            api_root: api_root.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &SeoConfig) -> Result<Self> {
        Self::new(
            config.origin_server.airtable_api.clone(),
            config.origin_server.airtable_token.clone(),
        )
    }

    fn page_url(&self, query: &RecordQuery, offset: Option<&str>) -> Result<url::Url> {
        let raw = format!(
            "{}/{}/{}",
            self.api_root,
            utf8_percent_encode(&query.base, COMPONENT),
            utf8_percent_encode(&query.table, COMPONENT)
        );
        let mut url = url::Url::parse(&raw)
            .map_err(|e| SeoError::ConfigError(format!("Invalid provider URL '{}': {}", raw, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("view", &query.view);
            pairs.append_pair("pageSize", PAGE_SIZE);
            if let Some(offset) = offset {
                pairs.append_pair("offset", offset);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RecordSource for AirtableSource {
    async fn fetch_all(&self, query: &RecordQuery) -> Result<Vec<Value>> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SeoError::ConfigError("AIRTABLE_TOKEN is not configured".to_string()))?;

        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        for page in 0..MAX_PAGES {
            let url = self.page_url(query, offset.as_deref())?;
            debug!("Fetching provider page {}: {}", page, url);

            let response = self.client.get(url.as_str()).bearer_auth(token).send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(SeoError::upstream(
                    status.as_u16(),
                    format!("Airtable {}: {}", status.as_u16(), text),
                ));
            }

            let body = response.bytes().await?;
            let page: ProviderPage = serde_json::from_slice(&body)?;
            records.extend(page.records);

            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => return Ok(records),
            }
        }

        Err(SeoError::upstream(
            502,
            format!("Provider returned more than {} pages", MAX_PAGES),
        ))
    }
}

/// Handler for the data endpoint
pub struct RecordsHandler {
    source: Arc<dyn RecordSource>,
    policy: CachePolicy,
    metrics: Option<Arc<SeoMetrics>>,
}

impl RecordsHandler {
    pub fn new(source: Arc<dyn RecordSource>, policy: CachePolicy) -> Self {
        Self {
            source,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SeoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle one data endpoint request
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>> {
        let response = self.respond(&req).await?;
        if let Some(ref metrics) = self.metrics {
            metrics.record_records_response(response.status().as_u16());
        }
        Ok(response)
    }

    async fn respond<B>(&self, req: &Request<B>) -> Result<Response<Full<Bytes>>> {
        if req.method() == Method::OPTIONS {
            let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
            for (name, value) in CORS_HEADERS {
                builder = builder.header(name, value);
            }
            return builder
                .body(Full::new(Bytes::new()))
                .map_err(|e| SeoError::InternalError(format!("Failed to build response: {}", e)));
        }

        if req.method() != Method::GET {
            return self.error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        let query = match RecordQuery::from_query(req.uri().query()) {
            Some(q) => q,
            None => {
                return self.error_response(StatusCode::BAD_REQUEST, "Missing base or table or view")
            }
        };

        let raw = match self.source.fetch_all(&query).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Record fetch failed for view={}: {}", query.view, e);
                return self.error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        let body = RecordsBody {
            records: raw.iter().map(InvestorRecord::from_provider).collect(),
        };
        let json = serde_json::to_vec(&body)?;
        let validator = compute_validator(&json);

        let if_none_match = req
            .headers()
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok());
        let not_modified = is_not_modified(if_none_match, &validator);

        info!(
            "Records view={} count={} not_modified={}",
            query.view,
            body.records.len(),
            not_modified
        );

        let mut builder = self
            .policy
            .stamp(Response::builder(), Some(&validator))
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in CORS_HEADERS {
            builder = builder.header(name, value);
        }

        let (status, body) = if not_modified {
            (StatusCode::NOT_MODIFIED, Bytes::new())
        } else {
            (StatusCode::OK, Bytes::from(json))
        };

        builder
            .status(status)
            .body(Full::new(body))
            .map_err(|e| SeoError::InternalError(format!("Failed to build response: {}", e)))
    }

    /// JSON error with CORS headers. Client errors are cacheable by the
    /// browser; server errors are not.
    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<Full<Bytes>>> {
        if status.is_server_error() {
            warn!("Records endpoint error {}: {}", status, message);
        }
        let json = serde_json::to_vec(&ErrorBody { error: message })?;
        let cache_control = if status.is_server_error() {
            "no-store".to_string()
        } else {
            self.policy.browser_directive()
        };

        let mut builder = Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, cache_control);
        for (name, value) in CORS_HEADERS {
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| SeoError::InternalError(format!("Failed to build response: {}", e)))
    }
}
