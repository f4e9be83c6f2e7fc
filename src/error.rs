//! Error types for the Pingora SEO module

use thiserror::Error;

/// Result type alias for SEO pipeline operations
pub type Result<T> = std::result::Result<T, SeoError>;

/// Error types that can occur in the SEO pipeline
#[derive(Error, Debug, Clone)]
pub enum SeoError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream returned error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Rewrite error: {0}")]
    RewriteError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for SeoError {
    fn from(err: std::io::Error) -> Self {
        SeoError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for SeoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SeoError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            SeoError::UpstreamError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SeoError::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SeoError {
    fn from(err: serde_json::Error) -> Self {
        SeoError::ParseError(err.to_string())
    }
}

impl SeoError {
    /// Whether the pipeline must degrade instead of surfacing this error.
    ///
    /// Upstream, network, parse, rewrite and cache failures never reach a
    /// crawler: the page is served without (or with less) metadata instead.
    /// Configuration and request validation errors are reported.
    pub fn is_degradable(&self) -> bool {
        match self {
            SeoError::UpstreamError { .. } => true,
            SeoError::Timeout(_) => true,
            SeoError::HttpError(_) => true,
            SeoError::ParseError(_) => true,
            SeoError::RewriteError(_) => true,
            SeoError::CacheError(_) => true,

            SeoError::ConfigError(_) => false,
            SeoError::InvalidRequest(_) => false,
            SeoError::NotFound(_) => false,
            SeoError::IoError(_) => false,
            SeoError::InternalError(_) => false,
        }
    }

    /// Convert error to HTTP status code
    ///
    /// - Request validation errors: 400
    /// - Unknown slugs: 404
    /// - Upstream errors and transport failures: 502
    /// - Timeouts: 504
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            SeoError::InvalidRequest(_) => 400,
            SeoError::ParseError(_) => 400,
            SeoError::NotFound(_) => 404,

            SeoError::UpstreamError { .. } => 502,
            SeoError::HttpError(_) => 502,
            SeoError::Timeout(_) => 504,

            SeoError::ConfigError(_) => 500,
            SeoError::RewriteError(_) => 500,
            SeoError::CacheError(_) => 500,
            SeoError::IoError(_) => 500,
            SeoError::InternalError(_) => 500,
        }
    }

    /// Create an UpstreamError from a status code and message
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        SeoError::UpstreamError {
            status,
            message: message.into(),
        }
    }
}
