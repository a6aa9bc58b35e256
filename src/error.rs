//! Error types for registry operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced by the registry clients.
///
/// Parse and verification failures are terminal: they indicate bad input or
/// a misbehaving server and are never retried. Transport errors pass through
/// as [`RegistryError::Network`] so callers can distinguish them from
/// protocol-level failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The repository/index/tag string failed to parse.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// The registry challenged with an auth scheme this client cannot speak.
    #[error("unsupported auth scheme: \"{0}\"")]
    UnsupportedAuthScheme(String),

    /// Login or credential use was rejected by the registry.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A content digest (header or blob) did not match the hashed bytes.
    #[error("digest mismatch: {0}")]
    BadDigest(String),

    /// A manifest JWS signature failed to verify.
    #[error("manifest verification failed: {0}")]
    ManifestVerification(String),

    /// A manifest was structurally malformed.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// The blob redirect chain exceeded the hop bound.
    #[error("maximum number of redirects ({limit}) hit when attempting to fetch {url}")]
    TooManyRedirects { limit: u32, url: String },

    /// A blob download delivered a different byte count than advertised.
    #[error("download failed: {0}")]
    Download(String),

    /// The remote resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success HTTP response, with its origin preserved.
    #[error("registry request failed: {status} {url}: {message}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        message: String,
    },

    /// The client was closed and can make no further requests.
    #[error("client is closed")]
    Closed,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
