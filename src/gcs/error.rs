//! GCS source error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcsError {
    #[error("GCS API returned {status} for {url}: {message}")]
    Api { status: u16, url: String, message: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credential problems are fatal to the source.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("object {name} is {size} bytes, over the {max}-byte limit")]
    ObjectTooLarge { name: String, size: i64, max: u64 },

    #[error("object {name} is empty")]
    EmptyObject { name: String },

    #[error("signing service-account JWT failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("chunk delivery failed: {0}")]
    ChunkSend(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
