//! GitHub source error taxonomy.

use thiserror::Error;

use crate::git::GitError;
use crate::source::TargetedScanErrors;

#[derive(Debug, Error)]
pub enum GithubError {
    /// A non-success API response that was not a rate limit.
    #[error("GitHub API returned {status} for {url}: {message}")]
    Api { status: u16, url: String, message: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credential problems are fatal to the source.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("cannot interpret {input:?} as a repository")]
    RepoParse { input: String },

    #[error("signing app JWT failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("GraphQL query failed: {0}")]
    Graphql(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Targeted(#[from] TargetedScanErrors),

    #[error("chunk delivery failed: {0}")]
    ChunkSend(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GithubError {
    /// Whether this error is the not-found control-flow signal used for the
    /// org-to-user enumeration fallback.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GithubError::Api { status: 404, .. })
    }
}
