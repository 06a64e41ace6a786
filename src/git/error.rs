//! Git scanning error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    /// `git` is not installed or not on PATH. Fatal at source init.
    #[error("git executable not found in PATH")]
    GitNotFound,

    /// A ref failed plain, `refs/heads/`, and `refs/remotes/origin/` lookup.
    #[error("could not resolve reference {reference:?}")]
    UnresolvableRef { reference: String },

    /// A git subprocess exited non-zero. `stderr` is already redacted.
    #[error("git {operation} failed: {stderr}")]
    CommandFailed { operation: String, stderr: String },

    /// Clone failed; the URL is password-redacted.
    #[error("clone of {url} failed: {stderr}")]
    CloneFailed { url: String, stderr: String },

    /// The input was not a recognizable git URL.
    #[error("unsupported git URL {url:?}: {reason}")]
    UrlParse { url: String, reason: String },

    /// The chunk channel closed underneath the scanner.
    #[error("chunk delivery failed: {0}")]
    ChunkSend(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
