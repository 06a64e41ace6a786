//! leakscan: a source layer for secret scanning.
//!
//! Enumerates heterogeneous content repositories (git working trees and
//! remotes, GitHub orgs/users/apps/gists, GCS buckets), clones or downloads
//! their artifacts, and streams uniform byte [`chunk::Chunk`]s with
//! provenance metadata to downstream detectors. Progress snapshots carry an
//! opaque resume token per source so interrupted scans can pick up where
//! they left off.
//!
//! ## Library usage
//!
//! Build a source from its config and credential, `init` it, then drain
//! chunks from a channel while `chunks` runs:
//!
//! ```no_run
//! use leakscan::git::{GitAuth, GitConfig, GitSource};
//! use leakscan::source::{CancelToken, Source};
//!
//! let mut source = GitSource::new(
//!     GitConfig {
//!         repositories: vec!["https://github.com/acme/widgets.git".into()],
//!         ..GitConfig::default()
//!     },
//!     GitAuth::Unauthenticated,
//! );
//! source.init("git", 1, 1, false, 4)?;
//!
//! let (tx, rx) = crossbeam_channel::bounded(64);
//! let drain = std::thread::spawn(move || rx.iter().count());
//! source.chunks(&tx, &[], &CancelToken::new())?;
//! drop(tx);
//! println!("{} chunks", drain.join().unwrap());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cache;
pub mod chunk;
pub mod cli;
pub mod filter;
pub mod gcs;
pub mod git;
pub mod github;
pub mod handler;
pub mod progress;
pub mod redact;
pub mod source;

pub use chunk::{CHUNK_SIZE, Chunk, PEEK_SIZE, SourceKind, SourceMetadata};
pub use progress::Progress;
pub use source::{CancelToken, ChunkReporter, ChunkingTarget, Source, SourceUnit, UnitSource};
