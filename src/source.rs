//! The source abstraction: lifecycle, work units, reporters, cancellation.
//!
//! A source produces chunks for one remote kind (git, GitHub, GCS). Every
//! source supports `init` + `chunks`; unit-aware sources additionally
//! support `enumerate` + `chunk_unit`, which lets an out-of-process driver
//! hand individual work units to workers.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, SourceKind};
use crate::progress::Progress;

/// Worker count for a source's bounded pool: non-positive requests become
/// the logical CPU count.
pub fn effective_concurrency(value: i64) -> usize {
    if value <= 0 { num_cpus::get() } else { value as usize }
}

/// Cooperative cancellation token shared between a driver and its workers.
///
/// Checked before every chunk send and every listing step; once cancelled,
/// producers wind down and partial progress stays persisted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a [`SourceUnit`] identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UnitKind {
    /// A clonable repository URL.
    Repo,
    /// A local directory holding a working tree or bare repo.
    Dir,
}

/// One schedulable subset of a source's work, serializable so it can be
/// handed to a worker in another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub kind: UnitKind,
    pub id: String,
}

impl SourceUnit {
    pub fn repo(url: impl Into<String>) -> Self {
        Self { kind: UnitKind::Repo, id: url.into() }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self { kind: UnitKind::Dir, id: path.into() }
    }

    /// Serialize for hand-off to a worker.
    pub fn marshal(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a unit previously produced by [`SourceUnit::marshal`]. Unknown
    /// kinds fail.
    pub fn unmarshal(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

impl fmt::Display for SourceUnit {
    /// Repo units render as `owner/repo`, directory units as the basename.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            UnitKind::Repo => {
                let trimmed = self.id.trim_end_matches('/').trim_end_matches(".git");
                let mut parts = trimmed.rsplit('/');
                match (parts.next(), parts.next()) {
                    (Some(repo), Some(owner)) if !owner.contains(':') && !owner.is_empty() => {
                        write!(f, "{owner}/{repo}")
                    }
                    _ => f.write_str(&self.id),
                }
            }
            UnitKind::Dir => {
                let base = Path::new(&self.id)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.id.clone());
                f.write_str(&base)
            }
        }
    }
}

/// Query criteria for a targeted scan: the repository link, the commit the
/// secret was seen at, and the path within that commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCriteria {
    pub link: String,
    pub commit: String,
    pub file: String,
}

/// A targeted-scan request tying a previously found secret to the location
/// that should be re-chunked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingTarget {
    pub secret_id: i64,
    pub query_criteria: QueryCriteria,
}

/// A single target's failure during a targeted scan.
#[derive(Debug, thiserror::Error)]
#[error("targeted scan for secret {secret_id} failed: {source}")]
pub struct TargetedScanError {
    pub secret_id: i64,
    #[source]
    pub source: anyhow::Error,
}

/// All targets' failures joined; callers can branch on individual targets
/// via [`TargetedScanErrors::errors`].
#[derive(Debug, Default)]
pub struct TargetedScanErrors(pub Vec<TargetedScanError>);

impl TargetedScanErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The per-target errors behind the joined message.
    pub fn errors(&self) -> &[TargetedScanError] {
        &self.0
    }
}

impl fmt::Display for TargetedScanErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TargetedScanErrors {}

/// Receives chunks from a scanner. A failed delivery is fatal to the scan.
pub trait ChunkReporter: Send + Sync {
    fn chunk_ok(&self, chunk: Chunk) -> anyhow::Result<()>;
}

impl ChunkReporter for crossbeam_channel::Sender<Chunk> {
    fn chunk_ok(&self, chunk: Chunk) -> anyhow::Result<()> {
        self.send(chunk)
            .map_err(|_| anyhow::anyhow!("chunk channel closed"))
    }
}

/// Receives enumerated units and per-unit failures. A unit is reported
/// exactly once: ok or err, never both.
pub trait UnitReporter: Send + Sync {
    fn unit_ok(&self, unit: SourceUnit) -> anyhow::Result<()>;
    fn unit_err(&self, err: anyhow::Error) -> anyhow::Result<()>;
}

/// Channel-backed [`UnitReporter`] used by in-process drivers and tests.
pub struct UnitChannel {
    pub units: crossbeam_channel::Sender<SourceUnit>,
    pub errors: crossbeam_channel::Sender<anyhow::Error>,
}

impl UnitReporter for UnitChannel {
    fn unit_ok(&self, unit: SourceUnit) -> anyhow::Result<()> {
        self.units
            .send(unit)
            .map_err(|_| anyhow::anyhow!("unit channel closed"))
    }

    fn unit_err(&self, err: anyhow::Error) -> anyhow::Result<()> {
        self.errors
            .send(err)
            .map_err(|_| anyhow::anyhow!("unit error channel closed"))
    }
}

/// A producer of chunks for one remote kind.
pub trait Source: Send {
    fn kind(&self) -> SourceKind;
    fn source_id(&self) -> i64;
    fn job_id(&self) -> i64;

    /// Bind identity and runtime knobs before scanning.
    fn init(
        &mut self,
        name: &str,
        source_id: i64,
        job_id: i64,
        verify: bool,
        concurrency: usize,
    ) -> anyhow::Result<()>;

    /// Scan everything (empty `targets`) or only the given targets.
    fn chunks(
        &mut self,
        reporter: &dyn ChunkReporter,
        targets: &[ChunkingTarget],
        cancel: &CancelToken,
    ) -> anyhow::Result<()>;

    /// A consistent snapshot of this source's progress.
    fn progress(&self) -> Progress;
}

/// Sources that can split their work into serializable units.
pub trait UnitSource: Source {
    /// Discover units and report each exactly once.
    fn enumerate(&mut self, reporter: &dyn UnitReporter, cancel: &CancelToken)
    -> anyhow::Result<()>;

    /// Scan a single previously enumerated unit.
    fn chunk_unit(
        &mut self,
        unit: &SourceUnit,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> anyhow::Result<()>;

    /// Parse a unit this source produced earlier.
    fn unmarshal_unit(&self, data: &str) -> anyhow::Result<SourceUnit> {
        Ok(SourceUnit::unmarshal(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_marshal_round_trip() {
        let unit = SourceUnit::repo("https://github.com/acme/widgets.git");
        let encoded = unit.marshal().unwrap();
        assert_eq!(SourceUnit::unmarshal(&encoded).unwrap(), unit);

        let dir = SourceUnit::dir("/srv/checkouts/widgets");
        let encoded = dir.marshal().unwrap();
        assert_eq!(SourceUnit::unmarshal(&encoded).unwrap(), dir);
    }

    #[test]
    fn unknown_unit_kind_fails() {
        assert!(SourceUnit::unmarshal(r#"{"kind":"idk","id":"x"}"#).is_err());
    }

    #[test]
    fn repo_unit_displays_owner_slash_repo() {
        let unit = SourceUnit::repo("https://github.com/acme/widgets.git");
        assert_eq!(unit.to_string(), "acme/widgets");
    }

    #[test]
    fn dir_unit_displays_basename() {
        let unit = SourceUnit::dir("/srv/checkouts/widgets");
        assert_eq!(unit.to_string(), "widgets");
    }

    #[test]
    fn concurrency_defaults_to_cpu_count() {
        assert_eq!(effective_concurrency(0), num_cpus::get());
        assert_eq!(effective_concurrency(-5), num_cpus::get());
        assert_eq!(effective_concurrency(3), 3);
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn targeted_errors_join_and_unwrap() {
        let errs = TargetedScanErrors(vec![
            TargetedScanError { secret_id: 1, source: anyhow::anyhow!("no such file") },
            TargetedScanError { secret_id: 2, source: anyhow::anyhow!("bad commit") },
        ]);
        let joined = errs.to_string();
        assert!(joined.contains("secret 1"));
        assert!(joined.contains("secret 2"));
        assert!(joined.contains("; "));
        assert_eq!(errs.errors().len(), 2);
    }
}
