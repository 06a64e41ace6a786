//! The chunk data model: bounded byte regions with provenance metadata.
//!
//! Every scanner in this crate ultimately produces [`Chunk`] values. A chunk
//! carries the bytes a detector will inspect plus enough metadata to point a
//! human back at the exact commit, file, or object the bytes came from.

use serde::{Deserialize, Serialize};

/// Target payload size for a single chunk.
pub const CHUNK_SIZE: usize = 10 * 1024;

/// Extra bytes allowed past [`CHUNK_SIZE`] so detectors can peek across a
/// chunk boundary without missing a credential that straddles it.
pub const PEEK_SIZE: usize = 3 * 1024;

/// Hard ceiling for a chunk payload produced by the line-boundary splitter.
/// Payloads above this are deliberately oversized (single huge lines).
pub const TOTAL_CHUNK_SIZE: usize = CHUNK_SIZE + PEEK_SIZE;

/// The kind of source a chunk originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    Git,
    Github,
    Gcs,
}

/// Repository visibility as reported by the hosting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Shared,
    #[default]
    Unknown,
}

/// Provenance for a chunk taken from local git history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitMetadata {
    pub commit: String,
    pub file: String,
    pub email: String,
    pub repository: String,
    /// Commit time, formatted `YYYY-MM-DD HH:MM:SS -0700`.
    pub timestamp: String,
    pub line: i64,
}

/// Provenance for a chunk taken from a GitHub-hosted repository, gist, or
/// issue/PR comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubMetadata {
    pub commit: String,
    pub file: String,
    pub email: String,
    pub repository: String,
    pub timestamp: String,
    pub line: i64,
    /// Browser link to the exact blob or comment.
    pub link: String,
    pub username: String,
    pub visibility: Visibility,
}

/// Provenance for a chunk taken from a GCS object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsMetadata {
    pub bucket: String,
    pub filename: String,
    pub link: String,
    pub email: String,
    pub content_type: String,
    pub acls: Vec<String>,
    /// Unix seconds, rendered decimal.
    pub created_at: String,
    pub updated_at: String,
}

/// Tagged provenance variant. The variant always matches the emitting
/// source's [`SourceKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceMetadata {
    Git(GitMetadata),
    Github(GithubMetadata),
    Gcs(GcsMetadata),
}

impl SourceMetadata {
    /// The source kind this metadata variant belongs to.
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceMetadata::Git(_) => SourceKind::Git,
            SourceMetadata::Github(_) => SourceKind::Github,
            SourceMetadata::Gcs(_) => SourceKind::Gcs,
        }
    }
}

/// The unit of work flowing to detectors. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_name: String,
    pub source_kind: SourceKind,
    pub source_id: i64,
    pub job_id: i64,
    /// Set only by targeted scans, to tie a chunk back to the secret that
    /// prompted the scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<i64>,
    /// Payload bytes. At most [`TOTAL_CHUNK_SIZE`] unless a single line or
    /// object was deliberately kept whole.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Whether detectors should attempt live verification downstream.
    pub verify: bool,
    pub metadata: SourceMetadata,
}

impl Chunk {
    /// Invariant check: the metadata variant matches the chunk's source kind.
    pub fn is_consistent(&self) -> bool {
        self.metadata.kind() == self.source_kind
    }
}

/// Format a commit time the way chunk metadata expects it.
pub fn format_commit_time(time: chrono::DateTime<chrono::FixedOffset>) -> String {
    time.format("%Y-%m-%d %H:%M:%S %z").to_string()
}

/// Serde adapter encoding chunk payloads as base64 strings so chunks can be
/// shipped as JSON lines.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_chunk() -> Chunk {
        Chunk {
            source_name: "local".into(),
            source_kind: SourceKind::Git,
            source_id: 1,
            job_id: 7,
            secret_id: None,
            data: b"password=hunter2\n".to_vec(),
            verify: true,
            metadata: SourceMetadata::Git(GitMetadata {
                commit: "deadbeef".into(),
                file: "config.env".into(),
                email: "dev@example.com".into(),
                repository: "https://example.com/a/b.git".into(),
                timestamp: "2024-05-01 10:00:00 +0000".into(),
                line: 3,
            }),
        }
    }

    #[test]
    fn metadata_variant_matches_source_kind() {
        assert!(git_chunk().is_consistent());

        let mut mismatched = git_chunk();
        mismatched.source_kind = SourceKind::Gcs;
        assert!(!mismatched.is_consistent());
    }

    #[test]
    fn chunk_json_round_trip() {
        let chunk = git_chunk();
        let encoded = serde_json::to_string(&chunk).unwrap();
        let decoded: Chunk = serde_json::from_str(&encoded).unwrap();
        assert_eq!(chunk, decoded);
    }

    #[test]
    fn payload_is_base64_in_json() {
        let encoded = serde_json::to_string(&git_chunk()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let data = value["data"].as_str().unwrap();
        assert!(!data.contains("hunter2"));
    }

    #[test]
    fn commit_time_format() {
        let time = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:00:00-07:00").unwrap();
        assert_eq!(format_commit_time(time), "2024-05-01 10:00:00 -0700");
    }
}
