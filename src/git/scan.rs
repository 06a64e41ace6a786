//! The commit-walking scanner: turns parsed diffs into chunks.
//!
//! One scanner instance is shared by the git and GitHub sources; the
//! metadata builder closure is what makes a chunk carry plain git
//! provenance or GitHub provenance with links and visibility.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::chunk::{CHUNK_SIZE, Chunk, SourceKind, SourceMetadata, TOTAL_CHUNK_SIZE};
use crate::chunk::{GitMetadata, format_commit_time};
use crate::handler::{BufferedReader, FileHandler, NoopHandler};
use crate::source::{CancelToken, ChunkReporter};

use super::clone::run_git;
use super::error::GitError;
use super::log_parser::{Commit, Diff, staged_diffs, stream_commits};
use super::options::ScanOptions;

/// Commit hash stand-in for staged (uncommitted) changes.
const STAGED_COMMIT: &str = "Staged";

/// Everything a metadata builder needs to describe one chunk's origin.
pub struct MetadataContext<'a> {
    pub commit: &'a str,
    pub file: &'a str,
    pub email: &'a str,
    pub repository: &'a str,
    pub timestamp: &'a str,
    pub line: i64,
}

/// Builds the provenance variant for each emitted chunk.
pub type MetadataBuilder = Arc<dyn Fn(&MetadataContext<'_>) -> SourceMetadata + Send + Sync>;

/// A contiguous piece of a diff, split on line boundaries.
#[derive(Debug, PartialEq, Eq)]
struct Piece {
    data: Vec<u8>,
    /// Lines preceding this piece within the diff.
    line_offset: i64,
}

/// Scans one repository at a time; reusable across repositories.
pub struct Scanner {
    source_name: String,
    source_kind: SourceKind,
    source_id: i64,
    job_id: i64,
    verify: bool,
    skip_binaries: bool,
    skip_archives: bool,
    handler: Arc<dyn FileHandler>,
    metadata: MetadataBuilder,
    commits_scanned: AtomicU64,
}

impl Scanner {
    pub fn new(
        source_name: impl Into<String>,
        source_id: i64,
        job_id: i64,
        verify: bool,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            source_kind: SourceKind::Git,
            source_id,
            job_id,
            verify,
            skip_binaries: false,
            skip_archives: false,
            handler: Arc::new(NoopHandler),
            metadata: Arc::new(|ctx| {
                SourceMetadata::Git(GitMetadata {
                    commit: ctx.commit.to_string(),
                    file: ctx.file.to_string(),
                    email: ctx.email.to_string(),
                    repository: ctx.repository.to_string(),
                    timestamp: ctx.timestamp.to_string(),
                    line: ctx.line,
                })
            }),
            commits_scanned: AtomicU64::new(0),
        }
    }

    pub fn with_skip_binaries(mut self, skip: bool) -> Self {
        self.skip_binaries = skip;
        self
    }

    pub fn with_skip_archives(mut self, skip: bool) -> Self {
        self.skip_archives = skip;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Override provenance construction (and the kind chunks report).
    pub fn with_metadata_builder(mut self, kind: SourceKind, builder: MetadataBuilder) -> Self {
        self.source_kind = kind;
        self.metadata = builder;
        self
    }

    pub fn commits_scanned(&self) -> u64 {
        self.commits_scanned.load(Ordering::Relaxed)
    }

    /// Scan commit history and, for non-bare repos, staged changes.
    pub fn scan_repo(
        &self,
        repo_path: &Path,
        repo_url: &str,
        options: &ScanOptions,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GitError> {
        let options = normalize_refs(repo_path, options)?;
        let commits = stream_commits(repo_path, &options)?;
        self.walk_commits(commits, Some(repo_path), repo_url, &options, reporter, cancel)?;

        if !options.bare {
            self.scan_staged(repo_path, repo_url, &options, reporter, cancel)?;
        }
        Ok(())
    }

    /// Walk an already-open commit stream. Terminates at the base hash, at
    /// max depth, or when the stream ends.
    fn walk_commits(
        &self,
        commits: impl IntoIterator<Item = Commit>,
        repo_path: Option<&Path>,
        repo_url: &str,
        options: &ScanOptions,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GitError> {
        let mut processed: i64 = 0;
        for commit in commits {
            if cancel.is_cancelled() {
                return Err(GitError::Cancelled);
            }
            if options.max_depth >= 0 && processed >= options.max_depth {
                log::debug!("reached max depth {} scanning {repo_url}", options.max_depth);
                break;
            }
            if !options.base_hash.is_empty() && commit.hash == options.base_hash {
                break;
            }
            processed += 1;
            self.commits_scanned.fetch_add(1, Ordering::Relaxed);

            for diff in &commit.diffs {
                if diff.path_after.is_empty() || !options.filter.pass(&diff.path_after) {
                    continue;
                }
                let result = if diff.is_binary {
                    self.handle_binary(repo_path, repo_url, &commit, diff, reporter, cancel)
                } else {
                    self.chunk_diff(
                        &commit.hash,
                        &commit.email,
                        &commit.date,
                        diff,
                        repo_url,
                        reporter,
                        cancel,
                    )
                };
                if let Err(err) = result {
                    match err {
                        GitError::Cancelled | GitError::ChunkSend(_) => return Err(err),
                        other => log::warn!(
                            "skipping diff {} at {}: {other}",
                            diff.path_after,
                            commit.hash
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Chunk the staged index of a working tree. Staged diffs report the
    /// sentinel commit and the current time.
    fn scan_staged(
        &self,
        repo_path: &Path,
        repo_url: &str,
        options: &ScanOptions,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GitError> {
        let now = format_commit_time(chrono::Local::now().fixed_offset());
        for diff in staged_diffs(repo_path)? {
            if diff.path_after.is_empty() || !options.filter.pass(&diff.path_after) {
                continue;
            }
            if let Err(err) =
                self.chunk_diff(STAGED_COMMIT, "", &now, &diff, repo_url, reporter, cancel)
            {
                match err {
                    GitError::Cancelled | GitError::ChunkSend(_) => return Err(err),
                    other => log::warn!("skipping staged diff {}: {other}", diff.path_after),
                }
            }
        }
        Ok(())
    }

    fn chunk_diff(
        &self,
        commit: &str,
        email: &str,
        timestamp: &str,
        diff: &Diff,
        repo_url: &str,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GitError> {
        for piece in split_on_line_boundaries(&diff.content) {
            if cancel.is_cancelled() {
                return Err(GitError::Cancelled);
            }
            let metadata = (self.metadata)(&MetadataContext {
                commit,
                file: &diff.path_after,
                email,
                repository: repo_url,
                timestamp,
                line: diff.line_start + piece.line_offset,
            });
            reporter
                .chunk_ok(self.build_chunk(metadata, piece.data))
                .map_err(|e| GitError::ChunkSend(e.to_string()))?;
        }
        Ok(())
    }

    /// Binary diffs carry no patch content; fetch the blob and hand it to
    /// the file-type handler, falling back to raw chunking when declined.
    fn handle_binary(
        &self,
        repo_path: Option<&Path>,
        repo_url: &str,
        commit: &Commit,
        diff: &Diff,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GitError> {
        if self.skip_binaries {
            log::debug!("skipping binary {} at {}", diff.path_after, commit.hash);
            return Ok(());
        }
        let Some(repo_path) = repo_path else {
            log::debug!("no repository on disk for binary {}", diff.path_after);
            return Ok(());
        };

        let blob = cat_file_blob(repo_path, &commit.hash, &diff.path_after)?;
        let metadata = (self.metadata)(&MetadataContext {
            commit: &commit.hash,
            file: &diff.path_after,
            email: &commit.email,
            repository: repo_url,
            timestamp: &commit.date,
            line: 0,
        });
        let skeleton = self.build_chunk(metadata, Vec::new());

        let mut reader = BufferedReader::spool(&mut blob.as_slice())?;
        if self.handler.handle(&diff.path_after, &mut reader, &skeleton, reporter, self.skip_archives)
        {
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        reader.rewind()?;
        let data = reader.slurp()?;
        reporter
            .chunk_ok(Chunk { data, ..skeleton })
            .map_err(|e| GitError::ChunkSend(e.to_string()))
    }

    fn build_chunk(&self, metadata: SourceMetadata, data: Vec<u8>) -> Chunk {
        Chunk {
            source_name: self.source_name.clone(),
            source_kind: self.source_kind,
            source_id: self.source_id,
            job_id: self.job_id,
            secret_id: None,
            data,
            verify: self.verify,
            metadata,
        }
    }
}

/// Fetch raw blob bytes for `<commit>:<path>`.
fn cat_file_blob(repo: &Path, commit: &str, path: &str) -> Result<Vec<u8>, GitError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["cat-file", "blob", &format!("{commit}:{path}")])
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            operation: "cat-file".to_string(),
            stderr: crate::redact::redact(String::from_utf8_lossy(&output.stderr).trim()),
        });
    }
    Ok(output.stdout)
}

/// True for a full 40-hex object id.
fn is_full_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Resolve a ref name to a commit hash: plain lookup first, then
/// `refs/heads/`, then `refs/remotes/origin/`.
fn resolve_ref(repo: &Path, reference: &str) -> Result<String, GitError> {
    let candidates = [
        reference.to_string(),
        format!("refs/heads/{reference}"),
        format!("refs/remotes/origin/{reference}"),
    ];
    for candidate in &candidates {
        let spec = format!("{candidate}^{{commit}}");
        if let Ok(out) = run_git(Some(repo), &["rev-parse", "--verify", "--quiet", &spec]) {
            let hash = out.trim().to_string();
            if !hash.is_empty() {
                return Ok(hash);
            }
        }
    }
    Err(GitError::UnresolvableRef { reference: reference.to_string() })
}

fn merge_base(repo: &Path, a: &str, b: &str) -> Result<String, GitError> {
    Ok(run_git(Some(repo), &["merge-base", a, b])?.trim().to_string())
}

/// Resolve non-hash refs to hashes and, when both ends of the range are
/// set, replace the base with the merge-base of the two.
fn normalize_refs(repo: &Path, options: &ScanOptions) -> Result<ScanOptions, GitError> {
    let mut normalized = options.clone();

    if !normalized.base_hash.is_empty() && !is_full_hash(&normalized.base_hash) {
        normalized.base_hash = resolve_ref(repo, &normalized.base_hash)?;
    }
    if !normalized.head_hash.is_empty() && !is_full_hash(&normalized.head_hash) {
        normalized.head_hash = resolve_ref(repo, &normalized.head_hash)?;
    }
    if !normalized.base_hash.is_empty() && !normalized.head_hash.is_empty() {
        normalized.base_hash = merge_base(repo, &normalized.base_hash, &normalized.head_hash)?;
    }
    Ok(normalized)
}

/// Split diff content on line boundaries so no chunk exceeds the target
/// size. A single line longer than the target is emitted alone. Content at
/// or under the oversize threshold is passed through whole.
fn split_on_line_boundaries(content: &[u8]) -> Vec<Piece> {
    if content.len() <= TOTAL_CHUNK_SIZE {
        return vec![Piece { data: content.to_vec(), line_offset: 0 }];
    }

    let mut pieces = Vec::new();
    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut buf_line: i64 = 0;
    let mut lines_seen: i64 = 0;

    for line in content.split_inclusive(|&b| b == b'\n') {
        if !buf.is_empty() && buf.len() + line.len() > CHUNK_SIZE {
            pieces.push(Piece { data: std::mem::take(&mut buf), line_offset: buf_line });
            buf_line = lines_seen;
        }
        buf.extend_from_slice(line);
        lines_seen += 1;
    }
    if !buf.is_empty() {
        pieces.push(Piece { data: buf, line_offset: buf_line });
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CancelToken;
    use crossbeam_channel::unbounded;

    fn collect_reporter() -> (crossbeam_channel::Sender<Chunk>, crossbeam_channel::Receiver<Chunk>)
    {
        unbounded()
    }

    fn commit_with_content(hash: &str, path: &str, content: &[u8]) -> Commit {
        Commit {
            hash: hash.to_string(),
            author: "Jane Doe".into(),
            email: "jane@example.com".into(),
            date: "2024-05-01 10:00:00 +0000".into(),
            diffs: vec![Diff {
                path_before: path.to_string(),
                path_after: path.to_string(),
                content: content.to_vec(),
                line_start: 1,
                is_binary: false,
            }],
        }
    }

    #[test]
    fn small_content_is_one_piece() {
        let pieces = split_on_line_boundaries(b"one\ntwo\n");
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].line_offset, 0);
    }

    #[test]
    fn oversize_content_splits_and_reassembles() {
        // Three lines, total one byte past the oversize threshold.
        let third = (TOTAL_CHUNK_SIZE + 1).div_ceil(3);
        let mut content = Vec::new();
        for _ in 0..2 {
            content.extend(vec![b'a'; third - 1]);
            content.push(b'\n');
        }
        content.extend(vec![b'b'; TOTAL_CHUNK_SIZE + 1 - content.len()]);

        let pieces = split_on_line_boundaries(&content);
        assert!(pieces.len() >= 2);

        let reassembled: Vec<u8> = pieces.iter().flat_map(|p| p.data.clone()).collect();
        assert_eq!(reassembled, content);

        // Offsets strictly increase.
        for pair in pieces.windows(2) {
            assert!(pair[0].line_offset < pair[1].line_offset);
        }
    }

    #[test]
    fn single_giant_line_is_emitted_alone() {
        let mut content = vec![b'x'; TOTAL_CHUNK_SIZE + 100];
        content.push(b'\n');
        content.extend_from_slice(b"short\n");

        let pieces = split_on_line_boundaries(&content);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].data.len(), TOTAL_CHUNK_SIZE + 101);
        assert_eq!(pieces[1].data, b"short\n");
        assert_eq!(pieces[1].line_offset, 1);
    }

    #[test]
    fn walk_stops_at_base_hash() {
        let base = "b".repeat(40);
        let commits = vec![
            commit_with_content(&"1".repeat(40), "h.txt", b"h\n"),
            commit_with_content(&"2".repeat(40), "a.txt", b"a\n"),
            commit_with_content(&"3".repeat(40), "b.txt", b"b\n"),
            commit_with_content(&"4".repeat(40), "c.txt", b"c\n"),
            commit_with_content(&base, "base.txt", b"base\n"),
            commit_with_content(&"5".repeat(40), "old.txt", b"old\n"),
        ];

        let scanner = Scanner::new("test", 1, 1, false);
        let options = ScanOptions::new().with_base_hash(base);
        let (tx, rx) = collect_reporter();
        scanner
            .walk_commits(commits, None, "repo", &options, &tx, &CancelToken::new())
            .unwrap();
        drop(tx);

        let files: Vec<String> = rx
            .iter()
            .map(|c| match c.metadata {
                SourceMetadata::Git(m) => m.file,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(files, vec!["h.txt", "a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn walk_respects_max_depth() {
        let commits = vec![
            commit_with_content(&"1".repeat(40), "a.txt", b"a\n"),
            commit_with_content(&"2".repeat(40), "b.txt", b"b\n"),
            commit_with_content(&"3".repeat(40), "c.txt", b"c\n"),
        ];

        let scanner = Scanner::new("test", 1, 1, false);
        let options = ScanOptions::new().with_max_depth(2);
        let (tx, rx) = collect_reporter();
        scanner
            .walk_commits(commits, None, "repo", &options, &tx, &CancelToken::new())
            .unwrap();
        drop(tx);

        assert_eq!(rx.iter().count(), 2);
        assert_eq!(scanner.commits_scanned(), 2);
    }

    #[test]
    fn filtered_paths_are_skipped() {
        let commits = vec![commit_with_content(&"1".repeat(40), "vendor/lib.js", b"x\n")];
        let scanner = Scanner::new("test", 1, 1, false);
        let options = ScanOptions::new().with_exclude_globs(&["vendor/**".into()]);
        let (tx, rx) = collect_reporter();
        scanner
            .walk_commits(commits, None, "repo", &options, &tx, &CancelToken::new())
            .unwrap();
        drop(tx);
        assert_eq!(rx.iter().count(), 0);
    }

    #[test]
    fn cancelled_walk_returns_cancelled() {
        let commits = vec![commit_with_content(&"1".repeat(40), "a.txt", b"a\n")];
        let scanner = Scanner::new("test", 1, 1, false);
        let cancel = CancelToken::new();
        cancel.cancel();
        let (tx, _rx) = collect_reporter();
        let err = scanner
            .walk_commits(commits, None, "repo", &ScanOptions::new(), &tx, &cancel)
            .unwrap_err();
        assert!(matches!(err, GitError::Cancelled));
    }

    #[test]
    fn oversize_diff_chunks_carry_line_numbers() {
        let mut content = Vec::new();
        let mut expect_lines = 0;
        while content.len() <= TOTAL_CHUNK_SIZE {
            content.extend_from_slice(b"line of secret material padding padding padding\n");
            expect_lines += 1;
        }
        let mut commit = commit_with_content(&"1".repeat(40), "big.txt", &content);
        commit.diffs[0].line_start = 10;

        let scanner = Scanner::new("test", 1, 1, false);
        let (tx, rx) = collect_reporter();
        scanner
            .walk_commits(vec![commit], None, "repo", &ScanOptions::new(), &tx, &CancelToken::new())
            .unwrap();
        drop(tx);

        let chunks: Vec<Chunk> = rx.iter().collect();
        assert!(chunks.len() >= 2);

        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(reassembled, content);

        let lines: Vec<i64> = chunks
            .iter()
            .map(|c| match &c.metadata {
                SourceMetadata::Git(m) => m.line,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(lines[0], 10);
        assert!(lines.windows(2).all(|w| w[0] < w[1]));
        assert!(*lines.last().unwrap() < 10 + expect_lines);
    }
}
