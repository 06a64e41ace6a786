//! Streaming parser for `git log -p` and `git diff` patch output.
//!
//! The parser is a line-driven state machine producing [`Commit`] values,
//! each carrying one [`Diff`] per hunk. Splitting per hunk keeps
//! `line_start` exact for every emitted region, which is what lets chunk
//! metadata point at real line numbers.
//!
//! Commits stream over a bounded channel while `git log` is still running;
//! dropping the receiver stops the producer and reaps the child process.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use crossbeam_channel::{Receiver, bounded};
use once_cell::sync::Lazy;
use regex::Regex;

use super::error::GitError;
use super::options::ScanOptions;

/// Backpressure bound between the parser thread and the scanner.
const COMMIT_CHANNEL_CAPACITY: usize = 64;

static HUNK_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,\d+)? @@").expect("static regex"));

/// One commit from the log, newest first in parser order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    pub email: String,
    /// Formatted `YYYY-MM-DD HH:MM:SS -0700`.
    pub date: String,
    pub diffs: Vec<Diff>,
}

/// The added content of a single hunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub path_before: String,
    pub path_after: String,
    /// Added lines, newline-joined, `+` prefixes stripped.
    pub content: Vec<u8>,
    /// 1-based line number of the hunk's first added line in the new file.
    pub line_start: i64,
    pub is_binary: bool,
}

#[derive(Default)]
struct DiffBuilder {
    path_before: String,
    path_after: String,
    line_start: i64,
    is_binary: bool,
    content: Vec<u8>,
    in_hunk: bool,
}

impl DiffBuilder {
    fn build(self) -> Diff {
        Diff {
            path_before: self.path_before,
            path_after: self.path_after,
            content: self.content,
            line_start: self.line_start,
            is_binary: self.is_binary,
        }
    }

    /// Split off the current hunk's content as a finished diff, keeping the
    /// paths for the next hunk.
    fn split_hunk(&mut self, next_line_start: i64) -> Diff {
        let done = Diff {
            path_before: self.path_before.clone(),
            path_after: self.path_after.clone(),
            content: std::mem::take(&mut self.content),
            line_start: self.line_start,
            is_binary: self.is_binary,
        };
        self.line_start = next_line_start;
        done
    }

    fn is_worth_keeping(&self) -> bool {
        self.is_binary || !self.content.is_empty()
    }
}

struct Parser {
    commit: Option<Commit>,
    diff: Option<DiffBuilder>,
}

impl Parser {
    fn new() -> Self {
        Self { commit: None, diff: None }
    }

    /// Feed one log line (without its trailing newline). Returns a finished
    /// commit when the line starts the next one.
    fn feed(&mut self, line: &[u8]) -> Option<Commit> {
        if let Some(hash) = parse_commit_header(line) {
            self.finish_diff();
            let done = self.commit.take();
            self.commit = Some(Commit { hash, ..Commit::default() });
            return done;
        }

        // Patch-only input (`git diff`) has no header: synthesize an
        // anonymous commit to collect into.
        let commit = self.commit.get_or_insert_with(Commit::default);

        let text = String::from_utf8_lossy(line);
        if let Some(rest) = text.strip_prefix("Author: ") {
            let (author, email) = parse_author(rest);
            commit.author = author;
            commit.email = email;
        } else if let Some(rest) = text.strip_prefix("Date:") {
            commit.date = rest.trim().to_string();
        } else if text.starts_with("diff --git ") {
            self.finish_diff();
            let mut builder = DiffBuilder::default();
            if let Some((before, after)) = parse_diff_git_paths(&text) {
                builder.path_before = before;
                builder.path_after = after;
            }
            self.diff = Some(builder);
        } else if let Some(diff) = &mut self.diff {
            if let Some(rest) = text.strip_prefix("--- ") {
                diff.path_before = parse_marker_path(rest, "a/");
            } else if let Some(rest) = text.strip_prefix("+++ ") {
                diff.path_after = parse_marker_path(rest, "b/");
            } else if text.starts_with("Binary files ") && text.ends_with(" differ") {
                diff.is_binary = true;
            } else if let Some(caps) = HUNK_HEADER.captures(&text) {
                let start: i64 = caps[1].parse().unwrap_or(0);
                if diff.in_hunk && !diff.content.is_empty() {
                    let done = diff.split_hunk(start);
                    commit.diffs.push(done);
                } else {
                    diff.line_start = start;
                    diff.in_hunk = true;
                }
            } else if diff.in_hunk && line.first() == Some(&b'+') && !text.starts_with("+++") {
                diff.content.extend_from_slice(&line[1..]);
                diff.content.push(b'\n');
            }
        }
        None
    }

    fn finish_diff(&mut self) {
        if let Some(builder) = self.diff.take() {
            if builder.is_worth_keeping() {
                if let Some(commit) = &mut self.commit {
                    commit.diffs.push(builder.build());
                }
            }
        }
    }

    fn finish(mut self) -> Option<Commit> {
        self.finish_diff();
        self.commit.take()
    }
}

fn parse_commit_header(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?;
    let hash = text.strip_prefix("commit ")?;
    let hash = hash.split_whitespace().next()?;
    if hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(hash.to_string())
    } else {
        None
    }
}

fn parse_author(rest: &str) -> (String, String) {
    match rest.rsplit_once('<') {
        Some((name, email)) => {
            (name.trim().to_string(), email.trim_end_matches('>').trim().to_string())
        }
        None => (rest.trim().to_string(), String::new()),
    }
}

/// Best-effort path extraction from `diff --git a/X b/Y`; the `---`/`+++`
/// markers that follow are authoritative.
fn parse_diff_git_paths(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("diff --git ")?;
    let (before, after) = rest.rsplit_once(" b/")?;
    Some((before.strip_prefix("a/").unwrap_or(before).to_string(), after.to_string()))
}

fn parse_marker_path(rest: &str, prefix: &str) -> String {
    let path = rest.trim();
    if path == "/dev/null" {
        return String::new();
    }
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

/// Parse a complete patch (e.g. `git diff --cached` output) into diffs.
pub fn parse_patch(patch: &[u8]) -> Vec<Diff> {
    let mut parser = Parser::new();
    for line in patch.split(|&b| b == b'\n') {
        // A patch never contains commit headers, so feed never yields.
        let _ = parser.feed(line);
    }
    parser.finish().map(|c| c.diffs).unwrap_or_default()
}

/// Staged (index vs HEAD) diffs for a working tree.
pub fn staged_diffs(repo: &Path) -> Result<Vec<Diff>, GitError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["diff", "--cached", "-U0", "--no-color"])
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            operation: "diff --cached".to_string(),
            stderr: crate::redact::redact(String::from_utf8_lossy(&output.stderr).trim()),
        });
    }
    Ok(parse_patch(&output.stdout))
}

/// Start `git log -p` for `repo` and stream parsed commits.
///
/// The producer thread exits when the log is exhausted or the receiver is
/// dropped; in the latter case the child process is killed so no generator
/// leaks.
pub fn stream_commits(repo: &Path, options: &ScanOptions) -> Result<Receiver<Commit>, GitError> {
    let mut args: Vec<String> = vec![
        "log".into(),
        "-p".into(),
        "-U0".into(),
        "--full-history".into(),
        "--no-color".into(),
        "--date=format:%Y-%m-%d %H:%M:%S %z".into(),
    ];
    if !options.head_hash.is_empty() {
        args.push(options.head_hash.clone());
    } else if options.log_options.all_refs {
        args.push("--all".into());
    }

    let mut child = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(&args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout piped");
    let (tx, rx) = bounded(COMMIT_CHANNEL_CAPACITY);

    thread::spawn(move || {
        let mut parser = Parser::new();
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut receiver_gone = false;

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    if let Some(commit) = parser.feed(&line) {
                        if tx.send(commit).is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                }
                Err(err) => {
                    log::warn!("reading git log output failed: {err}");
                    break;
                }
            }
        }

        if receiver_gone {
            let _ = child.kill();
        } else if let Some(commit) = parser.finish() {
            let _ = tx.send(commit);
        }

        match child.wait() {
            Ok(status) if !status.success() && !receiver_gone => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                log::warn!("git log exited with {status}: {}", crate::redact::redact(stderr.trim()));
            }
            Ok(_) => {}
            Err(err) => log::warn!("waiting on git log failed: {err}"),
        }
    });

    Ok(rx)
}
