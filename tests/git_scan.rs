//! End-to-end scans of fixture repositories built with the real `git`
//! binary.

use std::path::Path;
use std::process::Command;

use crossbeam_channel::unbounded;
use leakscan::chunk::{Chunk, SourceMetadata};
use leakscan::git::{GitAuth, GitConfig, GitSource};
use leakscan::source::{CancelToken, Source};

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("running git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn init_repo(dir: &Path) {
    git(dir, &["init"]);
}

/// Write a file, stage it, commit, and return the commit hash.
fn commit_file(dir: &Path, name: &str, contents: &[u8], message: &str) -> String {
    std::fs::write(dir.join(name), contents).expect("writing fixture file");
    git(dir, &["add", name]);
    git(
        dir,
        &[
            "-c",
            "user.name=Fixture Author",
            "-c",
            "user.email=fixture@example.com",
            "commit",
            "-m",
            message,
        ],
    );
    git(dir, &["rev-parse", "HEAD"]).trim().to_string()
}

fn scan_directory(dir: &Path, config_base: &str) -> Vec<Chunk> {
    let mut source = GitSource::new(
        GitConfig {
            directories: vec![dir.to_string_lossy().into_owned()],
            base: config_base.to_string(),
            ..GitConfig::default()
        },
        GitAuth::Unauthenticated,
    );
    source.init("git-test", 1, 1, false, 1).expect("init");

    let (tx, rx) = unbounded();
    source.chunks(&tx, &[], &CancelToken::new()).expect("scan");
    drop(tx);
    rx.iter().collect()
}

fn git_meta(chunk: &Chunk) -> &leakscan::chunk::GitMetadata {
    match &chunk.metadata {
        SourceMetadata::Git(meta) => meta,
        other => panic!("expected git metadata, got {other:?}"),
    }
}

#[test]
fn scans_commit_history() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let first = commit_file(dir.path(), "config.env", b"API_KEY=abc123\nDEBUG=false\n", "add config");
    let second = commit_file(dir.path(), "notes.txt", b"the token is t0ps3cret\n", "add notes");

    let chunks = scan_directory(dir.path(), "");
    assert_eq!(chunks.len(), 2);

    let by_file = |name: &str| {
        chunks
            .iter()
            .find(|c| git_meta(c).file == name)
            .unwrap_or_else(|| panic!("no chunk for {name}"))
    };

    let config = by_file("config.env");
    assert_eq!(config.data, b"API_KEY=abc123\nDEBUG=false\n");
    let meta = git_meta(config);
    assert_eq!(meta.commit, first);
    assert_eq!(meta.email, "fixture@example.com");
    assert_eq!(meta.line, 1);
    assert!(!meta.timestamp.is_empty());

    let notes = by_file("notes.txt");
    assert_eq!(notes.data, b"the token is t0ps3cret\n");
    assert_eq!(git_meta(notes).commit, second);
}

#[test]
fn binary_files_fall_back_to_raw_chunking() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    // 20 KB with an early NUL so git treats the blob as binary.
    let mut blob = vec![0u8; 16];
    for i in 0..(20 * 1024 - 16) {
        blob.push((i % 251) as u8);
    }
    let hash = commit_file(dir.path(), "firmware.bin", &blob, "add firmware");

    let chunks = scan_directory(dir.path(), "");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].data, blob);
    let meta = git_meta(&chunks[0]);
    assert_eq!(meta.file, "firmware.bin");
    assert_eq!(meta.commit, hash);
    assert_eq!(meta.line, 0);
}

#[test]
fn base_commit_bounds_the_walk() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    commit_file(dir.path(), "one.txt", b"one\n", "c1");
    let base = commit_file(dir.path(), "two.txt", b"two\n", "c2");
    commit_file(dir.path(), "three.txt", b"three\n", "c3");
    commit_file(dir.path(), "four.txt", b"four\n", "c4");

    let chunks = scan_directory(dir.path(), &base);
    let mut files: Vec<String> = chunks.iter().map(|c| git_meta(c).file.clone()).collect();
    files.sort();
    assert_eq!(files, vec!["four.txt", "three.txt"]);
}

#[test]
fn staged_changes_are_scanned() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    commit_file(dir.path(), "README.md", b"hello\n", "init");

    std::fs::write(dir.path().join("staged.env"), b"STAGED_SECRET=wip\n").unwrap();
    git(dir.path(), &["add", "staged.env"]);

    let chunks = scan_directory(dir.path(), "");
    let staged: Vec<&Chunk> =
        chunks.iter().filter(|c| git_meta(c).commit == "Staged").collect();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].data, b"STAGED_SECRET=wip\n");
    assert_eq!(git_meta(staged[0]).file, "staged.env");
    assert!(!git_meta(staged[0]).timestamp.is_empty());
}

#[test]
fn multiple_directories_scan_through_the_worker_pool() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    init_repo(dir_a.path());
    init_repo(dir_b.path());
    commit_file(dir_a.path(), "a.env", b"A_TOKEN=aaa\n", "a");
    commit_file(dir_b.path(), "b.env", b"B_TOKEN=bbb\n", "b");

    let mut source = GitSource::new(
        GitConfig {
            directories: vec![
                dir_a.path().to_string_lossy().into_owned(),
                dir_b.path().to_string_lossy().into_owned(),
            ],
            ..GitConfig::default()
        },
        GitAuth::Unauthenticated,
    );
    source.init("git-test", 1, 1, false, 4).expect("init");

    let (tx, rx) = unbounded();
    source.chunks(&tx, &[], &CancelToken::new()).expect("scan");
    drop(tx);

    let chunks: Vec<Chunk> = rx.iter().collect();
    let mut files: Vec<String> = chunks.iter().map(|c| git_meta(c).file.clone()).collect();
    files.sort();
    assert_eq!(files, vec!["a.env", "b.env"]);

    let progress = source.progress();
    assert_eq!(progress.percent_complete, 100);
    assert!(progress.encoded_resume_info.is_empty());
}

#[test]
fn max_depth_limits_the_walk() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    commit_file(dir.path(), "a.txt", b"a\n", "c1");
    commit_file(dir.path(), "b.txt", b"b\n", "c2");
    commit_file(dir.path(), "c.txt", b"c\n", "c3");

    let mut source = GitSource::new(
        GitConfig {
            directories: vec![dir.path().to_string_lossy().into_owned()],
            max_depth: 1,
            ..GitConfig::default()
        },
        GitAuth::Unauthenticated,
    );
    source.init("git-test", 1, 1, false, 1).unwrap();
    let (tx, rx) = unbounded();
    source.chunks(&tx, &[], &CancelToken::new()).unwrap();
    drop(tx);

    let chunks: Vec<Chunk> = rx.iter().collect();
    // Newest first: depth 1 sees only the latest commit.
    assert_eq!(chunks.len(), 1);
    assert_eq!(git_meta(&chunks[0]).file, "c.txt");
}

#[test]
fn progress_reports_completion_for_directory_scans() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    commit_file(dir.path(), "a.txt", b"a\n", "c1");

    let mut source = GitSource::new(
        GitConfig {
            directories: vec![dir.path().to_string_lossy().into_owned()],
            ..GitConfig::default()
        },
        GitAuth::Unauthenticated,
    );
    source.init("git-test", 1, 1, false, 1).unwrap();
    let (tx, rx) = unbounded();
    source.chunks(&tx, &[], &CancelToken::new()).unwrap();
    drop(tx);
    let _ = rx.iter().count();

    let progress = source.progress();
    assert_eq!(progress.percent_complete, 100);
    assert!(progress.encoded_resume_info.is_empty());
}
