//! The git source: scans clonable repositories and local directories.

mod clone;
mod error;
mod log_parser;
mod options;
mod scan;

pub use clone::{ClonedRepo, clone_repo, ensure_git, parse_git_url, strip_password, url_parts, with_credentials};
pub use error::GitError;
pub use log_parser::{Commit, Diff};
pub use options::{LogOptions, ScanOptions};
pub use scan::{MetadataBuilder, MetadataContext, Scanner};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context as _;
use rand::seq::SliceRandom;
use secrecy::{ExposeSecret, SecretString};

use crate::chunk::SourceKind;
use crate::filter::PathFilter;
use crate::progress::Progress;
use crate::source::{
    CancelToken, ChunkReporter, ChunkingTarget, Source, SourceUnit, UnitKind, UnitReporter,
    UnitSource, effective_concurrency,
};

/// When set, enumerated repositories keep their configured order instead of
/// being shuffled.
const STABLE_ORDER_ENV: &str = "DO_NOT_RANDOMIZE";

/// Git source configuration, filled from the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct GitConfig {
    pub repositories: Vec<String>,
    pub directories: Vec<String>,
    pub base: String,
    pub head: String,
    /// -1 is unbounded.
    pub max_depth: i64,
    pub bare: bool,
    pub exclude_globs: Vec<String>,
    pub skip_binaries: bool,
    pub skip_archives: bool,
    pub include_paths_file: Option<PathBuf>,
    pub exclude_paths_file: Option<PathBuf>,
}

/// Credential variants for cloning.
#[derive(Default)]
pub enum GitAuth {
    #[default]
    Unauthenticated,
    /// Basic credentials embedded into HTTPS clone URLs.
    BasicAuth { user: String, password: SecretString },
    /// Rely on the ambient ssh agent and keys.
    Ssh,
}

pub struct GitSource {
    name: String,
    source_id: i64,
    job_id: i64,
    verify: bool,
    concurrency: usize,
    config: GitConfig,
    auth: GitAuth,
    scanner: Option<Arc<Scanner>>,
    progress: Arc<Mutex<Progress>>,
    repos_scanned: AtomicU64,
}

impl GitSource {
    pub fn new(config: GitConfig, auth: GitAuth) -> Self {
        Self {
            name: String::new(),
            source_id: 0,
            job_id: 0,
            verify: false,
            concurrency: 0,
            config,
            auth,
            scanner: None,
            progress: Arc::new(Mutex::new(Progress::default())),
            repos_scanned: AtomicU64::new(0),
        }
    }

    /// Seed resume state from a previous run's progress token.
    pub fn with_resume_info(self, encoded: &str) -> Self {
        self.progress.lock().expect("progress lock poisoned").encoded_resume_info =
            encoded.to_string();
        self
    }

    pub fn repos_scanned(&self) -> u64 {
        self.repos_scanned.load(Ordering::Relaxed)
    }

    fn scanner(&self) -> anyhow::Result<&Arc<Scanner>> {
        self.scanner.as_ref().context("git source used before init")
    }

    fn scan_options(&self) -> anyhow::Result<ScanOptions> {
        let filter = PathFilter::from_files(
            self.config.include_paths_file.as_deref(),
            self.config.exclude_paths_file.as_deref(),
        )
        .context("loading path filter files")?;
        Ok(ScanOptions::new()
            .with_filter(filter)
            .with_exclude_globs(&self.config.exclude_globs)
            .with_base_hash(self.config.base.clone())
            .with_head_hash(self.config.head.clone())
            .with_max_depth(self.config.max_depth)
            .with_bare(self.config.bare))
    }

    /// All configured work as units: repositories first, then directories.
    fn units(&self) -> Vec<SourceUnit> {
        let mut units: Vec<SourceUnit> =
            self.config.repositories.iter().map(SourceUnit::repo).collect();
        units.extend(self.config.directories.iter().map(SourceUnit::dir));
        units
    }

    /// Apply a resume token: keep only the units it lists, in its order.
    fn apply_resume(&self, mut units: Vec<SourceUnit>, encoded: &str) -> Vec<SourceUnit> {
        if encoded.is_empty() {
            return units;
        }
        let mut remaining = Vec::new();
        for id in encoded.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(pos) = units.iter().position(|u| u.id == id) {
                remaining.push(units.swap_remove(pos));
            }
        }
        remaining
    }

    fn scan_unit(
        &self,
        unit: &SourceUnit,
        options: &ScanOptions,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GitError> {
        let scanner = self.scanner.as_ref().expect("init before scanning");
        match unit.kind {
            UnitKind::Repo => {
                let parsed = parse_git_url(&unit.id)?;

                // A base commit bounds the scan; when the repo is on
                // github.com a token lets us bound the clone too.
                let mut extra_args: Vec<String> = Vec::new();
                if !self.config.base.is_empty() && parsed.host_str() == Some("github.com") {
                    if let [_, owner, repo] = url_parts(&parsed).as_slice() {
                        if let Some(since) = crate::github::shallow_since_timestamp(
                            owner,
                            repo,
                            &self.config.base,
                        ) {
                            extra_args = vec!["--shallow-since".into(), since];
                        }
                    }
                }
                let extra: Vec<&str> = extra_args.iter().map(String::as_str).collect();

                let clone_url = match (&self.auth, parsed.scheme()) {
                    (GitAuth::BasicAuth { user, password }, "http" | "https") => {
                        with_credentials(&parsed, user, password.expose_secret())
                    }
                    _ => parsed,
                };
                let cloned = clone_repo(&clone_url, &extra)?;
                scanner.scan_repo(cloned.path(), &unit.id, options, reporter, cancel)?;
                // `cloned` drops here; the working tree is removed.
            }
            UnitKind::Dir => {
                let path = std::path::Path::new(&unit.id);
                let options = if !options.bare && path.join(".git").exists() {
                    options.clone()
                } else {
                    options.clone().with_bare(true)
                };
                scanner.scan_repo(path, &unit.id, &options, reporter, cancel)?;
            }
        }
        self.repos_scanned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Source for GitSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    fn source_id(&self) -> i64 {
        self.source_id
    }

    fn job_id(&self) -> i64 {
        self.job_id
    }

    fn init(
        &mut self,
        name: &str,
        source_id: i64,
        job_id: i64,
        verify: bool,
        concurrency: usize,
    ) -> anyhow::Result<()> {
        ensure_git()?;
        if let GitAuth::BasicAuth { password, .. } = &self.auth {
            crate::redact::register_secret(password.expose_secret());
        }
        self.name = name.to_string();
        self.source_id = source_id;
        self.job_id = job_id;
        self.verify = verify;
        self.concurrency = effective_concurrency(concurrency as i64);
        self.scanner = Some(Arc::new(
            Scanner::new(name, source_id, job_id, verify)
                .with_skip_binaries(self.config.skip_binaries)
                .with_skip_archives(self.config.skip_archives),
        ));
        Ok(())
    }

    fn chunks(
        &mut self,
        reporter: &dyn ChunkReporter,
        targets: &[ChunkingTarget],
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        if !targets.is_empty() {
            anyhow::bail!("git source does not support targeted scans");
        }
        let options = self.scan_options()?;

        let resume =
            self.progress.lock().expect("progress lock poisoned").encoded_resume_info.clone();
        let mut units = self.apply_resume(self.units(), &resume);
        if std::env::var_os(STABLE_ORDER_ENV).is_none() {
            units.shuffle(&mut rand::thread_rng());
        }

        let total = units.len();
        let workers = self.concurrency.max(1).min(total.max(1));
        // Units not yet finished, in scheduling order; this is what the
        // resume token snapshots. In-flight units stay listed until done.
        let pending: Mutex<Vec<String>> =
            Mutex::new(units.iter().map(|u| u.id.clone()).collect());
        let fatal: Mutex<Option<GitError>> = Mutex::new(None);

        let (unit_tx, unit_rx) = crossbeam_channel::unbounded();
        for unit in units {
            let _ = unit_tx.send(unit);
        }
        drop(unit_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let unit_rx = unit_rx.clone();
                let pending = &pending;
                let fatal = &fatal;
                let options = &options;
                let source: &GitSource = self;
                let cancel = cancel.clone();
                scope.spawn(move || {
                    for unit in unit_rx.iter() {
                        if cancel.is_cancelled()
                            || fatal.lock().expect("fatal lock poisoned").is_some()
                        {
                            break;
                        }
                        if let Err(err) = source.scan_unit(&unit, options, reporter, &cancel) {
                            match err {
                                GitError::ChunkSend(_) | GitError::Cancelled => {
                                    *fatal.lock().expect("fatal lock poisoned") = Some(err);
                                    break;
                                }
                                other => log::error!("unit {unit} failed: {other}"),
                            }
                        }

                        // Failed units advance progress too; only work not
                        // yet finished belongs in the resume list.
                        let (done, remaining) = {
                            let mut pending =
                                pending.lock().expect("pending lock poisoned");
                            pending.retain(|id| id != &unit.id);
                            (total - pending.len(), pending.join(","))
                        };
                        source
                            .progress
                            .lock()
                            .expect("progress lock poisoned")
                            .set_progress_complete(
                                done,
                                total,
                                format!("scanned {unit}"),
                                remaining,
                            );
                    }
                });
            }
        });

        if let Some(err) = fatal.into_inner().expect("fatal lock poisoned") {
            return Err(err.into());
        }
        if cancel.is_cancelled() {
            let left = pending.lock().expect("pending lock poisoned").len();
            log::info!("git scan cancelled with {} of {total} units done", total - left);
            return Ok(());
        }

        self.progress
            .lock()
            .expect("progress lock poisoned")
            .finish(format!("git scan complete: {total} units"));
        log::debug!(
            "git source done: {} repos, {} commits",
            self.repos_scanned(),
            self.scanner()?.commits_scanned()
        );
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress.lock().expect("progress lock poisoned").clone()
    }
}

impl UnitSource for GitSource {
    fn enumerate(
        &mut self,
        reporter: &dyn UnitReporter,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        for repo in &self.config.repositories {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match parse_git_url(repo) {
                Ok(_) => reporter.unit_ok(SourceUnit::repo(repo))?,
                Err(err) => reporter.unit_err(err.into())?,
            }
        }
        for dir in &self.config.directories {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if std::path::Path::new(dir).exists() {
                reporter.unit_ok(SourceUnit::dir(dir))?;
            } else {
                reporter.unit_err(anyhow::anyhow!("directory {dir} does not exist"))?;
            }
        }
        Ok(())
    }

    fn chunk_unit(
        &mut self,
        unit: &SourceUnit,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        let options = self.scan_options()?;
        Ok(self.scan_unit(unit, &options, reporter, cancel)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn source_with_repos(repos: &[&str]) -> GitSource {
        GitSource::new(
            GitConfig {
                repositories: repos.iter().map(|s| s.to_string()).collect(),
                ..GitConfig::default()
            },
            GitAuth::Unauthenticated,
        )
    }

    #[test]
    fn units_cover_repos_and_dirs() {
        let source = GitSource::new(
            GitConfig {
                repositories: vec!["https://github.com/acme/widgets.git".into()],
                directories: vec!["/srv/checkouts/widgets".into()],
                ..GitConfig::default()
            },
            GitAuth::Unauthenticated,
        );
        let units = source.units();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, UnitKind::Repo);
        assert_eq!(units[1].kind, UnitKind::Dir);
    }

    #[test]
    fn resume_keeps_only_listed_units_in_order() {
        let source = source_with_repos(&[
            "https://example.com/a/one.git",
            "https://example.com/a/two.git",
            "https://example.com/a/three.git",
        ]);
        let units = source.apply_resume(
            source.units(),
            "https://example.com/a/three.git,https://example.com/a/one.git",
        );
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["https://example.com/a/three.git", "https://example.com/a/one.git"]);
    }

    #[test]
    fn empty_resume_keeps_everything() {
        let source = source_with_repos(&["https://example.com/a/one.git"]);
        assert_eq!(source.apply_resume(source.units(), "").len(), 1);
    }

    #[test]
    fn enumerate_reports_bad_urls_as_unit_errors() {
        let mut source = source_with_repos(&["https://example.com/a/ok.git", "not a url"]);
        let (units_tx, units_rx) = unbounded();
        let (errs_tx, errs_rx) = unbounded();
        let reporter = crate::source::UnitChannel { units: units_tx, errors: errs_tx };

        source.enumerate(&reporter, &CancelToken::new()).unwrap();
        drop(reporter);

        assert_eq!(units_rx.iter().count(), 1);
        assert_eq!(errs_rx.iter().count(), 1);
    }

    #[test]
    fn targeted_scan_is_rejected() {
        let mut source = source_with_repos(&[]);
        source.init("git", 1, 1, false, 1).unwrap();
        let (tx, _rx) = unbounded();
        let target = ChunkingTarget {
            secret_id: 9,
            query_criteria: crate::source::QueryCriteria {
                link: "https://github.com/acme/widgets".into(),
                commit: "abc".into(),
                file: "x".into(),
            },
        };
        assert!(source.chunks(&tx, &[target], &CancelToken::new()).is_err());
    }
}
