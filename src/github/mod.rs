//! The GitHub source: credential-aware discovery and repository scanning.
//!
//! Enumeration populates the filtered repo cache through whichever paths
//! the credential allows (explicit URLs, orgs with user fallback, the
//! authenticated user's repos and gists, app installations, org members).
//! Chunking then clones each admitted repository once and drives the git
//! scanner with GitHub provenance, optionally followed by issue and
//! pull-request discussion through GraphQL.

mod api;
mod connector;
mod error;
mod graphql;
mod ratelimit;
mod repo_cache;

pub use api::{
    ApiClient, Gist, PUBLIC_API_URL, Repository, normalize_endpoint, repo_host,
    shallow_since_timestamp,
};
pub use connector::{Connector, GithubCredential, new_connector};
pub use error::GithubError;
pub use graphql::{CommentChunk, GraphqlClient};
pub use ratelimit::{ErrorReporter, RateLimiter};
pub use repo_cache::{FilteredRepoCache, RepoInfo, RepoInfoCache};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;

use crate::chunk::{Chunk, GithubMetadata, SourceKind, SourceMetadata, Visibility};
use crate::filter::FilterSet;
use crate::git::{Scanner, ScanOptions, parse_git_url, url_parts};
use crate::handler::{BufferedReader, FileHandler, NoopHandler};
use crate::progress::Progress;
use crate::source::{
    CancelToken, ChunkReporter, ChunkingTarget, Source, TargetedScanError, TargetedScanErrors,
    effective_concurrency,
};

/// GitHub source configuration, filled from the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct GithubConfig {
    /// Blank or the public host selects api.github.com; anything else is an
    /// enterprise endpoint.
    pub endpoint: String,
    pub organizations: Vec<String>,
    pub repositories: Vec<String>,
    pub include_repos: Vec<String>,
    pub ignore_repos: Vec<String>,
    pub include_forks: bool,
    /// Also scan each repo's wiki, when it has one. Wikis are plain git
    /// repos served at `<repo>.wiki.git`.
    pub include_wikis: bool,
    /// For app credentials: also walk org members' repos and gists.
    pub scan_users: bool,
    pub include_issue_comments: bool,
    pub include_pr_comments: bool,
    /// Only comments updated within this many days are scanned; 0 scans
    /// everything.
    pub comments_timeframe_days: u32,
}

enum CredentialKind {
    Unauthenticated,
    BasicAuth,
    Token,
    App,
}

pub struct GithubSource {
    name: String,
    source_id: i64,
    job_id: i64,
    verify: bool,
    concurrency: usize,
    config: GithubConfig,
    credential: GithubCredential,
    credential_kind: CredentialKind,
    limiter: Arc<RateLimiter>,
    connector: Option<Box<dyn Connector>>,
    graphql: Option<GraphqlClient>,
    repo_cache: FilteredRepoCache,
    /// Orgs already walked, so overlapping discovery paths (configured
    /// orgs, owned orgs, installation accounts) enumerate each once.
    seen_orgs: FilterSet,
    repo_info: Arc<RepoInfoCache>,
    handler: Arc<dyn FileHandler>,
    progress: Arc<Mutex<Progress>>,
    orgs_enumerated: AtomicU64,
    forks_skipped: AtomicU64,
    gists_enumerated: AtomicU64,
    commits_scanned: AtomicU64,
}

impl GithubSource {
    pub fn new(config: GithubConfig, credential: GithubCredential) -> Self {
        let credential_kind = match &credential {
            GithubCredential::Unauthenticated => CredentialKind::Unauthenticated,
            GithubCredential::BasicAuth { .. } => CredentialKind::BasicAuth,
            GithubCredential::Token(_) => CredentialKind::Token,
            GithubCredential::App { .. } => CredentialKind::App,
        };
        let repo_cache = FilteredRepoCache::new(&config.include_repos, &config.ignore_repos);
        Self {
            name: String::new(),
            source_id: 0,
            job_id: 0,
            verify: false,
            concurrency: 0,
            config,
            credential,
            credential_kind,
            limiter: Arc::new(RateLimiter::default()),
            connector: None,
            graphql: None,
            repo_cache,
            seen_orgs: FilterSet::new(&[], &[]),
            repo_info: Arc::new(RepoInfoCache::new()),
            handler: Arc::new(NoopHandler),
            progress: Arc::new(Mutex::new(Progress::default())),
            orgs_enumerated: AtomicU64::new(0),
            forks_skipped: AtomicU64::new(0),
            gists_enumerated: AtomicU64::new(0),
            commits_scanned: AtomicU64::new(0),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn orgs_enumerated(&self) -> u64 {
        self.orgs_enumerated.load(Ordering::Relaxed)
    }

    pub fn repos_enumerated(&self) -> usize {
        self.repo_cache.len()
    }

    pub fn gists_enumerated(&self) -> u64 {
        self.gists_enumerated.load(Ordering::Relaxed)
    }

    fn connector(&self) -> Result<&dyn Connector, GithubError> {
        self.connector
            .as_deref()
            .ok_or_else(|| GithubError::Auth("source used before init".to_string()))
    }

    fn api(&self) -> Result<&ApiClient, GithubError> {
        Ok(self.connector()?.api_client())
    }

    /// The web host serving this source's repositories.
    fn web_host(&self) -> Result<String, GithubError> {
        Ok(repo_host(self.api()?.api_base()))
    }

    /// Turn a configured repository string into a clone URL.
    ///
    /// Bare words fail; `owner/repo` is expanded onto the configured host;
    /// full URLs pass through with the host lowercased.
    fn normalize_repo(&self, input: &str) -> Result<String, GithubError> {
        let input = input.trim();
        if input.contains("://") {
            let mut url =
                parse_git_url(input).map_err(|_| GithubError::RepoParse { input: input.into() })?;
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            url.set_host(Some(&host))
                .map_err(|_| GithubError::RepoParse { input: input.into() })?;
            return Ok(url.to_string().trim_end_matches('/').to_string());
        }
        if input.contains('/') {
            return Ok(format!("https://{}/{}.git", self.web_host()?, input.trim_matches('/')));
        }
        Err(GithubError::RepoParse { input: input.into() })
    }

    // --- Enumeration ---

    fn enumerate_all(&mut self) -> Result<(), GithubError> {
        self.enumerate_explicit_repos();
        match self.credential_kind {
            CredentialKind::Unauthenticated | CredentialKind::BasicAuth => {
                let orgs = self.config.organizations.clone();
                for org in orgs {
                    self.enumerate_org_with_fallback(&org);
                }
            }
            CredentialKind::Token => self.enumerate_with_token()?,
            CredentialKind::App => self.enumerate_with_app()?,
        }
        log::info!(
            "enumerated {} repos across {} orgs ({} gists, {} forks skipped)",
            self.repo_cache.len(),
            self.orgs_enumerated(),
            self.gists_enumerated(),
            self.forks_skipped.load(Ordering::Relaxed),
        );
        Ok(())
    }

    fn enumerate_explicit_repos(&mut self) {
        let inputs = self.config.repositories.clone();
        for input in inputs {
            let fetched = self.normalize_repo(&input).and_then(|url| {
                let (owner, name) = owner_and_repo(&url)?;
                self.api()?.get_repo(&owner, &name)
            });
            match fetched {
                Ok(repo) => self.add_repo(&repo),
                Err(err) => log::error!("skipping configured repo {input:?}: {err}"),
            }
        }
    }

    /// Org listing with the 404-driven fallback to user listing. Each org
    /// is walked at most once regardless of how it was discovered.
    fn enumerate_org_with_fallback(&mut self, org: &str) {
        if !self.seen_orgs.add(org) {
            return;
        }
        let listed = match self.api().and_then(|api| api.list_org_repos(org)) {
            Ok(repos) => {
                self.orgs_enumerated.fetch_add(1, Ordering::Relaxed);
                Ok(repos)
            }
            Err(err) if err.is_not_found() => {
                log::debug!("{org} is not an org, listing as a user");
                self.api().and_then(|api| api.list_user_repos(org))
            }
            Err(err) => Err(err),
        };
        match listed {
            Ok(repos) => {
                for repo in &repos {
                    self.add_repo(repo);
                }
            }
            Err(err) => log::error!("enumerating {org} failed: {err}"),
        }
    }

    fn enumerate_with_token(&mut self) -> Result<(), GithubError> {
        let login = {
            let token = self
                .connector()?
                .as_token()
                .ok_or_else(|| GithubError::Auth("token connector expected".into()))?;
            token.authenticated_login()?.to_string()
        };
        log::debug!("scanning as {login}");

        let orgs = self.config.organizations.clone();
        for org in &orgs {
            self.enumerate_org_with_fallback(org);
        }

        // Nothing explicitly selected: fall back to everything the token
        // can see, including the user's own gists.
        if orgs.is_empty() && self.config.repositories.is_empty() {
            let listed = self.api()?.list_authenticated_repos();
            match listed {
                Ok(repos) => {
                    for repo in &repos {
                        self.add_repo(repo);
                    }
                }
                Err(err) => log::error!("listing repos for {login} failed: {err}"),
            }
            let listed = self.api()?.list_authenticated_gists();
            match listed {
                Ok(gists) => {
                    for gist in &gists {
                        self.add_gist(gist);
                    }
                }
                Err(err) => log::error!("listing gists for {login} failed: {err}"),
            }
            let listed = self.api()?.list_authenticated_orgs();
            match listed {
                Ok(owned) => {
                    for org in owned {
                        self.enumerate_org_with_fallback(&org.login);
                    }
                }
                Err(err) => log::error!("listing orgs for {login} failed: {err}"),
            }
        }
        Ok(())
    }

    fn enumerate_with_app(&mut self) -> Result<(), GithubError> {
        let installations = {
            let app = self
                .connector()?
                .as_app()
                .ok_or_else(|| GithubError::Auth("app connector expected".into()))?;
            app.apps_api().list_app_installations()?
        };
        self.orgs_enumerated.fetch_add(installations.len() as u64, Ordering::Relaxed);

        let repos = self.api()?.list_installation_repos()?;
        for repo in &repos {
            self.add_repo(repo);
        }

        if self.config.scan_users {
            for installation in installations {
                let Some(account) = installation.account else { continue };
                let listed = self.api()?.list_org_members(&account.login);
                let members = match listed {
                    Ok(members) => members,
                    Err(err) => {
                        log::error!("listing members of {} failed: {err}", account.login);
                        continue;
                    }
                };
                for member in members {
                    let gists = self.api()?.list_user_gists(&member.login);
                    if let Ok(gists) = gists {
                        for gist in &gists {
                            self.add_gist(gist);
                        }
                    }
                    let listed = self.api()?.list_user_repos(&member.login);
                    match listed {
                        Ok(repos) => {
                            for repo in &repos {
                                self.add_repo(repo);
                            }
                        }
                        Err(err) => {
                            log::error!("listing repos of {} failed: {err}", member.login)
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn add_repo(&mut self, repo: &Repository) {
        if repo.fork && !self.config.include_forks {
            self.forks_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.repo_cache.insert(&repo.full_name, &repo.clone_url) {
            let owner = repo
                .owner
                .as_ref()
                .map(|o| o.login.clone())
                .unwrap_or_else(|| {
                    repo.full_name.split('/').next().unwrap_or_default().to_string()
                });
            let info = RepoInfo {
                owner,
                name: repo.name.clone(),
                full_name: repo.full_name.clone(),
                has_wiki: repo.has_wiki,
                size_kb: repo.size,
                visibility: if repo.private { Visibility::Private } else { Visibility::Public },
            };
            self.repo_info.put(&repo.clone_url, info.clone());

            if self.config.include_wikis && repo.has_wiki {
                let wiki_name = format!("{}.wiki", repo.full_name);
                let wiki_url = wiki_clone_url(&repo.clone_url);
                if self.repo_cache.insert(&wiki_name, &wiki_url) {
                    self.repo_info.put(
                        &wiki_url,
                        RepoInfo { full_name: wiki_name, ..info },
                    );
                }
            }
        }
    }

    /// Gists scan like repos, addressed by their pull URL.
    fn add_gist(&mut self, gist: &api::Gist) {
        if self.repo_cache.insert(&gist.id, &gist.git_pull_url) {
            self.gists_enumerated.fetch_add(1, Ordering::Relaxed);
            self.repo_info.put(
                &gist.git_pull_url,
                RepoInfo {
                    owner: gist.owner.as_ref().map(|o| o.login.clone()).unwrap_or_default(),
                    name: gist.id.clone(),
                    full_name: gist.id.clone(),
                    has_wiki: false,
                    size_kb: 0,
                    visibility: if gist.public { Visibility::Public } else { Visibility::Shared },
                },
            );
        }
    }

    // --- Chunking ---

    fn comment_cutoff(&self) -> Option<chrono::DateTime<Utc>> {
        if self.config.comments_timeframe_days == 0 {
            return None;
        }
        Some(Utc::now() - ChronoDuration::days(i64::from(self.config.comments_timeframe_days)))
    }

    fn scan_repo_url(
        &self,
        url: &str,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GithubError> {
        let info = self.repo_info.get(url).unwrap_or_default();
        let cloned = self.connector()?.clone_repo(url)?;

        let repo_url = url.to_string();
        let link_base = blob_link_base(url);
        let username = info.owner.clone();
        let visibility = info.visibility;
        let builder: crate::git::MetadataBuilder = Arc::new(move |ctx| {
            SourceMetadata::Github(GithubMetadata {
                commit: ctx.commit.to_string(),
                file: ctx.file.to_string(),
                email: ctx.email.to_string(),
                repository: repo_url.clone(),
                timestamp: ctx.timestamp.to_string(),
                line: ctx.line,
                link: blob_link(&link_base, ctx.commit, ctx.file, ctx.line),
                username: username.clone(),
                visibility,
            })
        });

        let scanner = Scanner::new(&self.name, self.source_id, self.job_id, self.verify)
            .with_handler(self.handler.clone())
            .with_metadata_builder(SourceKind::Github, builder);
        scanner.scan_repo(cloned.path(), url, &ScanOptions::new(), reporter, cancel)?;
        self.commits_scanned.fetch_add(scanner.commits_scanned(), Ordering::Relaxed);
        // The clone drops here; its working tree is removed before comment
        // scanning starts.
        drop(cloned);

        if self.config.include_issue_comments || self.config.include_pr_comments {
            self.scan_comments(url, &info, reporter)?;
        }
        Ok(())
    }

    fn scan_comments(
        &self,
        url: &str,
        info: &RepoInfo,
        reporter: &dyn ChunkReporter,
    ) -> Result<(), GithubError> {
        let Some(graphql) = &self.graphql else {
            return Ok(());
        };
        let (owner, name) = owner_and_repo(url)?;
        let cutoff = self.comment_cutoff();
        let visibility = info.visibility;

        let mut emit = |comment: CommentChunk| -> anyhow::Result<()> {
            reporter.chunk_ok(Chunk {
                source_name: self.name.clone(),
                source_kind: SourceKind::Github,
                source_id: self.source_id,
                job_id: self.job_id,
                secret_id: None,
                data: comment.text.into_bytes(),
                verify: self.verify,
                metadata: SourceMetadata::Github(GithubMetadata {
                    commit: String::new(),
                    file: String::new(),
                    email: String::new(),
                    repository: url.to_string(),
                    timestamp: comment.updated_at,
                    line: 0,
                    link: comment.link,
                    username: comment.username,
                    visibility,
                }),
            })
        };

        if self.config.include_issue_comments {
            graphql.scan_issues(&owner, &name, cutoff, &mut emit)?;
        }
        if self.config.include_pr_comments {
            graphql.scan_pull_requests(&owner, &name, cutoff, &mut emit)?;
        }
        Ok(())
    }

    // --- Targeted scans ---

    fn scan_targets(
        &self,
        targets: &[ChunkingTarget],
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GithubError> {
        let mut failures = Vec::new();
        for target in targets {
            if cancel.is_cancelled() {
                return Err(GithubError::Cancelled);
            }
            match self.scan_one_target(target, reporter) {
                Ok(()) => {}
                Err(err @ GithubError::ChunkSend(_)) => return Err(err),
                Err(err) => failures.push(TargetedScanError {
                    secret_id: target.secret_id,
                    source: err.into(),
                }),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GithubError::Targeted(TargetedScanErrors(failures)))
        }
    }

    fn scan_one_target(
        &self,
        target: &ChunkingTarget,
        reporter: &dyn ChunkReporter,
    ) -> Result<(), GithubError> {
        let criteria = &target.query_criteria;
        let (owner, name) = owner_and_repo(&criteria.link)?;
        let bytes = self.api()?.contents_raw(&owner, &name, &criteria.file, &criteria.commit)?;

        let skeleton = Chunk {
            source_name: self.name.clone(),
            source_kind: SourceKind::Github,
            source_id: self.source_id,
            job_id: self.job_id,
            secret_id: Some(target.secret_id),
            data: Vec::new(),
            verify: self.verify,
            metadata: SourceMetadata::Github(GithubMetadata {
                commit: criteria.commit.clone(),
                file: criteria.file.clone(),
                email: String::new(),
                repository: criteria.link.clone(),
                timestamp: String::new(),
                line: 0,
                link: criteria.link.clone(),
                username: owner.clone(),
                visibility: Visibility::Unknown,
            }),
        };

        let mut reader = BufferedReader::spool(&mut bytes.as_slice())?;
        if self.handler.handle(&criteria.file, &mut reader, &skeleton, reporter, false) {
            return Ok(());
        }
        reader.rewind()?;
        let data = reader.slurp()?;
        reporter
            .chunk_ok(Chunk { data, ..skeleton })
            .map_err(|e| GithubError::ChunkSend(e.to_string()))
    }
}

impl Source for GithubSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Github
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
        crate::git::ensure_git()?;
        self.name = name.to_string();
        self.source_id = source_id;
        self.job_id = job_id;
        self.verify = verify;
        self.concurrency = effective_concurrency(concurrency as i64);

        let connector =
            connector::new_connector(&self.config.endpoint, &self.credential, self.limiter.clone())?;
        if self.config.include_issue_comments || self.config.include_pr_comments {
            let api = connector.api_client();
            self.graphql = Some(GraphqlClient::new(
                api.api_base(),
                api.auth().clone(),
                self.limiter.clone(),
            ));
        }
        self.connector = Some(connector);
        Ok(())
    }

    fn chunks(
        &mut self,
        reporter: &dyn ChunkReporter,
        targets: &[ChunkingTarget],
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        if !targets.is_empty() {
            return Ok(self.scan_targets(targets, reporter, cancel)?);
        }

        self.enumerate_all()?;

        let mut urls = self.repo_cache.clone_urls();
        if std::env::var_os("DO_NOT_RANDOMIZE").is_none() {
            urls.shuffle(&mut rand::thread_rng());
        }

        let total = urls.len();
        let workers = self.concurrency.max(1).min(total.max(1));
        let fatal: Mutex<Option<GithubError>> = Mutex::new(None);

        let (url_tx, url_rx) = crossbeam_channel::unbounded();
        for url in urls {
            let _ = url_tx.send(url);
        }
        drop(url_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let url_rx = url_rx.clone();
                let fatal = &fatal;
                let source: &GithubSource = self;
                let cancel = cancel.clone();
                scope.spawn(move || {
                    for url in url_rx.iter() {
                        if cancel.is_cancelled()
                            || fatal.lock().expect("fatal lock poisoned").is_some()
                        {
                            break;
                        }
                        if let Err(err) = source.scan_repo_url(&url, reporter, &cancel) {
                            match err {
                                GithubError::ChunkSend(_) | GithubError::Cancelled => {
                                    *fatal.lock().expect("fatal lock poisoned") = Some(err);
                                    break;
                                }
                                other => log::error!("repo {url} failed: {other}"),
                            }
                        }
                        let mut progress =
                            source.progress.lock().expect("progress lock poisoned");
                        let completed = progress.sections_completed as usize + 1;
                        progress.set_progress_complete(
                            completed,
                            total,
                            format!("scanned {url}"),
                            String::new(),
                        );
                    }
                });
            }
        });

        if let Some(err) = fatal.into_inner().expect("fatal lock poisoned") {
            return Err(err.into());
        }
        if cancel.is_cancelled() {
            let done = self.progress.lock().expect("progress lock poisoned").sections_completed;
            log::info!("github scan cancelled with {done} of {total} repos done");
            return Ok(());
        }

        self.progress
            .lock()
            .expect("progress lock poisoned")
            .finish(format!("github scan complete: {total} repos"));
        log::debug!(
            "github source done: {} commits, rate limited {} times for {}s",
            self.commits_scanned.load(Ordering::Relaxed),
            self.limiter.encounters(),
            self.limiter.seconds_spent(),
        );
        self.repo_info.clear();
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress.lock().expect("progress lock poisoned").clone()
    }
}

/// `(owner, repo)` from a repository URL, tolerant of `.git` suffixes and
/// gist-style single-segment paths.
fn owner_and_repo(url: &str) -> Result<(String, String), GithubError> {
    let parsed = parse_git_url(url).map_err(|_| GithubError::RepoParse { input: url.into() })?;
    let parts = url_parts(&parsed);
    match parts.as_slice() {
        [_host, owner, repo, ..] => Ok((owner.clone(), repo.clone())),
        _ => Err(GithubError::RepoParse { input: url.into() }),
    }
}

/// A repo's wiki lives at the same path with a `.wiki.git` suffix.
fn wiki_clone_url(clone_url: &str) -> String {
    format!("{}.wiki.git", clone_url.trim_end_matches('/').trim_end_matches(".git"))
}

/// Browser base for blob links: the clone URL without its `.git` suffix.
fn blob_link_base(clone_url: &str) -> String {
    clone_url.trim_end_matches('/').trim_end_matches(".git").to_string()
}

fn blob_link(base: &str, commit: &str, file: &str, line: i64) -> String {
    if commit.is_empty() || file.is_empty() {
        return base.to_string();
    }
    if line > 0 {
        format!("{base}/blob/{commit}/{file}#L{line}")
    } else {
        format!("{base}/blob/{commit}/{file}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(config: GithubConfig) -> GithubSource {
        GithubSource::new(config, GithubCredential::Unauthenticated)
    }

    #[test]
    fn owner_and_repo_from_urls() {
        let (owner, repo) =
            owner_and_repo("https://github.com/acme-corp/widget-factory.git").unwrap();
        assert_eq!(owner, "acme-corp");
        assert_eq!(repo, "widget-factory");

        assert!(owner_and_repo("https://github.com/").is_err());
    }

    #[test]
    fn blob_links_point_at_commit_and_line() {
        let base = blob_link_base("https://github.com/acme/widgets.git");
        assert_eq!(base, "https://github.com/acme/widgets");
        assert_eq!(
            blob_link(&base, "deadbeef", "src/config.rs", 12),
            "https://github.com/acme/widgets/blob/deadbeef/src/config.rs#L12"
        );
        assert_eq!(blob_link(&base, "", "", 0), base);
    }

    #[test]
    fn add_repo_skips_forks_by_default() {
        let mut src = source(GithubConfig::default());
        let fork: Repository = serde_json::from_str(
            r#"{"name":"widgets","full_name":"acme/widgets",
                "clone_url":"https://github.com/acme/widgets.git","fork":true}"#,
        )
        .unwrap();
        src.add_repo(&fork);
        assert_eq!(src.repos_enumerated(), 0);

        let mut src = source(GithubConfig { include_forks: true, ..GithubConfig::default() });
        src.add_repo(&fork);
        assert_eq!(src.repos_enumerated(), 1);
    }

    #[test]
    fn add_repo_applies_include_and_ignore_lists() {
        let mut src = source(GithubConfig {
            include_repos: vec!["org/*".into()],
            ignore_repos: vec!["org/repo1".into()],
            ..GithubConfig::default()
        });
        let mk = |full_name: &str| -> Repository {
            serde_json::from_str(&format!(
                r#"{{"name":"x","full_name":"{full_name}",
                    "clone_url":"https://github.com/{full_name}.git"}}"#
            ))
            .unwrap()
        };
        src.add_repo(&mk("org/repo2"));
        src.add_repo(&mk("org/repo1"));
        src.add_repo(&mk("other/x"));
        assert_eq!(src.repos_enumerated(), 1);
    }

    #[test]
    fn duplicate_discovery_paths_scan_once() {
        let mut src = source(GithubConfig::default());
        let repo: Repository = serde_json::from_str(
            r#"{"name":"widgets","full_name":"acme/widgets",
                "clone_url":"https://github.com/acme/widgets.git"}"#,
        )
        .unwrap();
        src.add_repo(&repo);
        src.add_repo(&repo);
        assert_eq!(src.repos_enumerated(), 1);
    }

    #[test]
    fn wikis_enumerate_alongside_their_repo() {
        let repo: Repository = serde_json::from_str(
            r#"{"name":"widgets","full_name":"acme/widgets",
                "clone_url":"https://github.com/acme/widgets.git","has_wiki":true}"#,
        )
        .unwrap();

        let mut src = source(GithubConfig { include_wikis: true, ..GithubConfig::default() });
        src.add_repo(&repo);
        assert_eq!(src.repos_enumerated(), 2);
        let wiki = src.repo_info.get("https://github.com/acme/widgets.wiki.git").unwrap();
        assert_eq!(wiki.full_name, "acme/widgets.wiki");

        // Off by default, and never for wiki-less repos.
        let mut src = source(GithubConfig::default());
        src.add_repo(&repo);
        assert_eq!(src.repos_enumerated(), 1);
    }

    #[test]
    fn gists_are_tracked_by_pull_url() {
        let mut src = source(GithubConfig::default());
        let gist: api::Gist = serde_json::from_str(
            r#"{"id":"abc123","git_pull_url":"https://gist.github.com/abc123.git",
                "public":false,"owner":{"login":"jane"}}"#,
        )
        .unwrap();
        src.add_gist(&gist);
        assert_eq!(src.gists_enumerated(), 1);
        let info = src.repo_info.get("https://gist.github.com/abc123.git").unwrap();
        assert_eq!(info.visibility, Visibility::Shared);
        assert_eq!(info.owner, "jane");
    }

    #[test]
    fn comment_cutoff_respects_timeframe() {
        let src = source(GithubConfig { comments_timeframe_days: 30, ..GithubConfig::default() });
        let cutoff = src.comment_cutoff().unwrap();
        assert!(cutoff < Utc::now());

        let src = source(GithubConfig::default());
        assert!(src.comment_cutoff().is_none());
    }
}
