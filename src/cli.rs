//! Command-line surface: one subcommand per source kind.
//!
//! Each subcommand's flags mirror its source's configuration; credential
//! flags select the connector variant (the most privileged one provided
//! wins).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;

use crate::gcs::{GcsConfig, GcsCredential, GcsSource};
use crate::git::{GitAuth, GitConfig, GitSource};
use crate::github::{GithubConfig, GithubCredential, GithubSource};

#[derive(Parser)]
#[command(name = "leakscan", version, about = "Stream secret-scan chunks from git, GitHub, and GCS")]
pub struct Cli {
    /// Source name recorded in chunk provenance.
    #[arg(long, global = true, default_value = "leakscan")]
    pub name: String,

    #[arg(long, global = true, default_value_t = 0)]
    pub source_id: i64,

    #[arg(long, global = true, default_value_t = 0)]
    pub job_id: i64,

    /// Mark chunks for downstream verification.
    #[arg(long, global = true)]
    pub verify: bool,

    /// Worker count; 0 uses the logical CPU count.
    #[arg(long, global = true, default_value_t = 0)]
    pub concurrency: usize,

    /// Resume token from a previous run's progress output.
    #[arg(long, global = true)]
    pub resume: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scan git history of repositories and local directories.
    Git(GitArgs),
    /// Enumerate and scan GitHub orgs, users, repos, and gists.
    Github(GithubArgs),
    /// Scan objects in Google Cloud Storage buckets.
    Gcs(GcsArgs),
}

#[derive(Args)]
pub struct GitArgs {
    /// Repository URL to clone and scan; repeatable.
    #[arg(long = "repo")]
    pub repositories: Vec<String>,

    /// Local working tree or bare repo to scan in place; repeatable.
    #[arg(long = "directory")]
    pub directories: Vec<String>,

    /// Single repository URI (equivalent to one --repo).
    #[arg(long)]
    pub uri: Option<String>,

    /// Oldest commit to scan (exclusive); a ref or full hash.
    #[arg(long, default_value = "")]
    pub base: String,

    /// Newest commit to scan (inclusive); a ref or full hash.
    #[arg(long, default_value = "")]
    pub head: String,

    /// Maximum commits to walk; -1 is unbounded.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub max_depth: i64,

    /// Comma-separated globs excluded from scanning.
    #[arg(long, value_delimiter = ',')]
    pub exclude_globs: Vec<String>,

    /// Treat directories as bare repositories (skip the staged pass).
    #[arg(long)]
    pub bare: bool,

    #[arg(long)]
    pub skip_binaries: bool,

    #[arg(long)]
    pub skip_archives: bool,

    /// File of newline-separated include patterns.
    #[arg(long)]
    pub include_paths_file: Option<PathBuf>,

    /// File of newline-separated exclude patterns.
    #[arg(long)]
    pub exclude_paths_file: Option<PathBuf>,

    /// Basic-auth username for HTTPS clones.
    #[arg(long)]
    pub username: Option<String>,

    /// Basic-auth password for HTTPS clones.
    #[arg(long, env = "GIT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Clone over ssh using the ambient agent and keys.
    #[arg(long)]
    pub ssh: bool,
}

impl GitArgs {
    pub fn into_source(self) -> GitSource {
        let mut repositories = self.repositories;
        if let Some(uri) = self.uri {
            repositories.push(uri);
        }
        let auth = match (self.username, self.password, self.ssh) {
            (Some(user), Some(password), _) => {
                GitAuth::BasicAuth { user, password: SecretString::from(password) }
            }
            (_, _, true) => GitAuth::Ssh,
            _ => GitAuth::Unauthenticated,
        };
        GitSource::new(
            GitConfig {
                repositories,
                directories: self.directories,
                base: self.base,
                head: self.head,
                max_depth: self.max_depth,
                bare: self.bare,
                exclude_globs: self.exclude_globs,
                skip_binaries: self.skip_binaries,
                skip_archives: self.skip_archives,
                include_paths_file: self.include_paths_file,
                exclude_paths_file: self.exclude_paths_file,
            },
            auth,
        )
    }
}

#[derive(Args)]
pub struct GithubArgs {
    /// API endpoint; blank selects api.github.com, anything else is an
    /// enterprise install.
    #[arg(long, default_value = "")]
    pub endpoint: String,

    /// Organization to enumerate; repeatable. Falls back to user listing
    /// on 404.
    #[arg(long = "org")]
    pub organizations: Vec<String>,

    /// Explicit repository (URL or owner/repo); repeatable.
    #[arg(long = "repo")]
    pub repositories: Vec<String>,

    /// Comma-separated globs a repo's full name must match.
    #[arg(long, value_delimiter = ',')]
    pub include_repos: Vec<String>,

    /// Comma-separated globs removing repos from the scan.
    #[arg(long, value_delimiter = ',')]
    pub ignore_repos: Vec<String>,

    #[arg(long)]
    pub include_forks: bool,

    /// Also scan repository wikis.
    #[arg(long)]
    pub include_wikis: bool,

    /// With an app credential, also scan org members' repos and gists.
    #[arg(long)]
    pub scan_users: bool,

    #[arg(long)]
    pub include_issue_comments: bool,

    #[arg(long)]
    pub include_pr_comments: bool,

    /// Only scan comments updated within this many days; 0 scans all.
    #[arg(long, default_value_t = 0)]
    pub comments_timeframe_days: u32,

    /// OAuth token.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Basic-auth username.
    #[arg(long)]
    pub username: Option<String>,

    /// Basic-auth password.
    #[arg(long, hide_env_values = true, env = "GITHUB_PASSWORD")]
    pub password: Option<String>,

    /// GitHub App id; requires --installation-id and --private-key-file.
    #[arg(long)]
    pub app_id: Option<String>,

    #[arg(long)]
    pub installation_id: Option<String>,

    /// PEM file with the app's RSA private key.
    #[arg(long)]
    pub private_key_file: Option<PathBuf>,
}

impl GithubArgs {
    pub fn into_source(self) -> anyhow::Result<GithubSource> {
        let credential = match (
            self.app_id,
            self.installation_id,
            self.private_key_file,
            self.token,
            self.username,
            self.password,
        ) {
            (Some(app_id), Some(installation_id), Some(key_file), _, _, _) => {
                let private_key = std::fs::read_to_string(&key_file).map_err(|e| {
                    anyhow::anyhow!("reading {}: {e}", key_file.display())
                })?;
                GithubCredential::App {
                    app_id,
                    installation_id,
                    private_key: Arc::new(SecretString::from(private_key)),
                }
            }
            (Some(_), _, _, _, _, _) => {
                anyhow::bail!("--app-id requires --installation-id and --private-key-file")
            }
            (_, _, _, Some(token), _, _) => {
                GithubCredential::Token(Arc::new(SecretString::from(token)))
            }
            (_, _, _, _, Some(user), Some(password)) => GithubCredential::BasicAuth {
                user,
                password: Arc::new(SecretString::from(password)),
            },
            _ => GithubCredential::Unauthenticated,
        };
        Ok(GithubSource::new(
            GithubConfig {
                endpoint: self.endpoint,
                organizations: self.organizations,
                repositories: self.repositories,
                include_repos: self.include_repos,
                ignore_repos: self.ignore_repos,
                include_forks: self.include_forks,
                include_wikis: self.include_wikis,
                scan_users: self.scan_users,
                include_issue_comments: self.include_issue_comments,
                include_pr_comments: self.include_pr_comments,
                comments_timeframe_days: self.comments_timeframe_days,
            },
            credential,
        ))
    }
}

#[derive(Args)]
pub struct GcsArgs {
    #[arg(long)]
    pub project_id: String,

    /// Comma-separated bucket globs to include (overrides excludes).
    #[arg(long, value_delimiter = ',')]
    pub include_buckets: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub exclude_buckets: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub include_objects: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub exclude_objects: Vec<String>,

    /// Per-object size cap in bytes; capped at 50 MiB.
    #[arg(long, default_value_t = 0)]
    pub max_object_size: u64,

    /// API key (public buckets only).
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Service-account JSON key file.
    #[arg(long)]
    pub service_account_file: Option<PathBuf>,

    /// Use application default credentials.
    #[arg(long)]
    pub adc: bool,

    /// OAuth2 client id for the refresh-token flow.
    #[arg(long)]
    pub oauth_client_id: Option<String>,

    #[arg(long, hide_env_values = true, env = "GCS_ACCESS_TOKEN")]
    pub oauth_access_token: Option<String>,

    #[arg(long, hide_env_values = true, env = "GCS_REFRESH_TOKEN")]
    pub oauth_refresh_token: Option<String>,
}

impl GcsArgs {
    pub fn into_source(self) -> GcsSource {
        let credential = if let Some(path) = self.service_account_file {
            GcsCredential::ServiceAccountFile(path)
        } else if self.adc {
            GcsCredential::ApplicationDefault
        } else if let (Some(client_id), Some(access), Some(refresh)) =
            (self.oauth_client_id, self.oauth_access_token, self.oauth_refresh_token)
        {
            GcsCredential::Oauth2 {
                client_id,
                access_token: Arc::new(SecretString::from(access)),
                refresh_token: Arc::new(SecretString::from(refresh)),
            }
        } else if let Some(key) = self.api_key {
            GcsCredential::ApiKey(Arc::new(SecretString::from(key)))
        } else {
            GcsCredential::Unauthenticated
        };
        GcsSource::new(
            GcsConfig {
                project_id: self.project_id,
                include_buckets: self.include_buckets,
                exclude_buckets: self.exclude_buckets,
                include_objects: self.include_objects,
                exclude_objects: self.exclude_objects,
                max_object_size: self.max_object_size,
            },
            credential,
        )
    }
}
