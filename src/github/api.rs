//! A minimal synchronous GitHub REST client.
//!
//! Built on blocking reqwest; every request funnels through the shared
//! [`RateLimiter`], so callers never see primary or secondary rate limits.
//! The response models are intentionally incomplete: only the fields the
//! enumerator consumes are deserialized.

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::connector::AppAuth;
use super::error::GithubError;
use super::ratelimit::RateLimiter;

/// The public GitHub REST endpoint.
pub const PUBLIC_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";
const PER_PAGE: usize = 100;

/// How credentials are attached to API requests.
#[derive(Clone)]
pub(crate) enum ApiAuth {
    None,
    Basic { user: String, password: Arc<SecretString> },
    Token(Arc<SecretString>),
    /// Short-lived app JWT, minted per request. Only valid for `/app/*`.
    AppJwt(Arc<AppAuth>),
    /// Installation token, cached and refreshed by [`AppAuth`].
    AppInstallation(Arc<AppAuth>),
}

impl ApiAuth {
    /// Attach these credentials to an outgoing request.
    pub(crate) fn apply(&self, req: RequestBuilder) -> Result<RequestBuilder, GithubError> {
        Ok(match self {
            ApiAuth::None => req,
            ApiAuth::Basic { user, password } => {
                req.basic_auth(user, Some(password.expose_secret()))
            }
            ApiAuth::Token(token) => req.bearer_auth(token.expose_secret()),
            ApiAuth::AppJwt(app) => req.bearer_auth(app.jwt()?),
            ApiAuth::AppInstallation(app) => {
                req.bearer_auth(app.installation_token()?.expose_secret())
            }
        })
    }
}

/// Normalize a configured endpoint into an API base URL.
///
/// Blank endpoints and the public host map to the public API. Anything
/// else is an enterprise install, with `/api/v3` appended when the caller
/// did not include an explicit API path.
pub fn normalize_endpoint(endpoint: &str) -> (String, bool) {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case(PUBLIC_API_URL)
        || trimmed.to_ascii_lowercase().ends_with("github.com")
    {
        return (PUBLIC_API_URL.to_string(), false);
    }
    let mut base = trimmed.to_string();
    if !base.to_ascii_lowercase().ends_with("/api/v3") {
        base.push_str("/api/v3");
    }
    (base, true)
}

/// The web host serving repositories for an API base, used to build clone
/// URLs and browser links.
pub fn repo_host(api_base: &str) -> String {
    if api_base.eq_ignore_ascii_case(PUBLIC_API_URL) {
        return "github.com".to_string();
    }
    api_base
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches("/api/v3")
        .to_string()
}

pub struct ApiClient {
    http: Client,
    api_base: String,
    auth: ApiAuth,
    limiter: Arc<RateLimiter>,
}

impl ApiClient {
    pub(crate) fn new(api_base: String, auth: ApiAuth, limiter: Arc<RateLimiter>) -> Self {
        let http = Client::builder()
            .user_agent(concat!("leakscan/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("building the GitHub HTTP client");
        Self { http, api_base, auth, limiter }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// The auth configuration, shared with the GraphQL client.
    pub(crate) fn auth(&self) -> &ApiAuth {
        &self.auth
    }

    fn apply_auth(&self, req: RequestBuilder) -> Result<RequestBuilder, GithubError> {
        self.auth.apply(req)
    }

    /// Issue a GET, transparently retrying through rate limits, and decode
    /// the JSON body.
    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GithubError> {
        let url = format!("{}{path}", self.api_base);
        loop {
            let req = self
                .http
                .get(&url)
                .header(ACCEPT, JSON_MEDIA_TYPE)
                .header("X-GitHub-Api-Version", API_VERSION)
                .query(query);
            let resp = self.apply_auth(req)?.send()?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp.json()?);
            }
            let headers = resp.headers().clone();
            let message = resp.text().unwrap_or_default();
            if self.limiter.handle_rest(status, &headers) {
                continue;
            }
            return Err(api_error(status, &url, message));
        }
    }

    /// Fetch a raw (non-JSON) resource, e.g. file contents.
    fn get_raw(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<u8>, GithubError> {
        let url = format!("{}{path}", self.api_base);
        loop {
            let req = self
                .http
                .get(&url)
                .header(ACCEPT, RAW_MEDIA_TYPE)
                .header("X-GitHub-Api-Version", API_VERSION)
                .query(query);
            let resp = self.apply_auth(req)?.send()?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp.bytes()?.to_vec());
            }
            let headers = resp.headers().clone();
            let message = resp.text().unwrap_or_default();
            if self.limiter.handle_rest(status, &headers) {
                continue;
            }
            return Err(api_error(status, &url, message));
        }
    }

    /// Drain every page of a list endpoint.
    fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, String)],
    ) -> Result<Vec<T>, GithubError> {
        let mut all = Vec::new();
        let mut page = 1usize;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            query.extend(extra.iter().map(|(k, v)| (*k, v.clone())));
            let items: Vec<T> = self.get_json(path, &query)?;
            let page_len = items.len();
            all.extend(items);
            if page_len < PER_PAGE {
                return Ok(all);
            }
            page += 1;
        }
    }

    // --- Endpoints ---

    pub fn current_user(&self) -> Result<User, GithubError> {
        self.get_json("/user", &[])
    }

    pub fn list_org_repos(&self, org: &str) -> Result<Vec<Repository>, GithubError> {
        self.get_paged(&format!("/orgs/{org}/repos"), &[("type", "all".to_string())])
    }

    pub fn list_user_repos(&self, user: &str) -> Result<Vec<Repository>, GithubError> {
        self.get_paged(&format!("/users/{user}/repos"), &[("type", "owner".to_string())])
    }

    /// Repos visible to the authenticated user.
    pub fn list_authenticated_repos(&self) -> Result<Vec<Repository>, GithubError> {
        self.get_paged("/user/repos", &[])
    }

    /// Orgs the authenticated user belongs to.
    pub fn list_authenticated_orgs(&self) -> Result<Vec<Org>, GithubError> {
        self.get_paged("/user/orgs", &[])
    }

    pub fn list_user_gists(&self, user: &str) -> Result<Vec<Gist>, GithubError> {
        self.get_paged(&format!("/users/{user}/gists"), &[])
    }

    pub fn list_authenticated_gists(&self) -> Result<Vec<Gist>, GithubError> {
        self.get_paged("/gists", &[])
    }

    pub fn list_org_members(&self, org: &str) -> Result<Vec<User>, GithubError> {
        self.get_paged(&format!("/orgs/{org}/members"), &[])
    }

    pub fn get_repo(&self, owner: &str, name: &str) -> Result<Repository, GithubError> {
        self.get_json(&format!("/repos/{owner}/{name}"), &[])
    }

    /// Installations of the app; requires app-JWT auth.
    pub fn list_app_installations(&self) -> Result<Vec<Installation>, GithubError> {
        self.get_paged("/app/installations", &[])
    }

    /// Repositories visible to the installation token.
    pub fn list_installation_repos(&self) -> Result<Vec<Repository>, GithubError> {
        let listed: InstallationRepositories =
            self.get_json("/installation/repositories", &[("per_page", PER_PAGE.to_string())])?;
        Ok(listed.repositories)
    }

    /// Raw file contents pinned to a commit.
    pub fn contents_raw(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, GithubError> {
        self.get_raw(
            &format!("/repos/{owner}/{repo}/contents/{path}"),
            &[("ref", reference.to_string())],
        )
    }

    /// Committer date of a commit, ISO 8601.
    pub fn commit_committed_at(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<String, GithubError> {
        let info: CommitInfo = self.get_json(&format!("/repos/{owner}/{repo}/commits/{sha}"), &[])?;
        Ok(info.commit.committer.date)
    }
}

fn api_error(status: StatusCode, url: &str, message: String) -> GithubError {
    let mut message = message.trim().to_string();
    if message.len() > 300 {
        message.truncate(300);
    }
    GithubError::Api { status: status.as_u16(), url: url.to_string(), message }
}

/// Look up a commit's committer timestamp on the public API, for shallow
/// clones bounded by a base commit. Requires `GITHUB_TOKEN`; any failure
/// quietly disables the optimization.
pub fn shallow_since_timestamp(owner: &str, repo: &str, sha: &str) -> Option<String> {
    let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty())?;
    let url = format!("{PUBLIC_API_URL}/repos/{owner}/{repo}/commits/{sha}");
    let resp = Client::new()
        .get(&url)
        .header(USER_AGENT, concat!("leakscan/", env!("CARGO_PKG_VERSION")))
        .header(ACCEPT, JSON_MEDIA_TYPE)
        .bearer_auth(&token)
        .send()
        .ok()?;
    if !resp.status().is_success() {
        log::debug!("shallow-since lookup for {owner}/{repo}@{sha} returned {}", resp.status());
        return None;
    }
    let info: CommitInfo = resp.json().ok()?;
    Some(info.commit.committer.date)
}

// --- Response models ---

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Org {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub private: bool,
    /// Size in kilobytes, as the API reports it.
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub has_wiki: bool,
    pub owner: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gist {
    pub id: String,
    pub git_pull_url: String,
    #[serde(default)]
    pub public: bool,
    pub owner: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub account: Option<User>,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositories {
    repositories: Vec<Repository>,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    committer: GitActor,
}

#[derive(Debug, Deserialize)]
struct GitActor {
    date: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", PUBLIC_API_URL, false)]
    #[case("https://api.github.com", PUBLIC_API_URL, false)]
    #[case("https://API.github.COM/", PUBLIC_API_URL, false)]
    #[case("https://github.com/", PUBLIC_API_URL, false)]
    #[case("https://ghe.example.com", "https://ghe.example.com/api/v3", true)]
    #[case("https://ghe.example.com/api/v3", "https://ghe.example.com/api/v3", true)]
    #[case("https://ghe.example.com/api/v3/", "https://ghe.example.com/api/v3", true)]
    fn endpoint_normalization(
        #[case] endpoint: &str,
        #[case] expected: &str,
        #[case] enterprise: bool,
    ) {
        let (base, is_enterprise) = normalize_endpoint(endpoint);
        assert_eq!(base, expected);
        assert_eq!(is_enterprise, enterprise);
    }

    #[test]
    fn repo_host_for_public_and_enterprise() {
        assert_eq!(repo_host(PUBLIC_API_URL), "github.com");
        assert_eq!(repo_host("https://ghe.example.com/api/v3"), "ghe.example.com");
    }

    #[test]
    fn repository_model_tolerates_missing_fields() {
        let repo: Repository = serde_json::from_str(
            r#"{"name":"widgets","full_name":"acme/widgets",
                "clone_url":"https://github.com/acme/widgets.git"}"#,
        )
        .unwrap();
        assert!(!repo.fork);
        assert!(!repo.private);
        assert_eq!(repo.size, 0);
    }

    #[test]
    fn commit_info_extracts_committer_date() {
        let info: CommitInfo = serde_json::from_str(
            r#"{"commit":{"committer":{"date":"2024-05-01T10:00:00Z"}}}"#,
        )
        .unwrap();
        assert_eq!(info.commit.committer.date, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn gist_model_parses_pull_url() {
        let gist: Gist = serde_json::from_str(
            r#"{"id":"abc123","git_pull_url":"https://gist.github.com/abc123.git",
                "public":true,"owner":{"login":"jane"}}"#,
        )
        .unwrap();
        assert_eq!(gist.git_pull_url, "https://gist.github.com/abc123.git");
        assert!(gist.public);
    }
}
