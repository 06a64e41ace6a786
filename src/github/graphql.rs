//! GraphQL scanning of issue and pull-request discussion.
//!
//! Pagination runs on three axes: the issue/PR list, each item's comment
//! list, and (for PRs) the review-thread list with its own per-thread
//! comment pages. Review-thread comments are batch-fetched by node id in
//! groups of up to 100, with a per-thread drill-down for threads whose
//! comment list does not fit one page.
//!
//! Every query carries a `rateLimit` side channel that feeds the shared
//! [`RateLimiter`]; when the limiter says retry, the same query is
//! re-issued after the process-wide resume time passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::api::{ApiAuth, PUBLIC_API_URL};
use super::error::GithubError;
use super::ratelimit::RateLimiter;

/// Review-thread ids per batched comment fetch.
const THREAD_BATCH_SIZE: usize = 100;

/// The GraphQL endpoint for an API base: the public API serves it at
/// `/graphql`, enterprise installs at `/api/graphql`.
pub fn graphql_url(api_base: &str) -> String {
    if api_base.eq_ignore_ascii_case(PUBLIC_API_URL) {
        return format!("{PUBLIC_API_URL}/graphql");
    }
    let root = api_base.trim_end_matches("/api/v3");
    format!("{root}/api/graphql")
}

/// One piece of discussion text bound for the chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentChunk {
    pub text: String,
    pub link: String,
    pub username: String,
    pub updated_at: String,
}

/// Emits comment chunks; a delivery failure aborts the scan.
pub type CommentSink<'a> = dyn FnMut(CommentChunk) -> anyhow::Result<()> + 'a;

pub struct GraphqlClient {
    http: Client,
    url: String,
    auth: ApiAuth,
    limiter: Arc<RateLimiter>,
}

impl GraphqlClient {
    pub(crate) fn new(api_base: &str, auth: ApiAuth, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http: Client::builder()
                .user_agent(concat!("leakscan/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("building the GraphQL HTTP client"),
            url: graphql_url(api_base),
            auth,
            limiter,
        }
    }

    /// POST one query, riding the rate-limit loop until it completes.
    fn post<T: DeserializeOwned + HasRateLimit>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, GithubError> {
        let body = json!({ "query": query, "variables": variables });
        loop {
            self.limiter.graphql_wait();
            let req = self.http.post(&self.url).json(&body);
            let resp = self.auth.apply(req)?.send()?;
            let status = resp.status();
            if !status.is_success() {
                let headers = resp.headers().clone();
                let message = resp.text().unwrap_or_default();
                if self.limiter.handle_rest(status, &headers) {
                    continue;
                }
                return Err(GithubError::Api {
                    status: status.as_u16(),
                    url: self.url.clone(),
                    message,
                });
            }

            let envelope: Envelope<T> = resp.json()?;
            let error_text = envelope.errors.as_ref().map(|errs| {
                errs.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; ")
            });

            match envelope.data {
                Some(data) => {
                    let rl = data.rate_limit();
                    let retry = self.limiter.handle_graphql(
                        rl.map(|r| r.remaining),
                        rl.and_then(|r| parse_time(&r.reset_at)),
                        error_text.as_deref(),
                    );
                    if retry {
                        continue;
                    }
                    if let Some(text) = error_text {
                        return Err(GithubError::Graphql(text));
                    }
                    return Ok(data);
                }
                None => {
                    if self.limiter.handle_graphql(None, None, error_text.as_deref()) {
                        continue;
                    }
                    return Err(GithubError::Graphql(
                        error_text.unwrap_or_else(|| "empty response".to_string()),
                    ));
                }
            }
        }
    }

    /// Walk issues newest-updated first, emitting `title\nbody` for each
    /// issue and the body of every comment newer than the cutoff.
    pub fn scan_issues(
        &self,
        owner: &str,
        name: &str,
        cutoff: Option<DateTime<Utc>>,
        emit: &mut CommentSink<'_>,
    ) -> Result<(), GithubError> {
        let mut cursor: Option<String> = None;
        loop {
            let data: IssuesData = self.post(
                ISSUES_QUERY,
                json!({ "owner": owner, "name": name, "cursor": cursor }),
            )?;
            let Some(repo) = data.repository else {
                return Ok(());
            };

            for issue in &repo.issues.nodes {
                // The list is sorted DESC by update time; everything past
                // the cutoff can be skipped wholesale.
                if older_than(&issue.updated_at, cutoff) {
                    return Ok(());
                }
                emit(CommentChunk {
                    text: format!("{}\n{}", issue.title, issue.body),
                    link: issue.url.clone(),
                    username: login_of(&issue.author),
                    updated_at: issue.updated_at.clone(),
                })
                .map_err(|e| GithubError::ChunkSend(e.to_string()))?;

                self.drain_comments(&issue.id, &issue.comments, ISSUE_COMMENTS_QUERY, cutoff, emit)?;
            }

            if !repo.issues.page_info.has_next_page {
                return Ok(());
            }
            cursor = repo.issues.page_info.end_cursor.clone();
        }
    }

    /// Walk pull requests: bodies, discussion comments, and review-thread
    /// comments.
    pub fn scan_pull_requests(
        &self,
        owner: &str,
        name: &str,
        cutoff: Option<DateTime<Utc>>,
        emit: &mut CommentSink<'_>,
    ) -> Result<(), GithubError> {
        let mut thread_ids: Vec<String> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data: PullRequestsData = self.post(
                PULL_REQUESTS_QUERY,
                json!({ "owner": owner, "name": name, "cursor": cursor }),
            )?;
            let Some(repo) = data.repository else {
                break;
            };

            for pr in &repo.pull_requests.nodes {
                if older_than(&pr.updated_at, cutoff) {
                    // Finish any threads already collected.
                    self.scan_thread_batches(&thread_ids, cutoff, emit)?;
                    return Ok(());
                }
                emit(CommentChunk {
                    text: format!("{}\n{}", pr.title, pr.body),
                    link: pr.url.clone(),
                    username: login_of(&pr.author),
                    updated_at: pr.updated_at.clone(),
                })
                .map_err(|e| GithubError::ChunkSend(e.to_string()))?;

                self.drain_comments(&pr.id, &pr.comments, PR_COMMENTS_QUERY, cutoff, emit)?;
                self.collect_thread_ids(pr, &mut thread_ids)?;
            }

            if !repo.pull_requests.page_info.has_next_page {
                break;
            }
            cursor = repo.pull_requests.page_info.end_cursor.clone();
        }

        self.scan_thread_batches(&thread_ids, cutoff, emit)
    }

    /// Emit a first page of comments and drill down while more remain.
    fn drain_comments(
        &self,
        node_id: &str,
        first_page: &CommentConnection,
        drill_query: &str,
        cutoff: Option<DateTime<Utc>>,
        emit: &mut CommentSink<'_>,
    ) -> Result<(), GithubError> {
        let reached_cutoff = emit_comment_page(&first_page.nodes, cutoff, emit)?;
        if reached_cutoff || !first_page.page_info.has_next_page {
            return Ok(());
        }

        let mut cursor = first_page.page_info.end_cursor.clone();
        loop {
            let data: NodeCommentsData =
                self.post(drill_query, json!({ "id": node_id, "cursor": cursor }))?;
            let Some(node) = data.node else {
                return Ok(());
            };
            let reached_cutoff = emit_comment_page(&node.comments.nodes, cutoff, emit)?;
            if reached_cutoff || !node.comments.page_info.has_next_page {
                return Ok(());
            }
            cursor = node.comments.page_info.end_cursor.clone();
        }
    }

    /// Gather every review-thread id for a PR, paginating the thread axis.
    fn collect_thread_ids(
        &self,
        pr: &PullRequestNode,
        thread_ids: &mut Vec<String>,
    ) -> Result<(), GithubError> {
        thread_ids.extend(pr.review_threads.nodes.iter().map(|t| t.id.clone()));

        let mut page_info = pr.review_threads.page_info.clone();
        while page_info.has_next_page {
            let data: NodeThreadsData = self.post(
                PR_THREADS_QUERY,
                json!({ "id": pr.id, "cursor": page_info.end_cursor }),
            )?;
            let Some(node) = data.node else {
                break;
            };
            thread_ids.extend(node.review_threads.nodes.iter().map(|t| t.id.clone()));
            page_info = node.review_threads.page_info.clone();
        }
        Ok(())
    }

    /// Fetch review-thread comments in id batches of up to 100, drilling
    /// into threads whose comments span multiple pages.
    fn scan_thread_batches(
        &self,
        thread_ids: &[String],
        cutoff: Option<DateTime<Utc>>,
        emit: &mut CommentSink<'_>,
    ) -> Result<(), GithubError> {
        for batch in thread_ids.chunks(THREAD_BATCH_SIZE) {
            let data: BatchThreadsData =
                self.post(THREAD_BATCH_QUERY, json!({ "ids": batch }))?;
            for thread in data.nodes.into_iter().flatten() {
                let reached_cutoff = emit_comment_page(&thread.comments.nodes, cutoff, emit)?;
                if reached_cutoff || !thread.comments.page_info.has_next_page {
                    continue;
                }

                let mut cursor = thread.comments.page_info.end_cursor.clone();
                loop {
                    let data: NodeCommentsData = self
                        .post(THREAD_COMMENTS_QUERY, json!({ "id": thread.id, "cursor": cursor }))?;
                    let Some(node) = data.node else {
                        break;
                    };
                    let reached_cutoff = emit_comment_page(&node.comments.nodes, cutoff, emit)?;
                    if reached_cutoff || !node.comments.page_info.has_next_page {
                        break;
                    }
                    cursor = node.comments.page_info.end_cursor.clone();
                }
            }
        }
        Ok(())
    }
}

/// Emit one page of comments. Returns true when the cutoff was reached,
/// meaning the remainder of this (DESC-sorted) list can be skipped.
fn emit_comment_page(
    nodes: &[CommentNode],
    cutoff: Option<DateTime<Utc>>,
    emit: &mut CommentSink<'_>,
) -> Result<bool, GithubError> {
    for comment in nodes {
        if older_than(&comment.updated_at, cutoff) {
            return Ok(true);
        }
        emit(CommentChunk {
            text: comment.body.clone(),
            link: comment.url.clone().unwrap_or_default(),
            username: login_of(&comment.author),
            updated_at: comment.updated_at.clone(),
        })
        .map_err(|e| GithubError::ChunkSend(e.to_string()))?;
    }
    Ok(false)
}

fn login_of(author: &Option<Actor>) -> String {
    author.as_ref().map(|a| a.login.clone()).unwrap_or_default()
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value).ok().map(|t| t.with_timezone(&Utc))
}

/// A timestamp strictly before the cutoff. Unparseable timestamps are kept.
fn older_than(updated_at: &str, cutoff: Option<DateTime<Utc>>) -> bool {
    match (parse_time(updated_at), cutoff) {
        (Some(at), Some(cutoff)) => at < cutoff,
        _ => false,
    }
}

// --- Queries ---

const ISSUES_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  rateLimit { remaining resetAt }
  repository(owner: $owner, name: $name) {
    issues(first: 100, after: $cursor, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        id title body url updatedAt author { login }
        comments(first: 100) {
          pageInfo { hasNextPage endCursor }
          nodes { body url updatedAt author { login } }
        }
      }
    }
  }
}"#;

const ISSUE_COMMENTS_QUERY: &str = r#"
query($id: ID!, $cursor: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on Issue {
      comments(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes { body url updatedAt author { login } }
      }
    }
  }
}"#;

const PULL_REQUESTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  rateLimit { remaining resetAt }
  repository(owner: $owner, name: $name) {
    pullRequests(first: 100, after: $cursor, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        id title body url updatedAt author { login }
        comments(first: 100) {
          pageInfo { hasNextPage endCursor }
          nodes { body url updatedAt author { login } }
        }
        reviewThreads(first: 100) {
          pageInfo { hasNextPage endCursor }
          nodes { id }
        }
      }
    }
  }
}"#;

const PR_COMMENTS_QUERY: &str = r#"
query($id: ID!, $cursor: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequest {
      comments(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes { body url updatedAt author { login } }
      }
    }
  }
}"#;

const PR_THREADS_QUERY: &str = r#"
query($id: ID!, $cursor: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequest {
      reviewThreads(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes { id }
      }
    }
  }
}"#;

const THREAD_BATCH_QUERY: &str = r#"
query($ids: [ID!]!) {
  rateLimit { remaining resetAt }
  nodes(ids: $ids) {
    ... on PullRequestReviewThread {
      id
      comments(first: 100) {
        pageInfo { hasNextPage endCursor }
        nodes { body url updatedAt author { login } }
      }
    }
  }
}"#;

const THREAD_COMMENTS_QUERY: &str = r#"
query($id: ID!, $cursor: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequestReviewThread {
      comments(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes { body url updatedAt author { login } }
      }
    }
  }
}"#;

// --- Response models ---

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    errors: Option<Vec<GraphqlErrorItem>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorItem {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitInfo {
    remaining: i64,
    reset_at: String,
}

trait HasRateLimit {
    fn rate_limit(&self) -> Option<&RateLimitInfo>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentNode {
    #[serde(default)]
    body: String,
    url: Option<String>,
    #[serde(default)]
    updated_at: String,
    author: Option<Actor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentConnection {
    page_info: PageInfo,
    nodes: Vec<CommentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    url: String,
    updated_at: String,
    author: Option<Actor>,
    comments: CommentConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueConnection {
    page_info: PageInfo,
    nodes: Vec<IssueNode>,
}

#[derive(Debug, Deserialize)]
struct IssuesRepository {
    issues: IssueConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuesData {
    rate_limit: Option<RateLimitInfo>,
    repository: Option<IssuesRepository>,
}

impl HasRateLimit for IssuesData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

#[derive(Debug, Deserialize)]
struct ThreadStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadConnection {
    page_info: PageInfo,
    nodes: Vec<ThreadStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestNode {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    url: String,
    updated_at: String,
    author: Option<Actor>,
    comments: CommentConnection,
    review_threads: ThreadConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestConnection {
    page_info: PageInfo,
    nodes: Vec<PullRequestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestsRepository {
    pull_requests: PullRequestConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestsData {
    rate_limit: Option<RateLimitInfo>,
    repository: Option<PullRequestsRepository>,
}

impl HasRateLimit for PullRequestsData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

#[derive(Debug, Deserialize)]
struct NodeComments {
    comments: CommentConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeCommentsData {
    rate_limit: Option<RateLimitInfo>,
    node: Option<NodeComments>,
}

impl HasRateLimit for NodeCommentsData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeThreads {
    review_threads: ThreadConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeThreadsData {
    rate_limit: Option<RateLimitInfo>,
    node: Option<NodeThreads>,
}

impl HasRateLimit for NodeThreadsData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchThread {
    id: String,
    comments: CommentConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchThreadsData {
    rate_limit: Option<RateLimitInfo>,
    nodes: Vec<Option<BatchThread>>,
}

impl HasRateLimit for BatchThreadsData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_url_for_public_and_enterprise() {
        assert_eq!(graphql_url(PUBLIC_API_URL), "https://api.github.com/graphql");
        assert_eq!(
            graphql_url("https://ghe.example.com/api/v3"),
            "https://ghe.example.com/api/graphql"
        );
    }

    #[test]
    fn cutoff_stops_descending_comment_page() {
        let cutoff = parse_time("2024-05-01T00:00:00Z");
        let nodes = vec![
            CommentNode {
                body: "new".into(),
                url: None,
                updated_at: "2024-06-01T00:00:00Z".into(),
                author: None,
            },
            CommentNode {
                body: "old".into(),
                url: None,
                updated_at: "2024-04-01T00:00:00Z".into(),
                author: None,
            },
            CommentNode {
                body: "older".into(),
                url: None,
                updated_at: "2024-03-01T00:00:00Z".into(),
                author: None,
            },
        ];

        let mut seen = Vec::new();
        let mut sink = |chunk: CommentChunk| {
            seen.push(chunk.text);
            Ok(())
        };
        let reached = emit_comment_page(&nodes, cutoff, &mut sink).unwrap();
        assert!(reached);
        assert_eq!(seen, vec!["new"]);
    }

    #[test]
    fn no_cutoff_emits_everything() {
        let nodes = vec![CommentNode {
            body: "a".into(),
            url: None,
            updated_at: "2024-06-01T00:00:00Z".into(),
            author: None,
        }];
        let mut count = 0;
        let mut sink = |_| {
            count += 1;
            Ok(())
        };
        assert!(!emit_comment_page(&nodes, None, &mut sink).unwrap());
        assert_eq!(count, 1);
    }

    #[test]
    fn unparseable_timestamps_are_kept() {
        assert!(!older_than("not-a-time", parse_time("2024-05-01T00:00:00Z")));
    }

    #[test]
    fn issues_payload_deserializes() {
        let payload = r#"{
            "data": {
                "rateLimit": {"remaining": 4999, "resetAt": "2024-05-01T00:00:00Z"},
                "repository": {
                    "issues": {
                        "pageInfo": {"hasNextPage": false, "endCursor": null},
                        "nodes": [{
                            "id": "I_abc",
                            "title": "leak",
                            "body": "token inside",
                            "url": "https://github.com/acme/widgets/issues/1",
                            "updatedAt": "2024-05-01T00:00:00Z",
                            "author": {"login": "jane"},
                            "comments": {
                                "pageInfo": {"hasNextPage": false, "endCursor": null},
                                "nodes": []
                            }
                        }]
                    }
                }
            }
        }"#;
        let envelope: Envelope<IssuesData> = serde_json::from_str(payload).unwrap();
        let data = envelope.data.unwrap();
        assert_eq!(data.rate_limit.unwrap().remaining, 4999);
        let repo = data.repository.unwrap();
        assert_eq!(repo.issues.nodes.len(), 1);
        assert_eq!(repo.issues.nodes[0].title, "leak");
    }
}
