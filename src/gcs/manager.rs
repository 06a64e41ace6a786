//! Bucket and object enumeration against the GCS JSON API.
//!
//! Listing pages objects into a bounded channel; one worker per bucket,
//! bounded by the configured concurrency. Object downloads retry on an
//! exponential backoff (2 s growing by 1.5x up to a 30 s ceiling).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, bounded};
use globset::GlobSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::error::GcsError;
use super::object::{Bucket, ListBucketsResponse, ListObjectsResponse, Object};
use crate::filter::compile_globs;
use crate::handler::skip_file;
use crate::source::{CancelToken, effective_concurrency};

const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const STORAGE_READ_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";

/// Default per-object size cap.
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 10 * 1024 * 1024;

/// Hard ceiling for the configurable size cap.
pub const MAX_OBJECT_SIZE_LIMIT: u64 = 50 * 1024 * 1024;

/// Bound on the object channel between listers and chunk workers.
const OBJECT_CHANNEL_CAPACITY: usize = 100;

const DOWNLOAD_BACKOFF_START: Duration = Duration::from_secs(2);
const DOWNLOAD_BACKOFF_CEILING: Duration = Duration::from_secs(30);
const DOWNLOAD_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Clamp a configured object size cap to (0, 50 MiB]; anything invalid
/// falls back to the default.
pub fn clamp_object_size(value: u64) -> u64 {
    if value == 0 || value > MAX_OBJECT_SIZE_LIMIT { DEFAULT_MAX_OBJECT_SIZE } else { value }
}

/// Credential variants for GCS. Key-only and unauthenticated variants see
/// public buckets only.
#[derive(Clone)]
pub enum GcsCredential {
    ApiKey(Arc<SecretString>),
    /// Inline service-account JSON.
    ServiceAccountJson(Arc<SecretString>),
    ServiceAccountFile(PathBuf),
    /// `GOOGLE_APPLICATION_CREDENTIALS` service-account file.
    ApplicationDefault,
    Unauthenticated,
    Oauth2 { client_id: String, access_token: Arc<SecretString>, refresh_token: Arc<SecretString> },
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct GrantClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: Arc<SecretString>,
    expires_at: Instant,
}

/// Resolves bearer tokens (or API-key query params) per credential.
struct GcsAuth {
    credential: GcsCredential,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl GcsAuth {
    fn new(credential: GcsCredential, http: Client) -> Self {
        Self { credential, http, cached: Mutex::new(None) }
    }

    fn authorize(&self, req: RequestBuilder) -> Result<RequestBuilder, GcsError> {
        Ok(match &self.credential {
            GcsCredential::Unauthenticated => req,
            GcsCredential::ApiKey(key) => req.query(&[("key", key.expose_secret())]),
            _ => req.bearer_auth(self.access_token()?.expose_secret()),
        })
    }

    fn access_token(&self) -> Result<Arc<SecretString>, GcsError> {
        {
            let cached = self.cached.lock().expect("token cache poisoned");
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.token.clone());
                }
            }
        }
        let (token, ttl) = self.mint_token()?;
        crate::redact::register_secret(token.expose_secret());
        let mut cached = self.cached.lock().expect("token cache poisoned");
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + ttl.saturating_sub(Duration::from_secs(300)),
        });
        Ok(token)
    }

    fn mint_token(&self) -> Result<(Arc<SecretString>, Duration), GcsError> {
        match &self.credential {
            GcsCredential::ServiceAccountJson(json) => {
                self.service_account_grant(json.expose_secret())
            }
            GcsCredential::ServiceAccountFile(path) => {
                let json = std::fs::read_to_string(path)?;
                self.service_account_grant(&json)
            }
            GcsCredential::ApplicationDefault => {
                let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").map_err(|_| {
                    GcsError::Auth(
                        "GOOGLE_APPLICATION_CREDENTIALS is not set for default credentials".into(),
                    )
                })?;
                let json = std::fs::read_to_string(path)?;
                self.service_account_grant(&json)
            }
            GcsCredential::Oauth2 { client_id, access_token, refresh_token } => {
                match self.refresh_grant(client_id, refresh_token) {
                    Ok(minted) => Ok(minted),
                    Err(err) => {
                        // Fall back to the provided access token; it may
                        // still be valid even if the refresh path is not.
                        log::debug!("oauth2 refresh failed, using provided token: {err}");
                        Ok((access_token.clone(), Duration::from_secs(10 * 60)))
                    }
                }
            }
            GcsCredential::Unauthenticated | GcsCredential::ApiKey(_) => {
                Err(GcsError::Auth("credential does not mint tokens".into()))
            }
        }
    }

    /// The JWT-bearer grant for service accounts.
    fn service_account_grant(&self, json: &str) -> Result<(Arc<SecretString>, Duration), GcsError> {
        let account: ServiceAccount = serde_json::from_str(json)
            .map_err(|e| GcsError::Auth(format!("unparseable service account: {e}")))?;
        let token_uri = account.token_uri.as_deref().unwrap_or(GOOGLE_TOKEN_URI);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let claims = GrantClaims {
            iss: account.client_email.clone(),
            scope: STORAGE_READ_SCOPE.to_string(),
            aud: token_uri.to_string(),
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let resp = self
            .http
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GcsError::Auth(format!("token grant failed with {status}")));
        }
        let token: TokenResponse = resp.json()?;
        let ttl = Duration::from_secs(token.expires_in.unwrap_or(3600));
        Ok((Arc::new(SecretString::from(token.access_token)), ttl))
    }

    fn refresh_grant(
        &self,
        client_id: &str,
        refresh_token: &SecretString,
    ) -> Result<(Arc<SecretString>, Duration), GcsError> {
        let resp = self
            .http
            .post(GOOGLE_TOKEN_URI)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("refresh_token", refresh_token.expose_secret()),
            ])
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GcsError::Auth(format!("token refresh failed with {status}")));
        }
        let token: TokenResponse = resp.json()?;
        let ttl = Duration::from_secs(token.expires_in.unwrap_or(3600));
        Ok((Arc::new(SecretString::from(token.access_token)), ttl))
    }
}

/// A running enumeration: the object stream plus the count of objects
/// discovered so far (which keeps growing while listers run).
pub struct Listing {
    pub objects: Receiver<Object>,
    pub discovered: Arc<AtomicU64>,
}

pub struct GcsManager {
    http: Client,
    auth: GcsAuth,
    endpoint: String,
    project_id: String,
    include_buckets: GlobSet,
    include_buckets_empty: bool,
    exclude_buckets: GlobSet,
    include_objects: GlobSet,
    include_objects_empty: bool,
    exclude_objects: GlobSet,
    max_object_size: u64,
    concurrency: usize,
}

impl GcsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: &str,
        include_buckets: &[String],
        exclude_buckets: &[String],
        include_objects: &[String],
        exclude_objects: &[String],
        max_object_size: u64,
        concurrency: i64,
        credential: GcsCredential,
    ) -> Self {
        let http = Client::builder()
            .user_agent(concat!("leakscan/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("building the GCS HTTP client");
        Self {
            auth: GcsAuth::new(credential, http.clone()),
            http,
            endpoint: DEFAULT_GCS_ENDPOINT.to_string(),
            project_id: project_id.to_string(),
            include_buckets: compile_globs(include_buckets),
            include_buckets_empty: include_buckets.is_empty(),
            exclude_buckets: compile_globs(exclude_buckets),
            include_objects: compile_globs(include_objects),
            include_objects_empty: include_objects.is_empty(),
            exclude_objects: compile_globs(exclude_objects),
            max_object_size: clamp_object_size(max_object_size),
            concurrency: effective_concurrency(concurrency),
        }
    }

    /// Point at a different API endpoint (tests, emulators).
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The include list overrides the exclude list when both are given.
    fn should_include_bucket(&self, name: &str) -> bool {
        if !self.include_buckets_empty {
            return self.include_buckets.is_match(name);
        }
        !self.exclude_buckets.is_match(name)
    }

    fn should_include_object(&self, name: &str) -> bool {
        if skip_file(name) {
            return false;
        }
        if !self.include_objects_empty {
            return self.include_objects.is_match(name);
        }
        !self.exclude_objects.is_match(name)
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, GcsError> {
        let req = self.http.get(url).query(query);
        let resp = self.auth.authorize(req)?.send()?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().unwrap_or_default();
            return Err(GcsError::Api {
                status: status.as_u16(),
                url: url.to_string(),
                message: message.chars().take(300).collect(),
            });
        }
        Ok(resp.json()?)
    }

    /// All accessible buckets that pass the bucket filters.
    pub fn list_buckets(&self) -> Result<Vec<Bucket>, GcsError> {
        let url = format!("{}/storage/v1/b", self.endpoint);
        let mut buckets = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![("project", self.project_id.clone())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let listed: ListBucketsResponse = self.get_json(&url, &query)?;
            for item in listed.items {
                let mut bucket = Bucket::new(item.name);
                bucket.should_include = self.should_include_bucket(&bucket.name);
                buckets.push(bucket);
            }
            match listed.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(buckets),
            }
        }
    }

    /// Page one bucket's objects into `tx`, starting from the bucket's
    /// resume offset. Returns how many objects were produced.
    fn list_objects(
        &self,
        bucket: &Bucket,
        tx: &crossbeam_channel::Sender<Object>,
        discovered: &AtomicU64,
        cancel: &CancelToken,
    ) -> Result<u64, GcsError> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, bucket.name);
        let mut produced = 0u64;
        let mut page_token: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Ok(produced);
            }
            let mut query: Vec<(&str, String)> = vec![
                (
                    "fields",
                    "items(name,contentType,owner,size,updated,timeCreated,md5Hash,acl,mediaLink),nextPageToken"
                        .to_string(),
                ),
                ("projection", "full".to_string()),
            ];
            if !bucket.start_offset.is_empty() {
                query.push(("startOffset", bucket.start_offset.clone()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let listed: ListObjectsResponse = self.get_json(&url, &query)?;
            for attrs in listed.items {
                if !self.should_include_object(&attrs.name) {
                    continue;
                }
                let size = attrs.parsed_size();
                if size <= 0 || size as u64 > self.max_object_size {
                    log::debug!(
                        "skipping {} ({} bytes, cap {})",
                        attrs.name,
                        size,
                        self.max_object_size
                    );
                    continue;
                }
                let object = attrs.into_object(&bucket.name, &self.endpoint);
                discovered.fetch_add(1, Ordering::Relaxed);
                produced += 1;
                if tx.send(object).is_err() {
                    // Consumer went away; stop listing.
                    return Ok(produced);
                }
            }
            match listed.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(produced),
            }
        }
    }

    /// Enumerate every included bucket concurrently into a bounded stream.
    pub fn enumerate(self: &Arc<Self>, cancel: &CancelToken) -> Result<Listing, GcsError> {
        let buckets: Vec<Bucket> =
            self.list_buckets()?.into_iter().filter(|b| b.should_include).collect();
        log::info!("listing {} buckets in project {}", buckets.len(), self.project_id);

        let (tx, rx) = bounded(OBJECT_CHANNEL_CAPACITY);
        let discovered = Arc::new(AtomicU64::new(0));
        let (bucket_tx, bucket_rx) = crossbeam_channel::unbounded::<Bucket>();
        for bucket in buckets {
            let _ = bucket_tx.send(bucket);
        }
        drop(bucket_tx);

        for _ in 0..self.concurrency {
            let manager = Arc::clone(self);
            let bucket_rx = bucket_rx.clone();
            let tx = tx.clone();
            let discovered = discovered.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                for bucket in bucket_rx.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match manager.list_objects(&bucket, &tx, &discovered, &cancel) {
                        Ok(count) => log::debug!("bucket {} listed {count} objects", bucket.name),
                        Err(err) => log::error!("listing bucket {} failed: {err}", bucket.name),
                    }
                }
            });
        }
        // Workers hold the remaining senders; the stream closes when the
        // last one finishes.
        drop(tx);

        Ok(Listing { objects: rx, discovered })
    }

    /// Download an object's bytes, retrying transient failures on an
    /// exponential backoff until the ceiling is reached.
    pub fn download(&self, object: &Object) -> Result<Vec<u8>, GcsError> {
        if object.size <= 0 {
            return Err(GcsError::EmptyObject { name: object.name.clone() });
        }
        if object.size as u64 > self.max_object_size {
            return Err(GcsError::ObjectTooLarge {
                name: object.name.clone(),
                size: object.size,
                max: self.max_object_size,
            });
        }
        let mut delay = DOWNLOAD_BACKOFF_START;
        loop {
            match self.try_download(object) {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    if delay > DOWNLOAD_BACKOFF_CEILING {
                        return Err(err);
                    }
                    log::debug!(
                        "fetching {} failed ({err}), retrying in {}s",
                        object.name,
                        delay.as_secs()
                    );
                    thread::sleep(delay);
                    delay = delay.mul_f64(DOWNLOAD_BACKOFF_MULTIPLIER);
                }
            }
        }
    }

    fn try_download(&self, object: &Object) -> Result<Vec<u8>, GcsError> {
        let req = self.http.get(&object.link);
        let resp = self.auth.authorize(req)?.send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GcsError::Api {
                status: status.as_u16(),
                url: object.link.clone(),
                message: resp.text().unwrap_or_default().chars().take(300).collect(),
            });
        }
        Ok(resp.bytes()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(
        include_buckets: &[&str],
        exclude_buckets: &[&str],
        max_object_size: u64,
    ) -> GcsManager {
        GcsManager::new(
            "test-project",
            &include_buckets.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &exclude_buckets.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &[],
            &[],
            max_object_size,
            4,
            GcsCredential::Unauthenticated,
        )
    }

    #[test]
    fn object_size_clamp() {
        assert_eq!(clamp_object_size(0), DEFAULT_MAX_OBJECT_SIZE);
        assert_eq!(clamp_object_size(1024), 1024);
        assert_eq!(clamp_object_size(MAX_OBJECT_SIZE_LIMIT), MAX_OBJECT_SIZE_LIMIT);
        assert_eq!(clamp_object_size(MAX_OBJECT_SIZE_LIMIT + 1), DEFAULT_MAX_OBJECT_SIZE);
    }

    #[test]
    fn include_list_overrides_exclude_list() {
        let m = manager(&["prod-*"], &["prod-secrets"], 0);
        // Include is present, so exclude is ignored entirely.
        assert!(m.should_include_bucket("prod-secrets"));
        assert!(m.should_include_bucket("prod-logs"));
        assert!(!m.should_include_bucket("dev-logs"));
    }

    #[test]
    fn exclude_list_applies_without_includes() {
        let m = manager(&[], &["scratch-*"], 0);
        assert!(!m.should_include_bucket("scratch-tmp"));
        assert!(m.should_include_bucket("prod-logs"));
    }

    #[test]
    fn object_filter_skips_known_binary_extensions() {
        let m = manager(&[], &[], 0);
        assert!(!m.should_include_object("assets/logo.png"));
        assert!(m.should_include_object("config/app.yaml"));
    }
}
