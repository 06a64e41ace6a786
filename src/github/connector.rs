//! Credential-specialized connectors.
//!
//! A connector is the pair every GitHub scan needs: an API client for
//! enumeration and a clone primitive for fetching repository contents. Each
//! credential variant implements the pair its own way; construction goes
//! through [`new_connector`], which inspects the credential.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::api::{ApiAuth, ApiClient, normalize_endpoint};
use super::error::GithubError;
use super::ratelimit::RateLimiter;
use crate::git::{ClonedRepo, clone_repo, parse_git_url, with_credentials};
use crate::redact;

/// Git user recorded for app-installation clones.
const APP_CLONE_USER: &str = "x-access-token";

/// App JWTs may live at most ten minutes; stay under it.
const APP_JWT_LIFETIME: Duration = Duration::from_secs(9 * 60);

/// Installation tokens last an hour; refresh with slack.
const INSTALLATION_TOKEN_LIFETIME: Duration = Duration::from_secs(55 * 60);

/// Credential variants accepted by the GitHub source. Secrets are shared
/// by reference so connectors and transports never copy key material.
#[derive(Clone)]
pub enum GithubCredential {
    Unauthenticated,
    BasicAuth { user: String, password: Arc<SecretString> },
    Token(Arc<SecretString>),
    App { app_id: String, installation_id: String, private_key: Arc<SecretString> },
}

/// API client + clone primitive, specialized per credential.
pub trait Connector: Send + Sync {
    fn api_client(&self) -> &ApiClient;
    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GithubError>;

    /// Type-recovery accessors for credential-specific enumeration paths.
    fn as_token(&self) -> Option<&TokenConnector> {
        None
    }
    fn as_app(&self) -> Option<&AppConnector> {
        None
    }
}

/// Build the connector for a credential. Secrets are registered with the
/// redactor here, before any of them can reach a log line.
pub fn new_connector(
    endpoint: &str,
    credential: &GithubCredential,
    limiter: Arc<RateLimiter>,
) -> Result<Box<dyn Connector>, GithubError> {
    let (api_base, _enterprise) = normalize_endpoint(endpoint);
    Ok(match credential {
        GithubCredential::Unauthenticated => Box::new(UnauthenticatedConnector {
            api: ApiClient::new(api_base, ApiAuth::None, limiter),
        }),
        GithubCredential::BasicAuth { user, password } => {
            redact::register_secret(password.expose_secret());
            Box::new(BasicAuthConnector {
                api: ApiClient::new(
                    api_base,
                    ApiAuth::Basic { user: user.clone(), password: password.clone() },
                    limiter,
                ),
                user: user.clone(),
                password: password.clone(),
            })
        }
        GithubCredential::Token(token) => {
            redact::register_secret(token.expose_secret());
            Box::new(TokenConnector {
                api: ApiClient::new(api_base, ApiAuth::Token(token.clone()), limiter),
                token: token.clone(),
                user: OnceCell::new(),
            })
        }
        GithubCredential::App { app_id, installation_id, private_key } => {
            redact::register_secret(private_key.expose_secret());
            let app = AppAuth::new(app_id, installation_id, private_key, api_base.clone())?;
            // Both clients must share the enterprise base, otherwise token
            // refreshes leak to the public cloud.
            Box::new(AppConnector {
                api: ApiClient::new(
                    api_base.clone(),
                    ApiAuth::AppInstallation(app.clone()),
                    limiter.clone(),
                ),
                apps_api: ApiClient::new(api_base, ApiAuth::AppJwt(app.clone()), limiter),
                app,
            })
        }
    })
}

/// Anonymous API access and anonymous HTTPS clones. Public data only.
pub struct UnauthenticatedConnector {
    api: ApiClient,
}

impl Connector for UnauthenticatedConnector {
    fn api_client(&self) -> &ApiClient {
        &self.api
    }

    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GithubError> {
        Ok(clone_repo(&parse_git_url(url)?, &[])?)
    }
}

/// HTTP basic credentials on the transport and embedded into clone URLs.
pub struct BasicAuthConnector {
    api: ApiClient,
    user: String,
    password: Arc<SecretString>,
}

impl Connector for BasicAuthConnector {
    fn api_client(&self) -> &ApiClient {
        &self.api
    }

    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GithubError> {
        let parsed = parse_git_url(url)?;
        let authed = with_credentials(&parsed, &self.user, self.password.expose_secret());
        Ok(clone_repo(&authed, &[])?)
    }
}

/// Static OAuth token. The clone username is the token owner's login,
/// resolved lazily through `GET /user` (which itself rides the rate-limit
/// loop).
pub struct TokenConnector {
    api: ApiClient,
    token: Arc<SecretString>,
    user: OnceCell<String>,
}

impl TokenConnector {
    /// The authenticated user's login, fetched once.
    pub fn authenticated_login(&self) -> Result<&str, GithubError> {
        self.user
            .get_or_try_init(|| self.api.current_user().map(|u| u.login))
            .map(String::as_str)
    }
}

impl Connector for TokenConnector {
    fn api_client(&self) -> &ApiClient {
        &self.api
    }

    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GithubError> {
        let login = self.authenticated_login()?.to_string();
        let parsed = parse_git_url(url)?;
        let authed = with_credentials(&parsed, &login, self.token.expose_secret());
        Ok(clone_repo(&authed, &[])?)
    }

    fn as_token(&self) -> Option<&TokenConnector> {
        Some(self)
    }
}

/// GitHub App: JWT for app-level endpoints, installation tokens for
/// everything else, a fresh installation token per clone.
pub struct AppConnector {
    api: ApiClient,
    apps_api: ApiClient,
    app: Arc<AppAuth>,
}

impl AppConnector {
    /// The JWT-authenticated client for `/app/*` endpoints.
    pub fn apps_api(&self) -> &ApiClient {
        &self.apps_api
    }

    pub fn app_auth(&self) -> &Arc<AppAuth> {
        &self.app
    }
}

impl Connector for AppConnector {
    fn api_client(&self) -> &ApiClient {
        &self.api
    }

    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GithubError> {
        let token = self.app.installation_token()?;
        let parsed = parse_git_url(url)?;
        let authed = with_credentials(&parsed, APP_CLONE_USER, token.expose_secret());
        Ok(clone_repo(&authed, &[])?)
    }

    fn as_app(&self) -> Option<&AppConnector> {
        Some(self)
    }
}

#[derive(Serialize)]
struct JwtClaims {
    iat: u64,
    exp: u64,
    iss: String,
}

struct CachedToken {
    token: Arc<SecretString>,
    expires_at: Instant,
}

/// Signs app JWTs and mints installation tokens against the configured API
/// base, caching each token until shortly before expiry.
pub struct AppAuth {
    app_id: String,
    installation_id: String,
    encoding_key: EncodingKey,
    api_base: String,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl AppAuth {
    fn new(
        app_id: &str,
        installation_id: &str,
        private_key: &SecretString,
        api_base: String,
    ) -> Result<Arc<Self>, GithubError> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())?;
        Ok(Arc::new(Self {
            app_id: app_id.to_string(),
            installation_id: installation_id.to_string(),
            encoding_key,
            api_base,
            http: Client::builder()
                .user_agent(concat!("leakscan/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("building the token-mint HTTP client"),
            cached: Mutex::new(None),
        }))
    }

    /// The API base tokens are minted against. Enterprise installs must see
    /// their own host here, never the public cloud.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// A short-lived app JWT. Backdated a minute to absorb clock drift.
    pub(crate) fn jwt(&self) -> Result<String, GithubError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let claims = JwtClaims {
            iat: now.saturating_sub(60),
            exp: now + APP_JWT_LIFETIME.as_secs(),
            iss: self.app_id.clone(),
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?)
    }

    /// A current installation token, minted on demand and cached.
    pub(crate) fn installation_token(&self) -> Result<Arc<SecretString>, GithubError> {
        {
            let cached = self.cached.lock().expect("token cache poisoned");
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.token.clone());
                }
            }
        }

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.installation_id
        );
        let resp = self.http.post(&url).bearer_auth(self.jwt()?).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GithubError::Auth(format!(
                "minting installation token failed with {status}"
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let minted: TokenResponse = resp.json()?;
        redact::register_secret(&minted.token);
        let token = Arc::new(SecretString::from(minted.token));

        let mut cached = self.cached.lock().expect("token cache poisoned");
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + INSTALLATION_TOKEN_LIFETIME,
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::api::PUBLIC_API_URL;

    // Throwaway RSA key generated for these tests only.
    const TEST_RSA_KEY: &str = include_str!("testdata/app_test_key.pem");

    fn app_credential() -> GithubCredential {
        GithubCredential::App {
            app_id: "1234".into(),
            installation_id: "5678".into(),
            private_key: Arc::new(SecretString::from(TEST_RSA_KEY.to_string())),
        }
    }

    #[test]
    fn enterprise_endpoint_reaches_both_app_transports() {
        let connector =
            new_connector("https://api.example.ghe.com", &app_credential(), Arc::default())
                .unwrap();
        let app = connector.as_app().expect("app connector");

        let installation_base = app.api_client().api_base().to_string();
        let apps_base = app.apps_api().api_base().to_string();
        let mint_base = app.app_auth().api_base().to_string();

        assert_eq!(installation_base, apps_base);
        assert_eq!(apps_base, mint_base);
        assert!(installation_base.starts_with("https://api.example.ghe.com"));
        assert_ne!(installation_base, PUBLIC_API_URL);
    }

    #[test]
    fn public_endpoint_keeps_public_base() {
        let connector = new_connector("", &app_credential(), Arc::default()).unwrap();
        let app = connector.as_app().expect("app connector");
        assert_eq!(app.api_client().api_base(), PUBLIC_API_URL);
        assert_eq!(app.app_auth().api_base(), PUBLIC_API_URL);
    }

    #[test]
    fn app_jwt_is_well_formed() {
        let connector = new_connector("", &app_credential(), Arc::default()).unwrap();
        let app = connector.as_app().unwrap();
        let jwt = app.app_auth().jwt().unwrap();
        // Three dot-separated base64 segments.
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[test]
    fn token_connector_exposes_itself() {
        let connector = new_connector(
            "",
            &GithubCredential::Token(Arc::new(SecretString::from("ghp_test_token_value".to_string()))),
            Arc::default(),
        )
        .unwrap();
        assert!(connector.as_token().is_some());
        assert!(connector.as_app().is_none());
    }

    #[test]
    fn unauthenticated_connector_has_no_specializations() {
        let connector =
            new_connector("", &GithubCredential::Unauthenticated, Arc::default()).unwrap();
        assert!(connector.as_token().is_none());
        assert!(connector.as_app().is_none());
    }
}
