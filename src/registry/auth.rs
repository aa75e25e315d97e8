//! Credentials, token caching and the registry token-challenge handshake.

use super::{RegistryError, read_json, send};
use crate::secret_string::SecretString;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Tokens are treated as expired slightly ahead of the registry's clock.
const EXPIRY_LEEWAY_SECONDS: i64 = 30;

#[derive(Debug, Clone)]
pub enum Credentials {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
    /// An already base64-encoded `user:password` pair, as handed out by ECR
    EncodedBasic(SecretString),
    Bearer(SecretString),
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Tokens keyed by scope (usually `host/repository`). Reads are shared; refreshes of one
/// key are serialized so concurrent callers that hit an expired token trigger one
/// handshake.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<String, CachedToken>>,
    refreshing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// A parsed `WWW-Authenticate: Bearer realm=..,service=..,scope=..` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
}

impl Credentials {
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            Credentials::EncodedBasic(encoded) => {
                request.header(AUTHORIZATION, format!("Basic {}", encoded.expose_secret()))
            }
            Credentials::Bearer(token) => request.bearer_auth(token.expose_secret()),
        }
    }
}

impl CachedToken {
    pub fn new(token: impl Into<SecretString>, expires_in_seconds: Option<i64>) -> Self {
        Self {
            token: token.into(),
            expires_at: expires_in_seconds.map(|seconds| Utc::now() + Duration::seconds(seconds)),
        }
    }

    fn is_valid(&self) -> bool {
        self.expires_at.is_none_or(|expires_at| {
            expires_at - Duration::seconds(EXPIRY_LEEWAY_SECONDS) > Utc::now()
        })
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token for `key`, if it has not expired.
    pub async fn get(&self, key: &str) -> Option<SecretString> {
        self.current(key, None).await
    }

    /// Returns the cached token for `key`, fetching a new one when there is none, when it
    /// expired, or when it equals `rejected` (a token the registry just refused).
    pub async fn get_or_refresh<F, Fut>(
        &self,
        key: &str,
        rejected: Option<&SecretString>,
        fetch: F,
    ) -> Result<SecretString, RegistryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, RegistryError>>,
    {
        if let Some(token) = self.current(key, rejected).await {
            return Ok(token);
        }

        let lock = self
            .refreshing
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone();
        let _refreshing = lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(token) = self.current(key, rejected).await {
            return Ok(token);
        }

        debug!("Fetching registry token for {}", key);
        let fresh = fetch().await?;
        let token = fresh.token.clone();
        self.tokens.write().await.insert(key.to_string(), fresh);
        Ok(token)
    }

    async fn current(&self, key: &str, rejected: Option<&SecretString>) -> Option<SecretString> {
        let tokens = self.tokens.read().await;
        tokens
            .get(key)
            .filter(|cached| cached.is_valid() && Some(&cached.token) != rejected)
            .map(|cached| cached.token.clone())
    }
}

/// Sends a request authorized with a cached token. When the registry answers 401 the
/// token is refreshed once and the request retried.
pub async fn send_with_token<F, FFut, S, SFut>(
    cache: &TokenCache,
    key: &str,
    fetch: F,
    send_request: S,
) -> Result<Response, RegistryError>
where
    F: Fn() -> FFut,
    FFut: Future<Output = Result<CachedToken, RegistryError>>,
    S: Fn(SecretString) -> SFut,
    SFut: Future<Output = Result<Response, RegistryError>>,
{
    let token = cache.get_or_refresh(key, None, &fetch).await?;
    let response = send_request(token.clone()).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    debug!("Registry rejected the cached token for {}, re-authenticating", key);
    let token = cache.get_or_refresh(key, Some(&token), &fetch).await?;
    send_request(token).await
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let re = Regex::new(r#"([A-Za-z_]+)="([^"]*)""#).ok()?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for caps in re.captures_iter(params) {
            let value = caps[2].to_string();
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    /// Exchanges `credentials` for a bearer token at the challenge's realm. When the
    /// challenge names no scope, pull access to `repository` is requested.
    pub async fn fetch_token(
        &self,
        http: &Client,
        host: &str,
        repository: &str,
        credentials: &Credentials,
    ) -> Result<CachedToken, RegistryError> {
        let scope = self
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &self.service {
            query.push(("service", service.clone()));
        }

        debug!("Requesting bearer token for {} from {}", host, self.realm);
        let request = credentials.apply(http.get(&self.realm).query(&query));
        let response = send(host, request).await?;
        if !response.status().is_success() {
            return Err(RegistryError::AuthenticationFailed {
                host: host.to_string(),
                reason: format!("token endpoint {} answered {}", self.realm, response.status()),
            });
        }

        let body: TokenResponse = read_json(host, response).await?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RegistryError::AuthenticationFailed {
                host: host.to_string(),
                reason: format!("token endpoint {} returned no token", self.realm),
            })?;
        Ok(CachedToken::new(token, body.expires_in))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:samalba/my-app:pull,push")
        );
    }

    #[test]
    fn test_parse_challenge_rejects_other_schemes() {
        assert_eq!(BearerChallenge::parse(r#"Basic realm="registry""#), None);
        assert_eq!(BearerChallenge::parse(r#"Bearer service="x""#), None);
        assert_eq!(BearerChallenge::parse(""), None);
    }

    #[test]
    fn test_cached_token_expiry() {
        assert!(CachedToken::new("t", None).is_valid());
        assert!(CachedToken::new("t", Some(3600)).is_valid());
        assert!(!CachedToken::new("t", Some(10)).is_valid());
    }

    #[tokio::test]
    async fn test_token_cache_reuses_and_refreshes_rejected_tokens() {
        let cache = TokenCache::new();
        let fetches = AtomicUsize::new(0);
        let fetch = || async {
            let n = fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RegistryError>(CachedToken::new(format!("token-{}", n), None))
        };

        let first = cache.get_or_refresh("key", None, &fetch).await.unwrap();
        let again = cache.get_or_refresh("key", None, &fetch).await.unwrap();
        assert_eq!(first.expose_secret(), "token-0");
        assert_eq!(again.expose_secret(), "token-0");

        let refreshed = cache
            .get_or_refresh("key", Some(&first), &fetch)
            .await
            .unwrap();
        assert_eq!(refreshed.expose_secret(), "token-1");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_token_cache_single_flight() {
        let cache = Arc::new(TokenCache::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh("key", None, || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, RegistryError>(CachedToken::new("shared", None))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().expose_secret(), "shared");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_cache_refreshes_keys_independently() {
        let cache = Arc::new(TokenCache::new());
        let (started, is_started) = tokio::sync::oneshot::channel::<()>();
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let slow_cache = cache.clone();
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_refresh("slow.example.com/repo", None, || async move {
                    let _ = started.send(());
                    let _ = released.await;
                    Ok::<_, RegistryError>(CachedToken::new("slow", None))
                })
                .await
                .unwrap()
        });
        is_started.await.unwrap();

        let fast = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            cache.get_or_refresh("fast.example.com/repo", None, || async {
                Ok::<_, RegistryError>(CachedToken::new("fast", None))
            }),
        )
        .await
        .expect("refresh of another key must not wait")
        .unwrap();
        assert_eq!(fast.expose_secret(), "fast");

        release.send(()).unwrap();
        assert_eq!(slow.await.unwrap().expose_secret(), "slow");
    }

    #[tokio::test]
    async fn test_fetch_token_from_realm() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "registry.example.com"))
            .and(query_param("scope", "repository:jetstack/example:pull"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "abc", "expires_in": 300})),
            )
            .mount(&server)
            .await;

        let challenge = BearerChallenge {
            realm: format!("{}/token", server.uri()),
            service: Some("registry.example.com".to_string()),
            scope: None,
        };
        let credentials = Credentials::Basic {
            username: "user".to_string(),
            password: "pass".into(),
        };
        let token = challenge
            .fetch_token(&Client::new(), "registry.example.com", "jetstack/example", &credentials)
            .await
            .unwrap();
        assert_eq!(token.token.expose_secret(), "abc");
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_fetch_token_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let challenge = BearerChallenge {
            realm: format!("{}/token", server.uri()),
            service: None,
            scope: None,
        };
        let err = challenge
            .fetch_token(&Client::new(), "registry.example.com", "repo", &Credentials::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AuthenticationFailed { .. }));
    }
}
