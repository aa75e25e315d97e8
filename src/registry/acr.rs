use super::auth::{CachedToken, TokenCache, send_with_token};
use super::{
    ManifestInfo, Registry, RegistryError, TagDescriptor, manifest_status_error, read_json, send,
    status_error,
};
use crate::config::{RegistryConfig, RegistryKind};
use crate::error::BuildError;
use crate::secret_string::SecretString;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// ACR pages its tag listing; larger pages mean fewer round trips.
const TAGS_PAGE_SIZE: u32 = 100;

/// Azure Container Registry. Credentials are exchanged for a short-lived, repository-scoped
/// access token at the registry's `/oauth2/token` endpoint.
#[derive(Debug)]
pub struct AcrClient {
    http: Client,
    scheme: String,
    auth: AcrAuth,
    tokens: TokenCache,
}

#[derive(Debug)]
enum AcrAuth {
    RefreshToken(SecretString),
    Password {
        username: String,
        password: SecretString,
    },
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<AcrTag>,
}

#[derive(Debug, Deserialize)]
struct TagResponse {
    tag: AcrTag,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcrTag {
    name: String,
    digest: Option<String>,
    created_time: Option<DateTime<Utc>>,
}

impl From<AcrTag> for TagDescriptor {
    fn from(tag: AcrTag) -> Self {
        TagDescriptor {
            tag: tag.name,
            digest: tag.digest,
            created: tag.created_time,
        }
    }
}

impl AcrClient {
    pub fn from_config(config: &RegistryConfig, http: &Client) -> Result<Self, BuildError> {
        let auth = match (
            config.secret("refresh_token"),
            config.param("username"),
            config.secret("password"),
        ) {
            (Some(refresh_token), _, _) => AcrAuth::RefreshToken(refresh_token),
            (None, Some(username), Some(password)) => AcrAuth::Password {
                username: username.to_string(),
                password,
            },
            _ => {
                return Err(BuildError::InvalidRegistryConfig {
                    kind: RegistryKind::Acr,
                    reason: "either refresh_token or username and password are required"
                        .to_string(),
                });
            }
        };

        Ok(Self {
            http: http.clone(),
            scheme: "https".to_string(),
            auth,
            tokens: TokenCache::new(),
        })
    }

    /// Talk plain HTTP, for registries served by a local test server.
    #[cfg(test)]
    fn insecure(mut self) -> Self {
        self.scheme = "http".to_string();
        self
    }

    fn base_url(&self, host: &str) -> String {
        format!("{}://{}", self.scheme, host)
    }

    async fn exchange_token(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<CachedToken, RegistryError> {
        let url = format!("{}/oauth2/token", self.base_url(host));
        let scope = format!("repository:{}:pull,metadata_read", repository);
        debug!("Requesting ACR access token for {} from {}", host, url);

        let request = match &self.auth {
            AcrAuth::RefreshToken(refresh_token) => self.http.post(&url).form(&[
                ("grant_type", "refresh_token"),
                ("service", host),
                ("scope", scope.as_str()),
                ("refresh_token", refresh_token.expose_secret()),
            ]),
            AcrAuth::Password { username, password } => self
                .http
                .get(&url)
                .query(&[("service", host), ("scope", scope.as_str())])
                .basic_auth(username, Some(password.expose_secret())),
        };

        let response = send(host, request).await?;
        if !response.status().is_success() {
            return Err(RegistryError::AuthenticationFailed {
                host: host.to_string(),
                reason: format!("token exchange answered {}", response.status()),
            });
        }
        let body: AccessTokenResponse = read_json(host, response).await?;
        Ok(CachedToken::new(body.access_token, body.expires_in))
    }

    async fn get(
        &self,
        host: &str,
        repository: &str,
        url: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        let key = format!("{}/{}", host, repository);
        send_with_token(
            &self.tokens,
            &key,
            || self.exchange_token(host, repository),
            |token: SecretString| async move {
                send(host, self.http.get(url).bearer_auth(token.expose_secret())).await
            },
        )
        .await
    }
}

impl Registry for AcrClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Acr
    }

    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        let mut descriptors: Vec<TagDescriptor> = Vec::new();
        loop {
            let mut url = format!(
                "{}/acr/v1/{}/_tags?n={}",
                self.base_url(host),
                repository,
                TAGS_PAGE_SIZE
            );
            if let Some(last) = descriptors.last() {
                url.push_str(&format!("&last={}", last.tag));
            }

            debug!("Listing ACR tags from URL {}", url);
            let response = self.get(host, repository, &url).await?;
            if !response.status().is_success() {
                return Err(status_error(host, repository, &response));
            }
            let page: TagsResponse = read_json(host, response).await?;
            let page_len = page.tags.len();
            descriptors.extend(page.tags.into_iter().map(TagDescriptor::from));
            if page_len < TAGS_PAGE_SIZE as usize {
                break;
            }
        }
        Ok(descriptors)
    }

    async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<ManifestInfo, RegistryError> {
        let url = format!("{}/acr/v1/{}/_tags/{}", self.base_url(host), repository, tag);
        let response = self.get(host, repository, &url).await?;
        if !response.status().is_success() {
            return Err(manifest_status_error(host, repository, tag, &response));
        }
        let body: TagResponse = read_json(host, response).await?;
        Ok(ManifestInfo {
            digest: body.tag.digest,
            created: body.tag.created_time,
        })
    }
}
