use super::auth::{CachedToken, TokenCache, send_with_token};
use super::{
    ManifestInfo, Registry, RegistryError, TagDescriptor, manifest_status_error, read_json,
    same_origin_page, send, status_error,
};
use crate::config::{RegistryConfig, RegistryKind};
use crate::error::BuildError;
use crate::secret_string::SecretString;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

const DOCKER_HUB_API: &str = "https://hub.docker.com";
const TAGS_PAGE_SIZE: u32 = 100;
/// Cache key of the session token; one login serves every repository.
const LOGIN_TOKEN_KEY: &str = "login";

/// Docker Hub, queried through the Hub API rather than the registry API since only the
/// former reports digests and push times in the tag listing.
#[derive(Debug)]
pub struct DockerHubClient {
    http: Client,
    api_base: String,
    auth: DockerHubAuth,
    tokens: TokenCache,
}

#[derive(Debug)]
enum DockerHubAuth {
    Anonymous,
    Token(SecretString),
    Login {
        username: String,
        password: SecretString,
    },
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    next: Option<String>,
    #[serde(default)]
    results: Vec<HubTag>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
    digest: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    images: Vec<HubImage>,
}

#[derive(Debug, Deserialize)]
struct HubImage {
    digest: Option<String>,
}

impl HubTag {
    /// Multi-arch tags carry the index digest at the top level; older entries only list
    /// per-platform image digests.
    fn digest(&self) -> Option<String> {
        self.digest
            .clone()
            .or_else(|| self.images.iter().find_map(|image| image.digest.clone()))
    }
}

impl From<HubTag> for TagDescriptor {
    fn from(tag: HubTag) -> Self {
        TagDescriptor {
            digest: tag.digest(),
            created: tag.last_updated,
            tag: tag.name,
        }
    }
}

/// Official images live under `library/`.
pub fn hub_repository(repository: &str) -> String {
    if repository.contains('/') {
        repository.to_string()
    } else {
        format!("library/{}", repository)
    }
}

impl DockerHubClient {
    pub fn from_config(config: &RegistryConfig, http: &Client) -> Result<Self, BuildError> {
        let auth = match (
            config.secret("token"),
            config.param("username"),
            config.secret("password"),
        ) {
            (Some(token), _, _) => DockerHubAuth::Token(token),
            (None, Some(username), Some(password)) => DockerHubAuth::Login {
                username: username.to_string(),
                password,
            },
            (None, None, None) => DockerHubAuth::Anonymous,
            _ => {
                return Err(BuildError::InvalidRegistryConfig {
                    kind: RegistryKind::Docker,
                    reason: "username and password must be set together".to_string(),
                });
            }
        };
        Ok(Self::new(http.clone(), auth))
    }

    pub fn anonymous(http: &Client) -> Self {
        Self::new(http.clone(), DockerHubAuth::Anonymous)
    }

    fn new(http: Client, auth: DockerHubAuth) -> Self {
        Self {
            http,
            api_base: DOCKER_HUB_API.to_string(),
            auth,
            tokens: TokenCache::new(),
        }
    }

    #[cfg(test)]
    fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    async fn login(
        &self,
        host: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<CachedToken, RegistryError> {
        let url = format!("{}/v2/users/login", self.api_base);
        debug!("Logging in to Docker Hub as {}", username);
        let request = self.http.post(&url).json(&serde_json::json!({
            "username": username,
            "password": password.expose_secret(),
        }));
        let response = send(host, request).await?;
        if !response.status().is_success() {
            return Err(RegistryError::AuthenticationFailed {
                host: host.to_string(),
                reason: format!("login answered {}", response.status()),
            });
        }
        let body: LoginResponse = read_json(host, response).await?;
        Ok(CachedToken::new(body.token, None))
    }

    async fn get(&self, host: &str, url: &str) -> Result<reqwest::Response, RegistryError> {
        match &self.auth {
            DockerHubAuth::Anonymous => send(host, self.http.get(url)).await,
            DockerHubAuth::Token(token) => {
                send(host, self.http.get(url).bearer_auth(token.expose_secret())).await
            }
            DockerHubAuth::Login { username, password } => {
                send_with_token(
                    &self.tokens,
                    LOGIN_TOKEN_KEY,
                    || self.login(host, username, password),
                    |token: SecretString| async move {
                        send(host, self.http.get(url).bearer_auth(token.expose_secret())).await
                    },
                )
                .await
            }
        }
    }
}

impl Registry for DockerHubClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Docker
    }

    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        let repository = hub_repository(repository);
        let first = format!(
            "{}/v2/repositories/{}/tags?page_size={}",
            self.api_base, repository, TAGS_PAGE_SIZE
        );
        let mut next = Some(first.clone());

        let mut descriptors = Vec::new();
        while let Some(url) = next {
            debug!("Listing Docker Hub tags from URL {}", url);
            let response = self.get(host, &url).await?;
            if !response.status().is_success() {
                return Err(status_error(host, &repository, &response));
            }
            let page: TagsPage = read_json(host, response).await?;
            descriptors.extend(page.results.into_iter().map(TagDescriptor::from));
            next = page.next.filter(|next| !next.is_empty());
            if let Some(url) = &next {
                same_origin_page(host, &first, url)?;
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
        let repository = hub_repository(repository);
        let url = format!(
            "{}/v2/repositories/{}/tags/{}",
            self.api_base, repository, tag
        );
        let response = self.get(host, &url).await?;
        if !response.status().is_success() {
            return Err(manifest_status_error(host, &repository, tag, &response));
        }
        let tag: HubTag = read_json(host, response).await?;
        Ok(ManifestInfo {
            digest: tag.digest(),
            created: tag.last_updated,
        })
    }
}
