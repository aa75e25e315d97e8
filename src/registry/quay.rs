use super::{
    ManifestInfo, Registry, RegistryError, TagDescriptor, read_json, send, status_error,
};
use crate::config::{RegistryConfig, RegistryKind};
use crate::secret_string::SecretString;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

const QUAY_API: &str = "https://quay.io";
const TAGS_PAGE_SIZE: u32 = 100;

/// Quay.io, queried through its repository API. Public repositories need no token.
#[derive(Debug)]
pub struct QuayClient {
    http: Client,
    api_base: String,
    token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Vec<QuayTag>,
    #[serde(default)]
    has_additional: bool,
}

#[derive(Debug, Deserialize)]
struct QuayTag {
    name: String,
    manifest_digest: Option<String>,
    /// Seconds since the epoch
    start_ts: Option<i64>,
}

impl From<QuayTag> for TagDescriptor {
    fn from(tag: QuayTag) -> Self {
        TagDescriptor {
            tag: tag.name,
            digest: tag.manifest_digest,
            created: tag
                .start_ts
                .and_then(|seconds| DateTime::from_timestamp(seconds, 0)),
        }
    }
}

impl QuayClient {
    pub fn from_config(config: &RegistryConfig, http: &Client) -> Self {
        Self {
            http: http.clone(),
            api_base: QUAY_API.to_string(),
            token: config.secret("token"),
        }
    }

    pub fn anonymous(http: &Client) -> Self {
        Self {
            http: http.clone(),
            api_base: QUAY_API.to_string(),
            token: None,
        }
    }

    #[cfg(test)]
    fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    async fn tags_page(
        &self,
        host: &str,
        repository: &str,
        query: &[(&str, String)],
    ) -> Result<TagsPage, RegistryError> {
        let url = format!("{}/api/v1/repository/{}/tag/", self.api_base, repository);
        debug!("Listing Quay tags from URL {} with {:?}", url, query);

        let mut request = self.http.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = send(host, request).await?;
        if !response.status().is_success() {
            return Err(status_error(host, repository, &response));
        }
        read_json(host, response).await
    }
}

impl Registry for QuayClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Quay
    }

    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        let mut descriptors = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [
                ("onlyActiveTags", "true".to_string()),
                ("limit", TAGS_PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let tags = self.tags_page(host, repository, &query).await?;
            descriptors.extend(tags.tags.into_iter().map(TagDescriptor::from));
            if !tags.has_additional {
                break;
            }
            page += 1;
        }
        Ok(descriptors)
    }

    async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<ManifestInfo, RegistryError> {
        let query = [
            ("onlyActiveTags", "true".to_string()),
            ("specificTag", tag.to_string()),
        ];
        let found = self
            .tags_page(host, repository, &query)
            .await?
            .tags
            .into_iter()
            .find(|candidate| candidate.name == tag)
            .ok_or_else(|| RegistryError::ManifestNotFound {
                host: host.to_string(),
                repository: repository.to_string(),
                tag: tag.to_string(),
            })?;
        let descriptor = TagDescriptor::from(found);
        Ok(ManifestInfo {
            digest: descriptor.digest,
            created: descriptor.created,
        })
    }
}
