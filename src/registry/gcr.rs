use super::auth::Credentials;
use super::v2::V2Client;
use super::{ManifestInfo, Registry, RegistryError, TagDescriptor};
use crate::config::{RegistryConfig, RegistryKind};
use reqwest::Client;

/// Username Google registries expect when an OAuth access token is used as password.
const GCR_TOKEN_USERNAME: &str = "oauth2accesstoken";

/// Google Container Registry and Artifact Registry. The configured token is presented as
/// the basic-auth password; it is not refreshed.
#[derive(Debug)]
pub struct GcrClient {
    credentials: Credentials,
    v2: V2Client,
}

impl GcrClient {
    pub fn from_config(config: &RegistryConfig, http: &Client) -> Self {
        let credentials = match config.secret("token") {
            Some(token) => Credentials::Basic {
                username: GCR_TOKEN_USERNAME.to_string(),
                password: token,
            },
            None => Credentials::Anonymous,
        };
        Self::new(http.clone(), credentials)
    }

    pub fn anonymous(http: &Client) -> Self {
        Self::new(http.clone(), Credentials::Anonymous)
    }

    fn new(http: Client, credentials: Credentials) -> Self {
        Self {
            credentials,
            v2: V2Client::new(http, "https"),
        }
    }
}

impl Registry for GcrClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Gcr
    }

    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        self.v2.list_tags(host, repository, &self.credentials).await
    }

    async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<ManifestInfo, RegistryError> {
        self.v2
            .get_manifest(host, repository, tag, &self.credentials)
            .await
    }
}
