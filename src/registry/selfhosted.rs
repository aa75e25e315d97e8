use super::auth::Credentials;
use super::v2::V2Client;
use super::{ManifestInfo, Registry, RegistryError, TagDescriptor};
use crate::config::{RegistryConfig, RegistryKind};
use crate::error::BuildError;
use reqwest::Client;
use std::path::Path;
use tracing::info;

/// A registry implementing the registry HTTP API directly, addressed by host.
#[derive(Debug)]
pub struct SelfHostedClient {
    label: String,
    host: String,
    credentials: Credentials,
    v2: V2Client,
}

/// Splits a configured host such as `http://registry.local:5000/` into the scheme to use
/// and the bare `host[:port]` images refer to.
pub fn split_host(configured: &str) -> (&'static str, String) {
    let configured = configured.trim().trim_end_matches('/');
    let (scheme, host) = match configured.split_once("://") {
        Some((scheme, host)) if scheme.eq_ignore_ascii_case("http") => ("http", host),
        Some((_, host)) => ("https", host),
        None => ("https", configured),
    };
    (scheme, host.to_ascii_lowercase())
}

impl SelfHostedClient {
    pub fn from_config(
        config: &RegistryConfig,
        label: String,
        http: &Client,
    ) -> Result<Self, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidRegistryConfig {
            kind: RegistryKind::Selfhosted,
            reason: format!("{}: {}", label, reason),
        };

        let configured_host = config.param("host").ok_or_else(|| invalid("host is required"))?;
        let (scheme, host) = split_host(configured_host);
        if host.is_empty() || host.contains('/') {
            return Err(invalid("host must be of the form [scheme://]host[:port]"));
        }

        let credentials = match (
            config.param("username"),
            config.secret("password"),
            config.secret("bearer"),
        ) {
            (None, None, None) => Credentials::Anonymous,
            (None, None, Some(token)) => Credentials::Bearer(token),
            (Some(username), Some(password), None) => Credentials::Basic {
                username: username.to_string(),
                password,
            },
            (Some(_), Some(_), Some(_)) => {
                return Err(invalid(
                    "either username/password or bearer may be set, not both",
                ));
            }
            _ => return Err(invalid("username and password must be set together")),
        };

        let http = match config.param("ca_path") {
            Some(path) => super::create_http_client(Some(Path::new(path)))?,
            None => http.clone(),
        };

        info!(
            "Configured self-hosted registry {} at {}://{}",
            label, scheme, host
        );
        Ok(Self {
            label,
            host,
            credentials,
            v2: V2Client::new(http, scheme),
        })
    }

    /// The `host[:port]` key images are matched against.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Registry for SelfHostedClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Selfhosted
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
