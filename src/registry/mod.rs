//! Registry clients, one per supported provider, behind the [`Registry`] capability.
//!
//! Every client owns its authentication handshake. Tokens are fetched lazily on the first
//! call, cached for the lifetime of the client and refreshed when the registry rejects them.

pub mod acr;
pub mod auth;
pub mod dockerhub;
pub mod ecr;
pub mod factory;
pub mod gcr;
pub mod quay;
pub mod selfhosted;
pub mod v2;

use crate::config::RegistryKind;
use crate::error::BuildError;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub use acr::AcrClient;
pub use dockerhub::DockerHubClient;
pub use ecr::EcrClient;
pub use factory::{RegistryRouter, ResolveError};
pub use gcr::GcrClient;
pub use quay::QuayClient;
pub use selfhosted::SelfHostedClient;

/// A tag of a repository, with whatever manifest metadata the listing endpoint returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDescriptor {
    pub tag: String,
    pub digest: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestInfo {
    pub digest: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("authentication against registry {host} failed: {reason}")]
    AuthenticationFailed { host: String, reason: String },
    #[error("repository {repository} not found on registry {host}")]
    RepositoryNotFound { host: String, repository: String },
    #[error("manifest {repository}:{tag} not found on registry {host}")]
    ManifestNotFound {
        host: String,
        repository: String,
        tag: String,
    },
    #[error("registry {host} is unreachable")]
    RegistryUnreachable {
        host: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("registry {host} is rate limiting requests")]
    RateLimited {
        host: String,
        retry_after_seconds: Option<u64>,
    },
    #[error("registry {host} returned unexpected status {status} for {url}")]
    UnexpectedStatus {
        host: String,
        status: u16,
        url: String,
    },
    #[error("registry {host} returned an invalid response: {reason}")]
    InvalidResponse { host: String, reason: String },
}

/// The operations the version checker needs from a registry.
#[allow(async_fn_in_trait)]
pub trait Registry {
    fn kind(&self) -> RegistryKind;

    /// Lists the tags of `repository` on `host`.
    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError>;

    /// Fetches digest and creation time of a single tag.
    async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<ManifestInfo, RegistryError>;
}

/// The closed set of registry clients, selected once per configuration entry.
#[derive(Debug)]
pub enum RegistryClient {
    Acr(AcrClient),
    Ecr(EcrClient),
    Gcr(GcrClient),
    DockerHub(DockerHubClient),
    Quay(QuayClient),
    SelfHosted(SelfHostedClient),
}

impl Registry for RegistryClient {
    fn kind(&self) -> RegistryKind {
        match self {
            RegistryClient::Acr(c) => c.kind(),
            RegistryClient::Ecr(c) => c.kind(),
            RegistryClient::Gcr(c) => c.kind(),
            RegistryClient::DockerHub(c) => c.kind(),
            RegistryClient::Quay(c) => c.kind(),
            RegistryClient::SelfHosted(c) => c.kind(),
        }
    }

    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        match self {
            RegistryClient::Acr(c) => c.list_tags(host, repository).await,
            RegistryClient::Ecr(c) => c.list_tags(host, repository).await,
            RegistryClient::Gcr(c) => c.list_tags(host, repository).await,
            RegistryClient::DockerHub(c) => c.list_tags(host, repository).await,
            RegistryClient::Quay(c) => c.list_tags(host, repository).await,
            RegistryClient::SelfHosted(c) => c.list_tags(host, repository).await,
        }
    }

    async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<ManifestInfo, RegistryError> {
        match self {
            RegistryClient::Acr(c) => c.get_manifest(host, repository, tag).await,
            RegistryClient::Ecr(c) => c.get_manifest(host, repository, tag).await,
            RegistryClient::Gcr(c) => c.get_manifest(host, repository, tag).await,
            RegistryClient::DockerHub(c) => c.get_manifest(host, repository, tag).await,
            RegistryClient::Quay(c) => c.get_manifest(host, repository, tag).await,
            RegistryClient::SelfHosted(c) => c.get_manifest(host, repository, tag).await,
        }
    }
}

/// Builds the HTTP client shared by registry clients. System certificates are loaded
/// automatically with rustls-tls-native-roots; `ca_certificate` adds one more PEM root.
pub fn create_http_client(ca_certificate: Option<&Path>) -> Result<Client, BuildError> {
    info!("Initializing registry HTTP client");
    let mut client_builder = Client::builder().user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ));

    if let Some(path) = ca_certificate {
        let file_content = fs::read(path).map_err(|source| BuildError::CaCertificate {
            path: path.to_path_buf(),
            source,
        })?;
        let cert = Certificate::from_pem(&file_content).map_err(BuildError::HttpClient)?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().map_err(BuildError::HttpClient)
}

pub(crate) async fn send(host: &str, request: RequestBuilder) -> Result<Response, RegistryError> {
    request
        .send()
        .await
        .map_err(|source| RegistryError::RegistryUnreachable {
            host: host.to_string(),
            source,
        })
}

/// Maps a non-success response onto the uniform registry failure kinds.
pub(crate) fn status_error(host: &str, repository: &str, response: &Response) -> RegistryError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryError::AuthenticationFailed {
            host: host.to_string(),
            reason: format!("registry answered {}", status),
        },
        StatusCode::NOT_FOUND => RegistryError::RepositoryNotFound {
            host: host.to_string(),
            repository: repository.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited {
            host: host.to_string(),
            retry_after_seconds: response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok()),
        },
        _ => RegistryError::UnexpectedStatus {
            host: host.to_string(),
            status: status.as_u16(),
            url: response.url().to_string(),
        },
    }
}

/// Like [`status_error`], but a 404 names the missing tag rather than the repository.
pub(crate) fn manifest_status_error(
    host: &str,
    repository: &str,
    tag: &str,
    response: &Response,
) -> RegistryError {
    if response.status() == StatusCode::NOT_FOUND {
        return RegistryError::ManifestNotFound {
            host: host.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        };
    }
    status_error(host, repository, response)
}

/// Pagination links are followed with the same credentials, so they must stay on the
/// origin of the first page.
pub(crate) fn same_origin_page(
    host: &str,
    first: &str,
    next: &str,
) -> Result<(), RegistryError> {
    let origin = |url: &str| Url::parse(url).map(|url| url.origin());
    match (origin(first), origin(next)) {
        (Ok(first), Ok(next)) if first == next => Ok(()),
        _ => Err(RegistryError::InvalidResponse {
            host: host.to_string(),
            reason: format!("refusing to follow pagination link to {}", next),
        }),
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    host: &str,
    response: Response,
) -> Result<T, RegistryError> {
    response.json::<T>().await.map_err(|source| {
        if source.is_decode() {
            RegistryError::InvalidResponse {
                host: host.to_string(),
                reason: source.to_string(),
            }
        } else {
            RegistryError::RegistryUnreachable {
                host: host.to_string(),
                source,
            }
        }
    })
}
