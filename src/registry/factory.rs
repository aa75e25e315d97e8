//! Builds the configured registry clients and routes image hosts to them.

use super::ecr::ECR_HOST_PATTERN;
use super::selfhosted::split_host;
use super::{
    AcrClient, DockerHubClient, EcrClient, GcrClient, QuayClient, RegistryClient,
    SelfHostedClient,
};
use crate::config::{RegistryConfig, RegistryKind};
use crate::error::BuildError;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Hosts that serve Docker Hub images.
pub const DOCKER_HUB_HOSTS: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];
pub const GCR_HOSTS: &[&str] = &["gcr.io"];
pub const QUAY_HOSTS: &[&str] = &["quay.io"];

const ACR_HOST_PATTERNS: &[&str] = &["*.azurecr.io"];
/// Regional GCR mirrors and Artifact Registry
const GCR_HOST_PATTERNS: &[&str] = &["*.gcr.io", "*-docker.pkg.dev"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no registry configured for host {0}")]
    NoRegistryForHost(String),
}

/// Maps image hosts onto registry clients: exact host names first, then cloud host
/// patterns, then the ECR host shape. Any other host is served by Docker Hub.
///
/// Cloud hosts whose provider is not configured do not fall back to Docker Hub.
#[derive(Debug)]
pub struct RegistryRouter {
    exact: HashMap<String, Arc<RegistryClient>>,
    patterns: GlobSet,
    pattern_clients: Vec<Option<Arc<RegistryClient>>>,
    ecr_hosts: Regex,
    ecr: Option<Arc<RegistryClient>>,
    docker_hub: Arc<RegistryClient>,
}

/// Accepted param keys, per registry kind.
fn known_params(kind: RegistryKind) -> &'static [&'static str] {
    match kind {
        RegistryKind::Acr => &["refresh_token", "username", "password"],
        RegistryKind::Ecr => &["access_key_id", "secret_access_key", "session_token"],
        RegistryKind::Gcr => &["token"],
        RegistryKind::Docker => &["token", "username", "password"],
        RegistryKind::Quay => &["token"],
        RegistryKind::Selfhosted => &["host", "username", "password", "bearer", "ca_path"],
    }
}

/// Builds the client for one configuration entry. `position` is the entry's 1-based
/// position in the registries list and names self-hosted entries in logs.
pub fn build(
    config: &RegistryConfig,
    position: usize,
    http: &Client,
) -> Result<RegistryClient, BuildError> {
    let known = known_params(config.kind);
    for key in config.params.keys() {
        if !known.contains(&key.as_str()) {
            warn!(
                "Ignoring unknown param {} for {} registry",
                key, config.kind
            );
        }
    }

    let client = match config.kind {
        RegistryKind::Acr => RegistryClient::Acr(AcrClient::from_config(config, http)?),
        RegistryKind::Ecr => RegistryClient::Ecr(EcrClient::from_config(config, http)?),
        RegistryKind::Gcr => RegistryClient::Gcr(GcrClient::from_config(config, http)),
        RegistryKind::Docker => {
            RegistryClient::DockerHub(DockerHubClient::from_config(config, http)?)
        }
        RegistryKind::Quay => RegistryClient::Quay(QuayClient::from_config(config, http)),
        RegistryKind::Selfhosted => RegistryClient::SelfHosted(SelfHostedClient::from_config(
            config,
            format!("selfhosted-{}", position),
            http,
        )?),
    };
    Ok(client)
}

fn host_patterns(patterns: &[&str]) -> Result<GlobSet, BuildError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| BuildError::InvalidHostPattern(e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| BuildError::InvalidHostPattern(e.to_string()))
}

impl RegistryRouter {
    /// Builds one client per configuration entry. Docker Hub, GCR and Quay get anonymous
    /// clients unless configured; self-hosted entries may claim any host, including those.
    pub fn new(configs: &[RegistryConfig], http: &Client) -> Result<Self, BuildError> {
        let mut exact: HashMap<String, Arc<RegistryClient>> = HashMap::new();
        let anonymous_gcr = Arc::new(RegistryClient::Gcr(GcrClient::anonymous(http)));
        let anonymous_docker_hub =
            Arc::new(RegistryClient::DockerHub(DockerHubClient::anonymous(http)));
        let anonymous = [
            (DOCKER_HUB_HOSTS, anonymous_docker_hub.clone()),
            (GCR_HOSTS, anonymous_gcr.clone()),
            (
                QUAY_HOSTS,
                Arc::new(RegistryClient::Quay(QuayClient::anonymous(http))),
            ),
        ];
        for (hosts, client) in anonymous {
            for host in hosts {
                exact.insert(host.to_string(), client.clone());
            }
        }

        let mut cloud: HashMap<RegistryKind, Arc<RegistryClient>> = HashMap::new();
        let mut selfhosted_hosts: HashMap<String, String> = HashMap::new();

        for (index, config) in configs.iter().enumerate() {
            let position = index + 1;
            if config.kind == RegistryKind::Selfhosted {
                let client = build(config, position, http)?;
                let RegistryClient::SelfHosted(selfhosted) = &client else {
                    continue;
                };
                let host = selfhosted.host().to_string();
                let label = selfhosted.label().to_string();
                if let Some(previous) = selfhosted_hosts.insert(host.clone(), label.clone()) {
                    return Err(BuildError::InvalidRegistryConfig {
                        kind: RegistryKind::Selfhosted,
                        reason: format!(
                            "{} and {} are both configured for host {}",
                            previous, label, host
                        ),
                    });
                }
                exact.insert(host, Arc::new(client));
                continue;
            }

            if cloud.contains_key(&config.kind) {
                warn!(
                    "Registry {} is configured more than once, keeping the first entry",
                    config.kind
                );
                continue;
            }
            let client = Arc::new(build(config, position, http)?);
            info!("Configured {} registry", config.kind);
            cloud.insert(config.kind, client);
        }

        // configured cloud clients replace the anonymous defaults, but not self-hosted claims
        for (kind, hosts) in [
            (RegistryKind::Docker, DOCKER_HUB_HOSTS),
            (RegistryKind::Gcr, GCR_HOSTS),
            (RegistryKind::Quay, QUAY_HOSTS),
        ] {
            let Some(client) = cloud.get(&kind) else {
                continue;
            };
            for host in hosts {
                if !selfhosted_hosts.contains_key(*host) {
                    exact.insert(host.to_string(), client.clone());
                }
            }
        }

        let mut pattern_list: Vec<&str> = Vec::new();
        let mut pattern_clients = Vec::new();
        let pattern_kinds = [
            (RegistryKind::Acr, ACR_HOST_PATTERNS),
            (RegistryKind::Gcr, GCR_HOST_PATTERNS),
        ];
        for (kind, patterns) in pattern_kinds {
            let client = match (kind, cloud.get(&kind)) {
                (_, Some(client)) => Some(client.clone()),
                // regional GCR hosts serve public images too
                (RegistryKind::Gcr, None) => Some(anonymous_gcr.clone()),
                _ => None,
            };
            for pattern in patterns {
                pattern_list.push(*pattern);
                pattern_clients.push(client.clone());
            }
        }

        let docker_hub = cloud
            .get(&RegistryKind::Docker)
            .cloned()
            .unwrap_or(anonymous_docker_hub);

        Ok(Self {
            exact,
            patterns: host_patterns(&pattern_list)?,
            pattern_clients,
            ecr_hosts: Regex::new(ECR_HOST_PATTERN)
                .map_err(|e| BuildError::InvalidHostPattern(e.to_string()))?,
            ecr: cloud.remove(&RegistryKind::Ecr),
            docker_hub,
        })
    }

    /// The client serving images on `host`. Hosts are compared case-insensitively; a
    /// `scheme://` prefix is ignored.
    pub fn resolve(&self, host: &str) -> Result<Arc<RegistryClient>, ResolveError> {
        let (_, host) = split_host(host);
        if let Some(client) = self.exact.get(&host) {
            return Ok(client.clone());
        }
        if let Some(index) = self.patterns.matches(&host).first() {
            return self
                .pattern_clients
                .get(*index)
                .cloned()
                .flatten()
                .ok_or(ResolveError::NoRegistryForHost(host));
        }
        if self.ecr_hosts.is_match(&host) {
            return self
                .ecr
                .clone()
                .ok_or(ResolveError::NoRegistryForHost(host));
        }
        Ok(self.docker_hub.clone())
    }
}
