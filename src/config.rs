use crate::secret_string::SecretString;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::{env, fmt, fs, io};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("missing environment variable {0}")]
    MissingEnvVar(String),
    #[error("failed to parse YAML config after environment variable expansion")]
    Parse(#[from] serde_yaml_ng::Error),
    #[error("failed to read secret file {} for registry param {key}", path.display())]
    SecretFile {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "k8s")]
    pub cluster: ClusterAccess,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    /// Upper bound on registry lookups in flight during one fetch
    #[serde(default = "default_max_concurrency", rename = "max-concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterAccess {
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Accepted for compatibility with the generic cluster gatherer configuration.
    /// The scanner ignores it, see [`ClusterAccess::resource`].
    #[serde(default)]
    pub resource_type: Option<GroupVersionResource>,
    #[serde(default)]
    pub exclude_namespaces: BTreeSet<String>,
    #[serde(default)]
    pub include_namespaces: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resource: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Acr,
    Ecr,
    Gcr,
    Docker,
    Quay,
    Selfhosted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub kind: RegistryKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl GroupVersionResource {
    pub fn pods() -> Self {
        Self {
            group: String::new(),
            version: "v1".to_string(),
            resource: "pods".to_string(),
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

impl ClusterAccess {
    /// The resource type to scan. Always core/v1 pods: the version checker only knows how
    /// to read container images out of pods, so a configured `resource-type` is overridden.
    pub fn resource(&self) -> GroupVersionResource {
        let pods = GroupVersionResource::pods();
        match &self.resource_type {
            Some(configured) if *configured != pods => {
                warn!(
                    "Ignoring configured resource-type {}, the version checker always scans {}",
                    configured, pods
                );
            }
            _ => {}
        }
        pods
    }

    /// The kubeconfig path, if one was configured. An empty string counts as unset.
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistryKind::Acr => "acr",
            RegistryKind::Ecr => "ecr",
            RegistryKind::Gcr => "gcr",
            RegistryKind::Docker => "docker",
            RegistryKind::Quay => "quay",
            RegistryKind::Selfhosted => "selfhosted",
        };
        f.write_str(name)
    }
}

impl RegistryConfig {
    /// A param value, treating blank values as absent.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn secret(&self, key: &str) -> Option<SecretString> {
        self.param(key).map(SecretString::from)
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max-concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.as_ref().to_path_buf(),
        source,
    })?;
    parse_config(&yaml_str)
}

/// Parses a YAML config document: expands `${VAR}` placeholders, deserializes, replaces
/// registry params that name a file by the file's contents, and validates the result.
pub fn parse_config(yaml_str: &str) -> Result<Config, ConfigError> {
    let expanded = expand_env_vars(yaml_str)?;
    let mut config: Config = serde_yaml_ng::from_str(&expanded)?;
    for registry in &mut config.registries {
        resolve_secret_files(&mut registry.params)?;
    }
    config.validate()?;
    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)}")
        .map_err(|e| ConfigError::Invalid(format!("invalid env var pattern: {}", e)))?;

    let mut missing: Option<String> = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| caps[1].to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// A param value naming an existing file (typically a mounted secret) is replaced by the
/// trimmed file contents. Any other value is kept as written.
fn resolve_secret_files(params: &mut BTreeMap<String, String>) -> Result<(), ConfigError> {
    for (key, value) in params.iter_mut() {
        let path = Path::new(value.trim());
        if path.as_os_str().is_empty() || !path.is_file() {
            continue;
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::SecretFile {
            key: key.clone(),
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded registry param {} from file {}", key, path.display());
        *value = contents.trim().to_string();
    }
    Ok(())
}
