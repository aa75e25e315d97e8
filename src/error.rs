use crate::config::RegistryKind;
use crate::image_reference::ImageReferenceError;
use crate::registry::ResolveError;
use crate::scanner::ScanError;
use crate::version::VersionError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while constructing the checker from its configuration. These abort startup.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid {kind} registry configuration: {reason}")]
    InvalidRegistryConfig { kind: RegistryKind, reason: String },
    #[error("invalid registry host pattern: {0}")]
    InvalidHostPattern(String),
    #[error("failed to read kubeconfig {}", path.display())]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: kube::config::KubeconfigError,
    },
    #[error("failed to create Kubernetes client")]
    Kube(#[from] kube::Error),
    #[error("failed to read CA certificate {}", path.display())]
    CaCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Why the version of a single image could not be determined. Reported per result record.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    InvalidImage(#[from] ImageReferenceError),
    #[error(transparent)]
    NoRegistry(#[from] ResolveError),
    #[error(transparent)]
    Version(#[from] VersionError),
}

/// Failures that abort a whole gathering pass.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to list workloads")]
    Scan(#[from] ScanError),
    #[error("gathering was cancelled")]
    Cancelled,
}
