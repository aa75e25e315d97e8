use std::fmt;
use thiserror::Error;

/// Host assumed for images that do not name a registry, e.g. `nginx:1.27`.
pub const DOCKER_HUB_HOST: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// A container image string split into its registry host, repository path and
/// the tag and/or digest it is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub host: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

/// Every variant is an invalid image reference; the variant says why.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageReferenceError {
    #[error("invalid image reference: image is empty")]
    Empty,
    #[error("invalid image reference {0:?}: more than one digest")]
    MultipleDigests(String),
    #[error("invalid image reference {0:?}: repository is missing")]
    MissingRepository(String),
    #[error("invalid image reference {0:?}: {1}")]
    InvalidFormat(String, &'static str),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ImageReferenceError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ImageReferenceError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ImageReferenceError::InvalidFormat(
                s.to_string(),
                "contains whitespace",
            ));
        }

        let (name, digest) = match s.matches('@').count() {
            0 => (s, None),
            1 => {
                let (name, digest) = s.split_once('@').unwrap_or((s, ""));
                if !is_valid_digest(digest) {
                    return Err(ImageReferenceError::InvalidFormat(
                        s.to_string(),
                        "digest must have the form <algorithm>:<hex>",
                    ));
                }
                (name, Some(digest.to_string()))
            }
            _ => return Err(ImageReferenceError::MultipleDigests(s.to_string())),
        };

        // A colon only denotes a tag when it follows the last slash, otherwise it
        // is the port of the registry host
        let last_slash = name.rfind('/');
        let (without_tag, tag) = match name.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&name[..pos], Some(name[pos + 1..].to_string()))
            }
            _ => (name, None),
        };
        if tag.as_deref() == Some("") {
            return Err(ImageReferenceError::InvalidFormat(
                s.to_string(),
                "tag is empty",
            ));
        }

        let (host, repository) = match without_tag.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (first, rest),
            _ => (DOCKER_HUB_HOST, without_tag),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(ImageReferenceError::MissingRepository(s.to_string()));
        }

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            host: host.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Host and repository with tag and digest stripped.
    pub fn image_url(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty() && !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
