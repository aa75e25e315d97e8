//! Picks the newest tag of an image's repository and compares it with the running one.

use crate::image_reference::{DEFAULT_TAG, ImageReference};
use crate::registry::{Registry, RegistryError, TagDescriptor};
use semver::Version;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// The verdict for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageVersion {
    #[serde(rename = "CurrentVersion")]
    pub current_version: String,
    /// Empty when no tag of the repository parses as a version.
    #[serde(rename = "LatestVersion")]
    pub latest_version: String,
    #[serde(rename = "IsLatest")]
    pub is_latest: bool,
    #[serde(rename = "ImageURL")]
    pub image_url: String,
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("repository {repository} has no tags")]
    NoTagsFound { repository: String },
    #[error("failed to list tags")]
    TagListFailed(#[source] RegistryError),
    #[error("failed to fetch manifest")]
    ManifestFailed(#[source] RegistryError),
}

/// Parses a tag as a semantic version. Accepts a `v` prefix and versions with fewer than
/// three components (`v1`, `1.21`), which are padded with zeros.
pub fn parse_version(tag: &str) -> Option<Version> {
    let tag = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
    let (core, suffix) = match tag.find(['-', '+']) {
        Some(pos) => tag.split_at(pos),
        None => (tag, ""),
    };

    let mut parts = Vec::with_capacity(3);
    for part in core.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        parts.push(part.parse::<u64>().ok()?);
    }
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.resize(3, 0);

    Version::parse(&format!("{}.{}.{}{}", parts[0], parts[1], parts[2], suffix)).ok()
}

/// The tag with the highest version. Pre-releases only take part when `allow_prerelease`
/// is set. Tags with equal versions (`v1.2.0` and `1.2.0`) are ordered by creation time,
/// then by name, so the pick does not depend on listing order.
pub fn select_latest(
    tags: &[TagDescriptor],
    allow_prerelease: bool,
) -> Option<(&TagDescriptor, Version)> {
    tags.iter()
        .filter_map(|descriptor| parse_version(&descriptor.tag).map(|v| (descriptor, v)))
        .filter(|(_, version)| allow_prerelease || version.pre.is_empty())
        .max_by(|(a, va), (b, vb)| {
            va.cmp(vb)
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.tag.cmp(&b.tag))
        })
}

/// The most recently created tag, for repositories whose tags are not versions.
fn newest_tag(tags: &[TagDescriptor]) -> Option<&TagDescriptor> {
    tags.iter()
        .filter(|descriptor| descriptor.created.is_some())
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.tag.cmp(&b.tag)))
}

/// Lists the tags of `image`'s repository on `client` and decides whether the image runs
/// the latest version.
///
/// For tagged images the tag is compared with the highest version among the repository's
/// tags. Images pinned by digest are compared by digest with the latest tag instead, and
/// fall back to the newest tag when no tag is a version.
pub async fn resolve<R: Registry>(
    image: &ImageReference,
    client: &R,
) -> Result<ImageVersion, VersionError> {
    let tags = client
        .list_tags(&image.host, &image.repository)
        .await
        .map_err(VersionError::TagListFailed)?;
    if tags.is_empty() {
        return Err(VersionError::NoTagsFound {
            repository: image.image_url(),
        });
    }
    debug!("Found {} tags for {}", tags.len(), image.image_url());

    let verdict = match &image.digest {
        Some(digest) => resolve_digest(image, digest, &tags, client).await?,
        None => resolve_tag(image, &tags),
    };
    debug!(
        "Image {} runs {}, latest is {:?}",
        verdict.image_url, verdict.current_version, verdict.latest_version
    );
    Ok(verdict)
}

fn resolve_tag(image: &ImageReference, tags: &[TagDescriptor]) -> ImageVersion {
    let current = image.tag.as_deref().unwrap_or(DEFAULT_TAG);
    let current_version = parse_version(current);
    let allow_prerelease = current_version
        .as_ref()
        .is_some_and(|version| !version.pre.is_empty());

    let (latest_version, is_latest) = match select_latest(tags, allow_prerelease) {
        Some((latest, version)) => (
            latest.tag.clone(),
            current_version.is_some_and(|current| current == version),
        ),
        None => (String::new(), false),
    };

    ImageVersion {
        current_version: current.to_string(),
        latest_version,
        is_latest,
        image_url: image.image_url(),
    }
}

async fn resolve_digest<R: Registry>(
    image: &ImageReference,
    digest: &str,
    tags: &[TagDescriptor],
    client: &R,
) -> Result<ImageVersion, VersionError> {
    let latest = select_latest(tags, false)
        .map(|(latest, _)| latest)
        .or_else(|| newest_tag(tags));

    let Some(latest) = latest else {
        return Ok(ImageVersion {
            current_version: digest.to_string(),
            latest_version: String::new(),
            is_latest: false,
            image_url: image.image_url(),
        });
    };

    let latest_digest = match &latest.digest {
        Some(latest_digest) => Some(latest_digest.clone()),
        None => {
            client
                .get_manifest(&image.host, &image.repository, &latest.tag)
                .await
                .map_err(VersionError::ManifestFailed)?
                .digest
        }
    };

    Ok(ImageVersion {
        current_version: digest.to_string(),
        latest_version: latest.tag.clone(),
        is_latest: latest_digest.as_deref() == Some(digest),
        image_url: image.image_url(),
    })
}
