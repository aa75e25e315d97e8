//! Ties the scanner, the registry clients and the version resolver together.

use crate::config::Config;
use crate::error::{BuildError, CheckError, FetchError};
use crate::image_reference::ImageReference;
use crate::registry::{RegistryRouter, create_http_client};
use crate::scanner::{WorkloadScanner, container_images, create_client};
use crate::version::{self, ImageVersion};
use futures::{FutureExt, StreamExt};
use kube::api::DynamicObject;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The verdict for one container of one pod.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub pod: DynamicObject,
    pub image: String,
    /// Shared between every record of the same image.
    pub outcome: Result<ImageVersion, Arc<CheckError>>,
}

/// Serializes as `{"Pod": .., "Result": ..}`, or `{"Pod": .., "Error": ".."}` when the image
/// could not be checked.
impl Serialize for ResultRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("Pod", &self.pod)?;
        match &self.outcome {
            Ok(version) => map.serialize_entry("Result", version)?,
            Err(error) => map.serialize_entry("Error", &error_chain(error.as_ref()))?,
        }
        map.end()
    }
}

/// `error: cause: root cause`
pub fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub struct DataGatherer {
    scanner: WorkloadScanner,
    registries: RegistryRouter,
    max_concurrency: usize,
}

impl Config {
    pub async fn new_data_gatherer(&self) -> Result<DataGatherer, BuildError> {
        DataGatherer::new(self).await
    }
}

impl DataGatherer {
    /// Builds every registry client and the Kubernetes client. Invalid registry params or
    /// an unreadable kubeconfig fail here, before any request is sent.
    pub async fn new(config: &Config) -> Result<Self, BuildError> {
        let http = create_http_client(None)?;
        let registries = RegistryRouter::new(&config.registries, &http)?;
        let client = create_client(&config.cluster).await?;
        Ok(Self {
            scanner: WorkloadScanner::new(client, &config.cluster),
            registries,
            max_concurrency: config.max_concurrency.max(1),
        })
    }

    /// Lists the cluster's pods and checks the image of every container. Records are
    /// ordered by pod, then by container. A failed image check is reported in its records;
    /// only a failed pod listing or cancellation fails the whole call.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<ResultRecord>, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Fetch cancelled, discarding partial results");
                Err(FetchError::Cancelled)
            }
            records = self.gather() => records,
        }
    }

    async fn gather(&self) -> Result<Vec<ResultRecord>, FetchError> {
        let pods = self.scanner.list().await?;

        // one slot per (pod, container); identical images share a check
        let mut images: Vec<String> = Vec::new();
        let mut image_index: HashMap<String, usize> = HashMap::new();
        let mut slots: Vec<(usize, usize)> = Vec::new();
        for (pod_index, pod) in pods.iter().enumerate() {
            for image in container_images(pod) {
                let index = *image_index.entry(image.clone()).or_insert_with(|| {
                    images.push(image);
                    images.len() - 1
                });
                slots.push((pod_index, index));
            }
        }
        info!(
            "Checking {} distinct images across {} containers",
            images.len(),
            slots.len()
        );

        let outcomes = check_bounded(images.clone(), self.max_concurrency, |image| async move {
            self.check(&image).await.map_err(Arc::new)
        })
        .await;

        Ok(slots
            .into_iter()
            .map(|(pod_index, index)| ResultRecord {
                pod: pods[pod_index].clone(),
                image: images[index].clone(),
                outcome: outcomes[index].clone(),
            })
            .collect())
    }

    async fn check(&self, image: &str) -> Result<ImageVersion, CheckError> {
        let outcome = self.check_image(image).await;
        match &outcome {
            Ok(verdict) if verdict.is_latest => {
                info!("Image {} is up to date", image)
            }
            Ok(verdict) if verdict.latest_version.is_empty() => {
                info!("Could not determine the latest version of image {}", image)
            }
            Ok(verdict) => info!(
                "Image {} runs {}, latest is {}",
                image, verdict.current_version, verdict.latest_version
            ),
            Err(error) => warn!("Failed to check image {}: {}", image, error_chain(error)),
        }
        outcome
    }

    async fn check_image(&self, image: &str) -> Result<ImageVersion, CheckError> {
        let reference = ImageReference::parse(image)?;
        let client = self.registries.resolve(&reference.host)?;
        Ok(version::resolve(&reference, client.as_ref()).await?)
    }
}

/// Runs `check` for every image with at most `limit` checks in flight. Outcomes are
/// returned in the order of `images`, not in completion order.
async fn check_bounded<T, F, Fut>(images: Vec<String>, limit: usize, check: F) -> Vec<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = T>,
{
    let mut checked: Vec<(usize, T)> = futures::stream::iter(images.into_iter().enumerate())
        .map(|(index, image)| check(image).map(move |outcome| (index, outcome)))
        .buffer_unordered(limit.max(1))
        .collect()
        .await;
    checked.sort_unstable_by_key(|(index, _)| *index);
    checked.into_iter().map(|(_, outcome)| outcome).collect()
}
