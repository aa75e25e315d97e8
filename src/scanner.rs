use crate::config::ClusterAccess;
use crate::error::BuildError;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::TypeMeta;
use kube::{Api, Client};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};

/// Pods are listed in pages of this size.
const LIST_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Kubernetes API server is unreachable")]
    ClusterUnreachable(#[source] kube::Error),
    #[error("Kubernetes API server rejected the credentials")]
    ClusterAuthError(#[source] kube::Error),
    #[error("failed to list pods")]
    ListFailed(#[source] kube::Error),
}

impl From<kube::Error> for ScanError {
    fn from(error: kube::Error) -> Self {
        let code = match &error {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        };
        match (code, &error) {
            (Some(401 | 403), _) | (_, kube::Error::Auth(_)) => ScanError::ClusterAuthError(error),
            (None, kube::Error::HyperError(_) | kube::Error::Service(_)) => {
                ScanError::ClusterUnreachable(error)
            }
            _ => ScanError::ListFailed(error),
        }
    }
}

/// Connects with the configured kubeconfig, or with the in-cluster / default kubeconfig
/// when none is configured. No request is sent until the first listing.
pub async fn create_client(cluster: &ClusterAccess) -> Result<Client, BuildError> {
    let Some(path) = cluster.kubeconfig_path() else {
        info!("Initializing Kubernetes client from the environment");
        return Ok(Client::try_default().await?);
    };

    info!("Initializing Kubernetes client from kubeconfig {}", path.display());
    let kubeconfig_error = |source| BuildError::Kubeconfig {
        path: path.to_path_buf(),
        source,
    };
    let kubeconfig = Kubeconfig::read_from(path).map_err(kubeconfig_error)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(kubeconfig_error)?;
    Ok(Client::try_from(config)?)
}

/// Lists the pods of a cluster, restricted by the namespace policy.
///
/// With include namespaces set, only those namespaces are listed; excluded namespaces
/// are then removed, so a namespace that is both included and excluded is skipped.
#[derive(Clone)]
pub struct WorkloadScanner {
    client: Client,
    resource: ApiResource,
    include_namespaces: BTreeSet<String>,
    exclude_namespaces: BTreeSet<String>,
}

impl WorkloadScanner {
    pub fn new(client: Client, cluster: &ClusterAccess) -> Self {
        info!("Scanning resource type {}", cluster.resource());
        Self {
            client,
            resource: ApiResource::erase::<Pod>(&()),
            include_namespaces: cluster.include_namespaces.clone(),
            exclude_namespaces: cluster.exclude_namespaces.clone(),
        }
    }

    /// Pods in listing order: per namespace in name order when include namespaces are
    /// set, otherwise in the order the API server returns them cluster-wide.
    pub async fn list(&self) -> Result<Vec<DynamicObject>, ScanError> {
        let mut pods = Vec::new();
        if self.include_namespaces.is_empty() {
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.resource);
            pods.extend(self.list_all(&api).await?);
        } else {
            for namespace in self.include_namespaces.difference(&self.exclude_namespaces) {
                let api: Api<DynamicObject> =
                    Api::namespaced_with(self.client.clone(), namespace, &self.resource);
                pods.extend(self.list_all(&api).await?);
            }
        }

        pods.retain(|pod| self.namespace_allowed(pod.metadata.namespace.as_deref()));
        for pod in &mut pods {
            // list items carry no type information of their own
            pod.types.get_or_insert_with(|| TypeMeta {
                api_version: self.resource.api_version.clone(),
                kind: self.resource.kind.clone(),
            });
        }
        info!("Found {} pods", pods.len());
        Ok(pods)
    }

    async fn list_all(&self, api: &Api<DynamicObject>) -> Result<Vec<DynamicObject>, ScanError> {
        let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
        if let Some(selector) = self.exclude_field_selector() {
            params = params.fields(&selector);
        }

        let mut pods = Vec::new();
        loop {
            let page = api.list(&params).await?;
            debug!("Listed {} pods", page.items.len());
            pods.extend(page.items);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => params = params.continue_token(&token),
                _ => break,
            }
        }
        Ok(pods)
    }

    /// Lets the API server drop excluded namespaces already.
    fn exclude_field_selector(&self) -> Option<String> {
        if self.exclude_namespaces.is_empty() {
            return None;
        }
        Some(
            self.exclude_namespaces
                .iter()
                .map(|namespace| format!("metadata.namespace!={}", namespace))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    fn namespace_allowed(&self, namespace: Option<&str>) -> bool {
        let namespace = namespace.unwrap_or_default();
        if !self.include_namespaces.is_empty() && !self.include_namespaces.contains(namespace) {
            return false;
        }
        !self.exclude_namespaces.contains(namespace)
    }
}

/// Image strings of a pod's containers in spec order, followed by its init containers.
/// Containers without an image are skipped.
pub fn container_images(pod: &DynamicObject) -> Vec<String> {
    ["containers", "initContainers"]
        .iter()
        .filter_map(|field| pod.data.get("spec")?.get(*field)?.as_array())
        .flatten()
        .filter_map(|container| container.get("image")?.as_str())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupVersionResource;
    use std::io::Write;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pod(namespace: &str, name: &str, images: &[&str]) -> serde_json::Value {
        let containers: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(i, image)| serde_json::json!({"name": format!("c{}", i), "image": image}))
            .collect();
        serde_json::json!({
            "metadata": {"name": name, "namespace": namespace},
            "spec": {"containers": containers}
        })
    }

    fn pod_list(items: Vec<serde_json::Value>, continue_token: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {"resourceVersion": "1", "continue": continue_token},
            "items": items
        })
    }

    fn kubeconfig_file(server: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
apiVersion: v1
kind: Config
clusters:
- cluster:
    server: {server}
  name: example
contexts:
- context:
    cluster: example
    namespace: default
    user: test
  name: test
current-context: test
users:
- name: test
  user:
    username: test
    password: test
"#
        )
        .unwrap();
        file
    }

    fn cluster(
        kubeconfig: &tempfile::NamedTempFile,
        include: &[&str],
        exclude: &[&str],
    ) -> ClusterAccess {
        ClusterAccess {
            kubeconfig: Some(kubeconfig.path().to_path_buf()),
            resource_type: Some(GroupVersionResource {
                group: "g".to_string(),
                version: "v".to_string(),
                resource: "r".to_string(),
            }),
            include_namespaces: include.iter().map(|s| s.to_string()).collect(),
            exclude_namespaces: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn scanner(cluster: &ClusterAccess) -> WorkloadScanner {
        let client = create_client(cluster).await.unwrap();
        WorkloadScanner::new(client, cluster)
    }

    #[test]
    fn test_container_images_includes_init_containers() {
        let pod: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p", "namespace": "default"},
            "spec": {
                "containers": [{"name": "app", "image": "nginx:1.27"}, {"name": "no-image"}],
                "initContainers": [{"name": "init", "image": "busybox:1.36"}]
            }
        }))
        .unwrap();
        assert_eq!(container_images(&pod), vec!["nginx:1.27", "busybox:1.36"]);

        let empty: DynamicObject =
            serde_json::from_value(serde_json::json!({"metadata": {"name": "p"}})).unwrap();
        assert!(container_images(&empty).is_empty());
    }

    #[tokio::test]
    async fn test_lists_pods_across_pages_ignoring_resource_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .and(query_param("continue", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(
                vec![pod("b", "second", &["nginx:1.27"])],
                None,
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .and(query_param("limit", "500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(
                vec![pod("a", "first", &["nginx:1.27"])],
                Some("page-2"),
            )))
            .mount(&server)
            .await;

        let kubeconfig = kubeconfig_file(&server.uri());
        let scanner = scanner(&cluster(&kubeconfig, &[], &[])).await;
        let pods = scanner.list().await.unwrap();

        let names: Vec<_> = pods.iter().map(|p| p.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["first", "second"]);
        let types = pods[0].types.as_ref().unwrap();
        assert_eq!((types.api_version.as_str(), types.kind.as_str()), ("v1", "Pod"));
    }

    #[tokio::test]
    async fn test_excluded_namespaces_are_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .and(query_param("fieldSelector", "metadata.namespace!=kube-system"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(
                vec![
                    pod("default", "app", &["nginx:1.27"]),
                    // a server ignoring the field selector is filtered client-side too
                    pod("kube-system", "coredns", &["coredns:1.11"]),
                ],
                None,
            )))
            .mount(&server)
            .await;

        let kubeconfig = kubeconfig_file(&server.uri());
        let scanner = scanner(&cluster(&kubeconfig, &[], &["kube-system"])).await;
        let pods = scanner.list().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.namespace.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_include_narrows_then_exclude_removes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/team-a/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(
                vec![pod("team-a", "a", &["nginx:1.27"])],
                None,
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/team-b/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_list(
                vec![pod("team-b", "b", &["nginx:1.27"])],
                None,
            )))
            .expect(0)
            .mount(&server)
            .await;

        let kubeconfig = kubeconfig_file(&server.uri());
        let scanner = scanner(&cluster(&kubeconfig, &["team-a", "team-b"], &["team-b"])).await;
        let pods = scanner.list().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_scan_error_kinds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "Unauthorized",
                "reason": "Unauthorized",
                "code": 401
            })))
            .mount(&server)
            .await;

        let kubeconfig = kubeconfig_file(&server.uri());
        let rejected = scanner(&cluster(&kubeconfig, &[], &[])).await;
        assert!(matches!(
            rejected.list().await,
            Err(ScanError::ClusterAuthError(_))
        ));

        // nothing listens on port 9 (discard) locally
        let kubeconfig = kubeconfig_file("http://127.0.0.1:9");
        let unreachable = scanner(&cluster(&kubeconfig, &[], &[])).await;
        assert!(matches!(
            unreachable.list().await,
            Err(ScanError::ClusterUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_fails_construction() {
        let cluster = ClusterAccess {
            kubeconfig: Some("/nonexistent/kubeconfig".into()),
            ..Default::default()
        };
        assert!(matches!(
            create_client(&cluster).await,
            Err(BuildError::Kubeconfig { .. })
        ));
    }
}
