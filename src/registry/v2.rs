//! Client for the Docker Registry HTTP API V2, shared by every provider that speaks it
//! directly (self-hosted registries, GCR and ECR).

use super::auth::{BearerChallenge, Credentials, TokenCache};
use super::{
    ManifestInfo, RegistryError, TagDescriptor, manifest_status_error, read_json,
    same_origin_page, send, status_error,
};
use crate::secret_string::SecretString;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, LINK, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.v1+prettyjws, \
application/json";

#[derive(Debug)]
pub struct V2Client {
    http: Client,
    scheme: String,
    endpoint: Option<String>,
    tokens: TokenCache,
}

/// GET /v2/<repo>/tags/list response. Google registries add a `manifest` map carrying
/// digests and timestamps.
#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
    #[serde(default)]
    manifest: HashMap<String, GoogleManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleManifestEntry {
    #[serde(default)]
    tag: Vec<String>,
    time_created_ms: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    schema_version: Option<u32>,
    config: Option<ManifestConfig>,
    #[serde(default)]
    history: Vec<V1History>,
}

#[derive(Debug, Deserialize)]
struct ManifestConfig {
    digest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1History {
    v1_compatibility: String,
}

/// Image config blob, or the v1 compatibility entry of a schema 1 manifest
#[derive(Debug, Deserialize)]
struct ImageConfig {
    created: Option<DateTime<Utc>>,
}

impl TagList {
    fn into_descriptors(self) -> Vec<TagDescriptor> {
        let mut by_tag: HashMap<&str, (&str, Option<DateTime<Utc>>)> = HashMap::new();
        for (digest, entry) in &self.manifest {
            let created = entry
                .time_created_ms
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis);
            for tag in &entry.tag {
                by_tag.insert(tag, (digest, created));
            }
        }

        self.tags
            .iter()
            .flatten()
            .map(|tag| {
                let (digest, created) = match by_tag.get(tag.as_str()) {
                    Some((digest, created)) => (Some(digest.to_string()), *created),
                    None => (None, None),
                };
                TagDescriptor {
                    tag: tag.clone(),
                    digest,
                    created,
                }
            })
            .collect()
    }
}

impl V2Client {
    pub fn new(http: Client, scheme: impl Into<String>) -> Self {
        Self {
            http,
            scheme: scheme.into(),
            endpoint: None,
            tokens: TokenCache::new(),
        }
    }

    /// Sends every request to `endpoint` instead of the image's host.
    #[cfg(test)]
    pub(crate) fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn base_url(&self, host: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("{}://{}", self.scheme, host),
        }
    }

    pub async fn list_tags(
        &self,
        host: &str,
        repository: &str,
        credentials: &Credentials,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        let first = format!("{}/v2/{}/tags/list", self.base_url(host), repository);
        let mut url = first.clone();
        let mut descriptors = Vec::new();
        loop {
            debug!("Listing tags from URL {}", url);
            let response = self
                .get(host, repository, &url, "application/json", credentials)
                .await?;
            if !response.status().is_success() {
                return Err(status_error(host, repository, &response));
            }

            let next = next_page(&response);
            let page: TagList = read_json(host, response).await?;
            descriptors.extend(page.into_descriptors());
            match next {
                Some(next) => {
                    same_origin_page(host, &first, &next)?;
                    url = next;
                }
                None => break,
            }
        }
        Ok(descriptors)
    }

    pub async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
        credentials: &Credentials,
    ) -> Result<ManifestInfo, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(host),
            repository,
            tag
        );
        debug!("Fetching manifest from URL {}", url);
        let response = self
            .get(host, repository, &url, MANIFEST_ACCEPT, credentials)
            .await?;
        if !response.status().is_success() {
            return Err(manifest_status_error(host, repository, tag, &response));
        }

        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let manifest: Manifest = read_json(host, response).await?;

        let created = match manifest.schema_version {
            Some(1) => manifest
                .history
                .first()
                .and_then(|entry| serde_json::from_str::<ImageConfig>(&entry.v1_compatibility).ok())
                .and_then(|config| config.created),
            _ => match &manifest.config {
                Some(config) => {
                    self.config_created(host, repository, &config.digest, credentials)
                        .await
                }
                None => None,
            },
        };

        Ok(ManifestInfo { digest, created })
    }

    /// Creation time from the image config blob. Missing or unreadable blobs only cost
    /// the timestamp.
    async fn config_created(
        &self,
        host: &str,
        repository: &str,
        digest: &str,
        credentials: &Credentials,
    ) -> Option<DateTime<Utc>> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url(host), repository, digest);
        let response = match self
            .get(host, repository, &url, "application/json", credentials)
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("Config blob {} answered {}", url, response.status());
                return None;
            }
            Err(e) => {
                debug!("Failed to fetch config blob {}: {}", url, e);
                return None;
            }
        };
        read_json::<ImageConfig>(host, response)
            .await
            .ok()
            .and_then(|config| config.created)
    }

    /// Sends an authorized GET. A 401 carrying a bearer challenge is answered by fetching a
    /// token from the challenge's realm with `credentials` and retrying once.
    async fn get(
        &self,
        host: &str,
        repository: &str,
        url: &str,
        accept: &str,
        credentials: &Credentials,
    ) -> Result<Response, RegistryError> {
        let key = format!("{}/{}", host, repository);
        let cached = self.tokens.get(&key).await;
        let response = self
            .send_once(host, url, accept, cached.as_ref(), credentials)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED
            || matches!(credentials, Credentials::Bearer(_))
        {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(response);
        };

        debug!(
            "Registry {} requested a bearer token from {}",
            host, challenge.realm
        );
        let token = self
            .tokens
            .get_or_refresh(&key, cached.as_ref(), || {
                challenge.fetch_token(&self.http, host, repository, credentials)
            })
            .await?;
        self.send_once(host, url, accept, Some(&token), credentials)
            .await
    }

    async fn send_once(
        &self,
        host: &str,
        url: &str,
        accept: &str,
        token: Option<&SecretString>,
        credentials: &Credentials,
    ) -> Result<Response, RegistryError> {
        let request = self.http.get(url).header(ACCEPT, accept);
        let request = match token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => credentials.apply(request),
        };
        send(host, request).await
    }
}

/// Resolves a `Link: <...>; rel="next"` header against the URL that was requested.
fn next_page(response: &Response) -> Option<String> {
    let link = response.headers().get(LINK)?.to_str().ok()?;
    let target = link
        .split(',')
        .find(|part| part.contains("rel=\"next\"") || part.contains("rel=next"))?
        .split(';')
        .next()?
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>');
    let base: &Url = response.url();
    base.join(target).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> V2Client {
        V2Client::new(Client::new(), "http")
    }

    fn host_of(server: &MockServer) -> String {
        server.address().to_string()
    }

    #[tokio::test]
    async fn test_list_tags_anonymous() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/jetstack/example/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "jetstack/example",
                "tags": ["v1.0.0", "v1.0.1"]
            })))
            .mount(&server)
            .await;

        let tags = client()
            .list_tags(&host_of(&server), "jetstack/example", &Credentials::Anonymous)
            .await
            .unwrap();
        let names: Vec<_> = tags.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["v1.0.0", "v1.0.1"]);
        assert!(tags.iter().all(|t| t.digest.is_none() && t.created.is_none()));
    }

    #[tokio::test]
    async fn test_list_tags_follows_link_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/tags/list"))
            .and(query_param("last", "b"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "repo", "tags": ["c"]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/tags/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", "</v2/repo/tags/list?n=2&last=b>; rel=\"next\"")
                    .set_body_json(serde_json::json!({"name": "repo", "tags": ["a", "b"]})),
            )
            .mount(&server)
            .await;

        let tags = client()
            .list_tags(&host_of(&server), "repo", &Credentials::Anonymous)
            .await
            .unwrap();
        let names: Vec<_> = tags.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_list_tags_refuses_foreign_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/tags/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "Link",
                        "<https://elsewhere.example.com/v2/repo/tags/list?last=b>; rel=\"next\"",
                    )
                    .set_body_json(serde_json::json!({"name": "repo", "tags": ["a", "b"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client()
            .list_tags(
                &host_of(&server),
                "repo",
                &Credentials::Bearer("secret".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_list_tags_reads_google_manifest_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/project/image/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "project/image",
                "tags": ["v1", "v2"],
                "manifest": {
                    "sha256:aaa": {"tag": ["v2"], "timeCreatedMs": "1700000000000", "timeUploadedMs": "1700000001000"}
                }
            })))
            .mount(&server)
            .await;

        let tags = client()
            .list_tags(&host_of(&server), "project/image", &Credentials::Anonymous)
            .await
            .unwrap();
        assert_eq!(tags[0].digest, None);
        assert_eq!(tags[1].digest.as_deref(), Some("sha256:aaa"));
        assert_eq!(
            tags[1].created,
            DateTime::from_timestamp_millis(1_700_000_000_000)
        );
    }

    #[tokio::test]
    async fn test_bearer_challenge_flow() {
        let server = MockServer::start().await;
        let realm = format!("{}/token", server.uri());
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "granted"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/tags/list"))
            .and(header("authorization", "Bearer granted"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "repo", "tags": ["v1"]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/tags/list"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!("Bearer realm=\"{}\",service=\"registry\"", realm).as_str(),
            ))
            .mount(&server)
            .await;

        let credentials = Credentials::Basic {
            username: "user".to_string(),
            password: "pass".into(),
        };
        let v2 = client();
        let host = host_of(&server);
        let tags = v2.list_tags(&host, "repo", &credentials).await.unwrap();
        assert_eq!(tags.len(), 1);
        // the token is cached: the second listing does not hit the realm again
        let tags = v2.list_tags(&host, "repo", &credentials).await.unwrap();
        assert_eq!(tags.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_static_bearer_is_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/tags/list"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client()
            .list_tags(
                &host_of(&server),
                "repo",
                &Credentials::Bearer("expired".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_tags_failure_kinds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/missing/tags/list"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/busy/tags/list"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let v2 = client();
        let host = host_of(&server);
        assert!(matches!(
            v2.list_tags(&host, "missing", &Credentials::Anonymous).await,
            Err(RegistryError::RepositoryNotFound { .. })
        ));
        assert!(matches!(
            v2.list_tags(&host, "busy", &Credentials::Anonymous).await,
            Err(RegistryError::RateLimited {
                retry_after_seconds: Some(30),
                ..
            })
        ));
        assert!(matches!(
            v2.list_tags("127.0.0.1:1", "repo", &Credentials::Anonymous).await,
            Err(RegistryError::RegistryUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_manifest_with_config_blob() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/manifests/v1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Docker-Content-Digest", "sha256:abc")
                    .set_body_json(serde_json::json!({
                        "schemaVersion": 2,
                        "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "size": 10, "digest": "sha256:cfg"}
                    })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repo/blobs/sha256:cfg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"created": "2024-05-01T10:00:00Z"})),
            )
            .mount(&server)
            .await;

        let manifest = client()
            .get_manifest(&host_of(&server), "repo", "v1", &Credentials::Anonymous)
            .await
            .unwrap();
        assert_eq!(manifest.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(
            manifest.created.map(|c| c.to_rfc3339()),
            Some("2024-05-01T10:00:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_manifest_schema_one_and_missing_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/jetstack/example/manifests/v1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "schemaVersion": 1,
                "name": "jetstack/example",
                "tag": "v1.0.0"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/jetstack/example/manifests/v9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let v2 = client();
        let host = host_of(&server);
        let manifest = v2
            .get_manifest(&host, "jetstack/example", "v1.0.0", &Credentials::Anonymous)
            .await
            .unwrap();
        assert_eq!(manifest, ManifestInfo::default());

        assert!(matches!(
            v2.get_manifest(&host, "jetstack/example", "v9", &Credentials::Anonymous)
                .await,
            Err(RegistryError::ManifestNotFound { .. })
        ));
    }
}
