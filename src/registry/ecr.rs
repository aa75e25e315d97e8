use super::auth::{CachedToken, Credentials, TokenCache};
use super::v2::V2Client;
use super::{ManifestInfo, Registry, RegistryError, TagDescriptor, read_json, send};
use crate::config::{RegistryConfig, RegistryKind};
use crate::error::BuildError;
use crate::secret_string::SecretString;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const ECR_SERVICE: &str = "ecr";
const GET_AUTHORIZATION_TOKEN_TARGET: &str =
    "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken";
const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// `<account>.dkr.ecr[-fips].<region>.amazonaws.com[.cn]`
pub const ECR_HOST_PATTERN: &str =
    r"^(\d{12})\.dkr\.ecr(?:-fips)?\.([a-z0-9-]+)\.amazonaws\.com(?:\.cn)?$";

/// Amazon Elastic Container Registry. The configured AWS credentials sign a
/// `GetAuthorizationToken` call; the returned token authenticates registry API requests.
#[derive(Debug)]
pub struct EcrClient {
    http: Client,
    access_key_id: String,
    secret_access_key: SecretString,
    session_token: Option<SecretString>,
    host_pattern: Regex,
    api_endpoint: Option<String>,
    tokens: TokenCache,
    v2: V2Client,
}

/// Account and region addressed by an ECR registry host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcrRegistry {
    pub account: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationTokenResponse {
    #[serde(default)]
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
    /// Seconds since the epoch
    expires_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AwsErrorResponse {
    #[serde(rename = "__type")]
    error_type: Option<String>,
    message: Option<String>,
}

/// The pieces of an AWS Signature Version 4 signed JSON request.
struct SignedRequest {
    amz_date: String,
    authorization: String,
}

impl EcrClient {
    pub fn from_config(config: &RegistryConfig, http: &Client) -> Result<Self, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidRegistryConfig {
            kind: RegistryKind::Ecr,
            reason: reason.to_string(),
        };
        let (Some(access_key_id), Some(secret_access_key)) = (
            config.param("access_key_id"),
            config.secret("secret_access_key"),
        ) else {
            return Err(invalid(
                "access_key_id and secret_access_key are required",
            ));
        };
        let host_pattern =
            Regex::new(ECR_HOST_PATTERN).map_err(|e| invalid(&format!("host pattern: {}", e)))?;

        Ok(Self {
            http: http.clone(),
            access_key_id: access_key_id.to_string(),
            secret_access_key,
            session_token: config.secret("session_token"),
            host_pattern,
            api_endpoint: None,
            tokens: TokenCache::new(),
            v2: V2Client::new(http.clone(), "https"),
        })
    }

    /// Sends the token request to `api` and registry requests to `registry`.
    #[cfg(test)]
    fn with_endpoints(mut self, api: String, registry: String) -> Self {
        self.api_endpoint = Some(api);
        self.v2 = V2Client::new(self.http.clone(), "http").with_endpoint(registry);
        self
    }

    pub fn parse_host(&self, host: &str) -> Option<EcrRegistry> {
        let host = host.to_ascii_lowercase();
        let caps = self.host_pattern.captures(&host)?;
        Some(EcrRegistry {
            account: caps[1].to_string(),
            region: caps[2].to_string(),
        })
    }

    fn api_url(&self, region: &str) -> String {
        match &self.api_endpoint {
            Some(endpoint) => endpoint.clone(),
            None if region.starts_with("cn-") => {
                format!("https://api.ecr.{}.amazonaws.com.cn/", region)
            }
            None => format!("https://api.ecr.{}.amazonaws.com/", region),
        }
    }

    async fn fetch_authorization_token(
        &self,
        host: &str,
        registry: &EcrRegistry,
    ) -> Result<CachedToken, RegistryError> {
        let url = self.api_url(&registry.region);
        let body = serde_json::json!({ "registryIds": [registry.account] }).to_string();
        let endpoint_host = Url::parse(&url)
            .ok()
            .and_then(|u| {
                u.host_str()
                    .map(|h| match u.port() {
                        Some(port) => format!("{}:{}", h, port),
                        None => h.to_string(),
                    })
            })
            .ok_or_else(|| RegistryError::InvalidResponse {
                host: host.to_string(),
                reason: format!("invalid ECR API endpoint {}", url),
            })?;

        let signed = sign_request(
            &self.access_key_id,
            &self.secret_access_key,
            self.session_token.as_ref(),
            &registry.region,
            &endpoint_host,
            &body,
            Utc::now(),
        );

        debug!(
            "Requesting ECR authorization token for account {} in {}",
            registry.account, registry.region
        );
        let mut request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, AMZ_JSON_CONTENT_TYPE)
            .header("X-Amz-Target", GET_AUTHORIZATION_TOKEN_TARGET)
            .header("X-Amz-Date", &signed.amz_date)
            .header("Authorization", &signed.authorization)
            .body(body);
        if let Some(session_token) = &self.session_token {
            request = request.header("X-Amz-Security-Token", session_token.expose_secret());
        }

        let response = send(host, request).await?;
        let status = response.status();
        if !status.is_success() {
            let error: AwsErrorResponse = read_json(host, response).await.unwrap_or(AwsErrorResponse {
                error_type: None,
                message: None,
            });
            return Err(aws_error(host, status, error));
        }

        let body: AuthorizationTokenResponse = read_json(host, response).await?;
        let data = body
            .authorization_data
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::AuthenticationFailed {
                host: host.to_string(),
                reason: "no authorization data returned".to_string(),
            })?;
        Ok(CachedToken {
            token: data.authorization_token.into(),
            expires_at: data
                .expires_at
                .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds as i64, 0)),
        })
    }

    async fn authorization_token(
        &self,
        host: &str,
        rejected: Option<&SecretString>,
    ) -> Result<SecretString, RegistryError> {
        let registry = self.parse_host(host).ok_or_else(|| RegistryError::InvalidResponse {
            host: host.to_string(),
            reason: "not an ECR registry host".to_string(),
        })?;
        self.tokens
            .get_or_refresh(host, rejected, || {
                self.fetch_authorization_token(host, &registry)
            })
            .await
    }
}

impl Registry for EcrClient {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Ecr
    }

    async fn list_tags(
        &self,
        host: &str,
        repository: &str,
    ) -> Result<Vec<TagDescriptor>, RegistryError> {
        let token = self.authorization_token(host, None).await?;
        let credentials = Credentials::EncodedBasic(token.clone());
        match self.v2.list_tags(host, repository, &credentials).await {
            Err(RegistryError::AuthenticationFailed { .. }) => {
                debug!("ECR rejected the authorization token for {}, refreshing", host);
                let token = self.authorization_token(host, Some(&token)).await?;
                let credentials = Credentials::EncodedBasic(token);
                self.v2.list_tags(host, repository, &credentials).await
            }
            result => result,
        }
    }

    async fn get_manifest(
        &self,
        host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<ManifestInfo, RegistryError> {
        let token = self.authorization_token(host, None).await?;
        let credentials = Credentials::EncodedBasic(token.clone());
        match self.v2.get_manifest(host, repository, tag, &credentials).await {
            Err(RegistryError::AuthenticationFailed { .. }) => {
                debug!("ECR rejected the authorization token for {}, refreshing", host);
                let token = self.authorization_token(host, Some(&token)).await?;
                let credentials = Credentials::EncodedBasic(token);
                self.v2
                    .get_manifest(host, repository, tag, &credentials)
                    .await
            }
            result => result,
        }
    }
}

fn aws_error(host: &str, status: StatusCode, error: AwsErrorResponse) -> RegistryError {
    let error_type = error.error_type.unwrap_or_default();
    // "__type" may be namespaced, e.g. "com.amazonaws...#ThrottlingException"
    let error_name = error_type.rsplit('#').next().unwrap_or_default();
    match error_name {
        "ThrottlingException" | "TooManyRequestsException" => RegistryError::RateLimited {
            host: host.to_string(),
            retry_after_seconds: None,
        },
        _ if status == StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited {
            host: host.to_string(),
            retry_after_seconds: None,
        },
        _ if status.is_client_error() => RegistryError::AuthenticationFailed {
            host: host.to_string(),
            reason: format!(
                "{} {}",
                error_name,
                error.message.unwrap_or_default()
            )
            .trim()
            .to_string(),
        },
        _ => RegistryError::UnexpectedStatus {
            host: host.to_string(),
            status: status.as_u16(),
            url: "GetAuthorizationToken".to_string(),
        },
    }
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Signs a POST of `body` to `/` of the ECR API with AWS Signature Version 4.
fn sign_request(
    access_key_id: &str,
    secret_access_key: &SecretString,
    session_token: Option<&SecretString>,
    region: &str,
    endpoint_host: &str,
    body: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers = vec![
        ("content-type", AMZ_JSON_CONTENT_TYPE.to_string()),
        ("host", endpoint_host.to_string()),
        ("x-amz-date", amz_date.clone()),
        ("x-amz-target", GET_AUTHORIZATION_TOKEN_TARGET.to_string()),
    ];
    if let Some(token) = session_token {
        headers.push(("x-amz-security-token", token.expose_secret().to_string()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers,
        signed_headers,
        sha256_hex(body)
    );
    let credential_scope = format!("{}/{}/{}/aws4_request", date, region, ECR_SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        sha256_hex(&canonical_request)
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", secret_access_key.expose_secret()).as_bytes(),
        &date,
    );
    let k_region = hmac_sha256(&k_date, region);
    let k_service = hmac_sha256(&k_region, ECR_SERVICE);
    let k_signing = hmac_sha256(&k_service, "aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, &string_to_sign));

    SignedRequest {
        amz_date,
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            access_key_id, credential_scope, signed_headers, signature
        ),
    }
}
