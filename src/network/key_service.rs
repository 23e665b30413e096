// src/network/key_service.rs

//! Client for the remote workload service that releases wrapped image keys
//! and receives VM trust reports.

use std::time::Duration;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::client::HttpConnector;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ConfigError, KeyServiceConfig};

/// Entitlement of this host to an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorKey {
    /// Image flavor identifier
    pub flavor_id: String,

    /// Whether the image must be decrypted before use
    pub encryption_required: bool,

    /// Content key wrapped to this host's binding key (may be empty)
    pub wrapped_key: Vec<u8>,
}

/// Workload service operations used by the agent
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Flavor and wrapped key of `image_uuid` for this host; `None` when the
    /// host holds no flavor for the image
    async fn get_image_flavor_key(&self, image_uuid: &str, hardware_uuid: &str) -> Result<Option<FlavorKey>, KeyServiceError>;

    /// Uploads a serialized VM trust report
    async fn post_vm_report(&self, report: Vec<u8>) -> Result<(), KeyServiceError>;
}

/// Wire form of the flavor-key response
#[derive(Debug, Deserialize)]
struct FlavorKeyResponse {
    flavor_id: String,

    #[serde(default)]
    encryption_required: bool,

    #[serde(default)]
    wrapped_key: Option<String>,
}

impl FlavorKeyResponse {
    fn into_flavor_key(self) -> Result<FlavorKey, KeyServiceError> {
        let wrapped_key = match self.wrapped_key.as_deref() {
            None | Some("") => Vec::new(),
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| KeyServiceError::InvalidResponse(format!("wrapped_key is not base64: {}", e)))?,
        };

        Ok(FlavorKey {
            flavor_id: self.flavor_id,
            encryption_required: self.encryption_required,
            wrapped_key,
        })
    }
}

/// `KeyService` over HTTP
pub struct HttpKeyService {
    /// HTTP client
    client: Client<HttpConnector>,

    /// API base URL
    base_url: Url,

    /// Bearer token
    token: Option<SecretString>,

    /// Per-request timeout
    timeout: Duration,
}

impl HttpKeyService {
    /// Creates a client from configuration, resolving the bearer token
    pub fn from_config(config: &KeyServiceConfig) -> Result<Self, KeyServiceError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| KeyServiceError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        let token = config.bearer_token.as_ref().map(|source| source.resolve()).transpose()?;

        Ok(Self::new(base_url, token, Duration::from_secs(config.timeout_seconds)))
    }

    /// Creates a client for `base_url`
    pub fn new(base_url: Url, token: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url,
            token,
            timeout,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, KeyServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| KeyServiceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, method: Method, url: &Url, body: Option<Vec<u8>>) -> Result<(StatusCode, Vec<u8>), KeyServiceError> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }

        let request = match body {
            Some(bytes) => builder.header(CONTENT_TYPE, "application/json").body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| KeyServiceError::Request(e.to_string()))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes.to_vec()))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| KeyServiceError::Timeout(self.timeout))?
            .map_err(|e| KeyServiceError::Request(e.to_string()))?;

        debug!(%method, url = %url, status = status.as_u16(), "Key service responded");
        Ok((status, bytes))
    }
}

#[async_trait]
impl KeyService for HttpKeyService {
    async fn get_image_flavor_key(&self, image_uuid: &str, hardware_uuid: &str) -> Result<Option<FlavorKey>, KeyServiceError> {
        let mut url = self.endpoint(&["images", image_uuid, "flavor-key"])?;
        url.query_pairs_mut().append_pair("hardware_uuid", hardware_uuid);

        let (status, body) = self.send(Method::GET, &url, None).await?;
        match status {
            StatusCode::OK => {
                let response: FlavorKeyResponse = serde_json::from_slice(&body)
                    .map_err(|e| KeyServiceError::InvalidResponse(e.to_string()))?;
                let flavor_key = response.into_flavor_key()?;
                info!(
                    image = image_uuid,
                    flavor = %flavor_key.flavor_id,
                    encryption_required = flavor_key.encryption_required,
                    "Image flavor retrieved"
                );
                Ok(Some(flavor_key))
            }
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => {
                warn!(image = image_uuid, "No flavor associated with image for this host");
                Ok(None)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(KeyServiceError::Unauthorized(status.as_u16())),
            other => Err(KeyServiceError::Status {
                status: other.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    async fn post_vm_report(&self, report: Vec<u8>) -> Result<(), KeyServiceError> {
        let url = self.endpoint(&["reports"])?;
        let (status, body) = self.send(Method::POST, &url, Some(report)).await?;

        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(KeyServiceError::Unauthorized(status.as_u16()));
        }
        Err(KeyServiceError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// Key service errors
#[derive(Error, Debug)]
pub enum KeyServiceError {
    #[error("Invalid key service URL: {0}")]
    InvalidUrl(String),

    #[error("Key service request failed: {0}")]
    Request(String),

    #[error("Key service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Key service rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("Key service returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },

    #[error("Invalid key service response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
