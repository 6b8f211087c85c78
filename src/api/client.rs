use crate::config::{self, Config};
use crate::error::{ConfigError, ServiceError, UploadError};
use crate::services::{ListingService, PresignService};
use crate::types::{Result, UploadMode, UploadTarget};
use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use urlencoding::encode;

use super::models::{
    CompleteMultipartRequest, CompleteMultipartResponse, CreateMultipartResponse, FileSpec,
    ListPartsResponse, ListedItem, ListingResponse, MultipartRef, PresignRequest, PresignResponse,
    SessionInfo,
};

const ROUTE_PRESIGN: &str = "uploads/presign";
const ROUTE_MULTIPART_CREATE: &str = "uploads/multipart";
const ROUTE_MULTIPART_PARTS: &str = "uploads/multipart/parts";
const ROUTE_MULTIPART_COMPLETE: &str = "uploads/multipart/complete";
const ROUTE_MULTIPART_ABORT: &str = "uploads/multipart/abort";
const ROUTE_SESSION: &str = "session";

/// HTTP client for the photodrop metadata API.
///
/// Requests are sent once; retrying is left to the caller's `RetryPolicy` so
/// that every backend call has exactly one retry budget.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    transfer_client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new() -> Result<Self> {
        Self::new_with_token_override(None)
    }

    pub fn new_with_token_override(token_override: Option<String>) -> Result<Self> {
        let config = Config::load().ok();

        let mut auth_token = token_override;
        let mut base_url = config::env_var("PHOTODROP_API_URL");

        if let Some(cfg) = config.as_ref() {
            if auth_token.is_none() {
                auth_token = Some(cfg.token.clone());
            }
            if base_url.is_none() {
                base_url = Some(cfg.api_url.clone());
            }
        }

        let base_url = base_url.unwrap_or_else(|| Config::default_api_url_value().to_string());
        Self::with_base_url(&base_url, auth_token)
    }

    pub fn with_base_url(base_url: &str, auth_token: Option<String>) -> Result<Self> {
        let cli_version = env!("CARGO_PKG_VERSION");
        let user_agent = format!("Photodrop-CLI/{cli_version}");

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_str(&user_agent).context("Invalid user agent")?,
        );
        headers.insert(
            "X-Photodrop-Client-Type",
            reqwest::header::HeaderValue::from_static("CLI"),
        );
        headers.insert(
            "X-Photodrop-CLI-Version",
            reqwest::header::HeaderValue::from_str(cli_version).context("Invalid CLI version")?,
        );

        let client = build_api_client_with_headers(Some(headers.clone()))?;
        let transfer_client = build_transfer_client_with_headers(Some(headers))?;

        let client = Self {
            client,
            transfer_client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            auth_token,
        };

        debug!(
            "ApiClient configured base_url={} token_configured={}",
            client.base_url,
            client.auth_token.is_some()
        );

        Ok(client)
    }

    pub fn transfer_client(&self) -> &Client {
        &self.transfer_client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn get_token(&self) -> Result<&str> {
        self.auth_token
            .as_deref()
            .context("No authentication token configured")
    }

    fn build_url_from_base(base_url: &str, endpoint: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    pub fn build_url(&self, endpoint: &str) -> String {
        Self::build_url_from_base(&self.base_url, endpoint)
    }

    fn upload_endpoint(target: &UploadTarget, route: &str) -> Result<String> {
        let gallery = encode(&target.resource_id);
        match target.mode {
            UploadMode::Gallery => Ok(format!("galleries/{gallery}/{route}")),
            UploadMode::Delivery => {
                let order = target
                    .secondary_id
                    .as_deref()
                    .filter(|id| !id.trim().is_empty())
                    .ok_or(UploadError::MissingSecondaryId {
                        mode: target.mode.as_str(),
                    })?;
                Ok(format!("galleries/{gallery}/orders/{}/{route}", encode(order)))
            }
        }
    }

    fn listing_endpoint(target: &UploadTarget) -> String {
        let mut endpoint = format!("galleries/{}/images", encode(&target.resource_id));
        if let Some(order) = target
            .secondary_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        {
            endpoint.push_str(&format!("?order={}", encode(order)));
        }
        endpoint
    }

    pub async fn get<T>(&self, endpoint: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = self.build_url(endpoint);
        debug!("GET {}", url);
        let response = self.send_authenticated_request(self.client.get(&url)).await?;
        self.parse_json_response(response).await
    }

    pub async fn post<T, R>(&self, endpoint: &str, body: &T) -> Result<R>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let response = self.post_response(endpoint, body).await?;
        self.parse_json_response(response).await
    }

    async fn post_response<T>(&self, endpoint: &str, body: &T) -> Result<Response>
    where
        T: Serialize,
    {
        let url = self.build_url(endpoint);
        debug!("POST {}", url);
        self.send_authenticated_request(self.client.post(&url).json(body))
            .await
    }

    pub async fn send_authenticated_request(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Response> {
        let token = self
            .auth_token
            .as_ref()
            .ok_or(ConfigError::TokenNotFound)?;

        let request = request.header("Authorization", format!("Bearer {}", token));
        match request.send().await {
            Ok(response) => Ok(response),
            Err(err) if err.is_connect() => Err(ServiceError::Network(format!(
                "Cannot connect to photodrop server at {}. Is the API URL correct? (Check with: photodrop config list)",
                self.base_url
            ))
            .into()),
            Err(err) if err.is_timeout() => {
                Err(ServiceError::Network(format!("Request timeout: {err}")).into())
            }
            Err(err) => Err(ServiceError::from(err).into()),
        }
    }

    pub async fn parse_json_response<T>(&self, response: Response) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        if response.status().is_success() {
            response
                .json()
                .await
                .context("Failed to parse JSON response")
        } else {
            Err(self.create_error_from_response(response).await)
        }
    }

    async fn create_error_from_response(&self, response: Response) -> anyhow::Error {
        let status = response.status();
        let url = response.url().clone();

        let error_body = response.text().await.unwrap_or_default();
        let parsed_payload = parse_error_payload(&error_body);

        let err = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::AuthExpired(
                "Invalid or expired token. Please run 'photodrop auth --token <token>' to sign in again."
                    .to_string(),
            ),
            StatusCode::TOO_MANY_REQUESTS => ServiceError::status(
                status.as_u16(),
                "Rate limit exceeded. Please try again later.",
            ),
            StatusCode::SERVICE_UNAVAILABLE => ServiceError::status(
                status.as_u16(),
                "Service temporarily unavailable. Please try again later.",
            ),
            StatusCode::NOT_FOUND => {
                ServiceError::status(status.as_u16(), format!("Resource not found: {}", url))
            }
            _ => ServiceError::status(
                status.as_u16(),
                format_error_message(&url, parsed_payload.as_ref(), &error_body),
            ),
        };
        err.into()
    }

    pub async fn get_session_info(&self) -> Result<SessionInfo> {
        self.get(ROUTE_SESSION).await
    }

    pub async fn validate_token(&self, _token: &str) -> Result<SessionInfo> {
        self.get_session_info()
            .await
            .context("Token validation failed")
    }

    pub async fn list_images(&self, target: &UploadTarget) -> Result<Vec<ListedItem>> {
        let endpoint = Self::listing_endpoint(target);
        let response: ListingResponse = self
            .get(&endpoint)
            .await
            .with_context(|| format!("Failed to list images for {}", target))?;
        Ok(response.items)
    }
}

#[async_trait]
impl PresignService for ApiClient {
    async fn request_upload_parameters(
        &self,
        target: &UploadTarget,
        files: &[FileSpec],
    ) -> Result<PresignResponse> {
        let endpoint = Self::upload_endpoint(target, ROUTE_PRESIGN)?;
        self.post(&endpoint, &PresignRequest { files })
            .await
            .with_context(|| format!("Failed to request upload URLs for {}", target))
    }

    async fn create_multipart_upload(
        &self,
        target: &UploadTarget,
        files: &[FileSpec],
    ) -> Result<CreateMultipartResponse> {
        let endpoint = Self::upload_endpoint(target, ROUTE_MULTIPART_CREATE)?;
        self.post(&endpoint, &PresignRequest { files })
            .await
            .with_context(|| format!("Failed to create multipart uploads for {}", target))
    }

    async fn list_multipart_parts(
        &self,
        target: &UploadTarget,
        upload: &MultipartRef,
    ) -> Result<ListPartsResponse> {
        let endpoint = Self::upload_endpoint(target, ROUTE_MULTIPART_PARTS)?;
        self.post(&endpoint, upload)
            .await
            .with_context(|| format!("Failed to list parts of {}", upload.key))
    }

    async fn complete_multipart_upload(
        &self,
        target: &UploadTarget,
        request: &CompleteMultipartRequest,
    ) -> Result<CompleteMultipartResponse> {
        let endpoint = Self::upload_endpoint(target, ROUTE_MULTIPART_COMPLETE)?;
        self.post(&endpoint, request)
            .await
            .with_context(|| format!("Failed to complete multipart upload {}", request.key))
    }

    async fn abort_multipart_upload(
        &self,
        target: &UploadTarget,
        upload: &MultipartRef,
    ) -> Result<()> {
        let endpoint = Self::upload_endpoint(target, ROUTE_MULTIPART_ABORT)?;
        let response = self.post_response(&endpoint, upload).await?;
        let status = response.status();

        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!("Aborted multipart upload {} ({})", upload.key, status);
            return Ok(());
        }

        Err(self.create_error_from_response(response).await)
            .with_context(|| format!("Failed to abort multipart upload {}", upload.key))
    }
}

#[async_trait]
impl ListingService for ApiClient {
    async fn list_processed_items(&self, target: &UploadTarget) -> Result<Vec<ListedItem>> {
        self.list_images(target).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedError {
    code: Option<String>,
    message: String,
    details: Vec<String>,
}

fn parse_error_payload(body: &str) -> Option<ParsedError> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;

    let message = value
        .get("error")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("message").and_then(|v| v.as_str()))?;

    let code = value
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let details = match value.get("details") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect(),
        Some(serde_json::Value::String(detail)) => vec![detail.to_string()],
        _ => Vec::new(),
    };

    Some(ParsedError {
        code,
        message: message.to_string(),
        details,
    })
}

fn format_error_message(url: &reqwest::Url, payload: Option<&ParsedError>, raw_body: &str) -> String {
    if let Some(parsed) = payload {
        let mut message = parsed.message.clone();

        if let Some(code) = parsed.code.as_ref() {
            message.push_str(&format!(" ({code})"));
        }

        for detail in &parsed.details {
            message.push_str(&format!("; {}", detail));
        }

        return message;
    }

    if raw_body.trim().is_empty() {
        format!("request to {} failed", url.path())
    } else {
        format!("request to {} failed: {}", url.path(), raw_body.trim())
    }
}

fn is_test_mode() -> bool {
    std::env::var("PHOTODROP_TEST_MODE")
        .map(|value| value == "1")
        .unwrap_or(false)
}

fn build_api_client_with_headers(headers: Option<reqwest::header::HeaderMap>) -> Result<Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .redirect(reqwest::redirect::Policy::limited(4))
        .use_rustls_tls()
        .http2_adaptive_window(true);

    if is_test_mode() {
        builder = builder
            .connect_timeout(Duration::from_millis(200))
            .timeout(Duration::from_secs(2));
    } else {
        builder = builder
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30));
    }

    if let Some(headers) = headers {
        builder = builder.default_headers(headers);
    }

    builder.build().context("Failed to build HTTP client")
}

fn build_transfer_client_with_headers(
    headers: Option<reqwest::header::HeaderMap>,
) -> Result<Client> {
    let mut builder = reqwest::Client::builder()
        .http1_only()
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .tcp_nodelay(true)
        .use_rustls_tls()
        .redirect(reqwest::redirect::Policy::limited(4));

    if is_test_mode() {
        builder = builder
            .connect_timeout(Duration::from_millis(200))
            .timeout(Duration::from_secs(10));
    } else {
        // Large originals over slow uplinks; parts are bounded by part size.
        builder = builder
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(600));
    }

    if let Some(headers) = headers {
        builder = builder.default_headers(headers);
    }

    builder
        .build()
        .context("Failed to build transfer HTTP client")
}
