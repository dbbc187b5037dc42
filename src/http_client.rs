use bytes::Bytes;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::{CredentialStore, TokenStorage};
use crate::cache::{Flight, Lookup, ResponseCache};
use crate::catalog::{is_listing_endpoint, ListEnvelope, ResourceFamily};
use crate::error::{ApiError, AuthError, Result};
use crate::metrics::ClientMetrics;

/// Default API URL when not specified
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Settings for [`ApiClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Extra attempts for GET requests failing with 429/5xx/transport errors
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// TTL for cached reads that do not set one
    pub default_ttl: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(500),
            default_ttl: Duration::from_secs(30),
        }
    }
}

/// File part of a multipart upload
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Request body
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    File(FileUpload),
}

/// Per-call cache settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Option<Duration>,
    pub stale_while_revalidate: bool,
}

impl CachePolicy {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
            stale_while_revalidate: false,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stale_while_revalidate(mut self) -> Self {
        self.stale_while_revalidate = true;
        self
    }
}

/// Outbound request description
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub cache: Option<CachePolicy>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            cache: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, endpoint).json(body)
    }

    pub fn patch(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, endpoint).json(body)
    }

    pub fn put(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, endpoint).json(body)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn upload(endpoint: impl Into<String>, file: FileUpload) -> Self {
        let mut request = Self::new(Method::POST, endpoint);
        request.body = RequestBody::File(file);
        request
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Make the request cache-eligible (GET only)
    pub fn cached(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn family(&self) -> Option<ResourceFamily> {
        ResourceFamily::from_endpoint(&self.endpoint)
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    /// GET on a collection listing
    pub fn is_listing(&self) -> bool {
        self.method == Method::GET && is_listing_endpoint(&self.endpoint)
    }
}

/// Request pipeline for the catalog API
/// Handles:
/// - auth headers on every request
/// - 401: one refresh, one retry
/// - read-through cache with stale-while-revalidate and single-flight
/// - family-wide invalidation after mutations
/// - empty-list fallback for failing list reads
#[derive(Clone)]
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API base URL (no trailing slash)
    base_url: Arc<str>,

    /// Token owner
    credentials: Arc<CredentialStore>,

    /// Response cache
    cache: ResponseCache,

    /// Pipeline counters
    metrics: Arc<ClientMetrics>,

    /// Maximum number of retries for idempotent reads
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    /// Create a client, hydrating the session from `storage`
    pub fn new(options: &ClientOptions, storage: Arc<dyn TokenStorage>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = options.base_url.trim_end_matches('/').to_string();
        let metrics = Arc::new(ClientMetrics::new());
        let credentials = Arc::new(
            CredentialStore::new(client.clone(), base_url.clone(), storage)
                .with_metrics(metrics.clone()),
        );

        Ok(Self {
            client,
            base_url: base_url.into(),
            credentials,
            cache: ResponseCache::new(options.default_ttl),
            metrics,
            max_retries: options.max_retries,
            base_delay_ms: options.retry_base_delay.as_millis() as u64,
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a request and return its JSON payload
    ///
    /// GETs on listing endpoints never fail: errors become an empty list
    /// envelope carrying the error message.
    pub async fn request(&self, request: ApiRequest) -> Result<Value> {
        let listing = request.is_listing();
        let endpoint = request.endpoint.clone();

        let result = self.run(request).await;

        match result {
            Err(e) => {
                self.metrics.record_error(e.kind());
                if listing {
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "List request failed, returning empty list"
                    );
                    self.metrics.record_degraded_list();
                    return serde_json::to_value(ListEnvelope::<Value>::degraded(e.to_string()))
                        .map_err(|e| ApiError::Internal(e.to_string()));
                }
                Err(e)
            }
            ok => ok,
        }
    }

    /// Execute a request and decode the payload
    pub async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let value = self.request(request).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Execute a list request; failures come back as a degraded envelope
    pub async fn list<T: DeserializeOwned>(&self, request: ApiRequest) -> ListEnvelope<T> {
        let result = match self.request(request).await {
            Ok(value) => ListEnvelope::from_value(value),
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            self.metrics.record_degraded_list();
            ListEnvelope::degraded(e.to_string())
        })
    }

    async fn run(&self, request: ApiRequest) -> Result<Value> {
        if request.method == Method::GET {
            if let Some(policy) = request.cache.clone() {
                return self.run_cached(request, policy).await;
            }
        }

        let family = request.family();
        let mutation = request.is_mutation();

        let value = self.execute(&request).await?;

        if mutation {
            if let Some(family) = family {
                self.cache.invalidate_family(family);
            }
        }

        Ok(value)
    }

    async fn run_cached(&self, request: ApiRequest, policy: CachePolicy) -> Result<Value> {
        match self.cache.lookup(&policy.key) {
            Lookup::Fresh(value) => {
                tracing::debug!(key = %policy.key, "Cache hit");
                self.metrics.record_cache_hit();
                return Ok(value);
            }
            Lookup::Stale(value) if policy.stale_while_revalidate => {
                tracing::debug!(key = %policy.key, "Serving stale value, revalidating");
                self.metrics.record_stale_hit();
                self.revalidate(request, &policy);
                return Ok(value);
            }
            Lookup::Stale(_) | Lookup::Miss => {
                tracing::debug!(key = %policy.key, "Cache miss");
                self.metrics.record_cache_miss();
            }
        }

        let flight = self.start_fetch(request, &policy);
        if !flight.is_leader() {
            tracing::debug!(key = %policy.key, "Joining in-flight fetch");
            self.metrics.record_coalesced();
        }

        flight.into_future().await
    }

    fn start_fetch(&self, request: ApiRequest, policy: &CachePolicy) -> Flight {
        let this = self.clone();
        let family = request.family();

        self.cache
            .fetch_shared(&policy.key, policy.ttl, family, async move {
                this.execute(&request).await
            })
    }

    /// Refresh a stale entry in the background; failures keep the stale value
    fn revalidate(&self, request: ApiRequest, policy: &CachePolicy) {
        let flight = self.start_fetch(request, policy);
        if !flight.is_leader() {
            return;
        }

        let key = policy.key.clone();
        let fetch = flight.into_future();
        tokio::spawn(async move {
            if let Err(e) = fetch.await {
                tracing::debug!(key = %key, error = %e, "Background revalidation failed");
            }
        });
    }

    /// Dispatch with one refresh-and-retry on 401
    async fn execute(&self, request: &ApiRequest) -> Result<Value> {
        let started = Instant::now();

        let (mut response, sent_token) = self.send_with_retry(request).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(rejected) = sent_token {
                tracing::warn!(
                    endpoint = %request.endpoint,
                    "Received 401, refreshing token and retrying..."
                );

                if let Err(e) = self.credentials.refresh_after_unauthorized(&rejected).await {
                    tracing::error!("Token refresh failed: {}", e);
                    self.credentials.logout().await;
                    return Err(AuthError::SessionExpired.into());
                }

                response = self.send_with_retry(request).await?.0;
            }
        }

        let result = handle_response(response).await;

        let family = request
            .family()
            .map(|f| f.segment())
            .unwrap_or("other");
        self.metrics
            .record_request_end(started.elapsed().as_secs_f64() * 1000.0, family);

        result
    }

    /// Send, retrying idempotent reads on 429/5xx/transport errors
    ///
    /// Returns the response together with the access token of the final
    /// attempt.
    async fn send_with_retry(&self, request: &ApiRequest) -> Result<(Response, Option<String>)> {
        let max_retries = if request.method == Method::GET {
            self.max_retries
        } else {
            0
        };
        let mut attempt = 0;

        tracing::debug!(
            method = %request.method,
            endpoint = %request.endpoint,
            "Sending HTTP request"
        );

        loop {
            let token = self.credentials.access_token().await;
            let builder = self.build(request, token.as_deref())?;
            self.metrics.record_network_request();

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!(status = %status, "Received HTTP response");

                    let transient =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if transient && attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    return Ok((response, token));
                }
                Err(e) => {
                    let error = ApiError::from(e);

                    if matches!(error, ApiError::Network(_)) && attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            error,
                            delay,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        endpoint = %request.endpoint,
                        error = %error,
                        total_attempts = attempt + 1,
                        "HTTP request failed"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Build the outbound request authorised with `access_token`
    fn build(&self, request: &ApiRequest, access_token: Option<&str>) -> Result<RequestBuilder> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        let mut headers = CredentialStore::headers_for(access_token);

        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let builder = match &request.body {
            RequestBody::Empty => builder.headers(headers),
            RequestBody::Json(body) => builder.headers(headers).json(body),
            RequestBody::Form(fields) => {
                headers.remove(CONTENT_TYPE);
                builder.headers(headers).form(fields)
            }
            RequestBody::File(upload) => {
                // reqwest sets the multipart boundary header itself
                headers.remove(CONTENT_TYPE);

                let mut part =
                    Part::bytes(upload.bytes.to_vec()).file_name(upload.file_name.clone());
                if let Some(content_type) = &upload.content_type {
                    part = part.mime_str(content_type).map_err(|e| {
                        ApiError::InvalidRequest(format!(
                            "Invalid content type '{}': {}",
                            content_type, e
                        ))
                    })?;
                }

                builder
                    .headers(headers)
                    .multipart(Form::new().part(upload.field.clone(), part))
            }
        };

        Ok(builder)
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, plus up to 10% jitter
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
        delay + jitter
    }
}

/// Map a response to its JSON payload or an `HttpStatus` error
async fn handle_response(response: Response) -> Result<Value> {
    let status = response.status();

    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }

    let url = response.url().clone();
    let body = response.text().await?;

    if !status.is_success() {
        tracing::error!(
            status = status.as_u16(),
            url = %url,
            response_body = %body,
            "HTTP request failed with error response"
        );
        return Err(ApiError::from_status(status.as_u16(), &body));
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&body)
        .map_err(|e| ApiError::Decode(format!("Failed to parse response from {}: {}", url, e)))
}
