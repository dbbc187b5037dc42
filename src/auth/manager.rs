use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::refresh;
use super::storage::{self, TokenStorage};
use super::types::{AuthState, TokenPair};
use crate::error::{ApiError, AuthError, Result};
use crate::metrics::ClientMetrics;

/// Credential store
/// Owns the token pair, keeps storage in sync and performs login/refresh/logout
pub struct CredentialStore {
    /// Current session state
    state: RwLock<AuthState>,

    /// Durable token storage
    storage: Arc<dyn TokenStorage>,

    /// HTTP client for token endpoint requests
    client: Client,

    /// API base URL (no trailing slash)
    base_url: String,

    /// Serialises refreshes so concurrent 401s trigger one refresh
    refresh_lock: Mutex<()>,

    /// Counts refresh exchanges that reached the network
    metrics: Option<Arc<ClientMetrics>>,
}

impl CredentialStore {
    /// Create a store and hydrate it from storage
    pub fn new(client: Client, base_url: impl Into<String>, storage: Arc<dyn TokenStorage>) -> Self {
        let state = match storage::load_pair(storage.as_ref()) {
            Ok(Some(pair)) => {
                tracing::debug!("Restored session from token storage");
                AuthState::Authenticated(pair)
            }
            Ok(None) => AuthState::Unauthenticated,
            Err(e) => {
                tracing::warn!("Failed to load tokens from storage, starting signed out: {:#}", e);
                AuthState::Unauthenticated
            }
        };

        Self {
            state: RwLock::new(state),
            storage,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            refresh_lock: Mutex::new(()),
            metrics: None,
        }
    }

    /// Record refresh exchanges into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Log in with username and password
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair> {
        tracing::info!("Logging in as {}", username);

        let pair = refresh::request_login(&self.client, &self.base_url, username, password).await?;

        storage::save_pair(self.storage.as_ref(), &pair)
            .map_err(|e| ApiError::Storage(format!("{:#}", e)))?;
        *self.state.write().await = AuthState::Authenticated(pair.clone());

        tracing::info!("Login successful (token: {}...)", token_prefix(&pair.access));
        Ok(pair)
    }

    /// Refresh the token pair
    ///
    /// Any failure clears the session; refresh is never retried.
    pub async fn refresh(&self) -> Result<TokenPair> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh after the API rejected `rejected_access`
    ///
    /// If another task already replaced that token while this one waited for
    /// the refresh lock, the current pair is returned without a network call.
    pub async fn refresh_after_unauthorized(&self, rejected_access: &str) -> Result<TokenPair> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.token_pair().await {
            if current.access != rejected_access {
                tracing::debug!("Token already refreshed by a concurrent request");
                return Ok(current);
            }
        }

        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<TokenPair> {
        let refresh_token = match self.token_pair().await {
            Some(pair) => pair.refresh,
            None => return Err(AuthError::NoRefreshToken.into()),
        };

        tracing::debug!("Refreshing access token...");
        if let Some(metrics) = &self.metrics {
            metrics.record_token_refresh();
        }

        match refresh::request_refresh(&self.client, &self.base_url, &refresh_token).await {
            Ok(pair) => {
                if let Err(e) = storage::save_pair(self.storage.as_ref(), &pair) {
                    // Memory and storage must not disagree; drop the session
                    self.logout().await;
                    return Err(ApiError::Storage(format!("{:#}", e)));
                }
                *self.state.write().await = AuthState::Authenticated(pair.clone());

                tracing::info!("Token refreshed (token: {}...)", token_prefix(&pair.access));
                Ok(pair)
            }
            Err(e) => {
                tracing::error!("Token refresh failed, clearing session: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_refresh_failure();
                }
                self.logout().await;
                Err(e.into())
            }
        }
    }

    /// Clear tokens from memory and storage (idempotent)
    pub async fn logout(&self) {
        *self.state.write().await = AuthState::Unauthenticated;

        if let Err(e) = storage::clear_pair(self.storage.as_ref()) {
            tracing::warn!("Failed to clear tokens from storage: {:#}", e);
        }

        tracing::debug!("Session cleared");
    }

    /// Whether an access token is held
    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_authenticated()
    }

    /// Current access token
    pub async fn access_token(&self) -> Option<String> {
        self.state.read().await.tokens().map(|t| t.access.clone())
    }

    /// Current token pair
    pub async fn token_pair(&self) -> Option<TokenPair> {
        self.state.read().await.tokens().cloned()
    }

    /// Default request headers
    /// Always sets a JSON content type, adds a bearer token when signed in
    pub async fn auth_headers(&self) -> HeaderMap {
        Self::headers_for(self.access_token().await.as_deref())
    }

    /// Default request headers for a given access token
    pub fn headers_for(access_token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = access_token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("Access token is not a valid header value, omitting"),
            }
        }

        headers
    }

    /// API base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}
