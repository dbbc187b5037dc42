// Token endpoint exchanges (login and refresh)

use reqwest::Client;

use super::types::{LoginForm, RefreshRequest, TokenPair, TokenResponse, DEFAULT_TOKEN_KIND};
use crate::error::{error_detail, ApiError, AuthError, Result};

/// Login endpoint path
pub const LOGIN_PATH: &str = "/v1/auth/login";

/// Refresh endpoint path
pub const REFRESH_PATH: &str = "/v1/auth/refresh";

/// Exchange username/password for a token pair
pub async fn request_login(
    client: &Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<TokenPair> {
    let url = format!("{}{}", base_url, LOGIN_PATH);
    tracing::debug!(url = %url, username = %username, "Sending login request");

    let form = LoginForm {
        username,
        password,
        grant_type: "password",
    };

    let response = client.post(&url).form(&form).send().await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        let detail = error_detail(&error_text)
            .unwrap_or_else(|| format!("Login failed with status {}", status.as_u16()));
        tracing::warn!(status = status.as_u16(), detail = %detail, "Login rejected");
        return Err(AuthError::InvalidCredentials(detail).into());
    }

    let data: TokenResponse = response
        .json()
        .await
        .map_err(|e| ApiError::Decode(format!("Failed to parse login response: {}", e)))?;

    if data.access_token.is_empty() {
        return Err(ApiError::Decode(
            "Login response does not contain access_token".to_string(),
        ));
    }

    let refresh = data
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ApiError::Decode("Login response does not contain refresh_token".to_string())
        })?;

    Ok(TokenPair {
        access: data.access_token,
        refresh,
        kind: data
            .token_type
            .unwrap_or_else(|| DEFAULT_TOKEN_KIND.to_string()),
    })
}

/// Exchange a refresh token for a new pair
///
/// Every failure maps to `AuthError::RefreshFailed`; the caller decides what
/// happens to the session.
pub async fn request_refresh(
    client: &Client,
    base_url: &str,
    refresh_token: &str,
) -> std::result::Result<TokenPair, AuthError> {
    let url = format!("{}{}", base_url, REFRESH_PATH);
    tracing::debug!(url = %url, "Sending token refresh request");

    let request = RefreshRequest { refresh_token };

    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| AuthError::RefreshFailed(format!("Failed to send refresh request: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        let detail = error_detail(&error_text)
            .unwrap_or_else(|| format!("Refresh failed with status {}", status.as_u16()));
        tracing::error!(
            status = status.as_u16(),
            body = %error_text,
            "Token refresh rejected"
        );
        return Err(AuthError::RefreshFailed(detail));
    }

    let data: TokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::RefreshFailed(format!("Failed to parse refresh response: {}", e)))?;

    if data.access_token.is_empty() {
        return Err(AuthError::RefreshFailed(
            "Refresh response does not contain access_token".to_string(),
        ));
    }

    // Keep the old refresh token if the server did not rotate it
    let refresh = data
        .refresh_token
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| refresh_token.to_string());

    Ok(TokenPair {
        access: data.access_token,
        refresh,
        kind: data
            .token_type
            .unwrap_or_else(|| DEFAULT_TOKEN_KIND.to_string()),
    })
}
