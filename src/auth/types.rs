// Authentication types

use serde::{Deserialize, Serialize};

/// Default token type when the server does not report one
pub const DEFAULT_TOKEN_KIND: &str = "bearer";

/// Access/refresh token pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub kind: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
            kind: DEFAULT_TOKEN_KIND.to_string(),
        }
    }
}

/// Session state held by the credential store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated(TokenPair),
}

impl AuthState {
    pub fn tokens(&self) -> Option<&TokenPair> {
        match self {
            AuthState::Unauthenticated => None,
            AuthState::Authenticated(pair) => Some(pair),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }
}

/// Form body for `POST /v1/auth/login`
#[derive(Serialize)]
pub struct LoginForm<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub grant_type: &'a str,
}

/// JSON body for `POST /v1/auth/refresh`
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
}
