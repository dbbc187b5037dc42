// Propstore client - library root

pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod http_client;
pub mod metrics;

pub use auth::{CredentialStore, MemoryTokenStorage, SqliteTokenStorage, TokenPair, TokenStorage};
pub use cache::{Lookup, ResponseCache};
pub use catalog::{Catalog, ListEnvelope, ListQuery, ResourceFamily};
pub use error::{ApiError, AuthError, Result};
pub use http_client::{ApiClient, ApiRequest, CachePolicy, ClientOptions, FileUpload};
