// Authentication module
// Manages the token pair lifecycle and its persistence

mod manager;
mod refresh;
mod storage;
mod types;

pub use manager::CredentialStore;
pub use refresh::{LOGIN_PATH, REFRESH_PATH};
pub use storage::{
    MemoryTokenStorage, SqliteTokenStorage, TokenStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
pub use types::{AuthState, TokenPair};
