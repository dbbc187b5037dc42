// Token persistence
// Durable key-value storage for the access/refresh token pair

use anyhow::{Context, Result};
use dashmap::DashMap;
use rusqlite::OptionalExtension;
use std::path::Path;
use std::sync::Mutex;

use super::types::TokenPair;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Durable string key-value store used by the credential store
pub trait TokenStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite-backed token storage (`auth_kv` table)
pub struct SqliteTokenStorage {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteTokenStorage {
    /// Open (or create) the token database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create token directory: {}", parent.display())
                })?;
            }
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, lost when dropped
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection mutex poisoned"))
    }
}

impl TokenStorage for SqliteTokenStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to load {} from SQLite", key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )
        .with_context(|| format!("Failed to store {} in SQLite", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [key])
            .with_context(|| format!("Failed to remove {} from SQLite", key))?;
        Ok(())
    }
}

/// Process-local storage, for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryTokenStorage {
    values: DashMap<String, String>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a token pair
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        let storage = Self::new();
        storage.values.insert(ACCESS_TOKEN_KEY.to_string(), access.to_string());
        storage.values.insert(REFRESH_TOKEN_KEY.to_string(), refresh.to_string());
        storage
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Load the persisted pair
///
/// A pair with only one half present is discarded and the stray key removed.
pub fn load_pair(storage: &dyn TokenStorage) -> Result<Option<TokenPair>> {
    let access = storage.get(ACCESS_TOKEN_KEY)?.filter(|s| !s.is_empty());
    let refresh = storage.get(REFRESH_TOKEN_KEY)?.filter(|s| !s.is_empty());

    match (access, refresh) {
        (Some(access), Some(refresh)) => Ok(Some(TokenPair::new(access, refresh))),
        (None, None) => Ok(None),
        _ => {
            tracing::warn!("Discarding incomplete token pair found in storage");
            clear_pair(storage)?;
            Ok(None)
        }
    }
}

/// Persist both halves of the pair
pub fn save_pair(storage: &dyn TokenStorage, pair: &TokenPair) -> Result<()> {
    storage.set(ACCESS_TOKEN_KEY, &pair.access)?;
    storage.set(REFRESH_TOKEN_KEY, &pair.refresh)?;
    Ok(())
}

/// Remove both halves of the pair
pub fn clear_pair(storage: &dyn TokenStorage) -> Result<()> {
    storage.remove(ACCESS_TOKEN_KEY)?;
    storage.remove(REFRESH_TOKEN_KEY)?;
    Ok(())
}
