use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::ResourceFamily;
use crate::http_client::{ClientOptions, DEFAULT_API_URL};

/// Propstore catalog client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API base URL
    #[arg(short = 'b', long, env = "PROPSTORE_API_URL", default_value = DEFAULT_API_URL)]
    pub base_url: String,

    /// Path to the SQLite file holding the session tokens
    #[arg(short = 'd', long, env = "PROPSTORE_TOKEN_DB")]
    pub token_db: Option<String>,

    /// Cache TTL for list and detail reads in seconds
    #[arg(long, env = "CACHE_TTL", default_value = "30")]
    pub cache_ttl: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries for reads
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "0")]
    pub http_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and store the session
    Login {
        #[arg(short, long)]
        username: Option<String>,

        /// Prompted when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Discard the stored session
    Logout,

    /// Show whether a session is stored
    Status,

    /// List a collection
    List {
        family: ResourceFamily,

        #[arg(long, default_value = "0")]
        offset: u64,

        #[arg(long, default_value = "20")]
        limit: u64,

        #[arg(long)]
        search: Option<String>,
    },

    /// Show one record
    Get { family: ResourceFamily, id: String },

    /// Create a record from a JSON payload
    Create { family: ResourceFamily, json: String },

    /// Update a record with a partial JSON payload
    Update {
        family: ResourceFamily,
        id: String,
        json: String,
    },

    /// Delete a record
    Delete { family: ResourceFamily, id: String },

    /// Upload a file
    Upload { path: PathBuf },

    /// Delete an uploaded file
    DeleteUpload { name: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub base_url: String,

    // Session storage
    pub token_db: PathBuf,

    // Cache
    pub cache_ttl: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let token_db = match &args.token_db {
            Some(path) => expand_tilde(path),
            None => default_token_db()?,
        };

        Ok(Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),

            token_db,

            cache_ttl: args.cache_ttl,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            http_max_retries: args.http_retries,

            log_level: args.log_level.clone(),

            log_json: args.log_json,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("PROPSTORE_API_URL is not a valid URL: {}", self.base_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!(
                "PROPSTORE_API_URL must use http or https, got '{}'",
                url.scheme()
            );
        }

        if self.cache_ttl == 0 {
            anyhow::bail!("CACHE_TTL must be greater than zero");
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    /// Options for the API client
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.base_url.clone(),
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
            max_retries: self.http_max_retries,
            default_ttl: self.cache_ttl(),
            ..ClientOptions::default()
        }
    }
}

/// Default session file under the user data directory
fn default_token_db() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .context("Could not determine a data directory (set PROPSTORE_TOKEN_DB)")?;

    Ok(data_dir.join("propstore").join("tokens.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
