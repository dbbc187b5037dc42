use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use dialoguer::{Input, Password};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use propstore_client::config::{CliArgs, Command, Config};
use propstore_client::{ApiClient, ApiError, Catalog, ListEnvelope, ListQuery, SqliteTokenStorage};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    init_tracing(&config);
    tracing::debug!(
        base_url = %config.base_url,
        token_db = %config.token_db.display(),
        "Configuration loaded"
    );

    let storage = SqliteTokenStorage::open(&config.token_db)?;
    let client = ApiClient::new(&config.client_options(), Arc::new(storage))?;
    let catalog = Catalog::new(client.clone()).with_ttl(config.cache_ttl());

    let outcome = run(&catalog, args.command).await;

    tracing::debug!(
        metrics = %serde_json::to_string(&client.metrics().snapshot()).unwrap_or_default(),
        "Request metrics"
    );

    match outcome {
        Err(e) if is_session_expired(&e) => {
            eprintln!("Your session has expired. Run `propstore login` to sign in again.");
            Err(e)
        }
        other => other,
    }
}

/// Initialize logging with a configured level
fn init_tracing(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(catalog: &Catalog, command: Command) -> Result<()> {
    let credentials = catalog.api().credentials();

    match command {
        Command::Login { username, password } => {
            let username = match username {
                Some(username) => username,
                None => Input::new()
                    .with_prompt("Username")
                    .interact_text()
                    .context("Failed to read username")?,
            };
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            credentials.login(&username, &password).await?;
            println!("Logged in as {}", username);
        }

        Command::Logout => {
            credentials.logout().await;
            println!("Logged out");
        }

        Command::Status => {
            let status = if credentials.is_authenticated().await {
                "authenticated"
            } else {
                "not authenticated"
            };
            println!("{} ({})", status, credentials.base_url());
        }

        Command::List {
            family,
            offset,
            limit,
            search,
        } => {
            let mut query = ListQuery {
                offset,
                ..ListQuery::default()
            }
            .limit(limit);
            if let Some(search) = search {
                query = query.search(search);
            }

            let envelope: ListEnvelope = catalog.list(family, &query).await;
            if let Some(error) = &envelope.error {
                tracing::warn!("List could not be loaded: {}", error);
            }
            print_json(&envelope)?;
        }

        Command::Get { family, id } => {
            let record: Value = catalog.get(family, &id).await?;
            print_json(&record)?;
        }

        Command::Create { family, json } => {
            let created = catalog.create(family, parse_payload(&json)?).await?;
            print_json(&created)?;
        }

        Command::Update { family, id, json } => {
            let updated = catalog.update(family, &id, parse_payload(&json)?).await?;
            print_json(&updated)?;
        }

        Command::Delete { family, id } => {
            catalog.delete(family, &id).await?;
            println!("Deleted {} {}", family, id);
        }

        Command::Upload { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .context("Upload path has no file name")?;

            let uploaded = catalog
                .upload(&file_name, guess_content_type(&path), Bytes::from(bytes))
                .await?;
            print_json(&uploaded)?;
        }

        Command::DeleteUpload { name } => {
            catalog.delete_upload(&name).await?;
            println!("Deleted upload {}", name);
        }
    }

    Ok(())
}

fn parse_payload(json: &str) -> Result<Value> {
    let payload: Value = serde_json::from_str(json).context("Payload is not valid JSON")?;
    if !payload.is_object() {
        anyhow::bail!("Payload must be a JSON object");
    }
    Ok(payload)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn is_session_expired(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_session_expired)
}

fn guess_content_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    let content_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(content_type)
}
