use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sponsorhub_core::AppStateDocument;
use sponsorhub_storage::{HttpClientConfig, SponsorImporter};
use sponsorhub_sync::{open_reconciler, Reconciler, StoreConfig};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sponsorhub")]
#[command(about = "SponsorHub server and maintenance commands")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web server.
    Serve,
    /// Create the configured backend's schema and singleton document.
    Migrate,
    /// Show what saving a local state document would change.
    Diff {
        #[arg(long)]
        file: PathBuf,
    },
    /// Save a local state document (backup, apply, log).
    Apply {
        #[arg(long)]
        file: PathBuf,
    },
    /// Preview a backup restore, or apply it with --force.
    Restore {
        #[arg(long)]
        backup: String,
        #[arg(long)]
        force: bool,
    },
    /// Compare the document's sponsor ids with the table's.
    Drift,
    /// Post every sponsor in a JSON file to a running instance.
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, env = "SPONSORHUB_URL", default_value = "http://localhost:3000")]
        url: String,
        #[arg(long, env = "ADMIN_EMAIL")]
        email: String,
        #[arg(long, env = "SPONSORHUB_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Set `profile.userId` on the canonical document and save it.
    SetProfileUser {
        #[arg(long)]
        user_id: String,
    },
    /// Print a bcrypt hash suitable for ADMIN_PASSWORD_HASH.
    HashPassword { password: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn reconciler_from_env() -> Result<Reconciler> {
    let config = StoreConfig::from_env()?;
    match open_reconciler(&config).await? {
        Some(reconciler) => Ok(reconciler),
        None => bail!("persistence is disabled (STORAGE_BACKEND=none)"),
    }
}

async fn read_json(path: &Path) -> Result<Value> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

async fn read_document(path: &Path) -> Result<AppStateDocument> {
    let value = read_json(path).await?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a valid state document", path.display()))
}

/// Accepts either a bare array or a document with a `sponsors` array.
fn sponsor_records(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("sponsors") {
            Some(Value::Array(items)) => Ok(items),
            _ => bail!("expected a JSON array or an object with a sponsors array"),
        },
        _ => bail!("expected a JSON array or an object with a sponsors array"),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => sponsorhub_web::serve_from_env().await?,
        Commands::Migrate => {
            let reconciler = reconciler_from_env().await?;
            println!(
                "store initialized: backend={}",
                reconciler.store().backend_name()
            );
        }
        Commands::Diff { file } => {
            let document = read_document(&file).await?;
            let diff = reconciler_from_env().await?.preview(&document).await?;
            print_json(&json!({ "ok": true, "dryRun": true, "diff": diff }))?;
        }
        Commands::Apply { file } => {
            let document = read_document(&file).await?;
            let summary = reconciler_from_env().await?.apply(document).await?;
            print_json(&json!({ "ok": true, "applied": true, "summary": summary }))?;
        }
        Commands::Restore { backup, force } => {
            let reconciler = reconciler_from_env().await?;
            if force {
                let summary = reconciler.restore(&backup).await?;
                print_json(&json!({ "ok": true, "applied": true, "summary": summary }))?;
            } else {
                let diff = reconciler.preview_restore(&backup).await?;
                print_json(&json!({ "ok": true, "dryRun": true, "diff": diff }))?;
            }
        }
        Commands::Drift => {
            let drift = reconciler_from_env().await?.drift().await?;
            print_json(&drift)?;
            if !drift.in_sync {
                warn!(
                    only_in_document = drift.only_in_document.len(),
                    only_in_table = drift.only_in_table.len(),
                    "document and table disagree"
                );
            }
        }
        Commands::Import {
            file,
            url,
            email,
            password,
        } => {
            let records = sponsor_records(read_json(&file).await?)?;
            let mut importer = SponsorImporter::new(&url, &HttpClientConfig::default())?;
            importer.login(&email, &password).await?;
            info!(count = records.len(), url = %url, "importing sponsors");

            let summary = importer.import_all(&records).await;
            print_json(&summary)?;
            if !summary.failures.is_empty() {
                bail!(
                    "{} of {} sponsors failed to import",
                    summary.failures.len(),
                    summary.total
                );
            }
        }
        Commands::SetProfileUser { user_id } => {
            let reconciler = reconciler_from_env().await?;
            let mut document = reconciler.get_state().await?;
            let previous = document.set_profile_field("userId", Value::String(user_id.clone()));
            let summary = reconciler.apply(document).await?;
            info!(user_id = %user_id, previous = ?previous, "profile user updated");
            print_json(&json!({ "ok": true, "applied": true, "summary": summary }))?;
        }
        Commands::HashPassword { password } => {
            println!("{}", bcrypt::hash(password, bcrypt::DEFAULT_COST)?);
        }
    }

    Ok(())
}
