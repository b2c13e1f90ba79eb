use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use trap_sync::auth::AuthService;
use trap_sync::camera::{capture_into, FilePhotoSource};
use trap_sync::client::{ApiClient, RemoteGateway};
use trap_sync::config::SyncConfig;
use trap_sync::credentials::{MemoryCredentialProvider, StoreCredentialProvider, TokenStore};
use trap_sync::local_store::{KeyValueStore, NativeDbStore};
use trap_sync::models::{FieldPatch, TrapPatch};
use trap_sync::repository::EntityRepository;

#[derive(Parser)]
#[command(name = "trap_sync_cli")]
#[command(about = "Inspect and edit the local trap store, and sync it with the backend")]
struct Args {
    /// Local database file (overrides TRAP_SYNC_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Backend URL (overrides TRAP_SYNC_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every field with its traps
    List,
    CreateField {
        #[arg(long)]
        name: String,
        #[arg(long)]
        location: Option<String>,
    },
    UpdateField {
        #[arg(long)]
        field: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        area: Option<f64>,
        #[arg(long)]
        status: Option<String>,
    },
    DeleteField {
        #[arg(long)]
        field: String,
    },
    CreateTrap {
        #[arg(long)]
        field: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        notes: Option<String>,
    },
    UpdateTrap {
        #[arg(long)]
        field: String,
        #[arg(long)]
        trap: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    DeleteTrap {
        #[arg(long)]
        field: String,
        #[arg(long)]
        trap: String,
    },
    /// Attach an image file to a trap as its current photo
    AttachPhoto {
        #[arg(long)]
        field: String,
        #[arg(long)]
        trap: String,
        #[arg(long)]
        file: String,
    },
    ClearPhoto {
        #[arg(long)]
        field: String,
        #[arg(long)]
        trap: String,
    },
    /// Run a full reconciliation pass
    Sync,
    /// Run one upload-queue drain cycle
    Drain,
    /// Reconcile once, then keep draining uploads until Ctrl-C
    Watch,
    /// Show queued photo uploads
    Pending,
    Stats,
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn found(ok: bool, what: &str) -> Result<()> {
    if ok {
        print_json(&serde_json::json!({ "ok": true }))
    } else {
        Err(anyhow!("{} not found", what))
    }
}

// example usage:
// trap_sync_cli create-field --name "Talhão A" --location Norte
// trap_sync_cli create-trap --field <local id> --name A1
// trap_sync_cli attach-photo --field <local id> --trap <local id> --file trap.jpg
// TRAP_SYNC_API_URL=http://192.168.75.1:3333 trap_sync_cli sync
// TRAP_SYNC_DRAIN_INTERVAL_SECS=5 trap_sync_cli watch

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("trap_sync={}", args.log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = SyncConfig::from_env()?;
    if let Some(db_path) = args.db_path {
        config = config.with_db_path(db_path);
    }
    if let Some(api_url) = args.api_url {
        config = config.with_api_url(api_url);
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(NativeDbStore::open(&config.db_path)?);
    let tokens = Arc::new(TokenStore::select(vec![
        Box::new(StoreCredentialProvider::new("device-store", store.clone())),
        Box::new(MemoryCredentialProvider::new()),
    ]));
    let gateway: Arc<dyn RemoteGateway> = Arc::new(ApiClient::new(&config, tokens.clone())?);
    info!("Using backend {} and database {}", config.api_url, config.db_path);

    let repository = EntityRepository::open(store, gateway.clone(), config)?;
    let auth = AuthService::new(gateway, tokens);

    let outcome = run(args.command, &repository, &auth).await;
    repository.wait_for_background().await;

    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}

async fn run(command: Command, repository: &EntityRepository, auth: &AuthService) -> Result<()> {
    match command {
        Command::List => print_json(&repository.list_fields()),
        Command::CreateField { name, location } => {
            print_json(&repository.create_field(name, location))
        }
        Command::UpdateField {
            field,
            name,
            location,
            area,
            status,
        } => {
            let patch = FieldPatch {
                name,
                location,
                area,
                status,
            };
            found(repository.update_field(&field, patch), "Field")
        }
        Command::DeleteField { field } => found(repository.delete_field(&field).await, "Field"),
        Command::CreateTrap { field, name, notes } => {
            let trap = repository
                .create_trap(&field, name, notes)
                .ok_or_else(|| anyhow!("Field not found"))?;
            print_json(&trap)
        }
        Command::UpdateTrap {
            field,
            trap,
            name,
            notes,
        } => found(
            repository.update_trap(&field, &trap, TrapPatch { name, notes }),
            "Trap",
        ),
        Command::DeleteTrap { field, trap } => found(repository.delete_trap(&field, &trap), "Trap"),
        Command::AttachPhoto { field, trap, file } => {
            let source = FilePhotoSource::new(file);
            let attached = capture_into(repository, &source, &field, &trap)
                .await
                .map_err(|e| anyhow!("{} ({})", e.user_message(), e))?;
            found(attached, "Trap")
        }
        Command::ClearPhoto { field, trap } => found(repository.clear_photo(&field, &trap), "Trap"),
        Command::Sync => match repository.force_sync().await {
            Some(report) => print_json(&report),
            None => Err(anyhow!("A sync is already running")),
        },
        Command::Drain => {
            let report = repository.drain_uploads().await;
            info!("{} uploads still queued", repository.pending_uploads().len());
            print_json(&report)
        }
        Command::Watch => {
            let worker = repository.start();
            info!(
                "Draining uploads every {}s, press Ctrl-C to stop",
                repository.config().drain_interval_secs
            );
            tokio::signal::ctrl_c().await?;
            worker.abort();
            print_json(&repository.pending_uploads())
        }
        Command::Pending => print_json(&repository.pending_uploads()),
        Command::Stats => print_json(&repository.summary()),
        Command::Register {
            name,
            email,
            password,
        } => print_json(&auth.register(&name, &email, &password).await?),
        Command::Login { email, password } => {
            auth.login(&email, &password).await?;
            print_json(&serde_json::json!({ "authenticated": auth.is_authenticated().await }))
        }
        Command::Logout => {
            auth.logout()?;
            print_json(&serde_json::json!({ "ok": true }))
        }
    }
}
