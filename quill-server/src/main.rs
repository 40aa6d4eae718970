//! Quill server binary.
//!
//! Starts the WebSocket sync listener, the autosave loop and the backup
//! scheduler over one data root. Fatal startup errors (unreadable config,
//! database, data root or token file) exit non-zero before serving.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use quill_collab::{DocRegistry, SyncEngine, TokenVerifier};
use quill_server::{AdminApi, ServerConfig, ServerCtx, StaticTokenVerifier};
use quill_store::{BackupScheduler, PermissionStore, VaultStore};

#[derive(Parser, Debug)]
#[command(
    name = "quill-server",
    about = "Self-hosted collaborative note-vault server",
    version
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the data root directory.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Override the token file path.
    #[arg(long)]
    tokens: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(data_root) = cli.data_root {
        config.data_root = data_root;
    }
    if let Some(tokens) = cli.tokens {
        config.tokens_path = Some(tokens);
    }

    std::fs::create_dir_all(&config.data_root)?;
    let store = Arc::new(VaultStore::new(&config.data_root));
    store.init().await?;
    let permissions = Arc::new(PermissionStore::open(config.data_root.join("quill.db"))?);

    let verifier: Arc<dyn TokenVerifier> = match &config.tokens_path {
        Some(path) => {
            let verifier = StaticTokenVerifier::from_file(path)?;
            log::info!("loaded {} tokens from {}", verifier.len(), path.display());
            Arc::new(verifier)
        }
        None => {
            log::warn!("no token file configured; every authentication will be rejected");
            Arc::new(StaticTokenVerifier::new())
        }
    };

    let registry = Arc::new(DocRegistry::with_debounce(
        store,
        Duration::from_millis(config.debounce_ms),
    ));
    let engine = Arc::new(SyncEngine::new(
        registry.clone(),
        permissions,
        verifier.clone(),
    ));
    let backups = Arc::new(BackupScheduler::new(&config.data_root));

    // Handed to the external HTTP router; unused by the socket path.
    let _admin = AdminApi::new(engine.clone(), backups.clone(), verifier);

    // Autosave: flush dirty vaults on a fixed cadence.
    {
        let registry = registry.clone();
        let period = Duration::from_secs(config.autosave_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let flushed = registry.flush_dirty().await;
                if flushed > 0 {
                    log::debug!("autosave: flushed {flushed} vaults");
                }
            }
        });
    }

    tokio::spawn(backups.run(Duration::from_secs(config.backup_interval_secs.max(60))));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    log::info!("quill-server listening on {}", config.bind_addr);

    let ctx = Arc::new(ServerCtx {
        engine,
        auth_timeout: Duration::from_secs(config.auth_timeout_secs.max(1)),
    });

    tokio::select! {
        result = quill_server::ws::run(listener, ctx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down, flushing live vaults");
            registry.flush_all().await;
        }
    }
    Ok(())
}
