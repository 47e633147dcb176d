use anyhow::Context;
use clap::{Parser, Subcommand};
use skua_core::{GroupStore, NewUser, UserStore};
use skua_db::{Database, MemoryStore};
use skua_ftp::{Config, ConfigHandle, Server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skua")]
#[command(about = "Multi-user FTP daemon with sections, ratios and credits", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/skua/skua.conf")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Server {
        /// PostgreSQL connection string (default: $SKUA_DATABASE_URL)
        #[arg(long)]
        database_url: Option<String>,

        /// Run against an ephemeral in-memory store with one bootstrap
        /// operator account; nothing survives a restart
        #[arg(long)]
        memory_store: bool,
    },

    /// Parse the configuration and report problems
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skua=info,skua_ftp=info,skua_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig => {
            let config = Config::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            println!(
                "{} OK: version {}, {} section(s), port {}",
                cli.config.display(),
                config.version,
                config.sections.len(),
                config.port
            );
            Ok(())
        }
        Commands::Server {
            database_url,
            memory_store,
        } => run_server(&cli.config, database_url, memory_store).await,
    }
}

async fn run_server(
    config_path: &PathBuf,
    database_url: Option<String>,
    memory_store: bool,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(version = config.version, "configuration loaded");
    let handle = ConfigHandle::new(config);

    let (users, groups): (Arc<dyn UserStore>, Arc<dyn GroupStore>) = if memory_store {
        let store = Arc::new(MemoryStore::new());
        bootstrap_memory_store(store.as_ref()).await?;
        (store.clone(), store)
    } else {
        let url = database_url
            .or_else(|| std::env::var("SKUA_DATABASE_URL").ok())
            .context("no database URL; pass --database-url or set SKUA_DATABASE_URL")?;
        let db = Database::connect(&url).await?;
        db.spawn_cache_refresh(Duration::from_secs(60));
        (db.clone(), db)
    };

    spawn_reload_handler(config_path.clone(), handle.clone());

    let server = Server::new(handle, users, groups)?;
    server.run().await?;
    Ok(())
}

async fn bootstrap_memory_store(store: &MemoryStore) -> anyhow::Result<()> {
    let group = store.create_group("staff", "bootstrap group").await?;
    let password = skua_ftp::auth::new_salt();
    let salt = skua_ftp::auth::new_salt();
    let hash = skua_ftp::auth::hash_password(&salt, &password);
    let user = store
        .create_user(NewUser {
            name: "admin".to_string(),
            primary_gid: group.gid,
            flags: "13".to_string(),
            default_ratio: 0,
            home_dir: "/".to_string(),
            password_salt: salt,
            password_hash: hash,
        })
        .await?;
    // Stdout on purpose: the generated password must not hit the logs.
    println!("bootstrap account: {} / {}", user.name, password);
    warn!("running on an in-memory store; users and credits will not survive a restart");
    Ok(())
}

/// SIGHUP reloads the configuration; a failed reload keeps the running
/// snapshot.
fn spawn_reload_handler(path: PathBuf, handle: ConfigHandle) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot install SIGHUP handler: {}", e);
                return;
            }
        };
        while hup.recv().await.is_some() {
            match Config::load(&path) {
                Ok(config) => {
                    info!(version = config.version, "configuration reloaded");
                    handle.replace(config);
                }
                Err(e) => {
                    error!("reload failed, keeping previous configuration: {}", e);
                }
            }
        }
    });
}
