use anyhow::{Context, Result};
use branchchat::config::{Config, DEFAULT_CONFIG_PATH};
use branchchat::db::Database;
use branchchat::storage::LocalObjectStore;
use branchchat::{router, AppState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Multi-provider AI chat server with branching conversations
#[derive(Parser, Debug)]
#[command(name = "branchchat")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "BRANCHCHAT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the database path from config
    #[arg(long, env = "BRANCHCHAT_DATABASE_PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:3000
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Manage session tokens
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Create the user if needed and print a new session token
    Issue {
        #[arg(long)]
        user: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Revoke a session token
    Revoke {
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    init_tracing(config.logging.json);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            serve(config).await
        }
        Commands::Token { command } => {
            let db = Database::new(&config.database.path).context("failed to open database")?;
            match command {
                TokenCommand::Issue { user, email } => {
                    db.ensure_user(&user, email.as_deref())?;
                    let token = db.create_session(&user)?;
                    println!("{}", token);
                }
                TokenCommand::Revoke { token } => {
                    if db.revoke_session(&token)? {
                        println!("session revoked");
                    } else {
                        anyhow::bail!("no session matches that token");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let db = Database::new(&config.database.path).context("failed to open database")?;
    let store = LocalObjectStore::new(&config.storage.root)
        .context("failed to prepare attachment storage")?;
    let bind = config.server.bind.clone();

    let state = Arc::new(AppState::new(config, db, Arc::new(store)));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    tracing::info!("Server running on http://{}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutting down");
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("branchchat=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
