//! golem-herder — main entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use golem_herder::broker::{Hub, HubConfig};
use golem_herder::config::Config;
use golem_herder::container;
use golem_herder::daemon::DaemonRegistry;
use golem_herder::ledger::Ledger;
use golem_herder::server::{self, HerderState};
use golem_herder::token::TokenManager;

#[derive(Parser)]
#[command(name = "golem-herder", about = "Start, stop and otherwise manage golems.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the herder server.
    Serve {
        /// Listen port; overrides the HERDER_PORT environment key.
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Generate a token offline.
    Token {
        /// Credit grant to bake into the token.
        #[arg(long, short, default_value_t = 30_000)]
        credits: i64,
        /// Subject (email) of the token.
        #[arg(long, short)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("golem_herder=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = Config::from_env()?;

    match cli.command {
        Some(Command::Token { credits, email }) => {
            let tokens = TokenManager::new(&config.pubkey, &config.privkey)?;
            let mut extra = serde_json::Map::new();
            extra.insert("crd".to_string(), json!(credits));
            let token = tokens.generate(&email, extra)?;
            println!("{token}");
            Ok(())
        }
        Some(Command::Serve { port }) => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting golem-herder...");

    let tokens = TokenManager::new(&config.pubkey, &config.privkey)?;
    tracing::info!("Token keys loaded");

    let ledger = Ledger::open(&config.meter_db)?;
    tracing::info!(db = %config.meter_db.display(), "Credit ledger open");

    let docker = container::connect()?;

    let state = Arc::new(HerderState {
        docker,
        hub: Hub::new(HubConfig::default()),
        ledger,
        tokens,
        daemons: DaemonRegistry::new(),
        http: reqwest::Client::new(),
        config,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Herder listening");

    axum::serve(listener, server::router(state)).await?;
    Ok(())
}
