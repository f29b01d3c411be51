use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use genealogy_predictions::{
    auth::Caller,
    config::{Config, LogFormat},
    server::{AppState, McpServer},
    storage::SqliteStorage,
};

/// Relationship gap predictions for genealogy trees.
#[derive(Parser, Debug)]
#[command(name = "genealogy-predictions", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the MCP tools over stdio (default).
    Serve,
    /// Scan a tree once and print the summary as JSON.
    Scan {
        #[arg(long)]
        tree_id: String,
        #[arg(long)]
        user_id: String,
    },
    /// Accept every new prediction at or above a threshold and print the counts.
    AcceptAll {
        #[arg(long)]
        tree_id: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        min_confidence: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Genealogy predictions starting..."
    );

    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    let state = Arc::new(AppState::new(config, storage));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let server = McpServer::new(state);
            info!("Server ready, waiting for requests on stdin...");

            if let Err(e) = server.run().await {
                error!(error = %e, "Server error");
                return Err(e.into());
            }
            info!("Server shutdown complete");
        }
        Commands::Scan { tree_id, user_id } => {
            let summary = state
                .service
                .scan_tree(&tree_id, &Caller::new(user_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::AcceptAll {
            tree_id,
            user_id,
            min_confidence,
        } => {
            let summary = state
                .service
                .accept_all_high_confidence(&tree_id, min_confidence, &Caller::new(user_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

/// Initialize tracing/logging. Output goes to stderr; stdout carries the protocol.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
