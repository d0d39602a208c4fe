//! tillctl - diagnostics for the Till data layer.
//!
//! Resolves the configuration the application would use, opens the local
//! databases against the in-process remote and reports their sync state.

use clap::{Parser, Subcommand};
use serde_json::json;
use till_data::{Config, DataLayer, EntityType, MemoryServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tillctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Simulate the device being offline
    #[arg(global = true, long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration (password redacted)
    Config,

    /// Open every database and print sync status and statistics as JSON
    Status {
        /// Run a manual sync on every synced database first
        #[arg(short, long)]
        sync: bool,
    },

    /// Destroy every local database of an in-process data layer. Stores
    /// opened by this tool live in memory only, so this never touches data
    /// held by another process.
    Clear {
        /// Confirm the data loss
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "till_data=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Config => {
            println!("{config:#?}");
            println!("sync possible: {}", config.sync_possible());
        }
        Commands::Status { sync } => {
            let server = match &config.credentials {
                Some(credentials) => MemoryServer::new().with_credentials(credentials.clone()),
                None => MemoryServer::new(),
            };
            let layer = DataLayer::new(config, std::sync::Arc::new(server));
            layer.set_online(!cli.offline);

            for entity in EntityType::ALL {
                layer.get_database(entity).await?;
            }

            let mut manual = serde_json::Map::new();
            if sync {
                for entity in EntityType::ALL {
                    if layer.status().sync_enabled_for(entity) {
                        let report = layer.trigger_manual_sync(entity).await?;
                        manual.insert(entity.to_string(), serde_json::to_value(report)?);
                    }
                }
            }

            let mut statuses = serde_json::Map::new();
            for entity in EntityType::ALL {
                statuses.insert(
                    entity.to_string(),
                    serde_json::to_value(layer.get_sync_status(entity))?,
                );
            }

            let output = json!({
                "status": statuses,
                "statistics": layer.get_sync_statistics().await,
                "manualSync": manual,
                "errors": layer.status().error_history(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            layer.shutdown().await;
        }
        Commands::Clear { yes } => {
            if !yes {
                eprintln!("Refusing to clear local data without --yes");
                std::process::exit(2);
            }
            let layer = DataLayer::new(config, MemoryServer::new_shared());
            layer.clear_all_databases().await;
            println!("In-process databases cleared; stores of other processes are untouched");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn clear_help_states_its_scope() {
        let cli = Cli::command();
        let clear = cli
            .get_subcommands()
            .find(|c| c.get_name() == "clear")
            .unwrap();
        let about = clear.get_about().unwrap().to_string();
        assert!(about.contains("in-process"), "{about}");
    }

    #[test]
    fn clear_requires_confirmation_flag() {
        let cli = Cli::try_parse_from(["tillctl", "clear"]).unwrap();
        assert!(matches!(cli.command, Commands::Clear { yes: false }));
        let cli = Cli::try_parse_from(["tillctl", "clear", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Clear { yes: true }));
    }
}
