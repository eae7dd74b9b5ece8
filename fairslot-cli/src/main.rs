mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::CliConfig;
use fairslot_core::FairSlotError;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fairslot")]
#[command(about = "Provably-fair slot sessions over hash-chain commit-reveal")]
#[command(version)]
struct Cli {
    /// Data directory for session databases
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a game between a player and a maker on a simulated ledger
    Simulate(commands::SimulateArgs),

    /// Hash chain primitives
    #[command(subcommand)]
    Chain(commands::ChainCommands),

    /// List persisted sessions
    Sessions {
        /// Session database (defaults to the player database)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Forget the session for this contract address
        #[arg(long)]
        remove: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "fairslot={},fairslot_core={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = CliConfig::default();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let result = match cli.command {
        Commands::Simulate(args) => commands::handle_simulate(args, &config).await,
        Commands::Chain(cmd) => commands::handle_chain_command(cmd),
        Commands::Sessions { db, remove } => {
            commands::handle_sessions(db, remove, &config).await
        }
    };

    if let Err(e) = result {
        match e {
            FairSlotError::FairnessViolation {
                chain_index,
                reason,
            } => {
                eprintln!("Error: Fairness violation on chain {}", chain_index);
                eprintln!("{}", reason);
                eprintln!("The session was aborted; the seat must be released");
            }
            FairSlotError::ChainExhausted { chain_index } => {
                eprintln!("Error: Chain {} has no reveals left", chain_index);
                eprintln!("Use a larger --rounds-per-chain or fewer --rounds");
            }
            FairSlotError::UnknownSession(address) => {
                eprintln!("Error: No session for {}", address);
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
