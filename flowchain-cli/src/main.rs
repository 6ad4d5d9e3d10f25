mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;

#[derive(Parser)]
#[command(name = "flowchain")]
#[command(version)]
#[command(about = "Inspect flowchain flow definitions and the durable flow store")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (default: XDG config directory)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Registered flow definitions
    Flows {
        #[command(subcommand)]
        command: cli::flows::FlowCommands,
    },

    /// Flow instances, transitions and chain progress in the state store
    ///
    /// Examples:
    ///   flowchain store instances --status running
    ///   flowchain store transitions 6f1c... --json
    ///   flowchain store chains --incomplete --store /var/lib/flowchain/store.json
    Store {
        #[command(subcommand)]
        command: cli::store::StoreCommands,
    },

    /// Configure flowchain settings
    Config {
        /// Start interactive configuration setup
        #[arg(long)]
        init: bool,

        /// Write the defaults without asking
        #[arg(long, requires = "init")]
        defaults: bool,

        /// Path to configuration file
        #[arg(long)]
        config_file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = handlers::load_configuration(cli.config.as_deref())?;
    handlers::init_cli_logging(&config)?;

    match cli.command {
        Commands::Flows { command } => {
            cli::flow_handlers::handle_flow_commands(command)?;
        }
        Commands::Store { command } => {
            cli::store_handlers::handle_store_commands(command, &config)?;
        }
        Commands::Config {
            init,
            defaults,
            config_file,
        } => {
            if init {
                handlers::handle_config_init(config_file.or(cli.config), defaults)?;
            } else {
                println!("Config command requires --init flag");
                println!("Usage: flowchain config --init [--defaults] [--config-file PATH]");
            }
        }
    }

    Ok(())
}
