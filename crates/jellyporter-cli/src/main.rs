use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod metrics;

#[derive(Parser)]
#[command(name = "jellyporter")]
#[command(about = "Sync user playback data across multiple Jellyfin servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync engine to replicate user playback data across Jellyfin servers
    Run {
        /// Do not run as daemon but only sync once and exit
        #[arg(short, long, action = ArgAction::SetTrue)]
        once: bool,

        /// Print debug statements
        #[arg(short, long, action = ArgAction::SetTrue)]
        debug: bool,

        /// Path to YAML config file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            once,
            debug,
            config,
        } => {
            logging::init_logging(debug).map_err(|e| color_eyre::eyre::eyre!("{}", e))?;
            commands::run::run(once, config).await
        }
        Commands::Version => {
            println!("jellyporter {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
