use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use rill_cluster::run_application_master;
use rill_cluster::state::JobStatus;
use rill_common::config::AppConfig;

#[derive(Parser)]
#[command(name = "rill", version, about = "Stream-processing application master")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Negotiate containers and run the job until it finishes.
    Run,
    /// Print the resolved configuration and exit.
    Config,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    match cli.command {
        Command::Config => match serde_json::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                error!("failed to render the configuration: {e}");
                std::process::exit(1);
            }
        },
        Command::Run => match run_application_master(&config).await {
            Ok(JobStatus::Succeeded) => info!("job succeeded"),
            Ok(status) => {
                error!("job finished with status {status}");
                std::process::exit(1);
            }
            Err(e) => {
                error!("application master failed: {e}");
                std::process::exit(1);
            }
        },
    }
}
