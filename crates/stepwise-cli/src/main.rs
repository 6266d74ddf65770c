mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Multi-step identity verification orchestration",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ./stepwise.yaml when present)
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value = "8080", env = "STEPWISE_PORT")]
        port: u16,
    },

    /// Validate an orchestration definition (YAML or JSON)
    Validate {
        /// Definition file; `-` reads stdin
        file: PathBuf,
    },

    /// Inspect the server configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Compute the signature a webhook receiver should expect
    Sign {
        /// Shared subscription secret
        #[arg(long, env = "STEPWISE_WEBHOOK_SECRET")]
        secret: String,
        /// Unix timestamp sent in the x-webhook-timestamp header
        #[arg(long)]
        timestamp: Option<i64>,
        /// Raw request body
        body: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Serve { port } => cmd::serve::run(config_path, port),
        Commands::Validate { file } => cmd::validate::run(&file, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config_path, subcommand, cli.json),
        Commands::Sign {
            secret,
            timestamp,
            body,
        } => cmd::sign::run(&secret, timestamp, &body, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
