use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "deep-bridge")]
#[command(about = "Deep Bridge CLI - send content to the bridge server for analysis")]
#[command(version)]
struct Cli {
    /// Bridge server URL
    #[arg(long, env = "BRIDGE_URL", default_value = bridge::client::DEFAULT_BRIDGE_URL, global = true)]
    bridge_url: String,

    /// Bearer key for the bridge server
    #[arg(long, env = "BRIDGE_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Reader frontend URL
    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:5173", global = true)]
    frontend_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze a file and print the reader URL
    Send {
        /// File to analyze
        file: PathBuf,
    },

    /// Read from stdin and analyze
    Push,

    /// Analyze a file and cache the result only
    Cache {
        /// File to analyze
        file: PathBuf,
    },

    /// Show a task's current state
    Status {
        /// Task id returned by send/push/cache
        task_id: String,
    },

    /// Check that the bridge server is up
    Health,

    /// Pre-generate word audio for a file into the local cache
    WarmAudio {
        /// File whose words should be warmed
        file: PathBuf,

        /// Local cache database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Speech synthesis endpoint
        #[arg(long, env = "TTS_API_URL")]
        tts_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context {
        bridge_url: cli.bridge_url,
        api_key: cli.api_key,
        frontend_url: cli.frontend_url,
    };

    match cli.command {
        Commands::Send { file } => commands::analyze::run_file(&ctx, &file, false).await?,
        Commands::Cache { file } => commands::analyze::run_file(&ctx, &file, true).await?,
        Commands::Push => commands::analyze::run_stdin(&ctx).await?,
        Commands::Status { task_id } => commands::status::run_status(&ctx, &task_id).await?,
        Commands::Health => commands::status::run_health(&ctx).await?,
        Commands::WarmAudio { file, db, tts_url } => {
            commands::warm_audio::run_warm_audio(&file, db, tts_url).await?
        }
    }

    Ok(())
}
