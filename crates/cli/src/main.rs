//! LocAIted CLI - event discovery from the terminal
//!
//! Loads configuration, wires the discovery engine to the OpenAI and Tavily
//! providers and runs one discovery request.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// LocAIted - find upcoming events worth covering
#[derive(Parser)]
#[command(name = "locaited")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Discover specific upcoming events for a location and set of interests")]
#[command(long_about = r#"
LocAIted builds a search profile, proposes event leads, verifies them, gathers
web evidence and curates a ranked list of concrete upcoming events.

Examples:
  locaited discover --location Brooklyn --days 14 --interest climate --interest housing
  locaited discover -l "San Francisco" -i tech --step
  locaited config show
  locaited cache stats
"#)]
struct Cli {
    /// Configuration file (defaults to ./locaited.toml when present)
    #[arg(short, long, global = true, env = "LOCAITED_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one discovery request
    Discover(DiscoverArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Result cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count and hit statistics
    Stats,
    /// Delete every cached result
    Clear,
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// City or neighborhood to search
    #[arg(short, long)]
    pub location: String,

    /// Days ahead to search, starting today
    #[arg(short, long, default_value = "14")]
    pub days: u32,

    /// Interest keyword; repeat for several
    #[arg(short, long = "interest", required = true)]
    pub interests: Vec<String>,

    /// Free-text request passed to the planner
    #[arg(short, long)]
    pub query: Option<String>,

    /// Bypass the result cache for this run
    #[arg(long)]
    pub no_cache: bool,

    /// Skip lead verification
    #[arg(long)]
    pub no_verify: bool,

    /// Pause after every stage (Enter continues, q stops)
    #[arg(long)]
    pub step: bool,

    /// Print the response as JSON
    #[arg(long)]
    pub json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up API keys from `.env` during local development
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("locaited={},warn", log_level).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Discover(args) => commands::discover(config, args).await?,
        Commands::Config {
            action: ConfigAction::Show,
        } => commands::show_config(&config, cli.config.as_deref())?,
        Commands::Cache { action } => match action {
            CacheAction::Stats => commands::cache_stats(&config).await?,
            CacheAction::Clear => commands::cache_clear(&config).await?,
        },
    }

    Ok(())
}
