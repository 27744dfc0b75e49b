//! Qiraah Coach
//!
//! Arabic reading coach for Kitab Kuning students: text analysis, a grounded
//! dictionary, a study chat and live spoken reading practice with Gemini.

mod audio;
mod commands;
mod config;
mod export;
mod gemini;
mod live;
mod session;

use clap::{Parser, Subcommand};
use config::Config;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "qiraah-coach", version, about = "Arabic reading coach powered by Gemini")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Translate, parse (i'rab) or summarize Arabic text
    Analyze(commands::analyze::AnalyzeArgs),
    /// Explain a term with web-grounded sources
    Dictionary(commands::dictionary::DictionaryArgs),
    /// Chat with the study assistant
    Chat,
    /// Live reading practice with the voice coach
    Practice(commands::practice::PracticeArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for the interactive output
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,qiraah_coach=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Qiraah Coach starting...");

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration loaded successfully");
    if config.gemini_api_key.is_none() {
        info!("GEMINI_API_KEY is not set; Gemini features will report a configuration error");
    }

    let result = match cli.command {
        Command::Analyze(args) => commands::analyze::run(&config, args).await,
        Command::Dictionary(args) => commands::dictionary::run(&config, args).await,
        Command::Chat => commands::chat::run(&config).await,
        Command::Practice(args) => commands::practice::run(&config, args).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
