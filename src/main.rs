// ABOUTME: Main entry point for the Slack/Discord bridge
// ABOUTME: Parses the CLI, loads config, initializes logging and runs the bridge until Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slackord::{config::Config, paths, Bridge};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "slackord")]
#[command(version, about = "Relay messages, threads and greetings between Slack and Discord")]
struct Cli {
    /// Path to config.toml (defaults to SLACKORD_CONFIG_PATH, ./config.toml, then the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge (default)
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print the effective channel mappings
    Mappings,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nPANIC! slackord crashed:\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    let config = Config::load_from(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            let mappings = config.channel_mappings()?;
            println!("Configuration OK");
            println!("  data dir:        {}", config.storage.data_dir().display());
            println!("  webhook:         {}:{}", config.webhook.host, config.webhook.port);
            println!("  channel pairs:   {}", mappings.len());
            println!(
                "  greeting channel: {}",
                config.bridge.greeting_channel().unwrap_or("(none)")
            );
            Ok(())
        }
        Command::Mappings => {
            let mappings = config.channel_mappings()?;
            for m in &mappings {
                println!("{}\t{}", m.slack_channel_id, m.discord_channel_id);
            }
            if let Some(fallback) = &config.bridge.slack_fallback_channel {
                println!("*\t-> slack {}", fallback);
            }
            if let Some(fallback) = &config.bridge.discord_fallback_channel {
                println!("*\t-> discord {}", fallback);
            }
            Ok(())
        }
        Command::Run => {
            let _guard = init_logging(&config)?;
            tracing::info!(
                webhook = %format!("{}:{}", config.webhook.host, config.webhook.port),
                data_dir = %config.storage.data_dir().display(),
                "Starting slackord"
            );

            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl-C received, shutting down");
                }
                shutdown.cancel();
            });

            let bridge = Bridge::connect(config, cancel).await?;
            bridge.run().await
        }
    }
}

/// Console output plus an optional daily-rolling file under the data dir.
/// The returned guard flushes the file writer on drop.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };

    let console = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter()).boxed()
    };

    let (file, guard) = if config.logging.file {
        let log_dir = paths::log_dir(&config.storage.data_dir());
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&log_dir, "slackord.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(filter())
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Ok(guard)
}
