use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use onair::config;
use onair::runtime::Runtime;
use onair::state::StateStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "onair")]
#[command(about = "Announces Kick and VK Video Live sessions to a Telegram group")]
#[command(version)]
struct Args {
    /// Path to config file
    #[arg(long, short)]
    config: Option<std::path::PathBuf>,

    /// Run a single poll tick and exit
    #[arg(long)]
    once: bool,

    /// Print the persisted state (with defaults applied) and exit
    #[arg(long)]
    print_state: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("onair=info".parse()?),
        )
        .init();

    let mut config = config::load(args.config.as_deref())?;

    if args.print_state {
        let state = StateStore::from_config(&config)?.load();
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    config.validate()?;
    let runtime = Arc::new(Runtime::from_config(config)?);

    if args.once {
        let report = runtime.poll_once(Utc::now()).await;
        println!(
            "forwarded: {:?}, suppressed: {:?}, failed: {:?}",
            report.forwarded, report.suppressed, report.failed
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    runtime.run(shutdown).await
}
