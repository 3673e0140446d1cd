use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use market_recorder::{
    client::weights::{batch_size, request_cost},
    monitoring,
    recorder::Recorder,
    types::{AppConfig, StorageBackend, DEFAULT_CONFIG_PATH},
};

const DASHBOARD_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "market-recorder")]
#[command(about = "Records Betfair exchange catalogue and price snapshots to durable storage", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the storage backend
    #[arg(long)]
    storage: Option<StorageBackend>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the recording loop and run until Ctrl-C
    Run {},
    /// Run a single poll cycle and exit
    PollOnce {},
    /// Check the configured storage backend is reachable and writable
    TestStorage {},
    /// Print the effective configuration with secrets masked
    ShowConfig {},
    /// Show the request cost and markets-per-call for a set of price fields
    BatchSize {
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "market_recorder=debug,recorder=debug,info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    tracing::debug!(target: "recorder", config = %cli.config, "loading config");

    let mut settings = AppConfig::load(&cli.config)?;
    if let Some(backend) = cli.storage {
        settings.storage.backend = backend;
    }
    tracing::info!(
        target: "config",
        config = %cli.config,
        backend = ?settings.storage.backend,
        countries = ?settings.recorder.countries,
        "config loaded"
    );

    match cli.command.unwrap_or(Commands::Run {}) {
        Commands::Run {} => {
            let recorder = Recorder::from_config(settings).await?;
            let storage = recorder.dashboard_state().storage.backend;
            monitoring::logger::log_startup(&recorder.config(), &storage);

            let outcome = recorder.start().await;
            if !outcome.success {
                anyhow::bail!("recorder failed to start: {}", outcome.message);
            }
            let dashboard = monitoring::dashboard::spawn_dashboard_task(recorder.clone(), DASHBOARD_PERIOD);

            tokio::signal::ctrl_c().await?;
            tracing::info!(target: "recorder", "shutdown requested");
            dashboard.abort();
            recorder.stop().await;
        }
        Commands::PollOnce {} => {
            let recorder = Recorder::from_config(settings).await?;
            let outcome = recorder.poll_once().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            println!("{}", serde_json::to_string_pretty(&recorder.dashboard_state())?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::TestStorage {} => {
            let recorder = Recorder::from_config(settings).await?;
            let outcome = recorder.test_storage().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::ShowConfig {} => {
            let recorder = Recorder::from_config(settings).await?;
            println!("{}", serde_json::to_string_pretty(&recorder.redacted_config())?);
        }
        Commands::BatchSize { fields } => {
            println!(
                "cost={} markets_per_call={}",
                request_cost(&fields),
                batch_size(&fields)
            );
        }
    }

    Ok(())
}
