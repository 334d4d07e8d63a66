use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadline-cli")]
#[command(about = "Hotel lead call desk command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh cycle (dedup, normalize, aggregate) and print its report.
    Refresh,
    /// Run one refresh cycle and print the dashboard statistics as JSON.
    Stats,
    /// Serve the dashboard API with a live refresh loop.
    Serve,
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LEADLINE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let bundle = leadline_sync::run_refresh_once_from_env().await?;
            let report = &bundle.report;
            println!(
                "refresh complete: cycle_id={} rows={} deleted={} normalized={} failures={}",
                report.cycle_id,
                report.snapshot_rows,
                report.duplicates_deleted,
                report.normalizer_writes,
                report.fetch_failures + report.delete_failures + report.normalizer_failures
            );
        }
        Commands::Stats => {
            let bundle = leadline_sync::run_refresh_once_from_env().await?;
            let json = serde_json::to_string_pretty(&bundle.stats).context("encoding stats")?;
            println!("{json}");
        }
        Commands::Serve => leadline_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = leadline_sync::RefreshConfig::from_env();
            let ledger = leadline_sync::connect_ledger(&config).await?;
            ledger.migrate().await.context("running migrations")?;
            println!("migrations applied to {}", leadline_ledger::TABLE_NAME);
        }
    }

    Ok(())
}
