use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quotebook::config::{default_config_path, ResolvedConfig};
use quotebook::market_data::{AssetKind, AssetRef, MarketDataServiceBuilder, PerformanceOptions};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "quotebook")]
#[command(about = "Rate-governed crypto and equity quotes in one reporting currency")]
struct Cli {
    /// Path to config file (defaults to ./quotebook.toml, then the data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Current price of one asset
    Price {
        id: String,
        #[arg(long, default_value = "crypto")]
        kind: AssetKind,
    },
    /// Daily price history ending today
    History {
        id: String,
        #[arg(long, default_value = "crypto")]
        kind: AssetKind,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Change over 1d, 7d, 30d and 1y
    Performance {
        id: String,
        #[arg(long, default_value = "crypto")]
        kind: AssetKind,
        /// Recompute even if cached figures exist
        #[arg(long)]
        no_cache: bool,
    },
    /// Quotes for several assets, given as kind:id[=alias]
    Quotes {
        #[arg(required = true)]
        assets: Vec<AssetRef>,
    },
    /// Rates per one unit of the reporting currency
    Fx {
        #[arg(required = true)]
        currencies: Vec<String>,
    },
    /// Per-provider rate governance snapshot
    Status,
    /// Drop cached prices, histories and performance for one asset
    Invalidate {
        id: String,
        #[arg(long, default_value = "crypto")]
        kind: AssetKind,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .json(),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = ResolvedConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load quotebook config: {}", config_path.display()))?;

    let service = MarketDataServiceBuilder::new(&config).build().await?;

    match cli.command {
        Command::Price { id, kind } => {
            let quote = service.fetch_price(&AssetRef::new(id, kind)).await?;
            print_json(&quote)?;
        }
        Command::History { id, kind, days } => {
            let series = service.fetch_history(&AssetRef::new(id, kind), days).await?;
            print_json(&series)?;
        }
        Command::Performance { id, kind, no_cache } => {
            let asset = AssetRef::new(id, kind);
            let metrics = service
                .fetch_performance_metrics(&asset, PerformanceOptions { no_cache })
                .await?;
            print_json(&metrics)?;
        }
        Command::Quotes { assets } => {
            let result = service.get_current_quotes(&assets).await?;
            print_json(&result)?;
        }
        Command::Fx { currencies } => {
            let rates: std::collections::BTreeMap<_, _> =
                service.get_fx_rates(&currencies).await.into_iter().collect();
            print_json(&rates)?;
        }
        Command::Status => {
            print_json(&service.provider_status().await)?;
        }
        Command::Invalidate { id, kind } => {
            let removed = service.invalidate(&AssetRef::new(id, kind)).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}
