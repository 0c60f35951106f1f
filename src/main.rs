//! Market Pulse
//!
//! Scheduled crypto market snapshots with cached analytics.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use market_pulse::{
    analysis::MarketAnalytics,
    client::CoinGeckoClient,
    config::Config,
    error::AppError,
    pipeline::{Orchestrator, PipelineRunResult, PipelineSettings},
    storage::{open_store, MarketStore},
    types::{timestamp_key, MarketRecord, MetricField},
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "market-pulse")]
#[command(about = "Scheduled crypto market snapshots with cached analytics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to config.toml, config.yaml, then ~/.config/market-pulse/)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Run the pipeline once and exit
    Once,
    /// Show the latest snapshot
    Latest {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Newest record of these assets instead of the whole snapshot
        #[arg(short, long)]
        asset: Vec<String>,
    },
    /// Rank the latest snapshot by a metric
    Top {
        /// price, market_cap, volume_24h, change_pct_24h or volatility_score
        #[arg(default_value = "market_cap")]
        field: MetricField,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show one asset's recent records
    History {
        /// Provider asset id, e.g. bitcoin
        asset: String,
        #[arg(long, default_value = "24")]
        hours: i64,
    },
    /// Flag unusual movers in the latest snapshot
    Anomalies {
        /// z-score threshold (defaults to the configured one)
        #[arg(short, long)]
        threshold: Option<Decimal>,
    },
    /// Headline figures for the latest snapshot
    Kpi,
    /// List archived raw snapshots
    Snapshots {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Re-load an archived snapshot by its fetch time (RFC 3339)
    Replay { fetched_at: DateTime<Utc> },
}

struct App {
    store: Arc<dyn MarketStore>,
    orchestrator: Arc<Orchestrator>,
    analytics: Arc<MarketAnalytics>,
}

impl App {
    async fn build(config: &Config) -> market_pulse::error::Result<Self> {
        let store = open_store(&config.storage).await?;
        let client = CoinGeckoClient::new(&config.provider).map_err(|e| AppError::Config(e.to_string()))?;
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(client),
            store.clone(),
            PipelineSettings::from_config(config),
        ));
        let analytics = Arc::new(MarketAnalytics::new(orchestrator.clone(), &config.analytics));

        Ok(Self {
            store,
            orchestrator,
            analytics,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("market_pulse=info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let app = App::build(&config).await?;
    tracing::info!("Store backend: {}", app.store.backend());

    match cli.command {
        Commands::Run => run_service(app, &config).await,
        Commands::Once => {
            let result = app.analytics.trigger_run().await?;
            print_run(&result);
            Ok(())
        }
        Commands::Latest { limit, asset } => {
            let records = if asset.is_empty() {
                app.analytics.latest_snapshot().await?
            } else {
                app.store.read_latest(&asset).await?
            };
            print_records(&records[..records.len().min(limit)]);
            Ok(())
        }
        Commands::Top { field, limit } => {
            let records = app.analytics.top_by(field, limit).await?;
            println!("\nTop {} by {}:\n", limit, field);
            print_records(&records);
            Ok(())
        }
        Commands::History { asset, hours } => {
            let since = Utc::now() - chrono::Duration::hours(hours);
            let records = app.analytics.history(&asset, since).await?;
            println!("\n{} records for {} in the last {}h:\n", records.len(), asset, hours);
            for r in &records {
                println!(
                    "{}  ${:>14}  {:>8}%  vol {:>8}",
                    timestamp_key(&r.extracted_at),
                    r.price,
                    r.change_pct_24h.round_dp(2),
                    r.volatility_score
                );
            }
            Ok(())
        }
        Commands::Anomalies { threshold } => show_anomalies(&app, threshold).await,
        Commands::Kpi => {
            let kpi = app.analytics.kpi_summary().await?;
            println!("{}", serde_json::to_string_pretty(&kpi)?);
            Ok(())
        }
        Commands::Snapshots { limit } => {
            let snapshots = app.store.recent_snapshots(limit).await?;
            println!("\n{:<30} {:<20} {:>6}", "Fetched at", "Source", "Items");
            println!("{}", "-".repeat(58));
            for s in snapshots {
                println!("{:<30} {:<20} {:>6}", timestamp_key(&s.fetched_at), s.source, s.item_count);
            }
            Ok(())
        }
        Commands::Replay { fetched_at } => {
            let result = app.orchestrator.replay_snapshot(fetched_at).await?;
            print_run(&result);
            Ok(())
        }
    }
}

async fn run_service(app: App, config: &Config) -> anyhow::Result<()> {
    tracing::info!("Starting market pulse scheduler");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(app.orchestrator.clone().run_forever(shutdown_rx));
    let cleanup = app
        .analytics
        .clone()
        .start_cleanup_task(config.analytics.cache_ttl().max(Duration::from_secs(1)));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down...");

    shutdown_tx.send(true)?;
    scheduler.await?;
    cleanup.abort();

    if let Some(last) = app.orchestrator.last_result() {
        tracing::info!(
            "Last run {} finished {} with status {}",
            last.run_id,
            timestamp_key(&last.finished_at),
            last.status
        );
    }
    Ok(())
}

async fn show_anomalies(app: &App, threshold: Option<Decimal>) -> anyhow::Result<()> {
    let flags = app.analytics.anomalies(threshold).await?;
    if flags.is_empty() {
        println!("No anomalies in the latest snapshot");
        return Ok(());
    }

    println!("\n{:<24} {:<8} {:>14} {:>9} {:>6}", "Asset", "Symbol", "Value", "z", "Dir");
    println!("{}", "-".repeat(65));
    for f in &flags {
        println!(
            "{:<24} {:<8} {:>14} {:>9} {:>6}",
            f.asset_id,
            f.symbol,
            f.value.round_dp(4),
            f.z_score,
            format!("{:?}", f.direction)
        );
    }
    Ok(())
}

fn print_records(records: &[MarketRecord]) {
    println!(
        "{:>4}  {:<8} {:<22} {:>14} {:>18} {:>9} {:>9}",
        "#", "Symbol", "Name", "Price", "Market cap", "24h %", "Vol"
    );
    println!("{}", "-".repeat(92));
    for r in records {
        let rank = r.market_cap_rank.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
        let name = if r.name.len() > 22 {
            format!("{}...", r.name.chars().take(19).collect::<String>())
        } else {
            r.name.clone()
        };
        println!(
            "{:>4}  {:<8} {:<22} {:>14} {:>18} {:>9} {:>9}",
            rank,
            r.symbol,
            name,
            r.price,
            r.market_cap.round_dp(0),
            r.change_pct_24h.round_dp(2),
            r.volatility_score.round_dp(2)
        );
    }
}

fn print_run(result: &PipelineRunResult) {
    println!("Run {} ({:?}): {}", result.run_id, result.trigger, result.status);
    println!(
        "  fetched {}, dropped {}, written {}, attempts {}, {}ms",
        result.candidates_fetched,
        result.candidates_dropped,
        result.records_written,
        result.attempts,
        result.duration().num_milliseconds()
    );
    if let Some(err) = &result.error {
        println!("  error: {}", err);
    }
}
