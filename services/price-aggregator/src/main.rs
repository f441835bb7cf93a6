//! Price aggregator replay tool
//!
//! Usage:
//!   price-aggregator BTCUSD ETHUSD < frames.jsonl
//!
//! Each stdin line is a frame `{"destination": "/topic/candle.BTCUSD.1m", "body": {...}}`.
//! Every table snapshot is written to stdout as one JSON line.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use price_aggregator::{
    AggregatorConfig, BootstrapConfig, DailyFetcher, Frame, HttpDailyFetcher, NoBootstrap,
    PriceAggregator, PriceTable, SharedFeed,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "price-aggregator")]
#[command(about = "Aggregate candle frames from stdin into live price snapshots")]
struct Cli {
    /// Symbols to subscribe (e.g. BTCUSD VCB)
    #[arg(required = true)]
    symbols: Vec<String>,

    /// Market service base URL for the daily bootstrap
    #[arg(long, env = "PRICE_BOOTSTRAP_URL")]
    bootstrap_url: Option<String>,

    /// Skip the daily bootstrap entirely
    #[arg(long)]
    no_bootstrap: bool,

    /// Print metrics to stderr on exit
    #[arg(long)]
    metrics: bool,
}

fn print_snapshot(table: &PriceTable) {
    match serde_json::to_string(table) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize snapshot"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries snapshots
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("price_aggregator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let fetcher: Arc<dyn DailyFetcher> = if cli.no_bootstrap {
        Arc::new(NoBootstrap)
    } else {
        let mut config = BootstrapConfig::from_env();
        if let Some(url) = cli.bootstrap_url {
            config.base_url = url;
        }
        Arc::new(HttpDailyFetcher::new(config)?)
    };

    let feed = SharedFeed::new();
    let aggregator = PriceAggregator::with_config(
        Arc::new(feed.clone()),
        fetcher,
        AggregatorConfig {
            bootstrap_enabled: !cli.no_bootstrap,
        },
    );

    let listener = aggregator.add_listener(print_snapshot);
    let subscribed = aggregator.subscribe_all(&cli.symbols).await;
    tracing::info!(subscribed, "Symbols subscribed, reading frames from stdin");

    let (tx, rx) = mpsc::channel(1024);
    let pump = tokio::spawn({
        let feed = feed.clone();
        async move { feed.pump(rx).await }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping unparseable line"),
        }
    }

    drop(tx);
    pump.await?;

    listener.remove();
    if cli.metrics {
        for (name, value) in aggregator.metrics().export() {
            eprintln!("{} {}", name, value);
        }
    }
    aggregator.shutdown();

    Ok(())
}
