use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mt_data::{load_bars_dir, random_walk_bars, HistoricalDataManager};
use mt_engine::demo::{build_from_table, builtin_registry, StrategyTableRow};
use mt_engine::{
    EventProcessor, JsonFileStore, MemoryStore, Persistence, Portfolio, PortfolioConfig,
    ProcessorConfig, Runner, RunnerConfig, SymbolSubscription,
};
use mt_types::{Frequency, Instrument};
use rust_decimal::Decimal;

#[derive(Parser)]
#[command(name = "metronome", about = "Bar-driven algorithmic trading simulation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation across a bar schedule
    Run {
        /// Start of the schedule (ISO date or datetime)
        #[arg(long)]
        start: String,
        /// End of the schedule (ISO date or datetime)
        #[arg(long)]
        end: String,
        /// Bar frequency (1min, 5min, 15min, 1h, 1D)
        #[arg(long, default_value = "1D")]
        freq: String,
        /// Data source: "sample" or a directory of <product>_<symbol>.csv files
        #[arg(long, default_value = "sample")]
        source: String,
        /// Instruments, as <product>:<symbol>; repeatable
        #[arg(long = "symbol", default_value = "stock:DEMO")]
        symbols: Vec<String>,
        /// Strategy builder name (limit_poster, target_tracker)
        #[arg(long, default_value = "target_tracker")]
        strategy: String,
        /// Directory for end-of-day snapshots (in-memory when omitted)
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
        /// Abort the bar at the first component error
        #[arg(long)]
        strict: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!(error = %e, "metronome failed");
        std::process::exit(1);
    }
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid timestamp: {}", value))?;
    date.and_hms_opt(15, 0, 0)
        .map(|dt| dt.and_utc())
        .with_context(|| format!("invalid timestamp: {}", value))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let Commands::Run {
        start,
        end,
        freq,
        source,
        symbols,
        strategy,
        snapshot_dir,
        strict,
    } = cli.command;

    let start = parse_timestamp(&start)?;
    let end = parse_timestamp(&end)?;
    if end < start {
        bail!("end {} is before start {}", end, start);
    }
    let frequency: Frequency = freq.parse().map_err(|e| anyhow::anyhow!("{}", e))?;

    let instruments: Vec<Instrument> = symbols
        .iter()
        .map(|s| s.parse().map_err(|e| anyhow::anyhow!("{}", e)))
        .collect::<anyhow::Result<_>>()?;

    let mut market = HistoricalDataManager::new();
    if source == "sample" {
        for (index, instrument) in instruments.iter().enumerate() {
            let bars = random_walk_bars(
                instrument,
                frequency,
                start,
                end,
                42 + index as u64,
                Decimal::from(100),
            );
            market.add_series(instrument.clone(), frequency, bars);
        }
    } else {
        let dir = PathBuf::from(&source);
        for (instrument, bars) in load_bars_dir(&dir, frequency)? {
            market.add_series(instrument, frequency, bars);
        }
    }

    let persistence: Box<dyn Persistence> = match &snapshot_dir {
        Some(dir) => Box::new(JsonFileStore::new(dir)?),
        None => Box::new(MemoryStore::new()),
    };

    let config = ProcessorConfig {
        strict,
        ..Default::default()
    };
    let mut processor = EventProcessor::new(market, persistence, config);
    processor.add_portfolio(Portfolio::new(PortfolioConfig::new("main")));

    let subscriptions: Vec<SymbolSubscription> = instruments
        .iter()
        .map(|instrument| SymbolSubscription {
            instrument: instrument.clone(),
            frequency,
        })
        .collect();
    let rows = vec![StrategyTableRow {
        strategy_id: format!("{}-1", strategy),
        portfolio_id: "main".to_string(),
        builder: strategy,
    }];
    for built in build_from_table(&rows, &subscriptions, &builtin_registry())? {
        processor.add_strategy(built)?;
    }

    let mut runner = Runner::new(
        processor,
        RunnerConfig {
            start,
            end,
            frequency,
            source,
        },
    );
    let summary = runner.run()?;

    println!(
        "processed {} bars, {} orders ({})",
        summary.bars,
        summary.orders_total,
        summary
            .orders_by_state
            .iter()
            .map(|(state, count)| format!("{}: {}", state, count))
            .collect::<Vec<_>>()
            .join(", ")
    );
    for row in &summary.positions {
        println!(
            "{} {} position {} net_pnl {}",
            row.strategy_id, row.instrument, row.current_position, row.net_pnl
        );
    }
    Ok(())
}
