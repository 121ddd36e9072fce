//! CSV bar loading.

use chrono::{DateTime, Utc};
use mt_types::{Bar, Frequency, Instrument, MarketDataError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
struct CsvBar {
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// Load one instrument's bars from a CSV file with header
/// `timestamp,open,high,low,close,volume`.
pub fn load_bars_csv(
    path: &Path,
    instrument: &Instrument,
    frequency: Frequency,
) -> Result<Vec<Bar>, MarketDataError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| MarketDataError::Parse {
        message: format!("{}: {}", path.display(), e),
    })?;

    let mut bars = Vec::new();
    for record in reader.deserialize::<CsvBar>() {
        let row = record.map_err(|e| MarketDataError::Parse {
            message: format!("{}: {}", path.display(), e),
        })?;
        bars.push(Bar::new(
            instrument.clone(),
            row.timestamp,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
            frequency,
        ));
    }
    bars.sort_by_key(|b| b.timestamp);

    info!(instrument = %instrument, bars = bars.len(), "loaded csv bars");
    Ok(bars)
}

/// Load every `<product>_<symbol>.csv` file in a directory.
pub fn load_bars_dir(
    dir: &Path,
    frequency: Frequency,
) -> Result<Vec<(Instrument, Vec<Bar>)>, MarketDataError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    paths.sort();

    let mut loaded = Vec::new();
    for path in paths {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MarketDataError::Parse {
                message: format!("unreadable file name: {}", path.display()),
            })?;
        let (product, symbol) = stem.split_once('_').ok_or_else(|| MarketDataError::Parse {
            message: format!("expected <product>_<symbol>.csv, got: {}", stem),
        })?;
        let instrument = Instrument::new(product.parse()?, symbol);
        let bars = load_bars_csv(&path, &instrument, frequency)?;
        loaded.push((instrument, bars));
    }
    Ok(loaded)
}
