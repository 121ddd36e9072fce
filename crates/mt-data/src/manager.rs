//! Market-data access for the bar pipeline.
//!
//! The engine consumes market data through the [`MarketData`] trait: the
//! processor sets the bar time, asks for an update per (product, frequency),
//! and components read the snapshotted current bars and prices.

use chrono::{DateTime, Utc};
use mt_types::{Bar, Frequency, Instrument, MarketDataError, ProductType};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Read interface the pipeline components use for bars and prices.
///
/// `update` snapshots the bar at the current bartime for every tracked
/// instrument of the given product/frequency; `current_bar` then serves that
/// snapshot until the next update.  `current_price` is the last traded price
/// at or before the bartime, `prior_close` the close of the previous session.
pub trait MarketData {
    fn bartime(&self) -> Option<DateTime<Utc>>;
    fn set_bartime(&mut self, timestamp: DateTime<Utc>);
    fn track(&mut self, instrument: Instrument, frequency: Frequency);
    fn tracked(&self) -> Vec<(Instrument, Frequency)>;
    fn update(
        &mut self,
        product_type: ProductType,
        frequency: Frequency,
    ) -> Result<(), MarketDataError>;
    fn current_bar(&self, instrument: &Instrument) -> Option<&Bar>;
    fn current_price(&self, instrument: &Instrument) -> Option<Decimal>;
    fn prior_close(&self, instrument: &Instrument) -> Option<Decimal>;
}

/// In-memory [`MarketData`] implementation over preloaded bar series.
#[derive(Debug, Default)]
pub struct HistoricalDataManager {
    series: HashMap<(Instrument, Frequency), BTreeMap<DateTime<Utc>, Bar>>,
    tracked: Vec<(Instrument, Frequency)>,
    bartime: Option<DateTime<Utc>>,
    current: HashMap<Instrument, Bar>,
}

impl HistoricalDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a bar series and track its instrument.
    pub fn add_series(&mut self, instrument: Instrument, frequency: Frequency, bars: Vec<Bar>) {
        let timeline = self
            .series
            .entry((instrument.clone(), frequency))
            .or_default();
        for bar in bars {
            timeline.insert(bar.timestamp, bar);
        }
        self.track(instrument, frequency);
    }

    fn tracked_frequency(&self, instrument: &Instrument) -> Option<Frequency> {
        self.tracked
            .iter()
            .find(|(i, _)| i == instrument)
            .map(|(_, f)| *f)
    }
}

impl MarketData for HistoricalDataManager {
    fn bartime(&self) -> Option<DateTime<Utc>> {
        self.bartime
    }

    fn set_bartime(&mut self, timestamp: DateTime<Utc>) {
        self.bartime = Some(timestamp);
    }

    fn track(&mut self, instrument: Instrument, frequency: Frequency) {
        let key = (instrument, frequency);
        if !self.tracked.contains(&key) {
            self.tracked.push(key);
        }
    }

    fn tracked(&self) -> Vec<(Instrument, Frequency)> {
        self.tracked.clone()
    }

    fn update(
        &mut self,
        product_type: ProductType,
        frequency: Frequency,
    ) -> Result<(), MarketDataError> {
        let Some(bartime) = self.bartime else {
            return Ok(());
        };

        for (instrument, freq) in self.tracked.clone() {
            if instrument.product_type != product_type || freq != frequency {
                continue;
            }
            let bar = self
                .series
                .get(&(instrument.clone(), freq))
                .and_then(|timeline| timeline.get(&bartime));
            match bar {
                Some(bar) => {
                    self.current.insert(instrument, bar.clone());
                }
                None => {
                    // No bar this step; the instrument is skipped this bar.
                    debug!(instrument = %instrument, bartime = %bartime, "no bar at bartime");
                    self.current.remove(&instrument);
                }
            }
        }
        Ok(())
    }

    fn current_bar(&self, instrument: &Instrument) -> Option<&Bar> {
        self.current.get(instrument)
    }

    fn current_price(&self, instrument: &Instrument) -> Option<Decimal> {
        let bartime = self.bartime?;
        let frequency = self.tracked_frequency(instrument)?;
        let timeline = self.series.get(&(instrument.clone(), frequency))?;
        timeline
            .range(..=bartime)
            .next_back()
            .map(|(_, bar)| bar.close)
    }

    fn prior_close(&self, instrument: &Instrument) -> Option<Decimal> {
        let bartime = self.bartime?;
        let frequency = self.tracked_frequency(instrument)?;
        let timeline = self.series.get(&(instrument.clone(), frequency))?;
        timeline
            .iter()
            .rev()
            .find(|(ts, _)| ts.date_naive() < bartime.date_naive())
            .map(|(_, bar)| bar.close)
    }
}
