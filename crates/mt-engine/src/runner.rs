//! Runner: advances the bar clock across the schedule and drives the event
//! processor.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::oms::OrderFilter;
use crate::positions::PositionRow;
use crate::processor::EventProcessor;
use mt_data::MarketData;
use mt_types::{EngineResult, Frequency, PipelineError};

/// Outer-loop configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub frequency: Frequency,
    /// Name of the data source, for logs and snapshots.
    pub source: String,
}

/// End-of-run accounting.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub bars: usize,
    pub orders_total: usize,
    pub orders_by_state: BTreeMap<String, usize>,
    pub positions: Vec<PositionRow>,
}

/// Every bar time between start and end (inclusive) at the given frequency.
pub fn bar_schedule(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    frequency: Frequency,
) -> Vec<DateTime<Utc>> {
    let step = Duration::seconds(frequency.to_seconds() as i64);
    let mut schedule = Vec::new();
    let mut current = start;
    while current <= end {
        schedule.push(current);
        current += step;
    }
    schedule
}

/// Drives the processor across the schedule, marking the last bar of each
/// calendar day so end-of-day hooks and persistence fire.
pub struct Runner<M: MarketData> {
    processor: EventProcessor<M>,
    config: RunnerConfig,
}

impl<M: MarketData> Runner<M> {
    pub fn new(processor: EventProcessor<M>, config: RunnerConfig) -> Self {
        Self { processor, config }
    }

    pub fn processor(&self) -> &EventProcessor<M> {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut EventProcessor<M> {
        &mut self.processor
    }

    pub fn run(&mut self) -> EngineResult<RunSummary> {
        let schedule = bar_schedule(self.config.start, self.config.end, self.config.frequency);
        if schedule.is_empty() {
            return Err(PipelineError::EmptySchedule {
                start: self.config.start,
                end: self.config.end,
            }
            .into());
        }

        info!(
            source = %self.config.source,
            start = %self.config.start,
            end = %self.config.end,
            freq = %self.config.frequency,
            bars = schedule.len(),
            "run starting"
        );
        self.processor.start(schedule[0])?;

        for (index, &ts) in schedule.iter().enumerate() {
            let end_of_day = match schedule.get(index + 1) {
                Some(next) => next.date_naive() != ts.date_naive(),
                None => true,
            };
            if let Err(e) = self.processor.process_bar(ts, end_of_day) {
                error!(bartime = %ts, error = %e, "run aborted");
                return Err(e);
            }
        }

        let last = schedule.last().copied().unwrap_or(self.config.end);
        self.processor.stop(last)?;

        let summary = self.summarize(schedule.len());
        info!(
            bars = summary.bars,
            orders = summary.orders_total,
            "run complete"
        );
        for row in &summary.positions {
            info!(
                strategy = %row.strategy_id,
                instrument = %row.instrument,
                position = row.current_position,
                net_pnl = %row.net_pnl,
                "final position"
            );
        }
        Ok(summary)
    }

    fn summarize(&self, bars: usize) -> RunSummary {
        let orders = self.processor.oms().orders_list(&OrderFilter::default());
        let mut orders_by_state: BTreeMap<String, usize> = BTreeMap::new();
        for order in &orders {
            *orders_by_state.entry(order.state.to_string()).or_default() += 1;
        }
        RunSummary {
            bars,
            orders_total: orders.len(),
            orders_by_state,
            positions: self.processor.positions().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::portfolio::{Portfolio, PortfolioConfig};
    use crate::processor::ProcessorConfig;
    use crate::strategy::{Strategy, StrategyConfig, StrategyContext};
    use chrono::TimeZone;
    use mt_data::{random_walk_bars, HistoricalDataManager};
    use mt_types::{Instrument, OrderType, Side, StrategyError};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_bar_schedule_inclusive() {
        let end = Utc.with_ymd_and_hms(2024, 1, 6, 15, 0, 0).unwrap();
        let schedule = bar_schedule(t0(), end, Frequency::Day);
        assert_eq!(schedule.len(), 5);
        assert_eq!(schedule[0], t0());
        assert_eq!(*schedule.last().unwrap(), end);
    }

    #[test]
    fn test_empty_schedule_is_an_error() {
        let mut runner = Runner::new(
            EventProcessor::new(
                HistoricalDataManager::new(),
                Box::new(MemoryStore::new()),
                ProcessorConfig::default(),
            ),
            RunnerConfig {
                start: t0(),
                end: t0() - Duration::days(1),
                frequency: Frequency::Day,
                source: "test".to_string(),
            },
        );
        assert!(matches!(
            runner.run(),
            Err(mt_types::EngineError::Pipeline(
                PipelineError::EmptySchedule { .. }
            ))
        ));
    }

    /// Buys once on the first bar and holds.
    struct BuyOnce {
        config: StrategyConfig,
        instrument: Instrument,
        bought: bool,
    }

    impl BuyOnce {
        fn new(instrument: Instrument) -> Self {
            let mut config = StrategyConfig::new("buy-once", "main");
            config.add_symbol(instrument.clone(), Frequency::Day);
            Self {
                config,
                instrument,
                bought: false,
            }
        }
    }

    impl Strategy for BuyOnce {
        fn config(&self) -> &StrategyConfig {
            &self.config
        }

        fn config_mut(&mut self) -> &mut StrategyConfig {
            &mut self.config
        }

        fn on_bar(
            &mut self,
            ctx: &mut StrategyContext<'_>,
            _ts: DateTime<Utc>,
        ) -> Result<(), StrategyError> {
            if self.bought {
                return Ok(());
            }
            if let Some(price) = ctx.current_price(&self.instrument) {
                ctx.order(
                    self.instrument.clone(),
                    Side::Buy,
                    10,
                    OrderType::Limit {
                        price: price + dec!(10),
                    },
                )
                .map_err(|e| StrategyError::Callback {
                    strategy_id: "buy-once".to_string(),
                    message: e.to_string(),
                })?;
                self.bought = true;
            }
            Ok(())
        }
    }

    #[test]
    fn test_end_to_end_run_fills_and_books() {
        let instrument = Instrument::stock("DEMO");
        let end = Utc.with_ymd_and_hms(2024, 1, 9, 15, 0, 0).unwrap();

        let mut market = HistoricalDataManager::new();
        market.add_series(
            instrument.clone(),
            Frequency::Day,
            random_walk_bars(&instrument, Frequency::Day, t0(), end, 42, dec!(100)),
        );

        let mut processor = EventProcessor::new(
            market,
            Box::new(MemoryStore::new()),
            ProcessorConfig::default(),
        );
        processor.add_portfolio(Portfolio::new(PortfolioConfig::new("main")));
        processor
            .add_strategy(Box::new(BuyOnce::new(instrument.clone())))
            .unwrap();

        let mut runner = Runner::new(
            processor,
            RunnerConfig {
                start: t0(),
                end,
                frequency: Frequency::Day,
                source: "sample".to_string(),
            },
        );
        let summary = runner.run().unwrap();

        assert_eq!(summary.bars, 8);
        assert_eq!(summary.orders_total, 1);
        // A marketable limit on liquid random-walk bars fills.
        assert_eq!(summary.orders_by_state.get("FILLED"), Some(&1));
        assert_eq!(
            runner
                .processor()
                .positions()
                .position_quantity("buy-once", &instrument),
            10
        );
        // End-of-day snapshots were persisted for each day.
        assert!(runner
            .processor()
            .persistence()
            .get_orders("metronome", end)
            .is_ok());
    }
}
