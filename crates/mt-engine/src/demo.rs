//! Built-in demo strategies and the name -> constructor registry the runner
//! uses to instantiate strategies from an enumeration table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::strategy::{Strategy, StrategyConfig, StrategyContext, SymbolSubscription};
use mt_types::{EngineError, Instrument, OrderType, Side, StrategyError};

/// One row of the strategy enumeration table.
#[derive(Debug, Clone)]
pub struct StrategyTableRow {
    pub strategy_id: String,
    pub portfolio_id: String,
    pub builder: String,
}

pub type StrategyBuilder = fn(StrategyConfig) -> Box<dyn Strategy>;

/// The strategies shipped with the binary.
pub fn builtin_registry() -> HashMap<String, StrategyBuilder> {
    let mut registry: HashMap<String, StrategyBuilder> = HashMap::new();
    registry.insert("limit_poster".to_string(), |config| {
        Box::new(LimitPoster::new(config))
    });
    registry.insert("target_tracker".to_string(), |config| {
        Box::new(TargetTracker::new(config))
    });
    registry
}

/// Instantiate strategies from table rows, attaching the shared symbol list.
pub fn build_from_table(
    rows: &[StrategyTableRow],
    symbols: &[SymbolSubscription],
    registry: &HashMap<String, StrategyBuilder>,
) -> Result<Vec<Box<dyn Strategy>>, EngineError> {
    let mut strategies = Vec::new();
    for row in rows {
        let builder = registry
            .get(&row.builder)
            .ok_or_else(|| EngineError::Config(format!("unknown strategy builder: {}", row.builder)))?;
        let mut config = StrategyConfig::new(&row.strategy_id, &row.portfolio_id);
        config.add_symbols(symbols.to_vec());
        strategies.push(builder(config));
    }
    Ok(strategies)
}

/// Posts one passive limit buy per instrument per day, slightly below the
/// last close.
///
/// Parameters: `quantity` (default 100), `offset` (default 0.05).
pub struct LimitPoster {
    config: StrategyConfig,
    quantity: u64,
    offset: Decimal,
    posted_today: HashSet<Instrument>,
}

impl LimitPoster {
    pub fn new(config: StrategyConfig) -> Self {
        let quantity = config.get_parameter::<u64>("quantity").unwrap_or(100);
        let offset = config
            .get_parameter::<f64>("offset")
            .and_then(Decimal::from_f64_retain)
            .unwrap_or_else(|| Decimal::new(5, 2));
        Self {
            config,
            quantity,
            offset,
            posted_today: HashSet::new(),
        }
    }

    fn callback_error(&self, message: String) -> StrategyError {
        StrategyError::Callback {
            strategy_id: self.config.strategy_id.clone(),
            message,
        }
    }
}

impl Strategy for LimitPoster {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut StrategyConfig {
        &mut self.config
    }

    fn on_begin_of_day(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        self.posted_today.clear();
        Ok(())
    }

    fn on_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        for subscription in self.config.symbols.clone() {
            let instrument = subscription.instrument;
            if self.posted_today.contains(&instrument) {
                continue;
            }
            let Some(close) = ctx.current_price(&instrument) else {
                continue;
            };
            let uuid = ctx
                .order(
                    instrument.clone(),
                    Side::Buy,
                    self.quantity,
                    OrderType::Limit {
                        price: close - self.offset,
                    },
                )
                .map_err(|e| self.callback_error(e.to_string()))?;
            debug!(order = %uuid, instrument = %instrument, "limit posted");
            self.posted_today.insert(instrument);
        }
        Ok(())
    }
}

/// Declares an absolute position target per instrument and lets the
/// portfolio work the delta.  Re-states the intent only when flat of open
/// orders, so an unfilled delta order is not duplicated every bar.
///
/// Parameters: `target` (default 100).
pub struct TargetTracker {
    config: StrategyConfig,
    target: i64,
}

impl TargetTracker {
    pub fn new(config: StrategyConfig) -> Self {
        let target = config.get_parameter::<i64>("target").unwrap_or(100);
        Self { config, target }
    }
}

impl Strategy for TargetTracker {
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
        for subscription in self.config.symbols.clone() {
            let instrument = subscription.instrument;
            if ctx.position(&instrument) == self.target {
                continue;
            }
            if !ctx.open_orders(Some(&instrument)).is_empty() {
                continue;
            }
            ctx.intent(instrument, self.target);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_types::Frequency;

    fn rows() -> Vec<StrategyTableRow> {
        vec![StrategyTableRow {
            strategy_id: "tracker-1".to_string(),
            portfolio_id: "main".to_string(),
            builder: "target_tracker".to_string(),
        }]
    }

    fn symbols() -> Vec<SymbolSubscription> {
        vec![SymbolSubscription {
            instrument: Instrument::stock("DEMO"),
            frequency: Frequency::Day,
        }]
    }

    #[test]
    fn test_build_from_table() {
        let registry = builtin_registry();
        let strategies = build_from_table(&rows(), &symbols(), &registry).unwrap();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].config().strategy_id, "tracker-1");
        assert_eq!(strategies[0].config().portfolio_id, "main");
        assert_eq!(strategies[0].config().symbols.len(), 1);
    }

    #[test]
    fn test_unknown_builder_is_config_error() {
        let registry = builtin_registry();
        let mut bad = rows();
        bad[0].builder = "missing".to_string();
        assert!(build_from_table(&bad, &symbols(), &registry).is_err());
    }

    #[test]
    fn test_parameters_override_defaults() {
        let mut config = StrategyConfig::new("t", "main");
        config.set_parameter("target", 250i64);
        let tracker = TargetTracker::new(config);
        assert_eq!(tracker.target, 250);

        let mut config = StrategyConfig::new("p", "main");
        config.set_parameter("quantity", 42u64);
        let poster = LimitPoster::new(config);
        assert_eq!(poster.quantity, 42);
    }
}
