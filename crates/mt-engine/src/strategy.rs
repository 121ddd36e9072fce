//! Strategy contract: lifecycle callbacks plus the bridge strategies use to
//! author orders and intents.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::oms::{OrderFilter, OrderManager};
use crate::positions::{PositionManager, PositionRow};
use mt_data::MarketData;
use mt_types::{
    Bar, EngineResult, Frequency, Instrument, Order, OrderError, OrderId, OrderState, OrderType,
    Replacement, Side, StrategyError,
};

/// One market-data subscription requested by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSubscription {
    pub instrument: Instrument,
    pub frequency: Frequency,
}

/// Strategy configuration: identity, subscriptions and free-form parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    pub portfolio_id: String,
    pub symbols: Vec<SymbolSubscription>,
    pub parameters: HashMap<String, serde_json::Value>,
}

impl StrategyConfig {
    pub fn new(strategy_id: &str, portfolio_id: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            portfolio_id: portfolio_id.to_string(),
            symbols: Vec::new(),
            parameters: HashMap::new(),
        }
    }

    pub fn add_symbol(&mut self, instrument: Instrument, frequency: Frequency) -> &mut Self {
        self.symbols.push(SymbolSubscription {
            instrument,
            frequency,
        });
        self
    }

    pub fn add_symbols(&mut self, subscriptions: Vec<SymbolSubscription>) -> &mut Self {
        self.symbols.extend(subscriptions);
        self
    }

    pub fn set_parameter<T: Serialize>(&mut self, key: &str, value: T) -> &mut Self {
        self.parameters.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        self
    }

    pub fn get_parameter<T>(&self, key: &str) -> Option<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.parameters.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// Per-strategy absolute position targets.  Setting a target for the same
/// instrument replaces the previous one; targets are drained when the
/// portfolio materializes them.
#[derive(Debug, Clone, Default)]
pub struct IntentBook {
    targets: BTreeMap<Instrument, i64>,
}

impl IntentBook {
    pub fn set(&mut self, instrument: Instrument, target_quantity: i64) {
        self.targets.insert(instrument, target_quantity);
    }

    pub fn get(&self, instrument: &Instrument) -> Option<i64> {
        self.targets.get(instrument).copied()
    }

    pub fn remove(&mut self, instrument: &Instrument) {
        self.targets.remove(instrument);
    }

    pub fn targets(&self) -> Vec<(Instrument, i64)> {
        self.targets
            .iter()
            .map(|(instrument, target)| (instrument.clone(), *target))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// The capability set handed to a strategy for the duration of one callback:
/// non-owning handles on the order manager, position manager and market data,
/// plus the strategy's own intent book.
pub struct StrategyContext<'a> {
    pub ts: DateTime<Utc>,
    strategy_uuid: Uuid,
    strategy_id: String,
    oms: &'a mut OrderManager,
    positions: &'a PositionManager,
    market: &'a dyn MarketData,
    intents: &'a mut IntentBook,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        ts: DateTime<Utc>,
        strategy_uuid: Uuid,
        strategy_id: String,
        oms: &'a mut OrderManager,
        positions: &'a PositionManager,
        market: &'a dyn MarketData,
        intents: &'a mut IntentBook,
    ) -> Self {
        Self {
            ts,
            strategy_uuid,
            strategy_id,
            oms,
            positions,
            market,
            intents,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Create an order in CREATED state.  The portfolio stages it later in
    /// the same bar.
    pub fn order(
        &mut self,
        instrument: Instrument,
        side: Side,
        quantity: u64,
        order_type: OrderType,
    ) -> EngineResult<OrderId> {
        if quantity == 0 {
            return Err(OrderError::ZeroQuantity.into());
        }
        let order = Order::new(
            self.strategy_uuid,
            self.strategy_id.clone(),
            self.strategy_uuid,
            self.strategy_id.clone(),
            instrument,
            side,
            quantity,
            order_type,
            self.ts,
        );
        Ok(self.oms.new_order(order)?)
    }

    /// Request a cancel; the broker forwards it to the venue this bar.
    pub fn cancel_order(&mut self, uuid: OrderId) -> EngineResult<()> {
        self.oms
            .change_state(uuid, OrderState::CancelRequested, self.ts)?;
        Ok(())
    }

    /// Request a replace with new quantity and terms.
    pub fn replace_order(
        &mut self,
        uuid: OrderId,
        quantity: u64,
        order_type: OrderType,
    ) -> EngineResult<()> {
        if quantity == 0 {
            return Err(OrderError::ZeroQuantity.into());
        }
        self.oms
            .change_state(uuid, OrderState::ReplaceRequested, self.ts)?;
        self.oms.set_pending_replace(
            uuid,
            Replacement {
                quantity,
                order_type,
            },
        )?;
        Ok(())
    }

    pub fn get_order(&self, uuid: OrderId) -> Option<&Order> {
        self.oms.get(uuid)
    }

    /// This strategy's open orders, optionally narrowed to one instrument.
    pub fn open_orders(&self, instrument: Option<&Instrument>) -> Vec<&Order> {
        self.oms.open_orders(&OrderFilter {
            strategy_id: Some(self.strategy_id.clone()),
            instrument: instrument.cloned(),
            ..Default::default()
        })
    }

    /// Declare an absolute position target; replaces any previous target for
    /// the instrument.
    pub fn intent(&mut self, instrument: Instrument, target_quantity: i64) {
        self.intents.set(instrument, target_quantity);
    }

    pub fn get_intent(&self, instrument: &Instrument) -> Option<i64> {
        self.intents.get(instrument)
    }

    pub fn position(&self, instrument: &Instrument) -> i64 {
        self.positions
            .position_quantity(&self.strategy_id, instrument)
    }

    pub fn position_row(&self, instrument: &Instrument) -> Option<&PositionRow> {
        self.positions.row(&self.strategy_id, instrument)
    }

    pub fn current_bar(&self, instrument: &Instrument) -> Option<&Bar> {
        self.market.current_bar(instrument)
    }

    pub fn current_price(&self, instrument: &Instrument) -> Option<Decimal> {
        self.market.current_price(instrument)
    }
}

/// Lifecycle contract every strategy implements.
///
/// Callbacks run to completion inside the bar pipeline; an `Err` disables the
/// strategy until the next begin-of-day.
pub trait Strategy {
    fn config(&self) -> &StrategyConfig;
    fn config_mut(&mut self) -> &mut StrategyConfig;

    /// Merge runtime parameters into the configuration.
    fn set_parameters(&mut self, parameters: HashMap<String, serde_json::Value>) {
        self.config_mut().parameters.extend(parameters);
    }

    fn on_start(&mut self, _ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_begin_of_day(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_market_open(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    /// The one required callback: act on the new bar.
    fn on_bar(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        ts: DateTime<Utc>,
    ) -> Result<(), StrategyError>;

    fn on_fills(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
        _orders: &[Order],
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_cancels(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
        _orders: &[Order],
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_market_close(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_end_of_day(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_stop(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _ts: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }
}
