//! Event processor: one bar's worth of work across every component, in a
//! fixed order.
//!
//! Per bar: day/session hooks, market-data update, strategy `on_bar`,
//! portfolio staging, risk, broker send, exchange matching, fill mirroring,
//! booking, fill/cancel callbacks, PnL, end-of-day persistence, and the
//! stuck-order check.  Everything runs to completion on one thread; that is
//! what makes the state-machine invariants deterministic.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::PaperBroker;
use crate::exchange::PaperExchange;
use crate::oms::{OrderFilter, OrderManager};
use crate::persistence::Persistence;
use crate::portfolio::Portfolio;
use crate::positions::PositionManager;
use crate::risk::RiskEngine;
use crate::strategy::{IntentBook, Strategy, StrategyContext};
use mt_data::{MarketData, TradingCalendar};
use mt_types::{
    EngineError, EngineResult, Frequency, Order, OrderState, PersistenceError, PipelineError,
    ProductType, StrategyError,
};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Fail the bar at the first component error instead of surfacing it
    /// after the bar completes.
    pub strict: bool,
    pub calendar: TradingCalendar,
    /// Source tag used for end-of-day snapshots.
    pub snapshot_source: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            strict: false,
            calendar: TradingCalendar::always_open(),
            snapshot_source: "metronome".to_string(),
        }
    }
}

struct StrategySlot {
    strategy: Box<dyn Strategy>,
    strategy_id: String,
    uuid: Uuid,
    healthy: bool,
    intents: IntentBook,
}

/// Single-bar orchestrator owning every pipeline component.
pub struct EventProcessor<M: MarketData> {
    market: M,
    oms: OrderManager,
    exchange: PaperExchange,
    broker: PaperBroker,
    risk: RiskEngine,
    portfolios: Vec<Portfolio>,
    positions: PositionManager,
    persistence: Box<dyn Persistence>,
    slots: Vec<StrategySlot>,
    config: ProcessorConfig,
    last_bartime: Option<DateTime<Utc>>,
    market_was_open: bool,
}

impl<M: MarketData> EventProcessor<M> {
    pub fn new(market: M, persistence: Box<dyn Persistence>, config: ProcessorConfig) -> Self {
        Self {
            market,
            oms: OrderManager::new(),
            exchange: PaperExchange::with_defaults(),
            broker: PaperBroker::new(),
            risk: RiskEngine::default(),
            portfolios: Vec::new(),
            positions: PositionManager::new(),
            persistence,
            slots: Vec::new(),
            config,
            last_bartime: None,
            market_was_open: false,
        }
    }

    pub fn with_exchange(mut self, exchange: PaperExchange) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_risk(mut self, risk: RiskEngine) -> Self {
        self.risk = risk;
        self
    }

    pub fn add_portfolio(&mut self, portfolio: Portfolio) {
        self.portfolios.push(portfolio);
    }

    /// Register a strategy: binds it to its portfolio (which must already be
    /// added) and tracks its market-data subscriptions.
    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) -> EngineResult<()> {
        let config = strategy.config().clone();
        let portfolio = self
            .portfolios
            .iter_mut()
            .find(|p| p.portfolio_id() == config.portfolio_id)
            .ok_or_else(|| {
                EngineError::Strategy(StrategyError::NotBound {
                    strategy_id: config.strategy_id.clone(),
                    portfolio_id: config.portfolio_id.clone(),
                })
            })?;

        let uuid = Uuid::new_v4();
        portfolio.bind_strategy(&config.strategy_id, uuid);
        for subscription in &config.symbols {
            self.market
                .track(subscription.instrument.clone(), subscription.frequency);
        }
        self.slots.push(StrategySlot {
            strategy,
            strategy_id: config.strategy_id,
            uuid,
            healthy: true,
            intents: IntentBook::default(),
        });
        Ok(())
    }

    pub fn oms(&self) -> &OrderManager {
        &self.oms
    }

    pub fn oms_mut(&mut self) -> &mut OrderManager {
        &mut self.oms
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut PositionManager {
        &mut self.positions
    }

    pub fn market(&self) -> &M {
        &self.market
    }

    pub fn market_mut(&mut self) -> &mut M {
        &mut self.market
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    /// Invoke `on_start` on every strategy before the first bar.
    pub fn start(&mut self, timestamp: DateTime<Utc>) -> EngineResult<()> {
        self.dispatch(timestamp, |strategy, ctx| strategy.on_start(ctx));
        Ok(())
    }

    /// Invoke `on_stop` on every strategy after the last bar.
    pub fn stop(&mut self, timestamp: DateTime<Utc>) -> EngineResult<()> {
        self.dispatch(timestamp, |strategy, ctx| strategy.on_stop(ctx, timestamp));
        Ok(())
    }

    /// Run the full pipeline for one bar.  `end_of_day` marks the last bar of
    /// the calendar day and triggers end-of-day hooks and persistence.
    pub fn process_bar(&mut self, ts: DateTime<Utc>, end_of_day: bool) -> EngineResult<()> {
        let mut deferred: Vec<EngineError> = Vec::new();
        let strict = self.config.strict;
        let calendar = self.config.calendar.clone();
        debug!(bartime = %ts, "processing bar");

        // 1. Begin-of-day hooks; quarantined strategies come back.
        let new_day = self
            .last_bartime
            .map_or(true, |prev| prev.date_naive() != ts.date_naive());
        if new_day {
            for slot in &mut self.slots {
                if !slot.healthy {
                    warn!(strategy = %slot.strategy_id, "re-enabling strategy for new day");
                    slot.healthy = true;
                }
            }
            self.dispatch(ts, |strategy, ctx| strategy.on_begin_of_day(ctx, ts));
        }

        // 2. Market-open hooks.
        let open_now = calendar.is_open(ts);
        if !calendar.always_open && open_now && !self.market_was_open {
            self.sync_market_state(true);
            self.dispatch(ts, |strategy, ctx| strategy.on_market_open(ctx, ts));
        }

        // 3. Market-data update for every tracked (product, frequency).
        self.market.set_bartime(ts);
        let mut pairs: Vec<(ProductType, Frequency)> = Vec::new();
        for (instrument, frequency) in self.market.tracked() {
            let pair = (instrument.product_type, frequency);
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        for (product_type, frequency) in pairs {
            if let Err(e) = self.market.update(product_type, frequency) {
                // Missing data skips the product this bar; not fatal.
                warn!(product = %product_type, error = %e, "market data update failed");
            }
        }

        // 4. Strategies act on the bar.
        self.dispatch(ts, |strategy, ctx| strategy.on_bar(ctx, ts));

        // 5. Portfolios stage orders and materialize intents.
        {
            let mut portfolios = std::mem::take(&mut self.portfolios);
            let mut failed: Option<EngineError> = None;
            {
                let mut intents: HashMap<String, &mut IntentBook> = self
                    .slots
                    .iter_mut()
                    .map(|slot| (slot.strategy_id.clone(), &mut slot.intents))
                    .collect();
                for portfolio in portfolios.iter_mut() {
                    if let Err(e) = portfolio.process_orders(
                        &mut self.oms,
                        &self.positions,
                        &self.market,
                        &mut intents,
                        ts,
                    ) {
                        failed = Some(e);
                        break;
                    }
                }
            }
            self.portfolios = portfolios;
            if let Some(e) = failed {
                if strict {
                    return Err(e);
                }
                deferred.push(e);
            }
        }

        // 6. Risk accepts or rejects staged orders.
        {
            let portfolios = std::mem::take(&mut self.portfolios);
            let mut failed: Option<EngineError> = None;
            for portfolio in &portfolios {
                if let Err(e) = self.risk.process_portfolio_orders(
                    &mut self.oms,
                    &self.positions,
                    &self.market,
                    portfolio,
                    ts,
                ) {
                    failed = Some(e);
                    break;
                }
            }
            self.portfolios = portfolios;
            if let Some(e) = failed {
                if strict {
                    return Err(e);
                }
                deferred.push(e);
            }
        }

        // 7. Broker sends accepted orders and forwards cancels/replaces.
        if let Err(e) = self
            .broker
            .send_orders(&mut self.oms, &mut self.exchange, ts)
        {
            if strict {
                return Err(e);
            }
            deferred.push(e);
        }

        // 8. Exchange matches against this bar.
        self.exchange.process_orders(&self.market, ts);

        // 9. Broker mirrors venue outcomes back into the OMS.
        if let Err(e) = self
            .broker
            .process_fills(&mut self.oms, &mut self.exchange, ts)
        {
            if strict {
                return Err(e);
            }
            deferred.push(e);
        }

        // 10. Book closed, unbooked orders into positions.
        if let Err(e) = self.positions.book_fills(&mut self.oms) {
            if strict {
                return Err(e);
            }
            deferred.push(e);
        }

        // 11. Notify strategies of this bar's fills and cancels.
        let (filled_by, canceled_by) = self.collect_notifications(ts);
        if !filled_by.is_empty() {
            self.dispatch(ts, |strategy, ctx| {
                match filled_by.get(ctx.strategy_id()) {
                    Some(orders) => strategy.on_fills(ctx, ts, orders),
                    None => Ok(()),
                }
            });
        }
        if !canceled_by.is_empty() {
            self.dispatch(ts, |strategy, ctx| {
                match canceled_by.get(ctx.strategy_id()) {
                    Some(orders) => strategy.on_cancels(ctx, ts, orders),
                    None => Ok(()),
                }
            });
        }

        // 12. Mark positions to market.
        self.positions.update_pnl(&self.market);

        // 13. Market-close and end-of-day hooks, then persistence.
        let market_closing =
            !calendar.always_open && self.market_was_open && (!open_now || end_of_day);
        if market_closing {
            self.dispatch(ts, |strategy, ctx| strategy.on_market_close(ctx, ts));
            self.sync_market_state(false);
        }
        if end_of_day {
            self.dispatch(ts, |strategy, ctx| strategy.on_end_of_day(ctx, ts));
            self.persist_snapshots(ts)?;
        }

        self.market_was_open = if calendar.always_open {
            true
        } else {
            open_now && !market_closing
        };
        self.last_bartime = Some(ts);

        // 14. No transient state may survive a full bar.
        let stuck = self.check_stuck_orders(ts);
        if let Some(e) = deferred.into_iter().next() {
            return Err(e);
        }
        stuck
    }

    fn collect_notifications(
        &self,
        ts: DateTime<Utc>,
    ) -> (HashMap<String, Vec<Order>>, HashMap<String, Vec<Order>>) {
        let mut filled_by: HashMap<String, Vec<Order>> = HashMap::new();
        let mut canceled_by: HashMap<String, Vec<Order>> = HashMap::new();
        for order in self.oms.orders_list(&OrderFilter::default()) {
            let Some(last) = order.state_history.last() else {
                continue;
            };
            if last.timestamp != ts {
                continue;
            }
            match order.state {
                OrderState::Filled => filled_by
                    .entry(order.strategy_id.clone())
                    .or_default()
                    .push(order.clone()),
                OrderState::Canceled => canceled_by
                    .entry(order.strategy_id.clone())
                    .or_default()
                    .push(order.clone()),
                _ => {}
            }
        }
        (filled_by, canceled_by)
    }

    fn check_stuck_orders(&self, ts: DateTime<Utc>) -> EngineResult<()> {
        for order in self.oms.open_orders(&OrderFilter::default()) {
            if !order.state.is_transient() {
                continue;
            }
            let Some(last) = order.state_history.last() else {
                continue;
            };
            if last.timestamp < ts {
                return Err(PipelineError::StuckOrder {
                    uuid: order.uuid,
                    state: order.state,
                    since: last.timestamp,
                }
                .into());
            }
        }
        Ok(())
    }

    fn sync_market_state(&mut self, open: bool) {
        let mut seen: Vec<ProductType> = Vec::new();
        for (instrument, _) in self.market.tracked() {
            let product_type = instrument.product_type;
            if product_type.is_24_7() || seen.contains(&product_type) {
                continue;
            }
            seen.push(product_type);
            self.oms.set_market_state(product_type, open);
        }
    }

    fn persist_snapshots(&mut self, ts: DateTime<Utc>) -> EngineResult<()> {
        if let Err(e) = self.try_persist(ts) {
            warn!(error = %e, "persistence failed; retrying once");
            self.try_persist(ts).map_err(EngineError::from)?;
        }
        Ok(())
    }

    fn try_persist(&mut self, ts: DateTime<Utc>) -> Result<(), PersistenceError> {
        let orders: Vec<Order> = self
            .oms
            .orders_list(&OrderFilter::default())
            .into_iter()
            .cloned()
            .collect();
        let positions = self.positions.snapshot();
        let source = self.config.snapshot_source.clone();
        self.persistence.save_orders(&source, ts, &orders)?;
        self.persistence.save_positions(&source, ts, &positions)?;
        Ok(())
    }

    /// Run one callback on every healthy strategy with a fresh context.  A
    /// callback error quarantines the strategy until the next begin-of-day.
    fn dispatch<F>(&mut self, ts: DateTime<Utc>, mut callback: F)
    where
        F: FnMut(&mut dyn Strategy, &mut StrategyContext<'_>) -> Result<(), StrategyError>,
    {
        let mut slots = std::mem::take(&mut self.slots);
        for slot in slots.iter_mut() {
            if !slot.healthy {
                continue;
            }
            let mut ctx = StrategyContext::new(
                ts,
                slot.uuid,
                slot.strategy_id.clone(),
                &mut self.oms,
                &self.positions,
                &self.market,
                &mut slot.intents,
            );
            if let Err(e) = callback(slot.strategy.as_mut(), &mut ctx) {
                warn!(
                    strategy = %slot.strategy_id,
                    error = %e,
                    "strategy callback failed; disabled until next day"
                );
                slot.healthy = false;
            }
        }
        self.slots = slots;
    }
}
