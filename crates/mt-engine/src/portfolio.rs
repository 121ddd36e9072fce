//! Portfolio: aggregates strategies, stages their orders, converts intents
//! into delta orders, and optionally crosses opposing orders off-book.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::oms::{OrderFilter, OrderManager};
use crate::positions::PositionManager;
use crate::strategy::IntentBook;
use mt_data::MarketData;
use mt_types::{EngineResult, Fill, Instrument, Order, OrderId, OrderState, OrderType, Side};

#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub portfolio_id: String,
    /// Cross exactly opposing staged orders off-book instead of sending both
    /// to the venue.
    pub enable_crossing: bool,
    /// Offset applied to the last close when pricing intent-derived limit
    /// orders: buys at close - offset, sells at close + offset.
    pub price_offset: Decimal,
}

impl PortfolioConfig {
    pub fn new(portfolio_id: &str) -> Self {
        Self {
            portfolio_id: portfolio_id.to_string(),
            enable_crossing: false,
            price_offset: Decimal::ZERO,
        }
    }
}

/// One portfolio and the strategies bound to it.
#[derive(Debug)]
pub struct Portfolio {
    uuid: Uuid,
    config: PortfolioConfig,
    /// (strategy_id, strategy_uuid) in registration order
    strategies: Vec<(String, Uuid)>,
    next_cross_fill_id: u64,
}

impl Portfolio {
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            config,
            strategies: Vec::new(),
            next_cross_fill_id: 1,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn portfolio_id(&self) -> &str {
        &self.config.portfolio_id
    }

    pub fn bind_strategy(&mut self, strategy_id: &str, strategy_uuid: Uuid) {
        if !self.strategies.iter().any(|(id, _)| id == strategy_id) {
            self.strategies.push((strategy_id.to_string(), strategy_uuid));
        }
    }

    pub fn strategy_ids(&self) -> Vec<&str> {
        self.strategies.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn has_strategy(&self, strategy_id: &str) -> bool {
        self.strategies.iter().any(|(id, _)| id == strategy_id)
    }

    /// One bar of portfolio work: stage strategy-created orders, materialize
    /// intents as delta orders, then run the optional internal cross.
    pub fn process_orders(
        &mut self,
        oms: &mut OrderManager,
        positions: &PositionManager,
        market: &dyn MarketData,
        intents: &mut HashMap<String, &mut IntentBook>,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.stage_created_orders(oms, timestamp)?;
        self.materialize_intents(oms, positions, market, intents, timestamp)?;
        if self.config.enable_crossing {
            self.cross_staged_orders(oms, timestamp)?;
        }
        Ok(())
    }

    fn stage_created_orders(
        &self,
        oms: &mut OrderManager,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        for (strategy_id, _) in &self.strategies {
            let created = oms.uuids(&OrderFilter {
                state: Some(OrderState::Created),
                strategy_id: Some(strategy_id.clone()),
                ..Default::default()
            });
            for uuid in created {
                oms.assign_portfolio(uuid, self.uuid, &self.config.portfolio_id)?;
                oms.change_state(uuid, OrderState::Staged, timestamp)?;
                debug!(order = %uuid, portfolio = %self.config.portfolio_id, "staged");
            }
        }
        Ok(())
    }

    /// Convert each strategy's pending intents into limit orders for the
    /// difference between target and current position.  Intents without a
    /// price source are retained for the next bar.
    fn materialize_intents(
        &self,
        oms: &mut OrderManager,
        positions: &PositionManager,
        market: &dyn MarketData,
        intents: &mut HashMap<String, &mut IntentBook>,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        for (strategy_id, strategy_uuid) in &self.strategies {
            let Some(book) = intents.get_mut(strategy_id) else {
                continue;
            };
            for (instrument, target) in book.targets() {
                let current = positions.position_quantity(strategy_id, &instrument);
                let delta = target - current;
                if delta == 0 {
                    book.remove(&instrument);
                    continue;
                }
                let Some(close) = market.current_price(&instrument) else {
                    warn!(instrument = %instrument, "no price for intent; retrying next bar");
                    continue;
                };

                let side = if delta > 0 { Side::Buy } else { Side::Sell };
                let price = match side {
                    Side::Buy => close - self.config.price_offset,
                    Side::Sell => close + self.config.price_offset,
                };
                let mut order = Order::new(
                    self.uuid,
                    self.config.portfolio_id.clone(),
                    *strategy_uuid,
                    strategy_id.clone(),
                    instrument.clone(),
                    side,
                    delta.unsigned_abs(),
                    OrderType::Limit { price },
                    timestamp,
                );
                order.portfolio_uuid = Some(self.uuid);
                order.portfolio_id = Some(self.config.portfolio_id.clone());

                let uuid = oms.new_order(order)?;
                oms.change_state(uuid, OrderState::Staged, timestamp)?;
                book.remove(&instrument);
                info!(
                    order = %uuid,
                    instrument = %instrument,
                    target,
                    delta,
                    "intent materialized"
                );
            }
        }
        Ok(())
    }

    /// Cross exactly opposing staged limit orders from different strategies
    /// at the midpoint of their limit prices.  Anything that does not pair
    /// exactly goes to risk unchanged.
    fn cross_staged_orders(
        &mut self,
        oms: &mut OrderManager,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        let staged = oms.uuids(&OrderFilter {
            state: Some(OrderState::Staged),
            portfolio_id: Some(self.config.portfolio_id.clone()),
            ..Default::default()
        });

        let mut by_instrument: BTreeMap<Instrument, Vec<OrderId>> = BTreeMap::new();
        for uuid in staged {
            let order = oms.get_required(uuid)?;
            if order.order_type.limit_price().is_some() {
                by_instrument
                    .entry(order.instrument.clone())
                    .or_default()
                    .push(uuid);
            }
        }

        for (instrument, uuids) in by_instrument {
            let mut matched: Vec<OrderId> = Vec::new();
            for i in 0..uuids.len() {
                let buy_uuid = uuids[i];
                if matched.contains(&buy_uuid) {
                    continue;
                }
                let (buy_side, buy_qty, buy_strategy, buy_limit) = {
                    let o = oms.get_required(buy_uuid)?;
                    (
                        o.side,
                        o.quantity,
                        o.strategy_id.clone(),
                        o.order_type.limit_price(),
                    )
                };
                if buy_side != Side::Buy {
                    continue;
                }

                for &sell_uuid in &uuids[i + 1..] {
                    if matched.contains(&sell_uuid) {
                        continue;
                    }
                    let (sell_side, sell_qty, sell_strategy, sell_limit) = {
                        let o = oms.get_required(sell_uuid)?;
                        (
                            o.side,
                            o.quantity,
                            o.strategy_id.clone(),
                            o.order_type.limit_price(),
                        )
                    };
                    if sell_side != Side::Sell
                        || sell_qty != buy_qty
                        || sell_strategy == buy_strategy
                    {
                        continue;
                    }
                    let (Some(buy_px), Some(sell_px)) = (buy_limit, sell_limit) else {
                        continue;
                    };

                    let cross_price = (buy_px + sell_px) / Decimal::from(2);
                    for uuid in [buy_uuid, sell_uuid] {
                        let fill_id = self.next_cross_fill_id;
                        self.next_cross_fill_id += 1;
                        oms.apply_fill(
                            uuid,
                            Fill {
                                fill_id,
                                timestamp,
                                bartime: timestamp,
                                quantity: buy_qty,
                                price: cross_price,
                                commission: Decimal::ZERO,
                                booked: false,
                            },
                        )?;
                        oms.change_state(uuid, OrderState::Filled, timestamp)?;
                    }
                    matched.push(buy_uuid);
                    matched.push(sell_uuid);
                    info!(
                        instrument = %instrument,
                        quantity = buy_qty,
                        price = %cross_price,
                        "internal cross"
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mt_data::HistoricalDataManager;
    use mt_types::{Bar, Frequency};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap()
    }

    fn market_with_close(instrument: &Instrument, close: Decimal) -> HistoricalDataManager {
        let mut mdm = HistoricalDataManager::new();
        mdm.add_series(
            instrument.clone(),
            Frequency::Day,
            vec![Bar::new(
                instrument.clone(),
                t0(),
                close,
                close + dec!(0.5),
                close - dec!(0.5),
                close,
                dec!(10000),
                Frequency::Day,
            )],
        );
        mdm.set_bartime(t0());
        mdm.update(instrument.product_type, Frequency::Day).unwrap();
        mdm
    }

    fn strategy_order(strategy_uuid: Uuid, strategy_id: &str, side: Side, quantity: u64) -> Order {
        Order::new(
            strategy_uuid,
            strategy_id.to_string(),
            strategy_uuid,
            strategy_id.to_string(),
            Instrument::stock("X"),
            side,
            quantity,
            OrderType::Limit { price: dec!(10) },
            t0(),
        )
    }

    #[test]
    fn test_created_orders_are_staged_and_tagged() {
        let mut oms = OrderManager::new();
        let positions = PositionManager::new();
        let market = HistoricalDataManager::new();
        let strategy_uuid = Uuid::new_v4();

        let mut portfolio = Portfolio::new(PortfolioConfig::new("main"));
        portfolio.bind_strategy("strat", strategy_uuid);

        let uuid = oms
            .new_order(strategy_order(strategy_uuid, "strat", Side::Buy, 100))
            .unwrap();

        let mut books = HashMap::new();
        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.state, OrderState::Staged);
        assert_eq!(order.portfolio_uuid, Some(portfolio.uuid()));
        assert_eq!(order.portfolio_id.as_deref(), Some("main"));
        // No CREATED orders survive portfolio processing.
        assert!(oms
            .orders_list(&OrderFilter {
                state: Some(OrderState::Created),
                ..Default::default()
            })
            .is_empty());
    }

    #[test]
    fn test_intent_materializes_one_staged_delta_order() {
        let instrument = Instrument::stock("X");
        let mut oms = OrderManager::new();
        let positions = PositionManager::new();
        let market = market_with_close(&instrument, dec!(25));
        let strategy_uuid = Uuid::new_v4();

        let mut portfolio = Portfolio::new(PortfolioConfig::new("main"));
        portfolio.bind_strategy("strat", strategy_uuid);

        let mut book = IntentBook::default();
        book.set(instrument.clone(), 50);
        let mut books: HashMap<String, &mut IntentBook> = HashMap::new();
        books.insert("strat".to_string(), &mut book);

        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        let staged = oms.orders_list(&OrderFilter {
            state: Some(OrderState::Staged),
            ..Default::default()
        });
        assert_eq!(staged.len(), 1);
        let order = staged[0];
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.quantity, 50);
        // Originator is the portfolio, not the strategy.
        assert_eq!(order.originator_uuid, portfolio.uuid());
        assert_eq!(order.originator_id, "main");
        assert_eq!(order.strategy_id, "strat");
        assert_eq!(order.order_type.limit_price(), Some(dec!(25)));
        // Intent consumed.
        assert!(book.get(&instrument).is_none());
    }

    #[test]
    fn test_intent_with_zero_delta_is_discarded() {
        let instrument = Instrument::stock("X");
        let mut oms = OrderManager::new();
        let mut positions = PositionManager::new();
        let market = market_with_close(&instrument, dec!(25));
        let strategy_uuid = Uuid::new_v4();

        positions.enter_trade(
            "strat",
            "strat",
            t0(),
            &instrument,
            Side::Buy,
            50,
            dec!(25),
            Decimal::ZERO,
        );

        let mut portfolio = Portfolio::new(PortfolioConfig::new("main"));
        portfolio.bind_strategy("strat", strategy_uuid);

        let mut book = IntentBook::default();
        book.set(instrument.clone(), 50);
        let mut books: HashMap<String, &mut IntentBook> = HashMap::new();
        books.insert("strat".to_string(), &mut book);

        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        assert!(oms.is_empty());
        assert!(book.get(&instrument).is_none());
    }

    #[test]
    fn test_intent_sell_side_and_price_offset() {
        let instrument = Instrument::stock("X");
        let mut oms = OrderManager::new();
        let mut positions = PositionManager::new();
        let market = market_with_close(&instrument, dec!(25));
        let strategy_uuid = Uuid::new_v4();

        positions.enter_trade(
            "strat",
            "strat",
            t0(),
            &instrument,
            Side::Buy,
            80,
            dec!(25),
            Decimal::ZERO,
        );

        let mut config = PortfolioConfig::new("main");
        config.price_offset = dec!(0.05);
        let mut portfolio = Portfolio::new(config);
        portfolio.bind_strategy("strat", strategy_uuid);

        let mut book = IntentBook::default();
        book.set(instrument.clone(), 30); // current 80 -> delta -50
        let mut books: HashMap<String, &mut IntentBook> = HashMap::new();
        books.insert("strat".to_string(), &mut book);

        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        let staged = oms.orders_list(&OrderFilter::default());
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].side, Side::Sell);
        assert_eq!(staged[0].quantity, 50);
        assert_eq!(staged[0].order_type.limit_price(), Some(dec!(25.05)));
    }

    #[test]
    fn test_exact_opposite_orders_cross() {
        let mut oms = OrderManager::new();
        let positions = PositionManager::new();
        let market = HistoricalDataManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut config = PortfolioConfig::new("main");
        config.enable_crossing = true;
        let mut portfolio = Portfolio::new(config);
        portfolio.bind_strategy("alpha", a);
        portfolio.bind_strategy("beta", b);

        let mut buy = strategy_order(a, "alpha", Side::Buy, 100);
        buy.order_type = OrderType::Limit { price: dec!(10.1) };
        let buy_uuid = oms.new_order(buy).unwrap();
        let mut sell = strategy_order(b, "beta", Side::Sell, 100);
        sell.order_type = OrderType::Limit { price: dec!(9.9) };
        let sell_uuid = oms.new_order(sell).unwrap();

        let mut books = HashMap::new();
        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        for uuid in [buy_uuid, sell_uuid] {
            let order = oms.get(uuid).unwrap();
            assert_eq!(order.state, OrderState::Filled);
            assert_eq!(order.fill_quantity, 100);
            assert_eq!(order.fill_price, Some(dec!(10.0)));
            assert_eq!(order.booked, Some(false));
        }
        // Nothing left for risk.
        assert!(oms
            .orders_list(&OrderFilter {
                state: Some(OrderState::Staged),
                ..Default::default()
            })
            .is_empty());
    }

    #[test]
    fn test_mismatched_quantities_do_not_cross() {
        let mut oms = OrderManager::new();
        let positions = PositionManager::new();
        let market = HistoricalDataManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut config = PortfolioConfig::new("main");
        config.enable_crossing = true;
        let mut portfolio = Portfolio::new(config);
        portfolio.bind_strategy("alpha", a);
        portfolio.bind_strategy("beta", b);

        oms.new_order(strategy_order(a, "alpha", Side::Buy, 100)).unwrap();
        oms.new_order(strategy_order(b, "beta", Side::Sell, 60)).unwrap();

        let mut books = HashMap::new();
        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        let staged = oms.orders_list(&OrderFilter {
            state: Some(OrderState::Staged),
            ..Default::default()
        });
        assert_eq!(staged.len(), 2);
    }

    #[test]
    fn test_same_strategy_orders_do_not_cross() {
        let mut oms = OrderManager::new();
        let positions = PositionManager::new();
        let market = HistoricalDataManager::new();
        let a = Uuid::new_v4();

        let mut config = PortfolioConfig::new("main");
        config.enable_crossing = true;
        let mut portfolio = Portfolio::new(config);
        portfolio.bind_strategy("alpha", a);

        oms.new_order(strategy_order(a, "alpha", Side::Buy, 100)).unwrap();
        oms.new_order(strategy_order(a, "alpha", Side::Sell, 100)).unwrap();

        let mut books = HashMap::new();
        portfolio
            .process_orders(&mut oms, &positions, &market, &mut books, t0())
            .unwrap();

        let staged = oms.orders_list(&OrderFilter {
            state: Some(OrderState::Staged),
            ..Default::default()
        });
        assert_eq!(staged.len(), 2);
    }
}
