//! Paper broker: the bridge between the order manager and the exchange.
//!
//! Assigns broker ids, forwards accepted orders and cancel/replace requests
//! to the venue, and mirrors venue fills and outcomes back into the engine's
//! orders once per bar.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::exchange::{ExchangeOrderId, PaperExchange, PaperOrderState};
use crate::oms::OrderManager;
use mt_types::{EngineResult, Fill, OrderError, OrderId, OrderState};

#[derive(Debug, Clone, Copy)]
struct Route {
    uuid: OrderId,
    exchange_order_id: ExchangeOrderId,
}

/// Bridge between the OMS and the paper exchange.
#[derive(Debug, Default)]
pub struct PaperBroker {
    next_broker_id: u64,
    /// Routes in send order (broker ids are monotonic).
    routes: BTreeMap<u64, Route>,
    broker_id_by_uuid: HashMap<OrderId, u64>,
    uuid_by_exchange_id: HashMap<ExchangeOrderId, OrderId>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            next_broker_id: 1,
            ..Self::default()
        }
    }

    pub fn broker_order_id(&self, uuid: OrderId) -> Option<u64> {
        self.broker_id_by_uuid.get(&uuid).copied()
    }

    fn exchange_id(&self, uuid: OrderId) -> Result<ExchangeOrderId, OrderError> {
        self.broker_id_by_uuid
            .get(&uuid)
            .and_then(|bid| self.routes.get(bid))
            .map(|r| r.exchange_order_id)
            .ok_or(OrderError::NotFound { uuid })
    }

    /// Send every risk-accepted order to the venue, then forward pending
    /// cancel and replace requests.
    pub fn send_orders(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        for uuid in oms.uuids_in_state(OrderState::RiskAccepted) {
            self.send_order(oms, exchange, uuid, timestamp)?;
        }
        for uuid in oms.uuids_in_state(OrderState::CancelRequested) {
            let exchange_order_id = self.exchange_id(uuid)?;
            exchange.request_cancel(exchange_order_id);
            oms.change_state(uuid, OrderState::CancelSent, timestamp)?;
        }
        for uuid in oms.uuids_in_state(OrderState::ReplaceRequested) {
            let exchange_order_id = self.exchange_id(uuid)?;
            let terms = oms
                .get_required(uuid)?
                .pending_replace
                .clone()
                .ok_or(OrderError::NoPendingReplace { uuid })?;
            exchange.request_replace(exchange_order_id, terms);
            oms.change_state(uuid, OrderState::ReplaceSent, timestamp)?;
        }
        Ok(())
    }

    /// Send a single risk-accepted order to the venue.
    pub fn send_order(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
        uuid: OrderId,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        // Validates RISK_ACCEPTED -> SENT (and the market gate) up front, so
        // nothing reaches the venue on a bad edge.
        oms.change_state(uuid, OrderState::Sent, timestamp)?;

        let order = oms.get_required(uuid)?;
        let exchange_order_id = exchange.receive_order(
            order.instrument.clone(),
            order.side,
            order.quantity,
            order.order_type.clone(),
        );

        let broker_order_id = self.next_broker_id;
        self.next_broker_id += 1;
        self.routes.insert(
            broker_order_id,
            Route {
                uuid,
                exchange_order_id,
            },
        );
        self.broker_id_by_uuid.insert(uuid, broker_order_id);
        self.uuid_by_exchange_id.insert(exchange_order_id, uuid);
        oms.set_routing(uuid, broker_order_id, exchange_order_id)?;

        info!(order = %uuid, broker_order_id, exchange_order_id, "order sent");
        Ok(())
    }

    /// Mirror this bar's venue outcomes into the OMS: replace and cancel
    /// resolutions first, then any new fills with their state transitions.
    pub fn process_fills(
        &mut self,
        oms: &mut OrderManager,
        exchange: &mut PaperExchange,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        for (exchange_order_id, accepted) in exchange.take_replace_results() {
            let Some(&uuid) = self.uuid_by_exchange_id.get(&exchange_order_id) else {
                warn!(exchange_order = exchange_order_id, "replace result for unknown order");
                continue;
            };
            if accepted {
                oms.apply_replace(uuid)?;
                oms.change_state(uuid, OrderState::Live, timestamp)?;
                info!(order = %uuid, "replace accepted");
            } else {
                oms.clear_pending_replace(uuid)?;
                oms.change_state(uuid, OrderState::ReplaceRejected, timestamp)?;
                oms.change_state(uuid, OrderState::Live, timestamp)?;
                warn!(order = %uuid, "replace rejected by venue");
            }
        }

        for (exchange_order_id, accepted) in exchange.take_cancel_results() {
            let Some(&uuid) = self.uuid_by_exchange_id.get(&exchange_order_id) else {
                warn!(exchange_order = exchange_order_id, "cancel result for unknown order");
                continue;
            };
            if accepted {
                oms.change_state(uuid, OrderState::Canceled, timestamp)?;
                info!(order = %uuid, "canceled");
            } else {
                oms.change_state(uuid, OrderState::Live, timestamp)?;
                warn!(order = %uuid, "cancel rejected by venue");
            }
        }

        let routes: Vec<Route> = self.routes.values().copied().collect();
        for route in routes {
            self.mirror_order(oms, exchange, route, timestamp)?;
        }
        Ok(())
    }

    fn mirror_order(
        &mut self,
        oms: &mut OrderManager,
        exchange: &PaperExchange,
        route: Route,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        let state = oms.get_required(route.uuid)?.state;
        if !matches!(
            state,
            OrderState::Sent | OrderState::Live | OrderState::PartiallyFilled
        ) {
            return Ok(());
        }
        let Some(paper) = exchange.order(route.exchange_order_id) else {
            return Ok(());
        };

        // First observation of the venue's copy moves SENT -> LIVE.
        if state == OrderState::Sent && paper.state != PaperOrderState::Pending {
            oms.change_state(route.uuid, OrderState::Live, timestamp)?;
        }

        let last_seen = oms
            .get_required(route.uuid)?
            .fills
            .last()
            .map(|f| f.fill_id)
            .unwrap_or(0);
        let new_fills: Vec<_> = paper
            .fills
            .iter()
            .filter(|f| f.fill_id > last_seen)
            .cloned()
            .collect();

        for fill in &new_fills {
            oms.apply_fill(
                route.uuid,
                Fill {
                    fill_id: fill.fill_id,
                    timestamp: fill.timestamp,
                    bartime: fill.bartime,
                    quantity: fill.quantity,
                    price: fill.price,
                    commission: fill.commission,
                    booked: false,
                },
            )?;
        }

        let order = oms.get_required(route.uuid)?;
        let is_fully_filled = order.quantity > 0 && order.fill_quantity == order.quantity;
        let fill_quantity = order.fill_quantity;
        if is_fully_filled {
            oms.change_state(route.uuid, OrderState::Filled, timestamp)?;
            info!(order = %route.uuid, "filled");
        } else if !new_fills.is_empty() {
            oms.change_state(route.uuid, OrderState::PartiallyFilled, timestamp)?;
            info!(
                order = %route.uuid,
                fill_quantity = fill_quantity,
                "partially filled"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeConfig;
    use crate::oms::OrderFilter;
    use chrono::TimeZone;
    use mt_data::{HistoricalDataManager, MarketData};
    use mt_types::{Bar, Frequency, Instrument, Order, OrderType, Replacement, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 15, 0, 0).unwrap()
    }

    fn market_with_bar(
        instrument: &Instrument,
        ts: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        volume: Decimal,
    ) -> HistoricalDataManager {
        let mut mdm = HistoricalDataManager::new();
        mdm.add_series(
            instrument.clone(),
            Frequency::Day,
            vec![Bar::new(
                instrument.clone(),
                ts,
                open,
                high,
                low,
                open,
                volume,
                Frequency::Day,
            )],
        );
        mdm.set_bartime(ts);
        mdm.update(instrument.product_type, Frequency::Day).unwrap();
        mdm
    }

    fn accepted_order(oms: &mut OrderManager, quantity: u64, price: Decimal) -> OrderId {
        let order = Order::new(
            Uuid::new_v4(),
            "strat".to_string(),
            Uuid::new_v4(),
            "strat".to_string(),
            Instrument::stock("TEST"),
            Side::Buy,
            quantity,
            OrderType::Limit { price },
            t(2),
        );
        let uuid = oms.new_order(order).unwrap();
        oms.change_state(uuid, OrderState::Staged, t(2)).unwrap();
        oms.change_state(uuid, OrderState::RiskAccepted, t(2)).unwrap();
        uuid
    }

    #[test]
    fn test_send_order_assigns_ids_and_transitions() {
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::with_defaults();
        let mut broker = PaperBroker::new();
        let uuid = accepted_order(&mut oms, 100, dec!(10));

        broker.send_orders(&mut oms, &mut exchange, t(2)).unwrap();

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.state, OrderState::Sent);
        assert_eq!(order.broker_order_id, Some(1));
        assert!(order.exchange_order_id.is_some());
        assert_eq!(broker.broker_order_id(uuid), Some(1));
    }

    #[test]
    fn test_send_order_requires_risk_accepted() {
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::with_defaults();
        let mut broker = PaperBroker::new();

        let order = Order::new(
            Uuid::new_v4(),
            "strat".to_string(),
            Uuid::new_v4(),
            "strat".to_string(),
            Instrument::stock("TEST"),
            Side::Buy,
            100,
            OrderType::Market,
            t(2),
        );
        let uuid = oms.new_order(order).unwrap();

        let result = broker.send_order(&mut oms, &mut exchange, uuid, t(2));
        assert!(result.is_err());
        assert_eq!(oms.get(uuid).unwrap().state, OrderState::Created);
    }

    #[test]
    fn test_fill_mirroring_full_lifecycle() {
        let instrument = Instrument::stock("TEST");
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::with_defaults();
        let mut broker = PaperBroker::new();
        let uuid = accepted_order(&mut oms, 100, dec!(10.0));

        // Bar T2: sent and queued, no fills; first observation -> LIVE.
        broker.send_orders(&mut oms, &mut exchange, t(2)).unwrap();
        let market = market_with_bar(&instrument, t(2), dec!(10.3), dec!(10.4), dec!(10.2), dec!(1000));
        exchange.process_orders(&market, t(2));
        broker.process_fills(&mut oms, &mut exchange, t(2)).unwrap();
        assert_eq!(oms.get(uuid).unwrap().state, OrderState::Live);

        // Bar T3: marketable, full fill mirrored.
        let market = market_with_bar(&instrument, t(3), dec!(9.9), dec!(10.1), dec!(9.8), dec!(1000));
        exchange.process_orders(&market, t(3));
        broker.process_fills(&mut oms, &mut exchange, t(3)).unwrap();

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.fill_quantity, 100);
        assert_eq!(order.fill_price, Some(dec!(9.9)));
        assert_eq!(order.commission, dec!(-1.00));
        assert_eq!(order.booked, Some(false));
    }

    #[test]
    fn test_partial_fill_transition() {
        let instrument = Instrument::stock("TEST");
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::new(ExchangeConfig {
            fill_multiplier: dec!(0.6),
            ..Default::default()
        });
        let mut broker = PaperBroker::new();
        let uuid = accepted_order(&mut oms, 100, dec!(10.0));

        broker.send_orders(&mut oms, &mut exchange, t(2)).unwrap();
        let market = market_with_bar(&instrument, t(2), dec!(10.3), dec!(10.4), dec!(10.2), dec!(100));
        exchange.process_orders(&market, t(2));
        broker.process_fills(&mut oms, &mut exchange, t(2)).unwrap();

        let market = market_with_bar(&instrument, t(3), dec!(9.9), dec!(10.1), dec!(9.8), dec!(100));
        exchange.process_orders(&market, t(3));
        broker.process_fills(&mut oms, &mut exchange, t(3)).unwrap();

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.fill_quantity, 60);
        assert_eq!(order.remaining(), 40);
    }

    #[test]
    fn test_cancel_roundtrip() {
        let instrument = Instrument::stock("TEST");
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::with_defaults();
        let mut broker = PaperBroker::new();
        let uuid = accepted_order(&mut oms, 100, dec!(5.0)); // deep, never fills

        broker.send_orders(&mut oms, &mut exchange, t(2)).unwrap();
        let market = market_with_bar(&instrument, t(2), dec!(10.0), dec!(10.1), dec!(9.9), dec!(1000));
        exchange.process_orders(&market, t(2));
        broker.process_fills(&mut oms, &mut exchange, t(2)).unwrap();
        assert_eq!(oms.get(uuid).unwrap().state, OrderState::Live);

        // Strategy requests the cancel; broker forwards next send pass.
        oms.change_state(uuid, OrderState::CancelRequested, t(3)).unwrap();
        broker.send_orders(&mut oms, &mut exchange, t(3)).unwrap();
        assert_eq!(oms.get(uuid).unwrap().state, OrderState::CancelSent);

        let market = market_with_bar(&instrument, t(3), dec!(10.0), dec!(10.1), dec!(9.9), dec!(1000));
        exchange.process_orders(&market, t(3));
        broker.process_fills(&mut oms, &mut exchange, t(3)).unwrap();

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.state, OrderState::Canceled);
        let states: Vec<OrderState> = order.state_history.iter().map(|s| s.state).collect();
        assert!(states.windows(3).any(|w| w
            == [
                OrderState::CancelRequested,
                OrderState::CancelSent,
                OrderState::Canceled
            ]));
    }

    #[test]
    fn test_replace_accepted_roundtrip() {
        let instrument = Instrument::stock("TEST");
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::with_defaults();
        let mut broker = PaperBroker::new();
        let uuid = accepted_order(&mut oms, 100, dec!(5.0));

        broker.send_orders(&mut oms, &mut exchange, t(2)).unwrap();
        let market = market_with_bar(&instrument, t(2), dec!(10.0), dec!(10.1), dec!(9.9), dec!(1000));
        exchange.process_orders(&market, t(2));
        broker.process_fills(&mut oms, &mut exchange, t(2)).unwrap();

        oms.set_pending_replace(
            uuid,
            Replacement {
                quantity: 80,
                order_type: OrderType::Limit { price: dec!(6.0) },
            },
        )
        .unwrap();
        oms.change_state(uuid, OrderState::ReplaceRequested, t(3)).unwrap();
        broker.send_orders(&mut oms, &mut exchange, t(3)).unwrap();
        assert_eq!(oms.get(uuid).unwrap().state, OrderState::ReplaceSent);

        let market = market_with_bar(&instrument, t(3), dec!(10.0), dec!(10.1), dec!(9.9), dec!(1000));
        exchange.process_orders(&market, t(3));
        broker.process_fills(&mut oms, &mut exchange, t(3)).unwrap();

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.state, OrderState::Live);
        assert_eq!(order.quantity, 80);
        assert_eq!(order.order_type.limit_price(), Some(dec!(6.0)));
        assert_eq!(order.replaces.len(), 2);
        assert!(order.pending_replace.is_none());
    }

    #[test]
    fn test_no_duplicate_fill_mirroring() {
        let instrument = Instrument::stock("TEST");
        let mut oms = OrderManager::new();
        let mut exchange = PaperExchange::new(ExchangeConfig {
            fill_multiplier: dec!(0.3),
            ..Default::default()
        });
        let mut broker = PaperBroker::new();
        let uuid = accepted_order(&mut oms, 100, dec!(10.0));

        broker.send_orders(&mut oms, &mut exchange, t(2)).unwrap();
        let market = market_with_bar(&instrument, t(2), dec!(10.3), dec!(10.4), dec!(10.2), dec!(100));
        exchange.process_orders(&market, t(2));
        broker.process_fills(&mut oms, &mut exchange, t(2)).unwrap();

        for day in 3..5 {
            let market =
                market_with_bar(&instrument, t(day), dec!(9.9), dec!(10.1), dec!(9.8), dec!(100));
            exchange.process_orders(&market, t(day));
            broker.process_fills(&mut oms, &mut exchange, t(day)).unwrap();
            // Mirroring twice must not duplicate fills.
            broker.process_fills(&mut oms, &mut exchange, t(day)).unwrap();
        }

        let order = oms.get(uuid).unwrap();
        assert_eq!(order.fills.len(), 2);
        assert_eq!(order.fill_quantity, 60);
        assert_eq!(
            oms.orders_list(&OrderFilter::default())[0].fill_quantity,
            60
        );
    }
}
