//! Paper exchange: a simulated venue with a deliberately simple fill model.
//!
//! Orders are accepted by value (the venue never sees the engine's `Order`
//! entity) and matched against the current bar.  An order received during a
//! bar only becomes live on the next bar tick; the available liquidity per
//! (symbol, bar) is `floor(bar.volume * fill_multiplier)`, consumed in book
//! insertion order.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use mt_data::MarketData;
use mt_types::{Instrument, OrderType, ProductType, Replacement, Side};

/// Venue-assigned order identifier (monotonic, time-derived)
pub type ExchangeOrderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperOrderState {
    /// Received this bar; becomes live on the next bar tick
    Pending,
    Live,
    Filled,
    Canceled,
}

/// Execution recorded on the venue side
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub fill_id: u64,
    pub timestamp: DateTime<Utc>,
    pub bartime: DateTime<Utc>,
    pub quantity: u64,
    pub price: Decimal,
    pub commission: Decimal,
}

/// The venue's own order record
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub exchange_order_id: ExchangeOrderId,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u64,
    pub order_type: OrderType,
    pub state: PaperOrderState,
    pub fills: Vec<PaperFill>,
    pub close_bar_timestamp: Option<DateTime<Utc>>,
}

impl PaperOrder {
    pub fn filled_quantity(&self) -> u64 {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    pub fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.filled_quantity())
    }
}

/// Construction-time parameters, all overridable.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Fraction of a bar's volume available to fill orders (<= 1)
    pub fill_multiplier: Decimal,
    /// Per-share fee by product type; commissions are recorded as negative
    /// numbers (costs)
    pub fees_per_share: HashMap<ProductType, Decimal>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        let mut fees_per_share = HashMap::new();
        fees_per_share.insert(ProductType::Stock, Decimal::new(1, 2)); // $0.01
        Self {
            fill_multiplier: Decimal::ONE,
            fees_per_share,
        }
    }
}

impl ExchangeConfig {
    fn fee_per_share(&self, product_type: ProductType) -> Decimal {
        self.fees_per_share
            .get(&product_type)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// Simulated venue holding its own book of order copies.
#[derive(Debug)]
pub struct PaperExchange {
    config: ExchangeConfig,
    book: BTreeMap<ExchangeOrderId, PaperOrder>,
    next_order_id: ExchangeOrderId,
    next_fill_id: u64,
    pending_cancels: Vec<ExchangeOrderId>,
    pending_replaces: Vec<(ExchangeOrderId, Replacement)>,
    cancel_results: Vec<(ExchangeOrderId, bool)>,
    replace_results: Vec<(ExchangeOrderId, bool)>,
}

impl PaperExchange {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            book: BTreeMap::new(),
            // Time-derived so ids stay monotonic across venue restarts.
            next_order_id: Utc::now().timestamp_millis() as u64 * 1_000,
            next_fill_id: 1,
            pending_cancels: Vec::new(),
            pending_replaces: Vec::new(),
            cancel_results: Vec::new(),
            replace_results: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ExchangeConfig::default())
    }

    /// Accept an order by value and mint its venue id.  The order is queued
    /// and only participates in matching from the next bar on.
    pub fn receive_order(
        &mut self,
        instrument: Instrument,
        side: Side,
        quantity: u64,
        order_type: OrderType,
    ) -> ExchangeOrderId {
        let exchange_order_id = self.next_order_id;
        self.next_order_id += 1;

        debug!(exchange_order = exchange_order_id, instrument = %instrument, side = %side, quantity, "order received");
        self.book.insert(
            exchange_order_id,
            PaperOrder {
                exchange_order_id,
                instrument,
                side,
                quantity,
                order_type,
                state: PaperOrderState::Pending,
                fills: Vec::new(),
                close_bar_timestamp: None,
            },
        );
        exchange_order_id
    }

    pub fn request_cancel(&mut self, exchange_order_id: ExchangeOrderId) {
        self.pending_cancels.push(exchange_order_id);
    }

    pub fn request_replace(&mut self, exchange_order_id: ExchangeOrderId, terms: Replacement) {
        self.pending_replaces.push((exchange_order_id, terms));
    }

    /// Venue outcomes for cancels resolved this bar (`true` = canceled).
    pub fn take_cancel_results(&mut self) -> Vec<(ExchangeOrderId, bool)> {
        std::mem::take(&mut self.cancel_results)
    }

    /// Venue outcomes for replaces resolved this bar (`true` = accepted).
    pub fn take_replace_results(&mut self) -> Vec<(ExchangeOrderId, bool)> {
        std::mem::take(&mut self.replace_results)
    }

    pub fn order(&self, exchange_order_id: ExchangeOrderId) -> Option<&PaperOrder> {
        self.book.get(&exchange_order_id)
    }

    /// One bar of venue work: resolve queued replaces and cancels, match live
    /// orders against the current bars, then activate orders received during
    /// this bar.
    pub fn process_orders(&mut self, market: &dyn MarketData, bartime: DateTime<Utc>) {
        self.resolve_replaces(bartime);
        self.resolve_cancels(bartime);
        self.match_live_orders(market, bartime);

        for order in self.book.values_mut() {
            if order.state == PaperOrderState::Pending {
                order.state = PaperOrderState::Live;
            }
        }
    }

    fn resolve_replaces(&mut self, bartime: DateTime<Utc>) {
        for (id, terms) in std::mem::take(&mut self.pending_replaces) {
            let accepted = match self.book.get_mut(&id) {
                Some(order)
                    if matches!(
                        order.state,
                        PaperOrderState::Pending | PaperOrderState::Live
                    ) && terms.quantity >= order.filled_quantity() =>
                {
                    order.quantity = terms.quantity;
                    order.order_type = terms.order_type.clone();
                    if order.remaining() == 0 {
                        order.state = PaperOrderState::Filled;
                        order.close_bar_timestamp = Some(bartime);
                    }
                    true
                }
                _ => false,
            };
            debug!(exchange_order = id, accepted, "replace resolved");
            self.replace_results.push((id, accepted));
        }
    }

    fn resolve_cancels(&mut self, bartime: DateTime<Utc>) {
        for id in std::mem::take(&mut self.pending_cancels) {
            let accepted = match self.book.get_mut(&id) {
                Some(order)
                    if matches!(
                        order.state,
                        PaperOrderState::Pending | PaperOrderState::Live
                    ) =>
                {
                    order.state = PaperOrderState::Canceled;
                    order.close_bar_timestamp = Some(bartime);
                    true
                }
                _ => false,
            };
            debug!(exchange_order = id, accepted, "cancel resolved");
            self.cancel_results.push((id, accepted));
        }
    }

    fn match_live_orders(&mut self, market: &dyn MarketData, bartime: DateTime<Utc>) {
        // Shared liquidity budget per instrument for this bar; None marks an
        // instrument with no bar data this step.
        let mut budgets: HashMap<Instrument, Option<u64>> = HashMap::new();
        let ids: Vec<ExchangeOrderId> = self.book.keys().copied().collect();

        for id in ids {
            let (instrument, side, order_type, remaining, state) = match self.book.get(&id) {
                Some(o) => (
                    o.instrument.clone(),
                    o.side,
                    o.order_type.clone(),
                    o.remaining(),
                    o.state,
                ),
                None => continue,
            };
            if state != PaperOrderState::Live || remaining == 0 {
                continue;
            }

            let budget = budgets.entry(instrument.clone()).or_insert_with(|| {
                let budget = market.current_bar(&instrument).map(|bar| {
                    (bar.volume * self.config.fill_multiplier)
                        .floor()
                        .to_u64()
                        .unwrap_or(0)
                });
                if budget.is_none() {
                    warn!(instrument = %instrument, "no market data; skipping instrument this bar");
                }
                budget
            });
            let Some(available) = budget else { continue };
            if *available == 0 {
                continue;
            }
            let Some(bar) = market.current_bar(&instrument) else {
                continue;
            };

            let price = match (&order_type, side) {
                (OrderType::Market, _) => bar.open,
                (OrderType::Limit { price }, Side::Buy) if bar.low <= *price => {
                    (*price).min(bar.open)
                }
                (OrderType::Limit { price }, Side::Sell) if bar.high >= *price => {
                    (*price).max(bar.open)
                }
                _ => continue, // not marketable this bar
            };

            let quantity = remaining.min(*available);
            *available -= quantity;

            let commission =
                -(Decimal::from(quantity) * self.config.fee_per_share(instrument.product_type));
            let fill_id = self.next_fill_id;
            self.next_fill_id += 1;

            if let Some(order) = self.book.get_mut(&id) {
                order.fills.push(PaperFill {
                    fill_id,
                    timestamp: bartime,
                    bartime,
                    quantity,
                    price,
                    commission,
                });
                if order.remaining() == 0 {
                    order.state = PaperOrderState::Filled;
                    order.close_bar_timestamp = Some(bartime);
                }
                info!(
                    exchange_order = id,
                    instrument = %instrument,
                    side = %side,
                    quantity,
                    price = %price,
                    "fill"
                );
            }
        }
    }

    /// Test hook: force a fill outside the matching loop.  Must not be used
    /// from the pipeline.
    pub fn fill_order(
        &mut self,
        exchange_order_id: ExchangeOrderId,
        quantity: u64,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let fill_id = self.next_fill_id;
        self.next_fill_id += 1;
        match self.book.get_mut(&exchange_order_id) {
            Some(order) if quantity <= order.remaining() => {
                let commission = -(Decimal::from(quantity)
                    * self.config.fee_per_share(order.instrument.product_type));
                order.fills.push(PaperFill {
                    fill_id,
                    timestamp,
                    bartime: timestamp,
                    quantity,
                    price,
                    commission,
                });
                if order.remaining() == 0 {
                    order.state = PaperOrderState::Filled;
                    order.close_bar_timestamp = Some(timestamp);
                }
                true
            }
            _ => false,
        }
    }
}
