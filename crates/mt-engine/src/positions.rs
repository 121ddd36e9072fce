//! Position manager: books fills into per-strategy positions and computes
//! trade, position and net PnL.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::oms::OrderManager;
use mt_data::MarketData;
use mt_types::{EngineResult, Instrument, Order, OrderError, Side};

/// One row of the position table, keyed by (strategy, product, symbol).
///
/// PnL identities: `trade_pnl = buy_pnl + sell_pnl`,
/// `gross_pnl = trade_pnl + position_pnl`, `net_pnl = gross_pnl + commission`
/// (commissions are negative).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRow {
    pub strategy_id: String,
    pub instrument: Instrument,
    /// Position carried into the session
    pub start_position: i64,
    pub current_position: i64,
    /// Signed traded quantity since session start
    pub net_quantity: i64,
    pub buy_quantity: u64,
    pub sell_quantity: u64,
    pub buy_avg_price: Decimal,
    pub sell_avg_price: Decimal,
    pub buy_pnl: Decimal,
    pub sell_pnl: Decimal,
    pub trade_pnl: Decimal,
    pub position_pnl: Decimal,
    pub gross_pnl: Decimal,
    pub commission: Decimal,
    pub net_pnl: Decimal,
    pub prior_close_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
}

impl PositionRow {
    fn new(strategy_id: &str, instrument: Instrument) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            instrument,
            start_position: 0,
            current_position: 0,
            net_quantity: 0,
            buy_quantity: 0,
            sell_quantity: 0,
            buy_avg_price: Decimal::ZERO,
            sell_avg_price: Decimal::ZERO,
            buy_pnl: Decimal::ZERO,
            sell_pnl: Decimal::ZERO,
            trade_pnl: Decimal::ZERO,
            position_pnl: Decimal::ZERO,
            gross_pnl: Decimal::ZERO,
            commission: Decimal::ZERO,
            net_pnl: Decimal::ZERO,
            prior_close_price: None,
            current_price: None,
        }
    }
}

/// One booked trade, kept for the session trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub originator_id: String,
    pub strategy_id: String,
    pub timestamp: DateTime<Utc>,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub commission: Decimal,
}

/// Books fills into positions; the only mutator of position rows.
#[derive(Debug, Default)]
pub struct PositionManager {
    rows: BTreeMap<(String, Instrument), PositionRow>,
    trades: Vec<Trade>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trade and update the keyed row.
    #[allow(clippy::too_many_arguments)]
    pub fn enter_trade(
        &mut self,
        originator_id: &str,
        strategy_id: &str,
        timestamp: DateTime<Utc>,
        instrument: &Instrument,
        side: Side,
        quantity: u64,
        price: Decimal,
        commission: Decimal,
    ) {
        let row = self
            .rows
            .entry((strategy_id.to_string(), instrument.clone()))
            .or_insert_with(|| PositionRow::new(strategy_id, instrument.clone()));

        match side {
            Side::Buy => {
                let total = Decimal::from(row.buy_quantity) * row.buy_avg_price
                    + Decimal::from(quantity) * price;
                row.buy_quantity += quantity;
                row.buy_avg_price = total / Decimal::from(row.buy_quantity);
            }
            Side::Sell => {
                let total = Decimal::from(row.sell_quantity) * row.sell_avg_price
                    + Decimal::from(quantity) * price;
                row.sell_quantity += quantity;
                row.sell_avg_price = total / Decimal::from(row.sell_quantity);
            }
        }
        row.commission += commission;
        row.net_quantity = row.buy_quantity as i64 - row.sell_quantity as i64;
        row.current_position = row.start_position + row.net_quantity;

        debug!(
            strategy = strategy_id,
            instrument = %instrument,
            side = %side,
            quantity,
            price = %price,
            position = row.current_position,
            "trade booked"
        );
        self.trades.push(Trade {
            originator_id: originator_id.to_string(),
            strategy_id: strategy_id.to_string(),
            timestamp,
            instrument: instrument.clone(),
            side,
            quantity,
            price,
            commission,
        });
    }

    /// Book a closed order's accumulated fills as one trade.
    pub fn enter_trade_from_order(&mut self, order: &Order) -> EngineResult<()> {
        if !order.closed || order.fills.is_empty() {
            return Err(OrderError::NotBookable {
                uuid: order.uuid,
                state: order.state,
            }
            .into());
        }
        let price = order.fill_price.ok_or(OrderError::NotBookable {
            uuid: order.uuid,
            state: order.state,
        })?;
        let timestamp = order
            .fills
            .last()
            .map(|f| f.timestamp)
            .unwrap_or(order.create_timestamp);

        self.enter_trade(
            &order.originator_id,
            &order.strategy_id,
            timestamp,
            &order.instrument,
            order.side,
            order.fill_quantity,
            price,
            order.commission,
        );
        Ok(())
    }

    /// Book every unbooked closed order in the OMS.  Idempotent through the
    /// order `booked` flag.
    pub fn book_fills(&mut self, oms: &mut OrderManager) -> EngineResult<usize> {
        let pending = oms.to_be_booked();
        let booked = pending.len();
        for uuid in pending {
            let order = oms.get_required(uuid)?.clone();
            self.enter_trade_from_order(&order)?;
            oms.set_booked(uuid, true)?;
        }
        if booked > 0 {
            info!(booked, "booked fills into positions");
        }
        Ok(booked)
    }

    /// Recompute PnL for every row from current market prices.  Rows without
    /// a current price are left untouched.
    pub fn update_pnl(&mut self, market: &dyn MarketData) {
        for row in self.rows.values_mut() {
            let Some(current_price) = market.current_price(&row.instrument) else {
                debug!(instrument = %row.instrument, "no price; pnl unchanged");
                continue;
            };
            row.current_price = Some(current_price);
            row.prior_close_price = market.prior_close(&row.instrument);

            row.buy_pnl = if row.buy_quantity == 0 {
                Decimal::ZERO
            } else {
                (current_price - row.buy_avg_price) * Decimal::from(row.buy_quantity)
            };
            row.sell_pnl = if row.sell_quantity == 0 {
                Decimal::ZERO
            } else {
                (row.sell_avg_price - current_price) * Decimal::from(row.sell_quantity)
            };
            row.trade_pnl = row.buy_pnl + row.sell_pnl;

            row.position_pnl = match (row.start_position, row.prior_close_price) {
                (0, _) => Decimal::ZERO,
                (start, Some(prior_close)) => {
                    (current_price - prior_close) * Decimal::from(start)
                }
                (_, None) => Decimal::ZERO,
            };
            row.gross_pnl = row.trade_pnl + row.position_pnl;
            row.net_pnl = row.gross_pnl + row.commission;
        }
    }

    /// The position table, sorted by (strategy, product, symbol).
    pub fn positions(&self) -> Vec<&PositionRow> {
        self.rows.values().collect()
    }

    /// Cloned rows for persistence.
    pub fn snapshot(&self) -> Vec<PositionRow> {
        self.rows.values().cloned().collect()
    }

    pub fn row(&self, strategy_id: &str, instrument: &Instrument) -> Option<&PositionRow> {
        self.rows
            .get(&(strategy_id.to_string(), instrument.clone()))
    }

    pub fn position_quantity(&self, strategy_id: &str, instrument: &Instrument) -> i64 {
        self.row(strategy_id, instrument)
            .map(|r| r.current_position)
            .unwrap_or(0)
    }

    /// Seed the position carried into the session.
    pub fn set_start_position(
        &mut self,
        strategy_id: &str,
        instrument: &Instrument,
        quantity: i64,
    ) {
        let row = self
            .rows
            .entry((strategy_id.to_string(), instrument.clone()))
            .or_insert_with(|| PositionRow::new(strategy_id, instrument.clone()));
        row.start_position = quantity;
        row.current_position = row.start_position + row.net_quantity;
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }
}
