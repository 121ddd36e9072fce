use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::OrderError;
use crate::market::Instrument;

/// Unique order identifier
pub type OrderId = Uuid;

/// Direction of an order (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = OrderError;

    /// Canonicalizes the inputs accepted at the boundary: `b`, `B`, `buy`,
    /// `BUY`, `s`, `S`, `sell`, `SELL`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "b" | "buy" => Ok(Side::Buy),
            "s" | "sell" => Ok(Side::Sell),
            _ => Err(OrderError::InvalidSide {
                value: s.to_string(),
            }),
        }
    }
}

/// Order types supported by the engine.  Type-dependent parameters live on
/// the variant; their JSON projection is the `details` half of the order
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

impl OrderType {
    pub fn kind(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit { .. } => "LIMIT",
        }
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderType::Market => None,
            OrderType::Limit { price } => Some(*price),
        }
    }

    pub fn details_json(&self) -> serde_json::Value {
        match self {
            OrderType::Market => json!({}),
            OrderType::Limit { price } => json!({ "price": price }),
        }
    }
}

/// Order lifecycle states.
///
/// Open states move toward the venue or hold there; closed states are
/// terminal.  Transitions are validated against [`OrderState::successors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Staged,
    RiskAccepted,
    RiskRejected,
    Sent,
    Live,
    CancelRequested,
    CancelSent,
    ReplaceRequested,
    ReplaceSent,
    ReplaceRejected,
    PartiallyFilled,
    Rejected,
    Filled,
    Canceled,
}

impl OrderState {
    /// Terminal states.  Entering any of these sets `closed` on the order.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            OrderState::RiskRejected
                | OrderState::Rejected
                | OrderState::Filled
                | OrderState::Canceled
        )
    }

    /// Request/sent states that must resolve within one bar.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            OrderState::CancelRequested
                | OrderState::CancelSent
                | OrderState::ReplaceRequested
                | OrderState::ReplaceSent
                | OrderState::ReplaceRejected
        )
    }

    /// The static transition table.  `Staged -> Filled` is the internal-cross
    /// edge used when a portfolio crosses two opposing orders off-book.
    pub fn successors(self) -> &'static [OrderState] {
        use OrderState::*;
        match self {
            Created => &[Staged],
            Staged => &[RiskAccepted, RiskRejected, Filled],
            RiskAccepted => &[Sent, Rejected],
            Sent => &[Live, Rejected, Canceled, Filled, PartiallyFilled],
            Live => &[
                PartiallyFilled,
                Filled,
                CancelRequested,
                ReplaceRequested,
                Canceled,
            ],
            PartiallyFilled => &[
                PartiallyFilled,
                Filled,
                CancelRequested,
                ReplaceRequested,
                Canceled,
            ],
            CancelRequested => &[CancelSent],
            CancelSent => &[Canceled, Live],
            ReplaceRequested => &[ReplaceSent],
            ReplaceSent => &[Live, ReplaceRejected],
            ReplaceRejected => &[Live],
            RiskRejected | Rejected | Filled | Canceled => &[],
        }
    }

    pub fn may_transition_to(self, next: OrderState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Created => "CREATED",
            OrderState::Staged => "STAGED",
            OrderState::RiskAccepted => "RISK_ACCEPTED",
            OrderState::RiskRejected => "RISK_REJECTED",
            OrderState::Sent => "SENT",
            OrderState::Live => "LIVE",
            OrderState::CancelRequested => "CANCEL_REQUESTED",
            OrderState::CancelSent => "CANCEL_SENT",
            OrderState::ReplaceRequested => "REPLACE_REQUESTED",
            OrderState::ReplaceSent => "REPLACE_SENT",
            OrderState::ReplaceRejected => "REPLACE_REJECTED",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Rejected => "REJECTED",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
        };
        write!(f, "{}", s)
    }
}

/// One entry in an order's append-only state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub timestamp: DateTime<Utc>,
    pub state: OrderState,
}

/// One entry in an order's replacement history (includes the original terms)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replacement {
    pub quantity: u64,
    pub order_type: OrderType,
}

/// One execution applied to an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: u64,
    pub timestamp: DateTime<Utc>,
    pub bartime: DateTime<Utc>,
    pub quantity: u64,
    pub price: Decimal,
    pub commission: Decimal,
    pub booked: bool,
}

/// One trading instruction and its full lifecycle.
///
/// Owned by the order manager once inserted; every other component refers to
/// it by `uuid`.  State is only changed through the order manager, which
/// validates edges against the transition table before calling
/// [`Order::apply_transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub uuid: OrderId,
    pub originator_uuid: Uuid,
    pub originator_id: String,
    pub strategy_uuid: Uuid,
    pub strategy_id: String,
    pub portfolio_uuid: Option<Uuid>,
    pub portfolio_id: Option<String>,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u64,
    pub order_type: OrderType,
    pub state: OrderState,
    pub create_timestamp: DateTime<Utc>,
    pub broker_order_id: Option<u64>,
    pub exchange_order_id: Option<u64>,
    /// Quantity-weighted mean over all fills
    pub fill_price: Option<Decimal>,
    pub fill_quantity: u64,
    pub commission: Decimal,
    /// `None` until the first fill, `Some(false)` while unbooked,
    /// `Some(true)` once the position manager has applied it
    pub booked: Option<bool>,
    pub closed: bool,
    pub reject_reason: Option<String>,
    /// Requested terms while a replace is in flight
    pub pending_replace: Option<Replacement>,
    pub state_history: Vec<StateChange>,
    pub replaces: Vec<Replacement>,
    pub fills: Vec<Fill>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        originator_uuid: Uuid,
        originator_id: String,
        strategy_uuid: Uuid,
        strategy_id: String,
        instrument: Instrument,
        side: Side,
        quantity: u64,
        order_type: OrderType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            originator_uuid,
            originator_id,
            strategy_uuid,
            strategy_id,
            portfolio_uuid: None,
            portfolio_id: None,
            instrument,
            side,
            quantity,
            order_type: order_type.clone(),
            state: OrderState::Created,
            create_timestamp: timestamp,
            broker_order_id: None,
            exchange_order_id: None,
            fill_price: None,
            fill_quantity: 0,
            commission: Decimal::ZERO,
            booked: None,
            closed: false,
            reject_reason: None,
            pending_replace: None,
            state_history: vec![StateChange {
                timestamp,
                state: OrderState::Created,
            }],
            replaces: vec![Replacement {
                quantity,
                order_type,
            }],
            fills: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.fill_quantity)
    }

    /// Record a validated transition.  Callers (the order manager) have
    /// already checked the edge against the transition table.
    pub fn apply_transition(&mut self, timestamp: DateTime<Utc>, state: OrderState) {
        self.state_history.push(StateChange { timestamp, state });
        self.state = state;
        self.closed = state.is_closed();
    }

    /// Append a fill and recompute the aggregates.
    pub fn apply_fill(&mut self, fill: Fill) -> Result<(), OrderError> {
        if fill.quantity == 0 {
            return Err(OrderError::ZeroQuantity);
        }
        if fill.quantity > self.remaining() {
            return Err(OrderError::FillExceedsQuantity {
                uuid: self.uuid,
                fill_quantity: fill.quantity,
                remaining: self.remaining(),
            });
        }
        self.fills.push(fill);
        self.fill_quantity = self.fills.iter().map(|f| f.quantity).sum();
        let notional: Decimal = self
            .fills
            .iter()
            .map(|f| Decimal::from(f.quantity) * f.price)
            .sum();
        self.fill_price = Some(notional / Decimal::from(self.fill_quantity));
        self.commission = self.fills.iter().map(|f| f.commission).sum();
        if self.booked.is_none() {
            self.booked = Some(false);
        }
        Ok(())
    }

    /// Apply an accepted replacement: the latest terms become current and the
    /// replacement history grows by one entry.
    pub fn apply_replace(&mut self, replacement: Replacement) {
        self.quantity = replacement.quantity;
        self.order_type = replacement.order_type.clone();
        self.replaces.push(replacement);
        self.pending_replace = None;
    }

    /// Canonical string for cross-run comparison:
    /// `uuid|create_timestamp|product_type|symbol|side|quantity|type|detailsJSON`
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.uuid,
            self.create_timestamp.to_rfc3339(),
            self.instrument.product_type,
            self.instrument.symbol,
            self.side,
            self.quantity,
            self.order_type.kind(),
            self.order_type.details_json(),
        )
    }
}
