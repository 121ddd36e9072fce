use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::market::{Instrument, ProductType};
use crate::orders::OrderState;

/// Order lifecycle and order-manager errors
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("invalid transition for order {uuid}: {from} -> {to}")]
    InvalidTransition {
        uuid: Uuid,
        from: OrderState,
        to: OrderState,
    },

    #[error("duplicate order uuid: {uuid}")]
    DuplicateUuid { uuid: Uuid },

    #[error("order not found: {uuid}")]
    NotFound { uuid: Uuid },

    #[error("order {uuid} cannot be inserted in state {state}")]
    NotNew { uuid: Uuid, state: OrderState },

    #[error("market is closed for product type {product_type}")]
    MarketClosed { product_type: ProductType },

    #[error("fill of {fill_quantity} exceeds remaining {remaining} on order {uuid}")]
    FillExceedsQuantity {
        uuid: Uuid,
        fill_quantity: u64,
        remaining: u64,
    },

    #[error("order quantity must be positive")]
    ZeroQuantity,

    #[error("invalid side: {value}")]
    InvalidSide { value: String },

    #[error("order {uuid} has no pending replacement")]
    NoPendingReplace { uuid: Uuid },

    #[error("order {uuid} in state {state} cannot be booked")]
    NotBookable { uuid: Uuid, state: OrderState },
}

/// Market-data errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("no bar for {instrument} at {bartime}")]
    NoData {
        instrument: Instrument,
        bartime: DateTime<Utc>,
    },

    #[error("unknown instrument: {instrument}")]
    UnknownInstrument { instrument: Instrument },

    #[error("market data parse error: {message}")]
    Parse { message: String },

    #[error("market data IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Strategy-related errors
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("strategy {strategy_id} callback failed: {message}")]
    Callback {
        strategy_id: String,
        message: String,
    },

    #[error("strategy not found: {strategy_id}")]
    NotFound { strategy_id: String },

    #[error("strategy {strategy_id} is not bound to portfolio {portfolio_id}")]
    NotBound {
        strategy_id: String,
        portfolio_id: String,
    },
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("persistence IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no snapshot for {source_id} at {timestamp}")]
    NotFound {
        source_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Pipeline protocol violations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("order {uuid} stuck in transient state {state} since {since}")]
    StuckOrder {
        uuid: Uuid,
        state: OrderState,
        since: DateTime<Utc>,
    },

    #[error("no bars scheduled between {start} and {end}")]
    EmptySchedule {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Main error type for the Metronome engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("order error: {0}")]
    Order(#[from] OrderError),

    #[error("market data error: {0}")]
    MarketData(#[from] MarketDataError),

    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::OrderState;

    #[test]
    fn test_error_display() {
        let uuid = Uuid::new_v4();
        let err = OrderError::InvalidTransition {
            uuid,
            from: OrderState::Created,
            to: OrderState::Live,
        };
        let text = err.to_string();
        assert!(text.contains("CREATED"));
        assert!(text.contains("LIVE"));
        assert!(text.contains(&uuid.to_string()));
    }

    #[test]
    fn test_error_conversion() {
        let order_error = OrderError::DuplicateUuid {
            uuid: Uuid::new_v4(),
        };
        let engine_error: EngineError = order_error.into();
        match engine_error {
            EngineError::Order(_) => (),
            _ => panic!("expected Order error"),
        }
    }
}
