//! Metronome engine: the bar-driven order pipeline.
//!
//! A [`Runner`] advances the bar clock and invokes the [`EventProcessor`],
//! which drives strategies, the [`Portfolio`], [`RiskEngine`],
//! [`PaperBroker`], [`PaperExchange`] and [`PositionManager`] through one
//! bar's worth of work in a fixed order.

pub mod broker;
pub mod demo;
pub mod exchange;
pub mod oms;
pub mod persistence;
pub mod portfolio;
pub mod positions;
pub mod processor;
pub mod risk;
pub mod runner;
pub mod strategy;

pub use broker::PaperBroker;
pub use exchange::{ExchangeConfig, PaperExchange};
pub use oms::{OrderFilter, OrderManager};
pub use persistence::{JsonFileStore, MemoryStore, Persistence};
pub use portfolio::{Portfolio, PortfolioConfig};
pub use positions::{PositionManager, PositionRow, Trade};
pub use processor::{EventProcessor, ProcessorConfig};
pub use risk::{
    MarketOpenRule, MaxNotionalRule, MaxPositionRule, RiskCheckResult, RiskContext, RiskEngine,
    RiskRule,
};
pub use runner::{bar_schedule, RunSummary, Runner, RunnerConfig};
pub use strategy::{
    IntentBook, Strategy, StrategyConfig, StrategyContext, SymbolSubscription,
};
