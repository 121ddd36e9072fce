//! Pre-trade risk: the gate between portfolio-staged orders and the broker.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::oms::{OrderFilter, OrderManager};
use crate::portfolio::Portfolio;
use crate::positions::PositionManager;
use mt_data::MarketData;
use mt_types::{EngineResult, Order, OrderState};

/// Result of a risk check: either the order passes or it is rejected with a
/// human-readable reason.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskCheckResult {
    Approved,
    Rejected { reason: String },
}

impl RiskCheckResult {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskCheckResult::Approved)
    }
}

/// Read-only snapshot handed to each rule.
pub struct RiskContext<'a> {
    pub oms: &'a OrderManager,
    pub positions: &'a PositionManager,
    pub market: &'a dyn MarketData,
}

/// A pure predicate over (order, snapshot).
pub trait RiskRule {
    fn name(&self) -> &'static str;
    fn check(&self, order: &Order, ctx: &RiskContext<'_>) -> RiskCheckResult;
}

/// Reject orders whose product's market is closed.
#[derive(Debug, Default)]
pub struct MarketOpenRule;

impl RiskRule for MarketOpenRule {
    fn name(&self) -> &'static str {
        "market_open"
    }

    fn check(&self, order: &Order, ctx: &RiskContext<'_>) -> RiskCheckResult {
        let product_type = order.instrument.product_type;
        if ctx.oms.is_market_open(product_type) {
            RiskCheckResult::Approved
        } else {
            RiskCheckResult::Rejected {
                reason: format!("market closed for {}", product_type),
            }
        }
    }
}

/// Reject orders whose notional value exceeds a fixed limit.  Limit orders
/// are valued at their limit price, market orders at the last traded price.
#[derive(Debug)]
pub struct MaxNotionalRule {
    pub limit: Decimal,
}

impl RiskRule for MaxNotionalRule {
    fn name(&self) -> &'static str {
        "max_notional"
    }

    fn check(&self, order: &Order, ctx: &RiskContext<'_>) -> RiskCheckResult {
        let Some(price) = order
            .order_type
            .limit_price()
            .or_else(|| ctx.market.current_price(&order.instrument))
        else {
            return RiskCheckResult::Rejected {
                reason: format!("no price available to value {}", order.instrument),
            };
        };
        let notional = Decimal::from(order.quantity) * price;
        if notional > self.limit {
            RiskCheckResult::Rejected {
                reason: format!("order notional {} exceeds limit {}", notional, self.limit),
            }
        } else {
            RiskCheckResult::Approved
        }
    }
}

/// Reject orders that would take the strategy's absolute position past a
/// fixed limit.
#[derive(Debug)]
pub struct MaxPositionRule {
    pub limit: i64,
}

impl RiskRule for MaxPositionRule {
    fn name(&self) -> &'static str {
        "max_position"
    }

    fn check(&self, order: &Order, ctx: &RiskContext<'_>) -> RiskCheckResult {
        let current = ctx
            .positions
            .position_quantity(&order.strategy_id, &order.instrument);
        let resulting = current + order.side.sign() * order.quantity as i64;
        if resulting.abs() > self.limit {
            RiskCheckResult::Rejected {
                reason: format!(
                    "resulting position {} exceeds limit {} for {}",
                    resulting, self.limit, order.instrument
                ),
            }
        } else {
            RiskCheckResult::Approved
        }
    }
}

/// Runs the rule set over staged orders, stopping at the first rejection.
pub struct RiskEngine {
    rules: Vec<Box<dyn RiskRule>>,
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self {
            rules: vec![Box::new(MarketOpenRule)],
        }
    }
}

impl RiskEngine {
    pub fn new(rules: Vec<Box<dyn RiskRule>>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: Box<dyn RiskRule>) -> Self {
        self.rules.push(rule);
        self
    }

    fn evaluate(&self, order: &Order, ctx: &RiskContext<'_>) -> RiskCheckResult {
        for rule in &self.rules {
            if let RiskCheckResult::Rejected { reason } = rule.check(order, ctx) {
                return RiskCheckResult::Rejected {
                    reason: format!("{}: {}", rule.name(), reason),
                };
            }
        }
        RiskCheckResult::Approved
    }

    /// Accept or reject every order the portfolio has staged.
    pub fn process_portfolio_orders(
        &self,
        oms: &mut OrderManager,
        positions: &PositionManager,
        market: &dyn MarketData,
        portfolio: &Portfolio,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        let staged = oms.uuids(&OrderFilter {
            state: Some(OrderState::Staged),
            portfolio_id: Some(portfolio.portfolio_id().to_string()),
            ..Default::default()
        });

        for uuid in staged {
            let verdict = {
                let order = oms.get_required(uuid)?;
                let ctx = RiskContext {
                    oms,
                    positions,
                    market,
                };
                self.evaluate(order, &ctx)
            };
            match verdict {
                RiskCheckResult::Approved => {
                    oms.change_state(uuid, OrderState::RiskAccepted, timestamp)?;
                }
                RiskCheckResult::Rejected { reason } => {
                    oms.set_reject_reason(uuid, &reason)?;
                    oms.change_state(uuid, OrderState::RiskRejected, timestamp)?;
                    info!(order = %uuid, reason = %reason, "risk rejected");
                }
            }
        }
        Ok(())
    }
}
