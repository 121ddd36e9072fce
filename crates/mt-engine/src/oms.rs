//! Order manager: the single owner and single mutator of all orders.
//!
//! Every component requests state changes through [`OrderManager::change_state`],
//! which validates the edge against the transition table.  Orders are never
//! removed; they move between the open and closed partitions as their state
//! changes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use mt_types::{
    Fill, Instrument, Order, OrderError, OrderId, OrderState, ProductType, Replacement, Side,
};

/// Equality filter over order attributes; the predicate is the logical AND of
/// every populated field.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub state: Option<OrderState>,
    pub instrument: Option<Instrument>,
    pub product_type: Option<ProductType>,
    pub side: Option<Side>,
    pub originator_uuid: Option<Uuid>,
    pub strategy_id: Option<String>,
    pub portfolio_id: Option<String>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        if let Some(state) = self.state {
            if order.state != state {
                return false;
            }
        }
        if let Some(instrument) = &self.instrument {
            if &order.instrument != instrument {
                return false;
            }
        }
        if let Some(product_type) = self.product_type {
            if order.instrument.product_type != product_type {
                return false;
            }
        }
        if let Some(side) = self.side {
            if order.side != side {
                return false;
            }
        }
        if let Some(originator_uuid) = self.originator_uuid {
            if order.originator_uuid != originator_uuid {
                return false;
            }
        }
        if let Some(strategy_id) = &self.strategy_id {
            if &order.strategy_id != strategy_id {
                return false;
            }
        }
        if let Some(portfolio_id) = &self.portfolio_id {
            if order.portfolio_id.as_deref() != Some(portfolio_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Central repository for all orders.
#[derive(Debug, Default)]
pub struct OrderManager {
    orders: HashMap<OrderId, Order>,
    /// Insertion order; drives deterministic iteration everywhere.
    insertion: Vec<OrderId>,
    by_state: HashMap<OrderState, Vec<OrderId>>,
    by_strategy: HashMap<String, Vec<OrderId>>,
    by_instrument: HashMap<Instrument, Vec<OrderId>>,
    by_originator: HashMap<Uuid, Vec<OrderId>>,
    /// Tradability per product type; absent means open.
    market_open: HashMap<ProductType, bool>,
}

impl OrderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created order.
    pub fn new_order(&mut self, order: Order) -> Result<OrderId, OrderError> {
        if order.state != OrderState::Created {
            return Err(OrderError::NotNew {
                uuid: order.uuid,
                state: order.state,
            });
        }
        if self.orders.contains_key(&order.uuid) {
            return Err(OrderError::DuplicateUuid { uuid: order.uuid });
        }

        let uuid = order.uuid;
        self.insertion.push(uuid);
        self.by_state.entry(order.state).or_default().push(uuid);
        self.by_strategy
            .entry(order.strategy_id.clone())
            .or_default()
            .push(uuid);
        self.by_instrument
            .entry(order.instrument.clone())
            .or_default()
            .push(uuid);
        self.by_originator
            .entry(order.originator_uuid)
            .or_default()
            .push(uuid);
        debug!(order = %uuid, instrument = %order.instrument, side = %order.side, "new order");
        self.orders.insert(uuid, order);
        Ok(uuid)
    }

    /// Validate and apply one state transition.
    ///
    /// Beyond the transition table, a product whose market is closed cannot
    /// advance past STAGED toward the venue.
    pub fn change_state(
        &mut self,
        uuid: OrderId,
        new_state: OrderState,
        timestamp: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        let (from, product_type) = {
            let order = self.orders.get(&uuid).ok_or(OrderError::NotFound { uuid })?;
            (order.state, order.instrument.product_type)
        };

        if !from.may_transition_to(new_state) {
            return Err(OrderError::InvalidTransition {
                uuid,
                from,
                to: new_state,
            });
        }
        if matches!(new_state, OrderState::RiskAccepted | OrderState::Sent)
            && !self.is_market_open(product_type)
        {
            return Err(OrderError::MarketClosed { product_type });
        }

        if let Some(order) = self.orders.get_mut(&uuid) {
            order.apply_transition(timestamp, new_state);
        }
        if let Some(bucket) = self.by_state.get_mut(&from) {
            bucket.retain(|u| *u != uuid);
        }
        self.by_state.entry(new_state).or_default().push(uuid);
        debug!(order = %uuid, from = %from, to = %new_state, "state change");
        Ok(())
    }

    pub fn get(&self, uuid: OrderId) -> Option<&Order> {
        self.orders.get(&uuid)
    }

    pub fn get_required(&self, uuid: OrderId) -> Result<&Order, OrderError> {
        self.orders.get(&uuid).ok_or(OrderError::NotFound { uuid })
    }

    /// All matching orders, in insertion order.
    pub fn orders_list(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.insertion
            .iter()
            .filter_map(|uuid| self.orders.get(uuid))
            .filter(|order| filter.matches(order))
            .collect()
    }

    pub fn open_orders(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.orders_list(filter)
            .into_iter()
            .filter(|o| !o.closed)
            .collect()
    }

    pub fn closed_orders(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.orders_list(filter)
            .into_iter()
            .filter(|o| o.closed)
            .collect()
    }

    /// Matching uuids, in insertion order.  Used by components that mutate
    /// while iterating.
    pub fn uuids(&self, filter: &OrderFilter) -> Vec<OrderId> {
        self.orders_list(filter).iter().map(|o| o.uuid).collect()
    }

    /// Uuids currently in `state`, in insertion order (via the state index).
    pub fn uuids_in_state(&self, state: OrderState) -> Vec<OrderId> {
        self.by_state.get(&state).cloned().unwrap_or_default()
    }

    pub fn uuids_for_strategy(&self, strategy_id: &str) -> Vec<OrderId> {
        self.by_strategy
            .get(strategy_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn uuids_for_instrument(&self, instrument: &Instrument) -> Vec<OrderId> {
        self.by_instrument
            .get(instrument)
            .cloned()
            .unwrap_or_default()
    }

    pub fn uuids_for_originator(&self, originator_uuid: Uuid) -> Vec<OrderId> {
        self.by_originator
            .get(&originator_uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Append a fill and recompute the order's aggregates.
    pub fn apply_fill(&mut self, uuid: OrderId, fill: Fill) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.apply_fill(fill)
    }

    /// Tag the order with the portfolio that staged it.
    pub fn assign_portfolio(
        &mut self,
        uuid: OrderId,
        portfolio_uuid: Uuid,
        portfolio_id: &str,
    ) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.portfolio_uuid = Some(portfolio_uuid);
        order.portfolio_id = Some(portfolio_id.to_string());
        Ok(())
    }

    pub fn set_routing(
        &mut self,
        uuid: OrderId,
        broker_order_id: u64,
        exchange_order_id: u64,
    ) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.broker_order_id = Some(broker_order_id);
        order.exchange_order_id = Some(exchange_order_id);
        Ok(())
    }

    pub fn set_reject_reason(&mut self, uuid: OrderId, reason: &str) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.reject_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn set_pending_replace(
        &mut self,
        uuid: OrderId,
        replacement: Replacement,
    ) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.pending_replace = Some(replacement);
        Ok(())
    }

    /// Apply the pending replacement after venue acceptance.
    pub fn apply_replace(&mut self, uuid: OrderId) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        let replacement = order
            .pending_replace
            .take()
            .ok_or(OrderError::NoPendingReplace { uuid })?;
        order.apply_replace(replacement);
        Ok(())
    }

    pub fn clear_pending_replace(&mut self, uuid: OrderId) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.pending_replace = None;
        Ok(())
    }

    /// Flip the booked flag on the order and all of its fills.
    pub fn set_booked(&mut self, uuid: OrderId, booked: bool) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&uuid)
            .ok_or(OrderError::NotFound { uuid })?;
        order.booked = Some(booked);
        for fill in &mut order.fills {
            fill.booked = booked;
        }
        Ok(())
    }

    /// Closed orders with fills not yet applied to positions.
    pub fn to_be_booked(&self) -> Vec<OrderId> {
        self.insertion
            .iter()
            .filter_map(|uuid| self.orders.get(uuid))
            .filter(|o| o.closed && o.booked == Some(false))
            .map(|o| o.uuid)
            .collect()
    }

    pub fn set_market_state(&mut self, product_type: ProductType, is_open: bool) {
        self.market_open.insert(product_type, is_open);
    }

    pub fn is_market_open(&self, product_type: ProductType) -> bool {
        self.market_open.get(&product_type).copied().unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
