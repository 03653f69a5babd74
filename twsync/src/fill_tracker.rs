// twsync/src/fill_tracker.rs
//! Attribution of executions to the legs of bracket orders.
//!
//! Roles are registered when the bracket is placed, before any leg reaches TWS, so an execution
//! can never arrive for a leg whose role is not known yet. Exit fills are reported on their
//! own; they are not paired with the entry they close.

use crate::base::RequestId;
use crate::order::Direction;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
  EntryLong,
  EntryShort,
  Exit,
}

impl OrderRole {
  pub fn entry(direction: Direction) -> Self {
    match direction {
      Direction::Long => OrderRole::EntryLong,
      Direction::Short => OrderRole::EntryShort,
    }
  }
}

/// One attributed execution. Entry fills carry `entry_price` and `direction`, exit fills only
/// `exit_price`.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
  pub symbol: String,
  pub order_id: RequestId,
  pub shares: f64,
  pub entry_price: Option<f64>,
  pub exit_price: Option<f64>,
  pub direction: Option<Direction>,
}

const SHARE_EPSILON: f64 = 1e-9;

#[derive(Default)]
struct TrackerState {
  roles: HashMap<RequestId, OrderRole>,
  fills: Vec<FillRecord>,
  /// Shares attributed so far per tracked order.
  executed: HashMap<RequestId, f64>,
  /// Final filled quantity of orders TWS reported as fully filled.
  filled_total: HashMap<RequestId, f64>,
}

impl TrackerState {
  /// Drops the order once every share of its final fill has been attributed.
  fn release_if_done(&mut self, order_id: RequestId) -> bool {
    let Some(total) = self.filled_total.get(&order_id).copied() else { return false };
    let executed = self.executed.get(&order_id).copied().unwrap_or(0.0);
    if executed + SHARE_EPSILON < total {
      return false;
    }
    self.remove(order_id);
    debug!("Order {} fully filled and attributed; role released", order_id);
    true
  }

  fn remove(&mut self, order_id: RequestId) -> Option<OrderRole> {
    self.executed.remove(&order_id);
    self.filled_total.remove(&order_id);
    self.roles.remove(&order_id)
  }
}

#[derive(Default)]
pub struct BracketFillTracker {
  state: Mutex<TrackerState>,
}

impl BracketFillTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register_role(&self, order_id: RequestId, role: OrderRole) {
    debug!("Order {} registered as {:?}", order_id, role);
    self.state.lock().roles.insert(order_id, role);
  }

  pub fn role_of(&self, order_id: RequestId) -> Option<OrderRole> {
    self.state.lock().roles.get(&order_id).copied()
  }

  /// Records a fill for a tracked order. Returns false for orders placed outside a bracket.
  pub fn on_execution(&self, order_id: RequestId, symbol: &str, shares: f64, price: f64) -> bool {
    let mut state = self.state.lock();
    let Some(role) = state.roles.get(&order_id).copied() else {
      trace!("Execution for untracked order {}", order_id);
      return false;
    };
    let record = match role {
      OrderRole::EntryLong | OrderRole::EntryShort => FillRecord {
        symbol: symbol.to_string(),
        order_id,
        shares,
        entry_price: Some(price),
        exit_price: None,
        direction: Some(if role == OrderRole::EntryLong { Direction::Long } else { Direction::Short }),
      },
      OrderRole::Exit => FillRecord {
        symbol: symbol.to_string(),
        order_id,
        shares,
        entry_price: None,
        exit_price: Some(price),
        direction: None,
      },
    };
    debug!("Fill attributed: order {} {:?} {} x {} @ {}", order_id, role, symbol, shares, price);
    state.fills.push(record);
    *state.executed.entry(order_id).or_insert(0.0) += shares;
    state.release_if_done(order_id);
    true
  }

  /// Notes that TWS reported `order_id` fully filled at `filled` shares. The role is released
  /// now if the executions already cover that quantity, otherwise by the execution that does.
  /// Returns true if the role was released.
  pub fn on_fully_filled(&self, order_id: RequestId, filled: f64) -> bool {
    let mut state = self.state.lock();
    if !state.roles.contains_key(&order_id) {
      return false;
    }
    state.filled_total.insert(order_id, filled);
    state.release_if_done(order_id)
  }

  /// Takes all fills recorded since the last drain.
  pub fn drain_fills(&self) -> Vec<FillRecord> {
    std::mem::take(&mut self.state.lock().fills)
  }

  /// Drops the role of an order that will not fill any more.
  pub fn forget(&self, order_id: RequestId) -> Option<OrderRole> {
    self.state.lock().remove(order_id)
  }

  pub fn tracked_orders(&self) -> usize {
    self.state.lock().roles.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bracket_fills() {
    let tracker = BracketFillTracker::new();
    tracker.register_role(100, OrderRole::EntryLong);
    tracker.register_role(101, OrderRole::Exit);
    tracker.register_role(102, OrderRole::Exit);

    assert!(tracker.on_execution(100, "AAPL", 10.0, 150.0));
    assert!(tracker.on_execution(101, "AAPL", 10.0, 155.0));

    let fills = tracker.drain_fills();
    assert_eq!(fills, vec![
      FillRecord {
        symbol: "AAPL".into(),
        order_id: 100,
        shares: 10.0,
        entry_price: Some(150.0),
        exit_price: None,
        direction: Some(Direction::Long),
      },
      FillRecord {
        symbol: "AAPL".into(),
        order_id: 101,
        shares: 10.0,
        entry_price: None,
        exit_price: Some(155.0),
        direction: None,
      },
    ]);
    assert!(tracker.drain_fills().is_empty());
  }

  #[test]
  fn test_short_entry_and_unknown_order() {
    let tracker = BracketFillTracker::new();
    tracker.register_role(7, OrderRole::entry(Direction::Short));
    assert!(!tracker.on_execution(8, "TSLA", 1.0, 200.0));
    assert!(tracker.on_execution(7, "TSLA", 5.0, 210.0));

    let fills = tracker.drain_fills();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].direction, Some(Direction::Short));
    assert_eq!(fills[0].entry_price, Some(210.0));
  }

  #[test]
  fn test_forget_releases_role() {
    let tracker = BracketFillTracker::new();
    tracker.register_role(1, OrderRole::Exit);
    assert_eq!(tracker.forget(1), Some(OrderRole::Exit));
    assert_eq!(tracker.tracked_orders(), 0);
    assert!(!tracker.on_execution(1, "AAPL", 1.0, 1.0));
  }

  #[test]
  fn test_fully_filled_releases_after_last_execution() {
    let tracker = BracketFillTracker::new();
    tracker.register_role(7, OrderRole::EntryLong);
    tracker.register_role(8, OrderRole::Exit);

    // Executions first, then the final status.
    assert!(tracker.on_execution(7, "SPY", 5.0, 400.0));
    assert!(tracker.on_fully_filled(7, 5.0));
    assert_eq!(tracker.role_of(7), None);

    // Status first; partial executions keep the role until the quantity is covered.
    assert!(!tracker.on_fully_filled(8, 5.0));
    assert!(tracker.on_execution(8, "SPY", 2.0, 410.0));
    assert_eq!(tracker.role_of(8), Some(OrderRole::Exit));
    assert!(tracker.on_execution(8, "SPY", 3.0, 410.0));
    assert_eq!(tracker.tracked_orders(), 0);

    assert_eq!(tracker.drain_fills().len(), 3);
    assert!(!tracker.on_fully_filled(99, 1.0));
  }
}
