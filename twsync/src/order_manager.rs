// twsync/src/order_manager.rs
//! Order placement and order-state tracking.
//!
//! Every order id comes from the session's shared allocator, so orders and data requests never
//! collide. Status and open-order pushes keep the [`OpenOrderCache`] current; executions for
//! bracket legs are attributed by the [`BracketFillTracker`].
//!
//! A bracket is three orders on contiguous ids: a limit entry, a limit take-profit and a stop
//! stop-loss. The first two are sent with `transmit = false`, so TWS holds them until the
//! stop-loss arrives with `transmit = true` and releases the whole group.

use crate::account::Execution;
use crate::base::{IBKRError, RequestId};
use crate::conn::{CancelKind, OutboundRequest, Transport};
use crate::contract::{ComboLeg, Contract};
use crate::fill_tracker::{BracketFillTracker, FillRecord, OrderRole};
use crate::handler::OrderHandler;
use crate::ids::IdAllocator;
use crate::open_orders::{OpenOrderCache, OpenOrdersSnapshot};
use crate::order::{BracketIds, Direction, OrderRequest, OrderSide, OrderStatus, TimeInForce};
use crate::correlator::RequestCorrelator;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, trace, warn};

pub struct OrderManager {
  transport: Arc<dyn Transport>,
  ids: Arc<IdAllocator>,
  open_orders: OpenOrderCache,
  fills: BracketFillTracker,
  open_orders_timeout: Duration,
}

fn check_quantity(quantity: f64) -> Result<(), IBKRError> {
  if !quantity.is_finite() || quantity <= 0.0 {
    return Err(IBKRError::InvalidParameter(format!("quantity must be positive, got {}", quantity)));
  }
  Ok(())
}

fn check_price(name: &str, price: f64) -> Result<(), IBKRError> {
  if !price.is_finite() || price <= 0.0 {
    return Err(IBKRError::InvalidParameter(format!("{} must be positive, got {}", name, price)));
  }
  Ok(())
}

impl OrderManager {
  pub(crate) fn new(
    transport: Arc<dyn Transport>,
    ids: Arc<IdAllocator>,
    correlator: Arc<RequestCorrelator>,
    open_orders_timeout: Duration,
  ) -> Arc<Self> {
    Arc::new(OrderManager {
      open_orders: OpenOrderCache::new(transport.clone(), ids.clone(), correlator),
      fills: BracketFillTracker::new(),
      transport,
      ids,
      open_orders_timeout,
    })
  }

  /// Sends `order` for `contract` under a fresh order id.
  pub fn place_order(&self, contract: &Contract, order: OrderRequest) -> Result<RequestId, IBKRError> {
    check_quantity(order.quantity)?;
    let order_id = self.ids.next()?;
    self.submit_order(order_id, contract, order)?;
    Ok(order_id)
  }

  fn submit_order(&self, order_id: RequestId, contract: &Contract, order: OrderRequest) -> Result<(), IBKRError> {
    info!("Placing order {}: {} {} {} {} @ {:?}/{:?} transmit={}",
          order_id, order.side, order.quantity, contract.summary(), order.order_type,
          order.limit_price, order.aux_price, order.transmit);
    self.transport.submit(order_id, OutboundRequest::PlaceOrder { contract: contract.clone(), order })
  }

  /// Limit order for a SMART-routed USD stock, good till cancelled.
  pub fn place_limit_order(&self, symbol: &str, limit_price: f64, quantity: f64, side: OrderSide) -> Result<RequestId, IBKRError> {
    check_price("limit price", limit_price)?;
    self.place_order(&Contract::stock(symbol), OrderRequest::limit(side, quantity, limit_price))
  }

  /// Market order for a SMART-routed USD stock, good till cancelled.
  pub fn place_market_order(&self, symbol: &str, quantity: f64, side: OrderSide) -> Result<RequestId, IBKRError> {
    self.place_order(&Contract::stock(symbol), OrderRequest::market(side, quantity))
  }

  /// Places a three-leg bracket. Long brackets need `stop_loss < entry < take_profit`, short
  /// brackets the reverse.
  pub fn place_bracket_order(
    &self,
    symbol: &str,
    direction: Direction,
    entry_price: f64,
    take_profit_price: f64,
    stop_loss_price: f64,
    quantity: f64,
  ) -> Result<BracketIds, IBKRError> {
    check_quantity(quantity)?;
    check_price("entry price", entry_price)?;
    check_price("take profit price", take_profit_price)?;
    check_price("stop loss price", stop_loss_price)?;
    let ordered = match direction {
      Direction::Long => stop_loss_price < entry_price && entry_price < take_profit_price,
      Direction::Short => take_profit_price < entry_price && entry_price < stop_loss_price,
    };
    if !ordered {
      return Err(IBKRError::InvalidParameter(format!(
        "{:?} bracket prices out of order: entry={} take_profit={} stop_loss={}",
        direction, entry_price, take_profit_price, stop_loss_price
      )));
    }

    let first = self.ids.reserve_block(3)?;
    let ids = BracketIds { parent: first, take_profit: first + 1, stop_loss: first + 2 };

    // Roles go in before any leg is sent so no execution can outrun them.
    self.fills.register_role(ids.parent, OrderRole::entry(direction));
    self.fills.register_role(ids.take_profit, OrderRole::Exit);
    self.fills.register_role(ids.stop_loss, OrderRole::Exit);

    let entry_side = direction.entry_side();
    let exit_side = entry_side.opposite();
    let parent = OrderRequest {
      tif: TimeInForce::Day,
      transmit: false,
      ..OrderRequest::limit(entry_side, quantity, entry_price)
    };
    let take_profit = OrderRequest {
      parent_id: Some(ids.parent),
      transmit: false,
      ..OrderRequest::limit(exit_side, quantity, take_profit_price)
    };
    let stop_loss = OrderRequest {
      parent_id: Some(ids.parent),
      transmit: true,
      ..OrderRequest::stop(exit_side, quantity, stop_loss_price)
    };

    let contract = Contract::stock(symbol);
    let legs = [(ids.parent, parent), (ids.take_profit, take_profit), (ids.stop_loss, stop_loss)];
    let mut sent = Vec::with_capacity(3);
    for (order_id, order) in legs {
      if let Err(e) = self.submit_order(order_id, &contract, order) {
        warn!("Bracket leg {} for {} failed to send: {:?}; withdrawing bracket", order_id, symbol, e);
        for sent_id in &sent {
          if let Err(ce) = self.transport.cancel(*sent_id, CancelKind::Order) {
            warn!("Failed to withdraw bracket leg {}: {:?}", sent_id, ce);
          }
        }
        for leg in [ids.parent, ids.take_profit, ids.stop_loss] {
          self.fills.forget(leg);
        }
        return Err(e);
      }
      sent.push(order_id);
    }

    info!("Placed {:?} bracket for {}: {} @ {}, take profit {}, stop loss {}, order ids {}-{}",
          direction, symbol, quantity, entry_price, take_profit_price, stop_loss_price, ids.parent, ids.stop_loss);
    Ok(ids)
  }

  /// Market BUY of a two-leg combo. The order quantity is the smaller leg ratio.
  pub fn place_combo_order(&self, symbol: &str, leg1: ComboLeg, leg2: ComboLeg) -> Result<RequestId, IBKRError> {
    if leg1.ratio <= 0 || leg2.ratio <= 0 {
      return Err(IBKRError::InvalidParameter(format!(
        "combo leg ratios must be positive, got {} and {}", leg1.ratio, leg2.ratio
      )));
    }
    let quantity = leg1.ratio.min(leg2.ratio) as f64;
    debug!("Combo {}: leg {} {} x{}, leg {} {} x{}",
           symbol, leg1.con_id, leg1.action, leg1.ratio, leg2.con_id, leg2.action, leg2.ratio);
    let contract = Contract::combo(symbol, vec![leg1, leg2]);
    self.place_order(&contract, OrderRequest::market(OrderSide::Buy, quantity))
  }

  pub fn cancel_order(&self, order_id: RequestId) -> Result<(), IBKRError> {
    info!("Cancelling order {}", order_id);
    self.transport.cancel(order_id, CancelKind::Order)
  }

  /// Re-enumerates open orders with the configured timeout.
  pub fn refresh_open_orders(&self) -> Result<OpenOrdersSnapshot, IBKRError> {
    self.open_orders.refresh(self.open_orders_timeout)
  }

  pub fn open_orders(&self) -> &OpenOrderCache {
    &self.open_orders
  }

  pub fn fill_tracker(&self) -> &BracketFillTracker {
    &self.fills
  }

  /// Bracket fills attributed since the last call.
  pub fn drain_fills(&self) -> Vec<FillRecord> {
    self.fills.drain_fills()
  }
}

impl OrderHandler for OrderManager {
  fn next_valid_id(&self, order_id: RequestId) {
    debug!("Handler: Next Valid ID: {}", order_id);
    self.ids.seed(order_id);
  }

  fn order_status(&self, order_id: RequestId, status: OrderStatus, filled: f64, remaining: f64,
                  avg_fill_price: f64, parent_id: RequestId) {
    debug!("Handler: Order Status: ID={}, Status={}, Filled={}, Remaining={}, AvgPx={}, Parent={}",
           order_id, status, filled, remaining, avg_fill_price, parent_id);
    self.open_orders.on_status(order_id, status);
    if status == OrderStatus::Filled && remaining <= 0.0 {
      // Executions may trail the status; the role goes once they cover `filled`.
      self.fills.on_fully_filled(order_id, filled);
    } else if status.is_terminal() && status != OrderStatus::Filled && filled <= 0.0
      && self.fills.forget(order_id).is_some() {
      debug!("Order {} ended {} without fills; role released", order_id, status);
    }
  }

  fn open_order(&self, order_id: RequestId, contract: &Contract, status: OrderStatus) {
    trace!("Handler: Open Order: ID={}, Contract={}, Status={}", order_id, contract.summary(), status);
    self.open_orders.on_order_update(order_id, &contract.summary(), status);
  }

  fn open_order_end(&self) {
    debug!("Handler: Open Order End");
    self.open_orders.on_enumeration_end();
  }

  fn execution_details(&self, req_id: RequestId, contract: &Contract, execution: &Execution) {
    debug!("Handler: Execution: ReqID={}, OrderID={}, ExecID={}, {} {} {} @ {}",
           req_id, execution.order_id, execution.execution_id, execution.side,
           execution.shares, contract.symbol, execution.price);
    self.fills.on_execution(execution.order_id, &contract.symbol, execution.shares, execution.price);
  }

  fn order_error(&self, order_id: RequestId, error_code: i32, error_msg: &str) {
    if self.fills.role_of(order_id).is_some() || self.open_orders.get(order_id).is_some() {
      warn!("Order {} error {}: {}", order_id, error_code, error_msg);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::MockTransport;
  use crate::order::OrderType;
  use parking_lot::Mutex;

  fn seeded(first: RequestId) -> Arc<IdAllocator> {
    let ids = Arc::new(IdAllocator::new());
    ids.seed(first);
    ids
  }

  fn manager(mock: MockTransport, ids: Arc<IdAllocator>) -> Arc<OrderManager> {
    OrderManager::new(Arc::new(mock), ids, Arc::new(RequestCorrelator::new()), Duration::from_secs(1))
  }

  /// Transport that records every placed order.
  fn recording() -> (MockTransport, Arc<Mutex<Vec<(RequestId, OutboundRequest)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let mut mock = MockTransport::new();
    mock.expect_submit().returning(move |id, req| {
      sink.lock().push((id, req));
      Ok(())
    });
    (mock, log)
  }

  #[test]
  fn test_bracket_legs_and_roles() {
    let (mock, log) = recording();
    let mgr = manager(mock, seeded(100));
    let ids = mgr.place_bracket_order("AAPL", Direction::Long, 150.0, 160.0, 145.0, 10.0).unwrap();
    assert_eq!(ids, BracketIds { parent: 100, take_profit: 101, stop_loss: 102 });

    let sent = log.lock().clone();
    assert_eq!(sent.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![100, 101, 102]);
    let orders: Vec<OrderRequest> = sent.into_iter().map(|(_, req)| match req {
      OutboundRequest::PlaceOrder { order, .. } => order,
      other => panic!("unexpected {:?}", other),
    }).collect();

    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(orders[0].tif, TimeInForce::Day);
    assert_eq!((orders[0].transmit, orders[1].transmit, orders[2].transmit), (false, false, true));
    assert_eq!(orders[1].side, OrderSide::Sell);
    assert_eq!(orders[1].limit_price, Some(160.0));
    assert_eq!(orders[2].order_type, OrderType::Stop);
    assert_eq!(orders[2].aux_price, Some(145.0));
    assert_eq!(orders[1].parent_id, Some(100));
    assert_eq!(orders[2].parent_id, Some(100));

    assert_eq!(mgr.fill_tracker().role_of(100), Some(OrderRole::EntryLong));
    assert_eq!(mgr.fill_tracker().role_of(102), Some(OrderRole::Exit));
  }

  #[test]
  fn test_bracket_price_validation() {
    let mut mock = MockTransport::new();
    mock.expect_submit().times(0);
    let ids = seeded(1);
    let mgr = manager(mock, ids.clone());
    assert!(matches!(
      mgr.place_bracket_order("AAPL", Direction::Long, 150.0, 140.0, 145.0, 1.0),
      Err(IBKRError::InvalidParameter(_))
    ));
    assert!(matches!(
      mgr.place_bracket_order("AAPL", Direction::Short, 150.0, 160.0, 140.0, 1.0),
      Err(IBKRError::InvalidParameter(_))
    ));
    assert!(mgr.place_bracket_order("AAPL", Direction::Long, 150.0, 160.0, 145.0, 0.0).is_err());
    // Rejected brackets consume no ids.
    assert_eq!(ids.peek(), Some(1));
  }

  #[test]
  fn test_bracket_send_failure_withdraws() {
    let mut mock = MockTransport::new();
    let mut calls = 0;
    mock.expect_submit().returning(move |_, _| {
      calls += 1;
      if calls == 2 { Err(IBKRError::NotConnected) } else { Ok(()) }
    });
    mock.expect_cancel()
      .withf(|id, kind| *id == 10 && *kind == CancelKind::Order)
      .times(1)
      .returning(|_, _| Ok(()));
    let mgr = manager(mock, seeded(10));
    assert_eq!(
      mgr.place_bracket_order("AAPL", Direction::Short, 150.0, 140.0, 155.0, 1.0),
      Err(IBKRError::NotConnected)
    );
    assert_eq!(mgr.fill_tracker().tracked_orders(), 0);
  }

  #[test]
  fn test_orders_before_seed_rejected() {
    let mut mock = MockTransport::new();
    mock.expect_submit().times(0);
    let mgr = manager(mock, Arc::new(IdAllocator::new()));
    assert!(matches!(mgr.place_market_order("AAPL", 1.0, OrderSide::Buy), Err(IBKRError::NotReady(_))));
  }

  #[test]
  fn test_limit_and_combo_orders() {
    let (mock, log) = recording();
    let mgr = manager(mock, seeded(7));
    assert_eq!(mgr.place_limit_order("MSFT", 300.0, 2.0, OrderSide::Sell).unwrap(), 7);
    let combo_id = mgr.place_combo_order(
      "SPY",
      ComboLeg::smart(756733, 2, OrderSide::Buy),
      ComboLeg::smart(320227571, 3, OrderSide::Sell),
    ).unwrap();
    assert_eq!(combo_id, 8);

    let sent = log.lock().clone();
    match &sent[0].1 {
      OutboundRequest::PlaceOrder { contract, order } => {
        assert_eq!(contract.exchange, "SMART");
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.tif, TimeInForce::GoodTillCancelled);
      }
      other => panic!("unexpected {:?}", other),
    }
    match &sent[1].1 {
      OutboundRequest::PlaceOrder { contract, order } => {
        assert_eq!(contract.sec_type, crate::contract::SecType::Combo);
        assert_eq!(contract.combo_legs.len(), 2);
        assert_eq!(contract.combo_legs[1].action, "SELL");
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.quantity, 2.0);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_pushes_feed_cache_and_tracker() {
    let (mock, _log) = recording();
    let mgr = manager(mock, seeded(100));
    mgr.place_bracket_order("AAPL", Direction::Long, 150.0, 160.0, 145.0, 10.0).unwrap();

    let aapl = Contract::stock("AAPL");
    mgr.open_order(100, &aapl, OrderStatus::PreSubmitted);
    mgr.open_order(101, &aapl, OrderStatus::PreSubmitted);
    mgr.open_order(102, &aapl, OrderStatus::PreSubmitted);
    assert_eq!(mgr.open_orders().entries().len(), 3);

    let exec = |order_id: RequestId, price: f64| Execution {
      execution_id: format!("e{}", order_id),
      order_id,
      symbol: "AAPL".into(),
      side: "BOT".into(),
      shares: 10.0,
      price,
      time: String::new(),
    };
    mgr.execution_details(-1, &aapl, &exec(100, 150.0));
    mgr.order_status(100, OrderStatus::Filled, 10.0, 0.0, 150.0, 0);
    mgr.execution_details(-1, &aapl, &exec(101, 160.0));
    mgr.order_status(101, OrderStatus::Filled, 10.0, 0.0, 160.0, 100);
    mgr.order_status(102, OrderStatus::Cancelled, 0.0, 10.0, 0.0, 100);

    assert!(mgr.open_orders().entries().is_empty());
    let fills = mgr.drain_fills();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].direction, Some(Direction::Long));
    assert_eq!(fills[1].exit_price, Some(160.0));
    // Fully filled and attributed legs and the cancelled stop-loss all release their roles.
    assert_eq!(mgr.fill_tracker().role_of(102), None);
    assert_eq!(mgr.fill_tracker().role_of(101), None);
    assert_eq!(mgr.fill_tracker().tracked_orders(), 0);
  }

  #[test]
  fn test_filled_status_before_executions() {
    let (mock, _log) = recording();
    let mgr = manager(mock, seeded(200));
    mgr.place_bracket_order("MSFT", Direction::Short, 300.0, 290.0, 310.0, 10.0).unwrap();
    let msft = Contract::stock("MSFT");
    let exec = |execution_id: &str, shares: f64| Execution {
      execution_id: execution_id.into(),
      order_id: 200,
      symbol: "MSFT".into(),
      side: "SLD".into(),
      shares,
      price: 300.0,
      time: String::new(),
    };

    mgr.order_status(200, OrderStatus::Filled, 10.0, 0.0, 300.0, 0);
    assert_eq!(mgr.fill_tracker().role_of(200), Some(OrderRole::EntryShort));
    mgr.execution_details(-1, &msft, &exec("a", 4.0));
    assert_eq!(mgr.fill_tracker().role_of(200), Some(OrderRole::EntryShort));
    mgr.execution_details(-1, &msft, &exec("b", 6.0));
    assert_eq!(mgr.fill_tracker().role_of(200), None);

    assert_eq!(mgr.drain_fills().len(), 2);
    assert_eq!(mgr.fill_tracker().tracked_orders(), 2);
  }

  #[test]
  fn test_next_valid_id_seeds_allocator() {
    let ids = Arc::new(IdAllocator::new());
    let mgr = manager(MockTransport::new(), ids.clone());
    mgr.next_valid_id(42);
    assert_eq!(ids.peek(), Some(42));
  }
}
