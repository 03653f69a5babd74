// twsync/src/handler.rs
// Handlers for events delivered by the transport.
//
// All methods are called from the single delivery thread, in delivery order. Implementations
// must not block and must not panic: an unknown id or an odd payload is logged and dropped.
use std::sync::Arc;
use crate::account::Execution;
use crate::base::RequestId;
use crate::contract::{Bar, Contract, ContractDetails};
use crate::order::OrderStatus;

/// Meta messages such as errors and connection state.
pub trait ClientHandler: Send + Sync {
  /// `id` is a request or order id, or -1 for messages not tied to a request.
  fn error(&self, id: RequestId, error_code: i32, error_msg: &str);
  fn connection_closed(&self);
}

/// Order processing.
pub trait OrderHandler: Send + Sync {
  /// Provides the next available order ID. Sent automatically on connection.
  fn next_valid_id(&self, order_id: RequestId);

  fn order_status(
    &self,
    order_id: RequestId,
    status: OrderStatus,
    filled: f64,
    remaining: f64,
    avg_fill_price: f64,
    parent_id: RequestId, // 0 if not part of a bracket
  );

  /// One order from an open-order enumeration, or an unsolicited update for a live order.
  fn open_order(&self, order_id: RequestId, contract: &Contract, status: OrderStatus);

  /// Indicates the end of a reqOpenOrders/reqAllOpenOrders response.
  fn open_order_end(&self);

  fn execution_details(&self, req_id: RequestId, contract: &Contract, execution: &Execution);

  /// Error tied to an order id (e.g. a rejected leg).
  fn order_error(&self, order_id: RequestId, error_code: i32, error_msg: &str);
}

pub trait AccountHandler: Send + Sync {
  /// Provides a specific account summary value requested via reqAccountSummary.
  fn account_summary(&self, req_id: RequestId, account: &str, tag: &str, value: &str, currency: &str);

  /// Indicates the end of an account summary request.
  fn account_summary_end(&self, req_id: RequestId);

  fn position(&self, account: &str, contract: &Contract, position: f64, avg_cost: f64);

  /// Indicates the end of the position stream.
  fn position_end(&self);
}

pub trait ReferenceDataHandler: Send + Sync {
  fn contract_details(&self, req_id: RequestId, contract_details: &ContractDetails);

  fn contract_details_end(&self, req_id: RequestId);

  /// Option parameters for one exchange; several may arrive per request.
  fn security_definition_option_parameter(
    &self,
    req_id: RequestId,
    exchange: &str,
    underlying_con_id: i32,
    trading_class: &str,
    multiplier: &str,
    expirations: &[String],
    strikes: &[f64],
  );

  fn security_definition_option_parameter_end(&self, req_id: RequestId);
}

/// Quotes, depth and historical bars.
pub trait MarketDataHandler: Send + Sync {
  fn tick_price(&self, req_id: RequestId, tick_type: i32, price: f64);
  fn tick_size(&self, req_id: RequestId, tick_type: i32, size: f64);
  fn tick_string(&self, req_id: RequestId, tick_type: i32, value: &str);

  fn update_mkt_depth(&self, req_id: RequestId, position: i32, operation: i32, side: i32, price: f64, size: f64);

  #[allow(clippy::too_many_arguments)]
  fn update_mkt_depth_l2(
    &self,
    req_id: RequestId,
    position: i32,
    market_maker: &str,
    operation: i32,
    side: i32,
    price: f64,
    size: f64,
    is_smart_depth: bool,
  );

  fn historical_data(&self, req_id: RequestId, bar: &Bar);
  fn historical_data_end(&self, req_id: RequestId, start_date: &str, end_date: &str);
}

/// The full set of handlers the delivery thread dispatches to.
#[derive(Clone)]
pub struct MessageHandler {
  pub client: Arc<dyn ClientHandler>,
  pub order: Arc<dyn OrderHandler>,
  pub account: Arc<dyn AccountHandler>,
  pub data_ref: Arc<dyn ReferenceDataHandler>,
  pub data_market: Arc<dyn MarketDataHandler>,
}

impl MessageHandler {
  pub fn new(client: Arc<dyn ClientHandler>,
             order: Arc<dyn OrderHandler>,
             account: Arc<dyn AccountHandler>,
             data_ref: Arc<dyn ReferenceDataHandler>,
             data_market: Arc<dyn MarketDataHandler>) -> Self {
    MessageHandler {
      client,
      order,
      account,
      data_ref,
      data_market,
    }
  }
}
