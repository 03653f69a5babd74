// twsync/src/message_parser.rs
//
// Typed inbound events and their dispatch to the appropriate handler.
use serde::{Deserialize, Serialize};
use crate::account::Execution;
use crate::base::RequestId;
use crate::contract::{Bar, Contract, ContractDetails};
use crate::handler::MessageHandler;
use crate::order::OrderStatus;

/// One push notification from the transport, already decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
  NextValidId { order_id: RequestId },
  Error { id: RequestId, code: i32, message: String },
  ConnectionClosed,
  ContractDetails { req_id: RequestId, details: ContractDetails },
  ContractDetailsEnd { req_id: RequestId },
  HistoricalData { req_id: RequestId, bar: Bar },
  HistoricalDataEnd {
    req_id: RequestId,
    #[serde(default)]
    start: String,
    #[serde(default)]
    end: String,
  },
  AccountSummary {
    req_id: RequestId,
    account: String,
    tag: String,
    value: String,
    #[serde(default)]
    currency: String,
  },
  AccountSummaryEnd { req_id: RequestId },
  Position { account: String, contract: Contract, position: f64, avg_cost: f64 },
  PositionEnd,
  OpenOrder { order_id: RequestId, contract: Contract, status: OrderStatus },
  OpenOrderEnd,
  OrderStatusUpdate {
    order_id: RequestId,
    status: OrderStatus,
    #[serde(default)]
    filled: f64,
    #[serde(default)]
    remaining: f64,
    #[serde(default)]
    avg_fill_price: f64,
    #[serde(default)]
    parent_id: RequestId,
  },
  Execution { req_id: RequestId, contract: Contract, execution: Execution },
  TickPrice { req_id: RequestId, tick_type: i32, price: f64 },
  TickSize { req_id: RequestId, tick_type: i32, size: f64 },
  TickString { req_id: RequestId, tick_type: i32, value: String },
  MarketDepth { req_id: RequestId, position: i32, operation: i32, side: i32, price: f64, size: f64 },
  MarketDepthL2 {
    req_id: RequestId,
    position: i32,
    market_maker: String,
    operation: i32,
    side: i32,
    price: f64,
    size: f64,
    #[serde(default)]
    is_smart_depth: bool,
  },
  SecDefOptParams {
    req_id: RequestId,
    exchange: String,
    underlying_con_id: i32,
    trading_class: String,
    multiplier: String,
    expirations: Vec<String>,
    strikes: Vec<f64>,
  },
  SecDefOptParamsEnd { req_id: RequestId },
}

impl InboundEvent {
  /// Re-targets a reply at `id`: request replies get their request id replaced, order events
  /// their order id. Events not tied to a request are returned unchanged.
  pub fn with_request_id(mut self, id: RequestId) -> Self {
    match &mut self {
      InboundEvent::Error { id: target, .. }
      | InboundEvent::ContractDetails { req_id: target, .. }
      | InboundEvent::ContractDetailsEnd { req_id: target }
      | InboundEvent::HistoricalData { req_id: target, .. }
      | InboundEvent::HistoricalDataEnd { req_id: target, .. }
      | InboundEvent::AccountSummary { req_id: target, .. }
      | InboundEvent::AccountSummaryEnd { req_id: target }
      | InboundEvent::OpenOrder { order_id: target, .. }
      | InboundEvent::OrderStatusUpdate { order_id: target, .. }
      | InboundEvent::TickPrice { req_id: target, .. }
      | InboundEvent::TickSize { req_id: target, .. }
      | InboundEvent::TickString { req_id: target, .. }
      | InboundEvent::MarketDepth { req_id: target, .. }
      | InboundEvent::MarketDepthL2 { req_id: target, .. }
      | InboundEvent::SecDefOptParams { req_id: target, .. }
      | InboundEvent::SecDefOptParamsEnd { req_id: target } => *target = id,
      InboundEvent::Execution { execution, .. } => execution.order_id = id,
      InboundEvent::NextValidId { .. }
      | InboundEvent::ConnectionClosed
      | InboundEvent::Position { .. }
      | InboundEvent::PositionEnd
      | InboundEvent::OpenOrderEnd => {}
    }
    self
  }
}

/// Process an event based on its type. This is the entry point for event handling.
pub fn process_event(handler: &MessageHandler, event: &InboundEvent) {
  match event {
    InboundEvent::NextValidId { order_id } => handler.order.next_valid_id(*order_id),
    InboundEvent::Error { id, code, message } => {
      handler.client.error(*id, *code, message);
      if *id > 0 {
        handler.order.order_error(*id, *code, message);
      }
    }
    InboundEvent::ConnectionClosed => handler.client.connection_closed(),
    InboundEvent::ContractDetails { req_id, details } => handler.data_ref.contract_details(*req_id, details),
    InboundEvent::ContractDetailsEnd { req_id } => handler.data_ref.contract_details_end(*req_id),
    InboundEvent::HistoricalData { req_id, bar } => handler.data_market.historical_data(*req_id, bar),
    InboundEvent::HistoricalDataEnd { req_id, start, end } => {
      handler.data_market.historical_data_end(*req_id, start, end)
    }
    InboundEvent::AccountSummary { req_id, account, tag, value, currency } => {
      handler.account.account_summary(*req_id, account, tag, value, currency)
    }
    InboundEvent::AccountSummaryEnd { req_id } => handler.account.account_summary_end(*req_id),
    InboundEvent::Position { account, contract, position, avg_cost } => {
      handler.account.position(account, contract, *position, *avg_cost)
    }
    InboundEvent::PositionEnd => handler.account.position_end(),
    InboundEvent::OpenOrder { order_id, contract, status } => handler.order.open_order(*order_id, contract, *status),
    InboundEvent::OpenOrderEnd => handler.order.open_order_end(),
    InboundEvent::OrderStatusUpdate { order_id, status, filled, remaining, avg_fill_price, parent_id } => {
      handler.order.order_status(*order_id, *status, *filled, *remaining, *avg_fill_price, *parent_id)
    }
    InboundEvent::Execution { req_id, contract, execution } => {
      handler.order.execution_details(*req_id, contract, execution)
    }
    InboundEvent::TickPrice { req_id, tick_type, price } => handler.data_market.tick_price(*req_id, *tick_type, *price),
    InboundEvent::TickSize { req_id, tick_type, size } => handler.data_market.tick_size(*req_id, *tick_type, *size),
    InboundEvent::TickString { req_id, tick_type, value } => {
      handler.data_market.tick_string(*req_id, *tick_type, value)
    }
    InboundEvent::MarketDepth { req_id, position, operation, side, price, size } => {
      handler.data_market.update_mkt_depth(*req_id, *position, *operation, *side, *price, *size)
    }
    InboundEvent::MarketDepthL2 { req_id, position, market_maker, operation, side, price, size, is_smart_depth } => {
      handler.data_market.update_mkt_depth_l2(
        *req_id, *position, market_maker, *operation, *side, *price, *size, *is_smart_depth,
      )
    }
    InboundEvent::SecDefOptParams { req_id, exchange, underlying_con_id, trading_class, multiplier, expirations, strikes } => {
      handler.data_ref.security_definition_option_parameter(
        *req_id, exchange, *underlying_con_id, trading_class, multiplier, expirations, strikes,
      )
    }
    InboundEvent::SecDefOptParamsEnd { req_id } => handler.data_ref.security_definition_option_parameter_end(*req_id),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_script_line() {
    let json = r#"{"type":"account_summary","req_id":0,"account":"DU123","tag":"NetLiquidation","value":"5000.0"}"#;
    let event: InboundEvent = serde_json::from_str(json).unwrap();
    assert_eq!(
      event,
      InboundEvent::AccountSummary {
        req_id: 0,
        account: "DU123".into(),
        tag: "NetLiquidation".into(),
        value: "5000.0".into(),
        currency: String::new(),
      }
    );
  }

  #[test]
  fn test_with_request_id_stamps_replies_only() {
    let end = InboundEvent::ContractDetailsEnd { req_id: 0 }.with_request_id(42);
    assert_eq!(end, InboundEvent::ContractDetailsEnd { req_id: 42 });

    let exec = InboundEvent::Execution {
      req_id: -1,
      contract: Contract::stock("AAPL"),
      execution: Execution {
        execution_id: "0001".into(),
        order_id: 0,
        symbol: "AAPL".into(),
        side: "BOT".into(),
        shares: 10.0,
        price: 150.0,
        time: String::new(),
      },
    }
    .with_request_id(100);
    match exec {
      InboundEvent::Execution { req_id, execution, .. } => {
        assert_eq!(req_id, -1);
        assert_eq!(execution.order_id, 100);
      }
      other => panic!("unexpected {:?}", other),
    }

    assert_eq!(InboundEvent::PositionEnd.with_request_id(9), InboundEvent::PositionEnd);
  }
}
