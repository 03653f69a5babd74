// twsync/src/order.rs
// Order request and status types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::base::{IBKRError, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
  Buy,
  Sell,
}

impl OrderSide {
  pub fn opposite(self) -> Self {
    match self {
      OrderSide::Buy => OrderSide::Sell,
      OrderSide::Sell => OrderSide::Buy,
    }
  }
}

impl fmt::Display for OrderSide {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OrderSide::Buy => write!(f, "BUY"),
      OrderSide::Sell => write!(f, "SELL"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
  Market,
  Limit,
  Stop,
}

impl fmt::Display for OrderType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OrderType::Market => write!(f, "MKT"),
      OrderType::Limit => write!(f, "LMT"),
      OrderType::Stop => write!(f, "STP"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
  Day,
  GoodTillCancelled,
}

/// Order parameters as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
  pub side: OrderSide,
  pub order_type: OrderType,
  pub quantity: f64,
  pub limit_price: Option<f64>,
  /// Trigger price for stop orders.
  pub aux_price: Option<f64>,
  pub tif: TimeInForce,
  /// Parent order id for bracket children.
  pub parent_id: Option<RequestId>,
  /// When false TWS holds the order until a later order in the group transmits.
  pub transmit: bool,
}

impl OrderRequest {
  pub fn market(side: OrderSide, quantity: f64) -> Self {
    OrderRequest {
      side,
      order_type: OrderType::Market,
      quantity,
      limit_price: None,
      aux_price: None,
      tif: TimeInForce::GoodTillCancelled,
      parent_id: None,
      transmit: true,
    }
  }

  pub fn limit(side: OrderSide, quantity: f64, limit_price: f64) -> Self {
    OrderRequest {
      order_type: OrderType::Limit,
      limit_price: Some(limit_price),
      ..Self::market(side, quantity)
    }
  }

  pub fn stop(side: OrderSide, quantity: f64, stop_price: f64) -> Self {
    OrderRequest {
      order_type: OrderType::Stop,
      aux_price: Some(stop_price),
      ..Self::market(side, quantity)
    }
  }
}

/// Order status as reported by TWS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
  PendingSubmit,
  PendingCancel,
  PreSubmitted,
  Submitted,
  ApiPending,
  ApiCancelled,
  Cancelled,
  Filled,
  Inactive,
  Unknown,
}

impl OrderStatus {
  /// No further fills or cancellations apply.
  pub fn is_terminal(self) -> bool {
    matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::ApiCancelled)
  }
}

impl fmt::Display for OrderStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OrderStatus::PendingSubmit => "PendingSubmit",
      OrderStatus::PendingCancel => "PendingCancel",
      OrderStatus::PreSubmitted => "PreSubmitted",
      OrderStatus::Submitted => "Submitted",
      OrderStatus::ApiPending => "ApiPending",
      OrderStatus::ApiCancelled => "ApiCancelled",
      OrderStatus::Cancelled => "Cancelled",
      OrderStatus::Filled => "Filled",
      OrderStatus::Inactive => "Inactive",
      OrderStatus::Unknown => "Unknown",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for OrderStatus {
  type Err = IBKRError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "PendingSubmit" => Ok(OrderStatus::PendingSubmit),
      "PendingCancel" => Ok(OrderStatus::PendingCancel),
      "PreSubmitted" => Ok(OrderStatus::PreSubmitted),
      "Submitted" => Ok(OrderStatus::Submitted),
      "ApiPending" => Ok(OrderStatus::ApiPending),
      "ApiCancelled" => Ok(OrderStatus::ApiCancelled),
      "Cancelled" => Ok(OrderStatus::Cancelled),
      "Filled" => Ok(OrderStatus::Filled),
      "Inactive" => Ok(OrderStatus::Inactive),
      _ => Err(IBKRError::InvalidParameter(format!("Unknown order status: {}", s))),
    }
  }
}

/// Direction of a bracket entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
  Long,
  Short,
}

impl Direction {
  pub fn entry_side(self) -> OrderSide {
    match self {
      Direction::Long => OrderSide::Buy,
      Direction::Short => OrderSide::Sell,
    }
  }
}

/// Ids of the three legs of a bracket, reserved as one contiguous block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketIds {
  pub parent: RequestId,
  pub take_profit: RequestId,
  pub stop_loss: RequestId,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_terminal_statuses() {
    assert!(OrderStatus::Filled.is_terminal());
    assert!(OrderStatus::Cancelled.is_terminal());
    assert!(OrderStatus::ApiCancelled.is_terminal());
    assert!(!OrderStatus::PreSubmitted.is_terminal());
    assert!(!OrderStatus::Inactive.is_terminal());
  }

  #[test]
  fn test_status_parse() {
    assert_eq!("PreSubmitted".parse::<OrderStatus>().unwrap(), OrderStatus::PreSubmitted);
    assert!("Exploded".parse::<OrderStatus>().is_err());
  }

  #[test]
  fn test_stop_request() {
    let req = OrderRequest::stop(OrderSide::Sell, 10.0, 95.5);
    assert_eq!(req.order_type, OrderType::Stop);
    assert_eq!(req.aux_price, Some(95.5));
    assert_eq!(req.limit_price, None);
    assert!(req.transmit);
  }
}
