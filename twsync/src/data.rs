// twsync/src/data.rs
// Market data types shared by the tick stream and depth book

use chrono::{DateTime, Utc};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tick types the session interprets.
/// Based on `https://interactivebrokers.github.io/tws-api/tick_types.html`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(i32)]
pub enum TickType {
  BidSize = 0,
  BidPrice = 1,
  AskPrice = 2,
  AskSize = 3,
  LastPrice = 4,
  LastSize = 5,
  High = 6,
  Low = 7,
  Volume = 8,
  ClosePrice = 9,
  OpenTick = 14,
  BidExchange = 32,
  AskExchange = 33,
  LastTimestamp = 45,
  LastExchange = 84,
}

impl TickType {
  pub fn from_code(code: i32) -> Option<Self> {
    TickType::try_from(code).ok()
  }
}

impl fmt::Display for TickType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TickType::BidSize => "Bid Size",
      TickType::BidPrice => "Bid Price",
      TickType::AskPrice => "Ask Price",
      TickType::AskSize => "Ask Size",
      TickType::LastPrice => "Last Price",
      TickType::LastSize => "Last Size",
      TickType::High => "High",
      TickType::Low => "Low",
      TickType::Volume => "Volume",
      TickType::ClosePrice => "Close",
      TickType::OpenTick => "Open",
      TickType::BidExchange => "Bid Exchange",
      TickType::AskExchange => "Ask Exchange",
      TickType::LastTimestamp => "Last Timestamp",
      TickType::LastExchange => "Last Exchange",
    };
    write!(f, "{}", s)
  }
}

/// One quote update. A size that follows its price is merged into the same record.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
  pub timestamp: DateTime<Utc>,
  pub price: Option<f64>,
  pub size: Option<f64>,
}

/// Side of a depth row. TWS sends 0 for ask and 1 for bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthSide {
  Ask,
  Bid,
}

impl DepthSide {
  pub fn from_code(code: i32) -> Option<Self> {
    match code {
      0 => Some(DepthSide::Ask),
      1 => Some(DepthSide::Bid),
      _ => None,
    }
  }
}

/// Row operation in a depth update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthOperation {
  Insert,
  Update,
  Delete,
}

impl DepthOperation {
  pub fn from_code(code: i32) -> Option<Self> {
    match code {
      0 => Some(DepthOperation::Insert),
      1 => Some(DepthOperation::Update),
      2 => Some(DepthOperation::Delete),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthRow {
  pub price: f64,
  pub size: f64,
  /// Only set for L2 (market maker) updates.
  pub market_maker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DepthSnapshot {
  pub symbol: String,
  pub bids: Vec<DepthRow>,
  pub asks: Vec<DepthRow>,
  pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tick_type_codes() {
    assert_eq!(TickType::from_code(4), Some(TickType::LastPrice));
    assert_eq!(TickType::from_code(45), Some(TickType::LastTimestamp));
    assert_eq!(TickType::from_code(999), None);
    assert_eq!(TickType::LastSize.to_string(), "Last Size");
  }

  #[test]
  fn test_depth_codes() {
    assert_eq!(DepthSide::from_code(1), Some(DepthSide::Bid));
    assert_eq!(DepthOperation::from_code(2), Some(DepthOperation::Delete));
    assert_eq!(DepthOperation::from_code(3), None);
  }
}
