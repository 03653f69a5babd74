// twsync/src/account.rs
// Account, position and execution types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::base::RequestId;
use crate::contract::SecType;

/// Account metrics from one `reqAccountSummary` round trip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccountSnapshot {
  pub values: HashMap<String, Decimal>,
  /// Account code reported alongside the values (last one seen).
  pub account: Option<String>,
  /// True when the summary end marker arrived before the deadline.
  pub complete: bool,
}

impl AccountSnapshot {
  pub fn get(&self, tag: &str) -> Option<Decimal> {
    self.values.get(tag).copied()
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

/// What `collect` returns when the account summary does not finish in time.
///
/// A missing tag must be read as "unknown", so the default keeps partial data and flags it
/// rather than inventing values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum AccountFallback {
  /// Return `IBKRError::Timeout`.
  Fail,
  /// Return whatever arrived, with `complete == false`.
  #[default]
  Partial,
  /// Return whatever arrived, filling missing tags from the given values.
  Substitute(HashMap<String, Decimal>),
}

/// A position line from `reqPositions`.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
  pub account: String,
  pub symbol: String,
  pub con_id: i32,
  pub sec_type: SecType,
  pub currency: String,
  pub exchange: String,
  pub multiplier: Option<String>,
  pub position: f64,
  pub avg_cost: f64,
}

/// Positions collected until `positionEnd`, or until the deadline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionsSnapshot {
  pub positions: Vec<Position>,
  pub complete: bool,
}

/// A single fill as reported by `execDetails`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
  pub execution_id: String,
  pub order_id: RequestId,
  pub symbol: String,
  /// "BOT" or "SLD" as sent by TWS.
  pub side: String,
  pub shares: f64,
  pub price: f64,
  #[serde(default)]
  pub time: String,
}
