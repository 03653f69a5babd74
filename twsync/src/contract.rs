// twsync/src/contract.rs
// Contract and reference data types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::base::IBKRError;
use crate::order::OrderSide;

/// Security type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecType {
  #[default]
  Stock,
  Option,
  Future,
  Forex,
  Index,
  Combo,
}

impl fmt::Display for SecType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecType::Stock => "STK",
      SecType::Option => "OPT",
      SecType::Future => "FUT",
      SecType::Forex => "CASH",
      SecType::Index => "IND",
      SecType::Combo => "BAG",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for SecType {
  type Err = IBKRError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "STK" => Ok(SecType::Stock),
      "OPT" => Ok(SecType::Option),
      "FUT" => Ok(SecType::Future),
      "CASH" => Ok(SecType::Forex),
      "IND" => Ok(SecType::Index),
      "BAG" => Ok(SecType::Combo),
      _ => Err(IBKRError::InvalidParameter(format!("Unknown security type: {}", s))),
    }
  }
}

/// One leg of a BAG (combo) contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboLeg {
  pub con_id: i32,
  pub ratio: i32,
  pub action: String, // "BUY" or "SELL"
  pub exchange: String,
}

impl ComboLeg {
  /// A leg routed through SMART.
  pub fn smart(con_id: i32, ratio: i32, side: OrderSide) -> Self {
    ComboLeg { con_id, ratio, action: side.to_string(), exchange: "SMART".to_string() }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Contract {
  pub con_id: i32,
  pub symbol: String,
  pub sec_type: SecType,
  pub exchange: String,
  pub primary_exchange: Option<String>,
  pub currency: String,
  pub multiplier: Option<String>,
  pub local_symbol: Option<String>,
  pub combo_legs: Vec<ComboLeg>,
}

impl Contract {
  /// Create a new stock contract routed through SMART in USD.
  pub fn stock(symbol: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Stock,
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
      ..Default::default()
    }
  }

  /// Create a combo contract from its legs.
  pub fn combo(symbol: &str, legs: Vec<ComboLeg>) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Combo,
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
      combo_legs: legs,
      ..Default::default()
    }
  }

  /// Short human readable form, e.g. `AAPL STK@SMART USD`.
  pub fn summary(&self) -> String {
    format!("{} {}@{} {}", self.symbol, self.sec_type, self.exchange, self.currency)
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractDetails {
  pub contract: Contract,
  #[serde(default)]
  pub market_name: String,
  #[serde(default)]
  pub min_tick: f64,
  #[serde(default)]
  pub long_name: String,
  #[serde(default)]
  pub industry: Option<String>,
  #[serde(default)]
  pub time_zone_id: Option<String>,
}

/// Historical bar, with the time string exactly as delivered by TWS.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bar {
  pub time: String,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub volume: f64,
  #[serde(default)]
  pub wap: f64,
  #[serde(default)]
  pub count: i32,
}

/// Expirations and strikes for options on one underlying, merged across exchanges.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptionChain {
  pub underlying_con_id: i32,
  pub exchanges: Vec<String>,
  pub trading_classes: Vec<String>,
  pub multiplier: String,
  pub expirations: std::collections::BTreeSet<String>,
  /// Sorted, without duplicates.
  pub strikes: Vec<f64>,
}

impl OptionChain {
  pub(crate) fn merge(
    &mut self,
    exchange: &str,
    underlying_con_id: i32,
    trading_class: &str,
    multiplier: &str,
    expirations: &[String],
    strikes: &[f64],
  ) {
    self.underlying_con_id = underlying_con_id;
    if !self.exchanges.iter().any(|e| e == exchange) {
      self.exchanges.push(exchange.to_string());
    }
    if !self.trading_classes.iter().any(|c| c == trading_class) {
      self.trading_classes.push(trading_class.to_string());
    }
    if self.multiplier.is_empty() {
      self.multiplier = multiplier.to_string();
    }
    self.expirations.extend(expirations.iter().cloned());
    self.strikes.extend(strikes.iter().copied().filter(|s| s.is_finite()));
    self.strikes.sort_by(|a, b| a.total_cmp(b));
    self.strikes.dedup();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sec_type_round_trip_strings() {
    assert_eq!("BAG".parse::<SecType>().unwrap(), SecType::Combo);
    assert_eq!(SecType::Forex.to_string(), "CASH");
    assert!("XYZ".parse::<SecType>().is_err());
  }

  #[test]
  fn test_option_chain_merge_dedups() {
    let mut chain = OptionChain::default();
    chain.merge("SMART", 265598, "AAPL", "100", &["20250620".into()], &[150.0, 155.0]);
    chain.merge("CBOE", 265598, "AAPL", "100", &["20250620".into(), "20250718".into()], &[155.0, 145.0]);
    assert_eq!(chain.exchanges, vec!["SMART", "CBOE"]);
    assert_eq!(chain.trading_classes, vec!["AAPL"]);
    assert_eq!(chain.expirations.len(), 2);
    assert_eq!(chain.strikes, vec![145.0, 150.0, 155.0]);
  }
}
