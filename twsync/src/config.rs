// twsync/src/config.rs
//! Session configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it overrides. Durations are
//! written as integer milliseconds.

use crate::account::AccountFallback;
use crate::base::IBKRError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

/// Tags requested by `AccountManager::collect` unless configured otherwise.
pub const DEFAULT_ACCOUNT_TAGS: &[&str] = &[
  "AccountType",
  "NetLiquidation",
  "TotalCashValue",
  "SettledCash",
  "BuyingPower",
  "EquityWithLoanValue",
  "GrossPositionValue",
  "AvailableFunds",
  "ExcessLiquidity",
  "InitMarginReq",
  "MaintMarginReq",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  /// Ticks kept per symbol before the oldest are evicted (default: 3000)
  pub tick_buffer_capacity: usize,
  #[serde(with = "duration_ms")]
  pub contract_timeout: Duration,
  #[serde(with = "duration_ms")]
  pub historical_timeout: Duration,
  #[serde(with = "duration_ms")]
  pub account_timeout: Duration,
  #[serde(with = "duration_ms")]
  pub open_orders_timeout: Duration,
  #[serde(with = "duration_ms")]
  pub positions_timeout: Duration,
  #[serde(with = "duration_ms")]
  pub option_chain_timeout: Duration,
  /// Rows per side requested for market depth (default: 5)
  pub market_depth_rows: i32,
  /// Account group for account summary requests (default: "All")
  pub account_group: String,
  pub account_tags: Vec<String>,
  pub account_fallback: AccountFallback,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      tick_buffer_capacity: 3000,
      contract_timeout: Duration::from_secs(10),
      historical_timeout: Duration::from_secs(30),
      account_timeout: Duration::from_secs(10),
      open_orders_timeout: Duration::from_secs(5),
      positions_timeout: Duration::from_secs(10),
      option_chain_timeout: Duration::from_secs(30),
      market_depth_rows: 5,
      account_group: "All".to_string(),
      account_tags: DEFAULT_ACCOUNT_TAGS.iter().map(|t| t.to_string()).collect(),
      account_fallback: AccountFallback::Partial,
    }
  }
}

impl SessionConfig {
  pub fn from_json_str(json: &str) -> Result<Self, IBKRError> {
    let config: SessionConfig = serde_json::from_str(json)
      .map_err(|e| IBKRError::ConfigurationError(format!("invalid session config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, IBKRError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
      .map_err(|e| IBKRError::ConfigurationError(format!("cannot read {}: {}", path.display(), e)))?;
    Self::from_json_str(&json)
  }

  pub fn validate(&self) -> Result<(), IBKRError> {
    if self.tick_buffer_capacity == 0 {
      return Err(IBKRError::ConfigurationError("tick_buffer_capacity must be positive".to_string()));
    }
    let timeouts = [
      ("contract_timeout", self.contract_timeout),
      ("historical_timeout", self.historical_timeout),
      ("account_timeout", self.account_timeout),
      ("open_orders_timeout", self.open_orders_timeout),
      ("positions_timeout", self.positions_timeout),
      ("option_chain_timeout", self.option_chain_timeout),
    ];
    if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
      return Err(IBKRError::ConfigurationError(format!("{} must be positive", name)));
    }
    if self.market_depth_rows <= 0 {
      return Err(IBKRError::ConfigurationError("market_depth_rows must be positive".to_string()));
    }
    if self.account_tags.is_empty() {
      return Err(IBKRError::ConfigurationError("account_tags must not be empty".to_string()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rust_decimal::Decimal;
  use std::io::Write;

  #[test]
  fn test_defaults_are_valid() {
    let config = SessionConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.tick_buffer_capacity, 3000);
    assert_eq!(config.account_fallback, AccountFallback::Partial);
    assert!(config.account_tags.iter().any(|t| t == "AvailableFunds"));
  }

  #[test]
  fn test_partial_json_overrides() {
    let config = SessionConfig::from_json_str(
      r#"{"tick_buffer_capacity": 50, "account_timeout": 250, "account_fallback": "Fail"}"#,
    ).unwrap();
    assert_eq!(config.tick_buffer_capacity, 50);
    assert_eq!(config.account_timeout, Duration::from_millis(250));
    assert_eq!(config.account_fallback, AccountFallback::Fail);
    assert_eq!(config.contract_timeout, Duration::from_secs(10));
  }

  #[test]
  fn test_substitute_fallback_from_json() {
    let config = SessionConfig::from_json_str(
      r#"{"account_fallback": {"Substitute": {"AvailableFunds": "0"}}}"#,
    ).unwrap();
    match config.account_fallback {
      AccountFallback::Substitute(map) => assert_eq!(map.get("AvailableFunds"), Some(&Decimal::ZERO)),
      other => panic!("unexpected fallback {:?}", other),
    }
  }

  #[test]
  fn test_validation_errors() {
    let err = SessionConfig::from_json_str(r#"{"tick_buffer_capacity": 0}"#).unwrap_err();
    assert!(matches!(err, IBKRError::ConfigurationError(_)));

    let err = SessionConfig::from_json_str(r#"{"positions_timeout": 0}"#).unwrap_err();
    assert_eq!(err, IBKRError::ConfigurationError("positions_timeout must be positive".into()));

    let err = SessionConfig::from_json_str(r#"{"account_tags": []}"#).unwrap_err();
    assert!(matches!(err, IBKRError::ConfigurationError(_)));

    assert!(SessionConfig::from_json_str("{not json").is_err());
  }

  #[test]
  fn test_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"market_depth_rows": 10, "account_group": "DU123"}}"#).unwrap();
    let config = SessionConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.market_depth_rows, 10);
    assert_eq!(config.account_group, "DU123");

    let missing = SessionConfig::from_json_file(file.path().with_extension("missing"));
    assert!(matches!(missing, Err(IBKRError::ConfigurationError(_))));
  }

  #[test]
  fn test_serialized_durations_are_millis() {
    let json = serde_json::to_value(SessionConfig::default()).unwrap();
    assert_eq!(json["open_orders_timeout"], 5000);
  }
}
