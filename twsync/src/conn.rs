// twsync/src/conn.rs
//! The seam to the broker gateway.
//!
//! Encoding, framing and the socket all live behind [`Transport`]. The session only ever
//! submits tagged requests and cancellations; replies come back through the handler traits
//! in [`crate::handler`], invoked from the transport's delivery thread.

use crate::base::{IBKRError, RequestId};
use crate::contract::{Contract, SecType};
use crate::order::OrderRequest;
use serde::{Deserialize, Serialize};

/// Outbound requests the session knows how to issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboundRequest {
  ContractDetails { contract: Contract },
  HistoricalData {
    contract: Contract,
    /// Empty means "now".
    end_date_time: String,
    duration: String,
    bar_size: String,
    what_to_show: String,
    use_rth: bool,
  },
  AccountSummary { group: String, tags: Vec<String> },
  OpenOrders,
  Positions,
  MarketData { contract: Contract },
  MarketDepth { contract: Contract, num_rows: i32, is_smart_depth: bool },
  SecDefOptParams {
    underlying_symbol: String,
    fut_fop_exchange: String,
    underlying_sec_type: SecType,
    underlying_con_id: i32,
  },
  PlaceOrder { contract: Contract, order: OrderRequest },
}

impl OutboundRequest {
  /// Stable name used in logs and reply scripts.
  pub fn kind_name(&self) -> &'static str {
    match self {
      OutboundRequest::ContractDetails { .. } => "contract_details",
      OutboundRequest::HistoricalData { .. } => "historical_data",
      OutboundRequest::AccountSummary { .. } => "account_summary",
      OutboundRequest::OpenOrders => "open_orders",
      OutboundRequest::Positions => "positions",
      OutboundRequest::MarketData { .. } => "market_data",
      OutboundRequest::MarketDepth { .. } => "market_depth",
      OutboundRequest::SecDefOptParams { .. } => "sec_def_opt_params",
      OutboundRequest::PlaceOrder { .. } => "place_order",
    }
  }
}

/// Subscriptions that must be torn down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelKind {
  MarketData,
  MarketDepth { is_smart_depth: bool },
  HistoricalData,
  AccountSummary,
  Positions,
  Order,
}

/// Outbound side of the broker connection. Both calls are fire-and-forget: success means the
/// request was handed to the wire, not that TWS acted on it.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
  fn submit(&self, id: RequestId, request: OutboundRequest) -> Result<(), IBKRError>;
  fn cancel(&self, id: RequestId, kind: CancelKind) -> Result<(), IBKRError>;
}
