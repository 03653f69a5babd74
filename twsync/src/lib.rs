// twsync/src/lib.rs
// Main entry point for the session library

//! # twsync
//!
//! A synchronous request/response layer over the callback-driven TWS API:
//!
//! - Blocking calls with deadlines for contract details, history, account and positions
//! - Order entry, including three-leg brackets with fill attribution
//! - Bounded per-symbol tick buffers and L2 depth books
//! - A scripted transport for driving a session without TWS
//!
//! A [`TradingSession`] owns all state. Replies reach it through the [`handler::MessageHandler`]
//! returned at construction, usually fed by an [`EventDispatcher`] thread.

mod base;
mod ids;
mod correlator;
mod message_parser;
mod conn_mock;
mod dispatcher;
mod config;
mod tick_stream;
mod market_depth;
mod open_orders;
mod fill_tracker;
pub mod account;
pub mod contract;
pub mod data;
pub mod order;
pub mod conn;
pub mod handler;
pub mod client;
pub mod order_manager;
pub mod account_manager;
pub mod data_ref_manager;
pub mod data_market_manager;

pub use base::{IBKRError, RequestId};
pub use client::TradingSession;
pub use config::SessionConfig;
pub use conn::{CancelKind, OutboundRequest, Transport};
pub use conn_mock::{Script, ScriptedTransport};
pub use correlator::{Completion, RequestCorrelator};
pub use dispatcher::EventDispatcher;
pub use fill_tracker::{BracketFillTracker, FillRecord, OrderRole};
pub use ids::IdAllocator;
pub use message_parser::{process_event, InboundEvent};
pub use open_orders::{OpenOrderCache, OpenOrderEntry, OpenOrdersSnapshot};
pub use tick_stream::TickStream;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
