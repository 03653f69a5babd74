// twsync/src/base.rs
// Base types and error definitions for the session layer

use thiserror::Error;

/// Identifier assigned by the client to every outbound request and order.
pub type RequestId = i32;

/// Errors surfaced to callers of the session API.
///
/// Conditions detected on the delivery thread (unknown ids, late replies) are never turned
/// into errors; they are absorbed where they occur.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IBKRError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Not connected to IBKR")]
  NotConnected,

  #[error("Session not ready: {0}")]
  NotReady(String),

  #[error("Transport error: {0}")]
  TransportError(String),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("Duplicate request ID: {0}")]
  DuplicateRequestId(RequestId),

  #[error("Unknown request ID: {0}")]
  UnknownRequestId(RequestId),

  #[error("Already running: {0}")]
  AlreadyRunning(String),

  #[error("Invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("Internal error: {0}")]
  InternalError(String),

  #[error("API error: code={0}, msg={1}")]
  ApiError(i32, String),
}

impl IBKRError {
  pub fn is_timeout(&self) -> bool {
    matches!(self, IBKRError::Timeout(_))
  }
}
