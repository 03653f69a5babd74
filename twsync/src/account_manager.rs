// twsync/src/account_manager.rs

//! Account summary snapshots and position lists.
//!
//! Both are one-shot collections rather than subscriptions:
//!
//! -   [`AccountManager::collect`] issues `reqAccountSummary` for the configured group and tags,
//!     gathers `(tag, value)` pairs until `accountSummaryEnd`, then cancels the subscription.
//!     What happens when the end marker does not arrive in time is governed by
//!     [`AccountFallback`].
//! -   [`AccountManager::get_positions`] issues `reqPositions` and gathers non-zero positions
//!     until `positionEnd`.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use twsync::TradingSession;
//! # fn run(session: &TradingSession) -> Result<(), twsync::IBKRError> {
//! let snapshot = session.account().collect(Duration::from_secs(5))?;
//! if !snapshot.complete {
//!   println!("partial summary: {} tags", snapshot.len());
//! }
//! println!("available funds: {:?}", snapshot.get("AvailableFunds"));
//! # Ok(())
//! # }
//! ```

use crate::account::{AccountFallback, AccountSnapshot, Position, PositionsSnapshot};
use crate::base::{IBKRError, RequestId};
use crate::conn::{CancelKind, OutboundRequest, Transport};
use crate::contract::Contract;
use crate::correlator::{Completion, RequestCorrelator};
use crate::handler::AccountHandler;
use crate::ids::IdAllocator;
use parking_lot::{Condvar, Mutex};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info, trace, warn};

/// Positions smaller than this are treated as closed.
const POSITION_EPSILON: f64 = 1e-6;

#[derive(Debug, Default)]
struct PositionCollector {
  in_progress: bool,
  end_received: bool,
  positions: Vec<Position>,
}

pub struct AccountManager {
  transport: Arc<dyn Transport>,
  ids: Arc<IdAllocator>,
  correlator: Arc<RequestCorrelator>,
  group: String,
  tags: Vec<String>,
  fallback: AccountFallback,
  account_timeout: Duration,
  positions_timeout: Duration,
  positions: Mutex<PositionCollector>,
  positions_cond: Condvar,
}

impl AccountManager {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    transport: Arc<dyn Transport>,
    ids: Arc<IdAllocator>,
    correlator: Arc<RequestCorrelator>,
    group: String,
    tags: Vec<String>,
    fallback: AccountFallback,
    account_timeout: Duration,
    positions_timeout: Duration,
  ) -> Arc<Self> {
    Arc::new(AccountManager {
      transport,
      ids,
      correlator,
      group,
      tags,
      fallback,
      account_timeout,
      positions_timeout,
      positions: Mutex::new(PositionCollector::default()),
      positions_cond: Condvar::new(),
    })
  }

  /// Collects the account summary, applying the configured fallback on timeout.
  pub fn collect(&self, timeout: Duration) -> Result<AccountSnapshot, IBKRError> {
    self.collect_with(timeout, &self.fallback)
  }

  /// Collects the account summary with the configured timeout and fallback.
  pub fn get_account_snapshot(&self) -> Result<AccountSnapshot, IBKRError> {
    self.collect(self.account_timeout)
  }

  /// Collects the account summary, applying `fallback` if the end marker does not arrive
  /// within `timeout`.
  pub fn collect_with(&self, timeout: Duration, fallback: &AccountFallback) -> Result<AccountSnapshot, IBKRError> {
    let req_id = self.ids.next()?;
    info!("Requesting account summary: ReqID={}, Group={}, Tags={}", req_id, self.group, self.tags.len());
    self.correlator.register_as::<AccountSnapshot>(req_id)?;
    let request = OutboundRequest::AccountSummary { group: self.group.clone(), tags: self.tags.clone() };
    if let Err(e) = self.transport.submit(req_id, request) {
      self.correlator.cancel(req_id);
      return Err(e);
    }

    let outcome = self.correlator.wait_outcome_as::<AccountSnapshot>(req_id, timeout);

    // The summary stays subscribed on the TWS side until cancelled.
    if let Err(e) = self.transport.cancel(req_id, CancelKind::AccountSummary) {
      warn!("Failed to cancel account summary {}: {:?}", req_id, e);
    }

    match outcome? {
      Completion::Done(mut snapshot) => {
        snapshot.complete = true;
        debug!("Account summary {} complete with {} values", req_id, snapshot.len());
        Ok(snapshot)
      }
      Completion::TimedOut(mut snapshot) => {
        snapshot.complete = false;
        warn!("Account summary {} timed out after {:?} with {} values", req_id, timeout, snapshot.len());
        match fallback {
          AccountFallback::Fail => Err(IBKRError::Timeout(format!(
            "account summary not complete within {:?}", timeout
          ))),
          AccountFallback::Partial => Ok(snapshot),
          AccountFallback::Substitute(defaults) => {
            for (tag, value) in defaults {
              snapshot.values.entry(tag.clone()).or_insert(*value);
            }
            Ok(snapshot)
          }
        }
      }
    }
  }

  /// `AvailableFunds` from a fresh summary.
  pub fn get_available_funds(&self, timeout: Duration) -> Result<Decimal, IBKRError> {
    let snapshot = self.collect(timeout)?;
    match snapshot.get("AvailableFunds") {
      Some(funds) => Ok(funds),
      None if !snapshot.complete => Err(IBKRError::Timeout(format!(
        "AvailableFunds not received within {:?}", timeout
      ))),
      None => Err(IBKRError::InternalError("account summary did not include AvailableFunds".to_string())),
    }
  }

  /// Requests all positions and blocks until `positionEnd` or `timeout`. Zero positions are
  /// left out. Only one position request may be in flight at a time.
  pub fn get_positions(&self, timeout: Duration) -> Result<PositionsSnapshot, IBKRError> {
    {
      let mut collector = self.positions.lock();
      if collector.in_progress {
        warn!("get_positions called while another position request is in progress.");
        return Err(IBKRError::AlreadyRunning("position request already in progress".to_string()));
      }
      *collector = PositionCollector { in_progress: true, ..Default::default() };
    }
    let req_id: RequestId = match self.ids.next() {
      Ok(id) => id,
      Err(e) => {
        self.positions.lock().in_progress = false;
        return Err(e);
      }
    };

    info!("Requesting positions: ReqID={}", req_id);
    if let Err(e) = self.transport.submit(req_id, OutboundRequest::Positions) {
      self.positions.lock().in_progress = false;
      return Err(e);
    }

    let deadline = Instant::now() + timeout;
    let mut collector = self.positions.lock();
    while !collector.end_received {
      if self.positions_cond.wait_until(&mut collector, deadline).timed_out() {
        break;
      }
    }
    let complete = collector.end_received;
    let positions = std::mem::take(&mut collector.positions);
    collector.in_progress = false;
    drop(collector);

    if !complete {
      warn!("Position request {} timed out after {:?} with {} positions", req_id, timeout, positions.len());
    }
    if let Err(e) = self.transport.cancel(req_id, CancelKind::Positions) {
      warn!("Failed to cancel positions {}: {:?}", req_id, e);
    }
    Ok(PositionsSnapshot { positions, complete })
  }

  /// Positions with the configured timeout.
  pub fn list_open_positions(&self) -> Result<PositionsSnapshot, IBKRError> {
    self.get_positions(self.positions_timeout)
  }
}

fn parse_decimal(value: &str) -> Option<Decimal> {
  Decimal::from_str(value).or_else(|_| Decimal::from_scientific(value)).ok()
}

impl AccountHandler for AccountManager {
  fn account_summary(&self, req_id: RequestId, account: &str, tag: &str, value: &str, currency: &str) {
    trace!("Handler: Account Summary: ReqID={}, Account={}, Tag={}, Value={}, Currency={}",
           req_id, account, tag, value, currency);
    let Some(parsed) = parse_decimal(value) else {
      debug!("Skipping non-numeric account value {}={}", tag, value);
      return;
    };
    self.correlator.deliver_as::<AccountSnapshot, _>(req_id, |snapshot| {
      snapshot.values.insert(tag.to_string(), parsed);
      if !account.is_empty() {
        snapshot.account = Some(account.to_string());
      }
    });
  }

  fn account_summary_end(&self, req_id: RequestId) {
    debug!("Handler: Account Summary End: ReqID={}", req_id);
    self.correlator.complete(req_id);
  }

  fn position(&self, account: &str, contract: &Contract, position: f64, avg_cost: f64) {
    debug!("Handler: Position: Account={}, ConID={}, Symbol={}, Qty={}, AvgCost={}",
           account, contract.con_id, contract.symbol, position, avg_cost);
    let mut collector = self.positions.lock();
    if !collector.in_progress {
      trace!("Position for {} outside a position request; ignored", contract.symbol);
      return;
    }
    if position.abs() <= POSITION_EPSILON {
      return;
    }
    collector.positions.push(Position {
      account: account.to_string(),
      symbol: contract.symbol.clone(),
      con_id: contract.con_id,
      sec_type: contract.sec_type,
      currency: contract.currency.clone(),
      exchange: contract.exchange.clone(),
      multiplier: contract.multiplier.clone(),
      position,
      avg_cost,
    });
  }

  fn position_end(&self) {
    debug!("Handler: Position End");
    let mut collector = self.positions.lock();
    if collector.in_progress {
      collector.end_received = true;
      self.positions_cond.notify_all();
    }
  }
}
