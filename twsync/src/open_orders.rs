// twsync/src/open_orders.rs
//! Point-in-time view of the account's working orders.
//!
//! The cache is kept current by order pushes and can be rebuilt on demand with
//! [`OpenOrderCache::refresh`], which enumerates open orders through the correlator and
//! completes on the enumeration end marker.

use crate::base::{IBKRError, RequestId};
use crate::conn::{CancelKind, OutboundRequest, Transport};
use crate::correlator::{Completion, RequestCorrelator};
use crate::ids::IdAllocator;
use crate::order::OrderStatus;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrderEntry {
  pub order_id: RequestId,
  pub contract_summary: String,
  pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpenOrdersSnapshot {
  pub entries: Vec<OpenOrderEntry>,
  /// False when the enumeration did not finish before the deadline.
  pub complete: bool,
}

impl OpenOrdersSnapshot {
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

fn upsert(entries: &mut Vec<OpenOrderEntry>, entry: OpenOrderEntry) {
  match entries.iter_mut().find(|e| e.order_id == entry.order_id) {
    Some(existing) => *existing = entry,
    None => entries.push(entry),
  }
}

pub struct OpenOrderCache {
  transport: Arc<dyn Transport>,
  ids: Arc<IdAllocator>,
  correlator: Arc<RequestCorrelator>,
  entries: Mutex<BTreeMap<RequestId, OpenOrderEntry>>,
  /// Enumerations in flight. The end marker carries no id, so it completes all of them.
  pending_refreshes: Mutex<Vec<RequestId>>,
}

impl OpenOrderCache {
  pub fn new(transport: Arc<dyn Transport>, ids: Arc<IdAllocator>, correlator: Arc<RequestCorrelator>) -> Self {
    OpenOrderCache {
      transport,
      ids,
      correlator,
      entries: Mutex::new(BTreeMap::new()),
      pending_refreshes: Mutex::new(Vec::new()),
    }
  }

  /// Rebuilds the cache from a fresh enumeration. On timeout the orders seen so far are
  /// returned with `complete == false`.
  pub fn refresh(&self, timeout: Duration) -> Result<OpenOrdersSnapshot, IBKRError> {
    let req_id = self.ids.next()?;
    info!("Refreshing open orders: ReqID={}", req_id);

    self.entries.lock().clear();
    self.correlator.register_as::<Vec<OpenOrderEntry>>(req_id)?;
    self.pending_refreshes.lock().push(req_id);

    if let Err(e) = self.transport.submit(req_id, OutboundRequest::OpenOrders) {
      self.pending_refreshes.lock().retain(|id| *id != req_id);
      self.correlator.cancel(req_id);
      return Err(e);
    }

    let outcome = self.correlator.wait_outcome_as::<Vec<OpenOrderEntry>>(req_id, timeout);
    self.pending_refreshes.lock().retain(|id| *id != req_id);

    let snapshot = match outcome? {
      Completion::Done(mut entries) => {
        entries.sort_by_key(|e| e.order_id);
        OpenOrdersSnapshot { entries, complete: true }
      }
      Completion::TimedOut(mut entries) => {
        warn!("Open order enumeration {} timed out after {:?}; returning {} partial entries",
              req_id, timeout, entries.len());
        entries.sort_by_key(|e| e.order_id);
        OpenOrdersSnapshot { entries, complete: false }
      }
    };
    debug!("Open order refresh {} returned {} entries", req_id, snapshot.len());
    Ok(snapshot)
  }

  /// Applies an open-order push carrying the contract.
  pub fn on_order_update(&self, order_id: RequestId, contract_summary: &str, status: OrderStatus) {
    let entry = OpenOrderEntry { order_id, contract_summary: contract_summary.to_string(), status };
    {
      let mut entries = self.entries.lock();
      if status.is_terminal() {
        if entries.remove(&order_id).is_some() {
          debug!("Order {} left the open set ({})", order_id, status);
        }
      } else {
        entries.insert(order_id, entry.clone());
      }
    }

    let pending = self.pending_refreshes.lock().clone();
    for req_id in pending {
      self.correlator.deliver_as::<Vec<OpenOrderEntry>, _>(req_id, |buffer| {
        if status.is_terminal() {
          buffer.retain(|e| e.order_id != order_id);
        } else {
          upsert(buffer, entry.clone());
        }
      });
    }
  }

  /// Applies a status push, which has no contract attached.
  pub fn on_status(&self, order_id: RequestId, status: OrderStatus) {
    {
      let mut entries = self.entries.lock();
      if status.is_terminal() {
        entries.remove(&order_id);
      } else if let Some(entry) = entries.get_mut(&order_id) {
        entry.status = status;
      } else {
        trace!("Status {} for order {} not in the open set; ignored", status, order_id);
      }
    }

    let pending = self.pending_refreshes.lock().clone();
    for req_id in pending {
      self.correlator.deliver_as::<Vec<OpenOrderEntry>, _>(req_id, |buffer| {
        if status.is_terminal() {
          buffer.retain(|e| e.order_id != order_id);
        } else if let Some(entry) = buffer.iter_mut().find(|e| e.order_id == order_id) {
          entry.status = status;
        }
      });
    }
  }

  pub fn on_enumeration_end(&self) {
    let pending = self.pending_refreshes.lock().clone();
    if pending.is_empty() {
      trace!("Open order end with no refresh in flight");
    }
    for req_id in pending {
      self.correlator.complete(req_id);
    }
  }

  /// Sends a cancel for every cached order matching `predicate`. Entries stay in the cache
  /// until TWS confirms the cancellation.
  pub fn cancel_matching<P>(&self, predicate: P) -> Result<usize, IBKRError>
  where
    P: Fn(&OpenOrderEntry) -> bool,
  {
    let targets: Vec<RequestId> = self.entries.lock().values()
      .filter(|e| predicate(e))
      .map(|e| e.order_id)
      .collect();

    let mut sent = 0;
    let mut last_err = None;
    for order_id in targets {
      match self.transport.cancel(order_id, CancelKind::Order) {
        Ok(()) => {
          info!("Cancel requested for order {}", order_id);
          sent += 1;
        }
        Err(e) => {
          warn!("Failed to cancel order {}: {:?}", order_id, e);
          last_err = Some(e);
        }
      }
    }
    match last_err {
      Some(e) => Err(e),
      None => Ok(sent),
    }
  }

  pub fn entries(&self) -> Vec<OpenOrderEntry> {
    self.entries.lock().values().cloned().collect()
  }

  pub fn get(&self, order_id: RequestId) -> Option<OpenOrderEntry> {
    self.entries.lock().get(&order_id).cloned()
  }
}
