// twsync/src/ids.rs
//! Request and order identifier allocation.
//!
//! TWS hands out the first usable order id in its `nextValidId` message right after the
//! handshake. Every request the session makes (orders, contract lookups, market data lines,
//! account summaries) draws from that single counter, so ids are unique across kinds for the
//! lifetime of the connection.

use crate::base::{IBKRError, RequestId};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct IdAllocator {
  next_id: Mutex<Option<RequestId>>,
  seeded_cond: Condvar,
}

impl Default for IdAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl IdAllocator {
  pub fn new() -> Self {
    IdAllocator {
      next_id: Mutex::new(None),
      seeded_cond: Condvar::new(),
    }
  }

  /// Seeds the counter from the session-ready signal.
  ///
  /// TWS resends `nextValidId` on demand; a re-seed only ever moves the counter forward.
  pub fn seed(&self, first: RequestId) {
    let mut guard = self.next_id.lock();
    match *guard {
      None => {
        info!("Id allocator seeded with {}", first);
        *guard = Some(first);
      }
      Some(current) if first > current => {
        debug!("Id allocator advanced from {} to {}", current, first);
        *guard = Some(first);
      }
      Some(current) => {
        debug!("Ignoring stale next valid id {} (counter at {})", first, current);
      }
    }
    self.seeded_cond.notify_all();
  }

  pub fn is_seeded(&self) -> bool {
    self.next_id.lock().is_some()
  }

  /// The id the next call to `next()` would return.
  pub fn peek(&self) -> Option<RequestId> {
    *self.next_id.lock()
  }

  pub fn next(&self) -> Result<RequestId, IBKRError> {
    self.reserve_block(1)
  }

  /// Reserves `n` contiguous ids and returns the first one.
  pub fn reserve_block(&self, n: usize) -> Result<RequestId, IBKRError> {
    if n == 0 {
      return Err(IBKRError::InvalidParameter("cannot reserve an empty id block".to_string()));
    }
    let n = RequestId::try_from(n)
      .map_err(|_| IBKRError::InvalidParameter(format!("id block of {} is too large", n)))?;
    let mut guard = self.next_id.lock();
    let first = guard.ok_or_else(|| IBKRError::NotReady("next valid id not received yet".to_string()))?;
    let after = first.checked_add(n)
      .ok_or_else(|| IBKRError::InternalError("request id space exhausted".to_string()))?;
    *guard = Some(after);
    Ok(first)
  }

  /// Blocks until the allocator is seeded. Returns the current counter value.
  pub fn wait_until_seeded(&self, timeout: Duration) -> Result<RequestId, IBKRError> {
    let deadline = Instant::now() + timeout;
    let mut guard = self.next_id.lock();
    loop {
      if let Some(id) = *guard {
        return Ok(id);
      }
      if self.seeded_cond.wait_until(&mut guard, deadline).timed_out() {
        return guard.ok_or_else(|| {
          IBKRError::Timeout(format!("next valid id not received within {:?}", timeout))
        });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn test_unseeded_allocator_refuses() {
    let ids = IdAllocator::new();
    assert!(matches!(ids.next(), Err(IBKRError::NotReady(_))));
    assert!(matches!(ids.reserve_block(3), Err(IBKRError::NotReady(_))));
    assert_eq!(ids.peek(), None);
  }

  #[test]
  fn test_reserve_block_from_500() {
    let ids = IdAllocator::new();
    ids.seed(500);
    assert_eq!(ids.reserve_block(3).unwrap(), 500);
    assert_eq!(ids.peek(), Some(503));
    assert_eq!(ids.next().unwrap(), 503);
    assert_eq!(ids.peek(), Some(504));
  }

  #[test]
  fn test_empty_block_rejected() {
    let ids = IdAllocator::new();
    ids.seed(1);
    assert!(matches!(ids.reserve_block(0), Err(IBKRError::InvalidParameter(_))));
    assert_eq!(ids.peek(), Some(1));
  }

  #[test]
  fn test_reseed_never_moves_backwards() {
    let ids = IdAllocator::new();
    ids.seed(10);
    ids.next().unwrap();
    ids.next().unwrap();
    ids.seed(5);
    assert_eq!(ids.peek(), Some(12));
    ids.seed(40);
    assert_eq!(ids.peek(), Some(40));
  }

  #[test]
  fn test_concurrent_ranges_partition_the_span() {
    let ids = Arc::new(IdAllocator::new());
    ids.seed(1000);
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let ids = ids.clone();
        thread::spawn(move || {
          let mut taken = Vec::new();
          for k in 0..200 {
            let n = 1 + (t + k) % 3;
            let first = ids.reserve_block(n).unwrap();
            taken.extend(first..first + n as i32);
          }
          taken
        })
      })
      .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for h in handles {
      for id in h.join().unwrap() {
        assert!(seen.insert(id), "id {} issued twice", id);
        total += 1;
      }
    }
    let end = ids.peek().unwrap();
    assert_eq!((end - 1000) as usize, total);
    assert!((1000..end).all(|id| seen.contains(&id)));
  }

  #[test]
  fn test_wait_until_seeded() {
    let ids = Arc::new(IdAllocator::new());
    assert!(ids.wait_until_seeded(Duration::from_millis(20)).unwrap_err().is_timeout());

    let seeder = {
      let ids = ids.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        ids.seed(77);
      })
    };
    assert_eq!(ids.wait_until_seeded(Duration::from_secs(5)).unwrap(), 77);
    seeder.join().unwrap();
  }
}
