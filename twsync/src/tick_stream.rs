// twsync/src/tick_stream.rs
//! Per-symbol buffers of streaming quote updates.
//!
//! Each `reqMktData` line gets its own request id; pushes are mapped back to the symbol through
//! that id. A price tick appends a record, the size tick that TWS sends right after it is merged
//! into the same record.

use crate::base::{IBKRError, RequestId};
use crate::conn::{CancelKind, OutboundRequest, Transport};
use crate::contract::Contract;
use crate::data::{TickRecord, TickType};
use crate::ids::IdAllocator;
use chrono::Utc;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Bounded FIFO of ticks for one symbol, plus the string metadata TWS sends alongside.
#[derive(Debug, Clone)]
pub struct SymbolTickBuffer {
  records: VecDeque<TickRecord>,
  capacity: usize,
  last_timestamp: Option<String>,
  last_exchange: Option<String>,
}

impl SymbolTickBuffer {
  pub fn new(capacity: usize) -> Self {
    SymbolTickBuffer {
      records: VecDeque::with_capacity(capacity.min(1024)),
      capacity,
      last_timestamp: None,
      last_exchange: None,
    }
  }

  fn push(&mut self, record: TickRecord) {
    if self.capacity == 0 {
      return;
    }
    if self.records.len() == self.capacity {
      self.records.pop_front();
    }
    self.records.push_back(record);
  }

  /// Merges `size` into the newest record. Returns false if there is nothing to amend.
  fn amend_size(&mut self, size: f64) -> bool {
    match self.records.back_mut() {
      Some(last) => {
        last.size = Some(size);
        true
      }
      None => false,
    }
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn last_timestamp(&self) -> Option<&str> {
    self.last_timestamp.as_deref()
  }

  pub fn last_exchange(&self) -> Option<&str> {
    self.last_exchange.as_deref()
  }
}

/// Stream ids, the id currently feeding each symbol, and the buffers. Kept under one lock so a
/// restart and a stop of the same symbol cannot interleave.
#[derive(Default)]
struct StreamState {
  streams: HashMap<RequestId, String>,
  current: HashMap<String, RequestId>,
  buffers: HashMap<String, SymbolTickBuffer>,
}

impl StreamState {
  /// Buffer for pushes on `req_id`, if that id is the symbol's current stream.
  fn buffer_for(&mut self, req_id: RequestId) -> Option<(&str, &mut SymbolTickBuffer)> {
    let symbol = self.streams.get(&req_id)?;
    if self.current.get(symbol) != Some(&req_id) {
      trace!("Push on superseded stream {} for {}; dropped", req_id, symbol);
      return None;
    }
    let buffer = self.buffers.get_mut(symbol)?;
    Some((symbol.as_str(), buffer))
  }
}

pub struct TickStream {
  transport: Arc<dyn Transport>,
  ids: Arc<IdAllocator>,
  capacity: usize,
  state: Mutex<StreamState>,
}

impl TickStream {
  pub fn new(transport: Arc<dyn Transport>, ids: Arc<IdAllocator>, capacity: usize) -> Self {
    TickStream {
      transport,
      ids,
      capacity,
      state: Mutex::new(StreamState::default()),
    }
  }

  /// Starts a quote stream for `symbol` and returns its request id.
  ///
  /// A restart replaces the symbol's buffer. The older stream stays registered until it is
  /// stopped, but its pushes are dropped from then on.
  pub fn start_stream(&self, symbol: &str) -> Result<RequestId, IBKRError> {
    let req_id = self.ids.next()?;
    info!("Starting tick stream: ReqID={}, Symbol={}", req_id, symbol);

    let previous = {
      let mut state = self.state.lock();
      state.streams.insert(req_id, symbol.to_string());
      let prev_id = state.current.insert(symbol.to_string(), req_id);
      let prev_buffer = state.buffers.insert(symbol.to_string(), SymbolTickBuffer::new(self.capacity));
      prev_id.zip(prev_buffer)
    };

    let request = OutboundRequest::MarketData { contract: Contract::stock(symbol) };
    if let Err(e) = self.transport.submit(req_id, request) {
      warn!("Market data request {} for {} failed to send: {:?}", req_id, symbol, e);
      let mut state = self.state.lock();
      state.streams.remove(&req_id);
      if state.current.get(symbol) == Some(&req_id) {
        match previous {
          Some((prev_id, buffer)) if state.streams.contains_key(&prev_id) => {
            state.current.insert(symbol.to_string(), prev_id);
            state.buffers.insert(symbol.to_string(), buffer);
          }
          _ => {
            state.current.remove(symbol);
            state.buffers.remove(symbol);
          }
        }
      }
      return Err(e);
    }
    Ok(req_id)
  }

  pub fn on_price_tick(&self, req_id: RequestId, tick_type: i32, price: f64) {
    let mut state = self.state.lock();
    let Some((symbol, buffer)) = state.buffer_for(req_id) else {
      trace!("Price tick for unknown stream {}", req_id);
      return;
    };
    trace!("Tick price: {} {:?} {}", symbol, TickType::from_code(tick_type), price);
    buffer.push(TickRecord { timestamp: Utc::now(), price: Some(price), size: None });
  }

  pub fn on_size_tick(&self, req_id: RequestId, tick_type: i32, size: f64) {
    let mut state = self.state.lock();
    let Some((symbol, buffer)) = state.buffer_for(req_id) else {
      trace!("Size tick for unknown stream {}", req_id);
      return;
    };
    if !buffer.amend_size(size) {
      trace!("Size tick {:?} for {} before any price; dropped", TickType::from_code(tick_type), symbol);
    }
  }

  pub fn on_string_tick(&self, req_id: RequestId, tick_type: i32, value: &str) {
    let mut state = self.state.lock();
    let Some((symbol, buffer)) = state.buffer_for(req_id) else {
      trace!("String tick for unknown stream {}", req_id);
      return;
    };
    match TickType::from_code(tick_type) {
      Some(TickType::LastTimestamp) => buffer.last_timestamp = Some(value.to_string()),
      Some(TickType::BidExchange) | Some(TickType::AskExchange) | Some(TickType::LastExchange) => {
        buffer.last_exchange = Some(value.to_string())
      }
      _ => trace!("Ignoring string tick type {} for {}", tick_type, symbol),
    }
  }

  /// Cancels the stream. The buffer is discarded only if this was the symbol's current stream.
  /// The cancel is not acknowledged by TWS.
  pub fn stop_stream(&self, req_id: RequestId) -> Result<(), IBKRError> {
    let symbol = {
      let mut state = self.state.lock();
      let symbol = state.streams.remove(&req_id)
        .ok_or(IBKRError::UnknownRequestId(req_id))?;
      if state.current.get(&symbol) == Some(&req_id) {
        state.current.remove(&symbol);
        state.buffers.remove(&symbol);
      }
      symbol
    };
    info!("Stopping tick stream: ReqID={}, Symbol={}", req_id, symbol);
    if let Err(e) = self.transport.cancel(req_id, CancelKind::MarketData) {
      warn!("Cancel of market data {} failed: {:?}", req_id, e);
    }
    debug!("Tick stream {} for {} closed", req_id, symbol);
    Ok(())
  }

  pub fn snapshot(&self, symbol: &str) -> Option<Vec<TickRecord>> {
    self.state.lock().buffers.get(symbol).map(|b| b.records.iter().cloned().collect())
  }

  pub fn latest(&self, symbol: &str) -> Option<TickRecord> {
    self.state.lock().buffers.get(symbol).and_then(|b| b.records.back().cloned())
  }

  /// Timestamp and exchange strings last reported for `symbol`.
  pub fn metadata(&self, symbol: &str) -> Option<(Option<String>, Option<String>)> {
    self.state.lock().buffers.get(symbol).map(|b| (b.last_timestamp.clone(), b.last_exchange.clone()))
  }

  pub fn symbols(&self) -> Vec<String> {
    let mut symbols: Vec<String> = self.state.lock().buffers.keys().cloned().collect();
    symbols.sort();
    symbols
  }
}
