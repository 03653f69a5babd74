// twsync/src/correlator.rs
//! Synchronous waits over asynchronous replies.
//!
//! A caller registers a pending request under a freshly allocated id, sends the request, and
//! blocks in [`RequestCorrelator::wait`]. The delivery thread merges replies into the request's
//! buffer with [`RequestCorrelator::deliver`] and marks it finished with
//! [`RequestCorrelator::complete`] (or [`RequestCorrelator::fail`] for API errors).
//!
//! The entry is removed exactly once, by the waiter, whether it observed completion or its
//! deadline. Anything the delivery thread sends for an id that is no longer registered is
//! dropped, so replies that race a timeout are harmless.
//!
//! All request kinds share one map and one condition variable; the buffer shape differs per
//! kind through [`RequestBuffer`].

use crate::account::AccountSnapshot;
use crate::base::{IBKRError, RequestId};
use crate::conn::{OutboundRequest, Transport};
use crate::contract::{Bar, ContractDetails, OptionChain};
use crate::open_orders::OpenOrderEntry;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
  ContractDetails,
  HistoricalBars,
  AccountSummary,
  OpenOrders,
  OptionChain,
}

impl fmt::Display for RequestKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Buffers that can sit in a correlator know which request kind they serve.
pub trait RequestState: Send {
  fn kind(&self) -> RequestKind;
}

/// Kind-specific accumulators for pending requests.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBuffer {
  ContractDetails(Vec<ContractDetails>),
  HistoricalBars(Vec<Bar>),
  AccountSummary(AccountSnapshot),
  OpenOrders(Vec<OpenOrderEntry>),
  OptionChain(OptionChain),
}

impl RequestState for RequestBuffer {
  fn kind(&self) -> RequestKind {
    match self {
      RequestBuffer::ContractDetails(_) => RequestKind::ContractDetails,
      RequestBuffer::HistoricalBars(_) => RequestKind::HistoricalBars,
      RequestBuffer::AccountSummary(_) => RequestKind::AccountSummary,
      RequestBuffer::OpenOrders(_) => RequestKind::OpenOrders,
      RequestBuffer::OptionChain(_) => RequestKind::OptionChain,
    }
  }
}

/// Typed access to one variant of [`RequestBuffer`].
pub trait BufferVariant: Sized {
  const KIND: RequestKind;
  fn wrap(self) -> RequestBuffer;
  fn as_variant_mut(buffer: &mut RequestBuffer) -> Option<&mut Self>;
  fn into_variant(buffer: RequestBuffer) -> Option<Self>;
}

macro_rules! buffer_variant {
  ($ty:ty, $variant:ident) => {
    impl BufferVariant for $ty {
      const KIND: RequestKind = RequestKind::$variant;
      fn wrap(self) -> RequestBuffer { RequestBuffer::$variant(self) }
      fn as_variant_mut(buffer: &mut RequestBuffer) -> Option<&mut Self> {
        match buffer { RequestBuffer::$variant(v) => Some(v), _ => None }
      }
      fn into_variant(buffer: RequestBuffer) -> Option<Self> {
        match buffer { RequestBuffer::$variant(v) => Some(v), _ => None }
      }
    }
  };
}

buffer_variant!(Vec<ContractDetails>, ContractDetails);
buffer_variant!(Vec<Bar>, HistoricalBars);
buffer_variant!(AccountSnapshot, AccountSummary);
buffer_variant!(Vec<OpenOrderEntry>, OpenOrders);
buffer_variant!(OptionChain, OptionChain);

/// How a wait ended. A timed-out wait still hands back what had arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<B> {
  Done(B),
  TimedOut(B),
}

impl<B> Completion<B> {
  pub fn is_complete(&self) -> bool {
    matches!(self, Completion::Done(_))
  }

  pub fn into_inner(self) -> B {
    match self {
      Completion::Done(b) | Completion::TimedOut(b) => b,
    }
  }

  pub fn map<C, F: FnOnce(B) -> C>(self, f: F) -> Completion<C> {
    match self {
      Completion::Done(b) => Completion::Done(f(b)),
      Completion::TimedOut(b) => Completion::TimedOut(f(b)),
    }
  }
}

struct PendingRequest<B> {
  buffer: B,
  done: bool,
  error: Option<(i32, String)>,
  created_at: Instant,
}

pub struct RequestCorrelator<B = RequestBuffer> {
  pending: Mutex<HashMap<RequestId, PendingRequest<B>>>,
  cond: Condvar,
}

impl<B: RequestState> Default for RequestCorrelator<B> {
  fn default() -> Self {
    Self::new()
  }
}

impl<B: RequestState> RequestCorrelator<B> {
  pub fn new() -> Self {
    RequestCorrelator {
      pending: Mutex::new(HashMap::new()),
      cond: Condvar::new(),
    }
  }

  pub fn register(&self, id: RequestId, buffer: B) -> Result<(), IBKRError> {
    let mut pending = self.pending.lock();
    if pending.contains_key(&id) {
      return Err(IBKRError::DuplicateRequestId(id));
    }
    debug!("Registered pending {} request {}", buffer.kind(), id);
    pending.insert(id, PendingRequest { buffer, done: false, error: None, created_at: Instant::now() });
    Ok(())
  }

  /// Merges a reply into the buffer for `id`. Returns false if `id` is not pending.
  pub fn deliver<F: FnOnce(&mut B)>(&self, id: RequestId, f: F) -> bool {
    let mut pending = self.pending.lock();
    match pending.get_mut(&id) {
      Some(p) if !p.done => {
        f(&mut p.buffer);
        true
      }
      Some(_) => {
        trace!("Dropping delivery for already completed request {}", id);
        false
      }
      None => {
        trace!("Dropping delivery for unknown request {}", id);
        false
      }
    }
  }

  /// Marks `id` finished and wakes its waiter. Later calls are no-ops.
  pub fn complete(&self, id: RequestId) -> bool {
    let mut pending = self.pending.lock();
    match pending.get_mut(&id) {
      Some(p) if !p.done => {
        p.done = true;
        debug!("{} request {} completed after {:?}", p.buffer.kind(), id, p.created_at.elapsed());
        self.cond.notify_all();
        true
      }
      _ => false,
    }
  }

  /// Finishes `id` with an API error.
  pub fn fail(&self, id: RequestId, code: i32, msg: &str) -> bool {
    let mut pending = self.pending.lock();
    match pending.get_mut(&id) {
      Some(p) if !p.done => {
        warn!("{} request {} failed: code={} msg={}", p.buffer.kind(), id, code, msg);
        p.done = true;
        p.error = Some((code, msg.to_string()));
        self.cond.notify_all();
        true
      }
      _ => false,
    }
  }

  /// Drops a pending request without waiting for it.
  pub fn cancel(&self, id: RequestId) -> Option<B> {
    self.pending.lock().remove(&id).map(|p| p.buffer)
  }

  pub fn contains(&self, id: RequestId) -> bool {
    self.pending.lock().contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.pending.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.lock().is_empty()
  }

  /// Blocks until `id` completes or `timeout` elapses. The entry is gone on return.
  pub fn wait_outcome(&self, id: RequestId, timeout: Duration) -> Result<Completion<B>, IBKRError> {
    let deadline = Instant::now() + timeout;
    let mut pending = self.pending.lock();
    loop {
      let done = match pending.get(&id) {
        Some(p) => p.done,
        None => return Err(IBKRError::UnknownRequestId(id)),
      };
      if done || Instant::now() >= deadline {
        let p = pending.remove(&id).ok_or(IBKRError::UnknownRequestId(id))?;
        if let Some((code, msg)) = p.error {
          return Err(IBKRError::ApiError(code, msg));
        }
        if done {
          return Ok(Completion::Done(p.buffer));
        }
        debug!("{} request {} timed out after {:?}", p.buffer.kind(), id, timeout);
        return Ok(Completion::TimedOut(p.buffer));
      }
      // Spurious and foreign wakeups just loop; the deadline bounds the total wait.
      self.cond.wait_until(&mut pending, deadline);
    }
  }

  pub fn wait(&self, id: RequestId, timeout: Duration) -> Result<B, IBKRError> {
    match self.wait_outcome(id, timeout)? {
      Completion::Done(buffer) => Ok(buffer),
      Completion::TimedOut(buffer) => Err(IBKRError::Timeout(format!(
        "{} request {} timed out after {:?}", buffer.kind(), id, timeout
      ))),
    }
  }
}

impl RequestCorrelator<RequestBuffer> {
  /// Registers an empty buffer of the variant `T`.
  pub fn register_as<T: BufferVariant + Default>(&self, id: RequestId) -> Result<(), IBKRError> {
    self.register(id, T::default().wrap())
  }

  /// Like [`deliver`](Self::deliver), but only touches buffers of variant `T`.
  pub fn deliver_as<T: BufferVariant, F: FnOnce(&mut T)>(&self, id: RequestId, f: F) -> bool {
    let mut matched = false;
    let known = self.deliver(id, |buffer| {
      if let Some(v) = T::as_variant_mut(buffer) {
        f(v);
        matched = true;
      }
    });
    if known && !matched {
      warn!("Request {} is not a {} request; delivery dropped", id, T::KIND);
    }
    matched
  }

  pub fn wait_outcome_as<T: BufferVariant>(&self, id: RequestId, timeout: Duration) -> Result<Completion<T>, IBKRError> {
    let outcome = self.wait_outcome(id, timeout)?;
    let mismatch = || IBKRError::InternalError(format!("request {} buffer is not {}", id, T::KIND));
    Ok(match outcome {
      Completion::Done(b) => Completion::Done(T::into_variant(b).ok_or_else(mismatch)?),
      Completion::TimedOut(b) => Completion::TimedOut(T::into_variant(b).ok_or_else(mismatch)?),
    })
  }

  /// Registers an empty `T` under `id`, sends `request` and waits for the outcome. A request
  /// that cannot be sent leaves nothing registered.
  pub fn issue_as<T: BufferVariant + Default>(
    &self,
    transport: &dyn Transport,
    id: RequestId,
    request: OutboundRequest,
    timeout: Duration,
  ) -> Result<Completion<T>, IBKRError> {
    self.register_as::<T>(id)?;
    if let Err(e) = transport.submit(id, request) {
      warn!("{} request {} could not be sent: {:?}", T::KIND, id, e);
      self.cancel(id);
      return Err(e);
    }
    self.wait_outcome_as::<T>(id, timeout)
  }

  pub fn wait_as<T: BufferVariant>(&self, id: RequestId, timeout: Duration) -> Result<T, IBKRError> {
    match self.wait_outcome_as::<T>(id, timeout)? {
      Completion::Done(v) => Ok(v),
      Completion::TimedOut(_) => Err(IBKRError::Timeout(format!(
        "{} request {} timed out after {:?}", T::KIND, id, timeout
      ))),
    }
  }
}
