// twsync/src/dispatcher.rs
// The delivery thread: drains decoded events and hands them to the handlers in order.

use crate::base::IBKRError;
use crate::handler::MessageHandler;
use crate::message_parser::{process_event, InboundEvent};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct EventDispatcher {
  stop_flag: Arc<AtomicBool>,
  handle: Option<JoinHandle<u64>>,
}

impl EventDispatcher {
  /// Starts the delivery thread. It runs until `stop()` is called or every sender of
  /// `receiver` is dropped.
  pub fn spawn(handler: MessageHandler, receiver: Receiver<InboundEvent>) -> Result<Self, IBKRError> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_stop = stop_flag.clone();

    let handle = thread::Builder::new()
      .name("twsync-dispatch".to_string())
      .spawn(move || {
        debug!("Event dispatcher started");
        let mut processed: u64 = 0;
        loop {
          if thread_stop.load(Ordering::Acquire) {
            debug!("Event dispatcher stopping");
            break;
          }
          match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
              process_event(&handler, &event);
              processed += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
              info!("Event source closed; dispatcher exiting");
              break;
            }
          }
        }
        thread_stop.store(true, Ordering::Release);
        debug!("Event dispatcher ended after {} events", processed);
        processed
      })
      .map_err(|e| IBKRError::InternalError(format!("spawning dispatcher thread: {}", e)))?;

    Ok(EventDispatcher { stop_flag, handle: Some(handle) })
  }

  pub fn stop(&self) {
    self.stop_flag.store(true, Ordering::Release);
  }

  pub fn is_running(&self) -> bool {
    !self.stop_flag.load(Ordering::Acquire)
  }

  /// Waits for the thread to exit and returns the number of events it delivered.
  pub fn join(mut self) -> Result<u64, IBKRError> {
    match self.handle.take() {
      Some(handle) => handle.join()
        .map_err(|e| IBKRError::InternalError(format!("dispatcher thread panicked: {:?}", e))),
      None => Ok(0),
    }
  }
}

impl Drop for EventDispatcher {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.stop();
      if let Err(e) = handle.join() {
        error!("Error joining dispatcher thread: {:?}", e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::TradingSession;
  use crate::config::SessionConfig;
  use crate::conn::MockTransport;
  use crossbeam_channel::unbounded;

  #[test]
  fn test_delivers_in_order_until_disconnect() {
    let (session, handler) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    let (tx, rx) = unbounded();
    let dispatcher = EventDispatcher::spawn(handler, rx).unwrap();

    tx.send(InboundEvent::NextValidId { order_id: 40 }).unwrap();
    tx.send(InboundEvent::NextValidId { order_id: 30 }).unwrap();
    drop(tx);

    assert_eq!(dispatcher.join().unwrap(), 2);
    assert_eq!(session.ids().peek(), Some(40));
  }

  #[test]
  fn test_stop_ends_thread() {
    let (_session, handler) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    let (_tx, rx) = unbounded::<InboundEvent>();
    let dispatcher = EventDispatcher::spawn(handler, rx).unwrap();
    assert!(dispatcher.is_running());
    dispatcher.stop();
    assert_eq!(dispatcher.join().unwrap(), 0);
  }
}
