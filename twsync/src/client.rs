// twsync/src/client.rs
use crate::order_manager::OrderManager;
use crate::account_manager::AccountManager;
use crate::data_ref_manager::DataRefManager;
use crate::data_market_manager::DataMarketManager;
use crate::base::{IBKRError, RequestId};
use crate::config::SessionConfig;
use crate::conn::Transport;
use crate::correlator::RequestCorrelator;
use crate::ids::IdAllocator;
use crate::handler::MessageHandler;
use std::sync::Arc;
use std::time::Duration;
pub use mgr::ClientManager;

/// One broker session: the id counter, the pending-request table and the managers built on
/// them. Nothing is global, so independent sessions can coexist in one process.
pub struct TradingSession {
  config: SessionConfig,
  ids: Arc<IdAllocator>,
  correlator: Arc<RequestCorrelator>,
  client_mgr: Arc<ClientManager>,
  order_mgr: Arc<OrderManager>,
  account_mgr: Arc<AccountManager>,
  data_ref_mgr: Arc<DataRefManager>,
  data_market_mgr: Arc<DataMarketManager>,
}

impl TradingSession {
  /// Builds a session over `transport`. The returned handler must be fed the transport's
  /// inbound events, normally by an [`EventDispatcher`](crate::dispatcher::EventDispatcher).
  pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> (Arc<Self>, MessageHandler) {
    let ids = Arc::new(IdAllocator::new());
    let correlator = Arc::new(RequestCorrelator::new());
    let client_mgr = ClientManager::new(correlator.clone());
    let order_mgr = OrderManager::new(
      transport.clone(), ids.clone(), correlator.clone(), config.open_orders_timeout,
    );
    let account_mgr = AccountManager::new(
      transport.clone(), ids.clone(), correlator.clone(),
      config.account_group.clone(), config.account_tags.clone(), config.account_fallback.clone(),
      config.account_timeout, config.positions_timeout,
    );
    let data_ref_mgr = DataRefManager::new(
      transport.clone(), ids.clone(), correlator.clone(),
      config.contract_timeout, config.option_chain_timeout,
    );
    let data_market_mgr = DataMarketManager::new(
      transport, ids.clone(), correlator.clone(), data_ref_mgr.clone(),
      config.tick_buffer_capacity, config.historical_timeout, config.market_depth_rows,
    );
    let msg_handler = MessageHandler::new(client_mgr.clone(), order_mgr.clone(),
                                          account_mgr.clone(), data_ref_mgr.clone(),
                                          data_market_mgr.clone());
    let session = Arc::new(TradingSession {
      config,
      ids,
      correlator,
      client_mgr,
      order_mgr,
      account_mgr,
      data_ref_mgr,
      data_market_mgr,
    });
    (session, msg_handler)
  }

  /// Like [`new`](Self::new), rejecting an invalid configuration first.
  pub fn try_new(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<(Arc<Self>, MessageHandler), IBKRError> {
    config.validate()?;
    Ok(Self::new(transport, config))
  }

  /// Blocks until TWS has sent the first valid order id.
  pub fn wait_until_ready(&self, timeout: Duration) -> Result<RequestId, IBKRError> {
    self.ids.wait_until_seeded(timeout)
  }

  pub fn is_ready(&self) -> bool {
    self.ids.is_seeded()
  }

  pub fn is_connected(&self) -> bool {
    self.client_mgr.is_connected()
  }

  /// (request id, code, message) of the last error TWS reported.
  pub fn last_error(&self) -> Option<(i32, i32, String)> {
    self.client_mgr.get_last_error()
  }

  /// Requests currently waiting for a reply.
  pub fn pending_requests(&self) -> usize {
    self.correlator.len()
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  pub fn ids(&self) -> Arc<IdAllocator> {
    self.ids.clone()
  }

  pub fn client(&self) -> Arc<ClientManager> {
    self.client_mgr.clone()
  }

  pub fn orders(&self) -> Arc<OrderManager> {
    self.order_mgr.clone()
  }

  pub fn account(&self) -> Arc<AccountManager> {
    self.account_mgr.clone()
  }

  pub fn data_ref(&self) -> Arc<DataRefManager> {
    self.data_ref_mgr.clone()
  }

  pub fn data_market(&self) -> Arc<DataMarketManager> {
    self.data_market_mgr.clone()
  }
}

mod mgr {
  use crate::base::RequestId;
  use crate::correlator::RequestCorrelator;
  use crate::handler::ClientHandler;
  use log::{debug, error, info, warn};
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  /// Codes that mean the link between TWS and IB (or the API socket) is down.
  /// See https://interactivebrokers.github.io/tws-api/message_codes.html
  const CONNECTIVITY_LOST_CODES: [i32; 3] = [1100, 1300, 2110];
  /// 1101: restored, data lost. 1102: restored, data maintained.
  const CONNECTIVITY_RESTORED_CODES: [i32; 2] = [1101, 1102];

  pub struct ClientManager {
    correlator: Arc<RequestCorrelator>,
    connected: AtomicBool,
    last_error: Mutex<Option<(i32, i32, String)>>, // (id, code, msg)
  }

  impl ClientManager {
    pub(crate) fn new(correlator: Arc<RequestCorrelator>) -> Arc<Self> {
      Arc::new(ClientManager {
        correlator,
        connected: AtomicBool::new(true),
        last_error: Mutex::new(None),
      })
    }

    /// Checks if the session believes it's connected.
    pub fn is_connected(&self) -> bool {
      self.connected.load(Ordering::Relaxed)
    }

    /// Returns tuple (request_id, error_code, error_message).
    /// Request ID is -1 if not associated with a specific request.
    pub fn get_last_error(&self) -> Option<(i32, i32, String)> {
      self.last_error.lock().clone()
    }

    pub(crate) fn set_connected_status(&self, status: bool) {
      self.connected.store(status, Ordering::Relaxed);
      info!("Session connection status set to: {}", status);
    }
  }

  impl ClientHandler for ClientManager {
    fn error(&self, id: RequestId, error_code: i32, error_msg: &str) {
      *self.last_error.lock() = Some((id, error_code, error_msg.to_string()));

      if CONNECTIVITY_LOST_CODES.contains(&error_code) {
        warn!("Error code {} indicates disconnection: {}", error_code, error_msg);
        self.set_connected_status(false);
        return;
      }
      if CONNECTIVITY_RESTORED_CODES.contains(&error_code) {
        if error_code == 1101 {
          warn!("Connectivity restored but market data was lost; resubscribe streams: {}", error_msg);
        } else {
          info!("Connectivity restored: {}", error_msg);
        }
        self.set_connected_status(true);
        return;
      }
      if (2100..2200).contains(&error_code) {
        info!("TWS Info/Warning (ID: {}, Code: {}): {}", id, error_code, error_msg);
        return;
      }

      error!("TWS Error (ID: {}, Code: {}): {}", id, error_code, error_msg);
      if id >= 0 && !self.correlator.fail(id, error_code, error_msg) {
        // Orders, streams and position requests are not correlator entries.
        debug!("Error {} for id {} matched no pending request", error_code, id);
      }
    }

    fn connection_closed(&self) {
      error!("Session notified: Connection Closed.");
      self.set_connected_status(false);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::{MockTransport, OutboundRequest};
  use crate::contract::{Contract, ContractDetails};
  use crossbeam_channel::unbounded;
  use std::thread;

  #[test]
  fn test_api_error_fails_pending_request() {
    let (tx, rx) = unbounded();
    let mut mock = MockTransport::new();
    mock.expect_submit().returning(move |id, req| {
      tx.send((id, req)).unwrap();
      Ok(())
    });
    let (session, handler) = TradingSession::new(Arc::new(mock), SessionConfig::default());
    handler.order.next_valid_id(1);

    let feeder = thread::spawn(move || {
      let (id, req) = rx.recv().unwrap();
      assert!(matches!(req, OutboundRequest::ContractDetails { .. }));
      handler.client.error(id, 200, "No security definition has been found for the request");
    });
    let res: Result<Vec<ContractDetails>, IBKRError> = session.data_ref().get_contract_details(&Contract::stock("XXXX"));
    feeder.join().unwrap();

    assert_eq!(res, Err(IBKRError::ApiError(200, "No security definition has been found for the request".into())));
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(session.last_error().map(|e| e.1), Some(200));
    assert!(session.is_connected());
  }

  #[test]
  fn test_info_and_connectivity_codes() {
    let (session, handler) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    handler.client.error(-1, 2104, "Market data farm connection is OK:usfarm");
    assert!(session.is_connected());
    handler.client.error(-1, 1100, "Connectivity between IB and Trader Workstation has been lost.");
    assert!(!session.is_connected());
  }

  #[test]
  fn test_connectivity_restored_codes() {
    let (session, handler) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    handler.client.error(-1, 1100, "Connectivity between IB and Trader Workstation has been lost.");
    assert!(!session.is_connected());
    handler.client.error(-1, 1102, "Connectivity between IB and Trader Workstation has been restored - data maintained.");
    assert!(session.is_connected());
    assert_eq!(session.last_error().map(|e| e.1), Some(1102));

    handler.client.error(-1, 2110, "Connectivity between Trader Workstation and server is broken.");
    assert!(!session.is_connected());
    handler.client.error(-1, 1101, "Connectivity between IB and Trader Workstation has been restored - data lost.");
    assert!(session.is_connected());
  }

  #[test]
  fn test_connection_closed() {
    let (session, handler) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    handler.client.connection_closed();
    assert!(!session.is_connected());
  }

  #[test]
  fn test_independent_sessions() {
    let (a, ha) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    let (b, _hb) = TradingSession::new(Arc::new(MockTransport::new()), SessionConfig::default());
    ha.order.next_valid_id(500);
    assert_eq!(a.wait_until_ready(Duration::from_millis(10)).unwrap(), 500);
    assert!(!b.is_ready());
    assert!(b.wait_until_ready(Duration::from_millis(10)).unwrap_err().is_timeout());
  }

  #[test]
  fn test_try_new_validates() {
    let config = SessionConfig { tick_buffer_capacity: 0, ..Default::default() };
    assert!(matches!(
      TradingSession::try_new(Arc::new(MockTransport::new()), config),
      Err(IBKRError::ConfigurationError(_))
    ));
  }
}
