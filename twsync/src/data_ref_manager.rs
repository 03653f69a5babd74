// twsync/src/data_ref_manager.rs
use crate::base::{IBKRError, RequestId};
use crate::conn::{OutboundRequest, Transport};
use crate::contract::{Contract, ContractDetails, OptionChain, SecType};
use crate::correlator::{Completion, RequestCorrelator};
use crate::handler::ReferenceDataHandler;
use crate::ids::IdAllocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, trace, warn};


// --- DataRefManager ---

pub struct DataRefManager {
  transport: Arc<dyn Transport>,
  ids: Arc<IdAllocator>,
  correlator: Arc<RequestCorrelator>,
  contract_timeout: Duration,
  option_chain_timeout: Duration,
  /// Stock symbol -> con id, filled by `resolve_con_id`.
  con_id_cache: Mutex<HashMap<String, i32>>,
}

impl DataRefManager {
  pub(crate) fn new(
    transport: Arc<dyn Transport>,
    ids: Arc<IdAllocator>,
    correlator: Arc<RequestCorrelator>,
    contract_timeout: Duration,
    option_chain_timeout: Duration,
  ) -> Arc<Self> {
    Arc::new(DataRefManager {
      transport,
      ids,
      correlator,
      contract_timeout,
      option_chain_timeout,
      con_id_cache: Mutex::new(HashMap::new()),
    })
  }

  /// Requests and returns all contract details matching `contract`.
  /// Blocks until `contractDetailsEnd` arrives or the contract timeout elapses.
  pub fn get_contract_details(&self, contract: &Contract) -> Result<Vec<ContractDetails>, IBKRError> {
    info!("Requesting contract details for: {}", contract.summary());
    let req_id = self.ids.next()?;
    let request = OutboundRequest::ContractDetails { contract: contract.clone() };
    match self.correlator.issue_as::<Vec<ContractDetails>>(
      self.transport.as_ref(), req_id, request, self.contract_timeout,
    )? {
      Completion::Done(details) => {
        debug!("Contract details request {} returned {} matches", req_id, details.len());
        Ok(details)
      }
      Completion::TimedOut(partial) => Err(IBKRError::Timeout(format!(
        "contract details for {} ({} received before timeout of {:?})",
        contract.symbol, partial.len(), self.contract_timeout
      ))),
    }
  }

  /// Looks up the con id of a SMART-routed USD stock, caching the answer for the session.
  pub fn resolve_con_id(&self, symbol: &str) -> Result<i32, IBKRError> {
    if let Some(con_id) = self.con_id_cache.lock().get(symbol).copied() {
      trace!("Con id cache hit: {} -> {}", symbol, con_id);
      return Ok(con_id);
    }
    let details = self.get_contract_details(&Contract::stock(symbol))?;
    let first = details.first()
      .ok_or_else(|| IBKRError::InvalidParameter(format!("no contract found for symbol {}", symbol)))?;
    if details.len() > 1 {
      warn!("{} matches for {}; using con id {}", details.len(), symbol, first.contract.con_id);
    }
    let con_id = first.contract.con_id;
    self.con_id_cache.lock().insert(symbol.to_string(), con_id);
    Ok(con_id)
  }

  pub fn cached_con_id(&self, symbol: &str) -> Option<i32> {
    self.con_id_cache.lock().get(symbol).copied()
  }

  /// Expirations and strikes for options on a stock, merged over every exchange that answers.
  pub fn get_option_chain(&self, symbol: &str) -> Result<OptionChain, IBKRError> {
    let con_id = self.resolve_con_id(symbol)?;
    info!("Requesting option chain for: Symbol={}, ConID={}", symbol, con_id);
    let req_id: RequestId = self.ids.next()?;
    let request = OutboundRequest::SecDefOptParams {
      underlying_symbol: symbol.to_string(),
      fut_fop_exchange: String::new(),
      underlying_sec_type: SecType::Stock,
      underlying_con_id: con_id,
    };
    match self.correlator.issue_as::<OptionChain>(
      self.transport.as_ref(), req_id, request, self.option_chain_timeout,
    )? {
      Completion::Done(chain) => {
        debug!("Option chain {}: {} exchanges, {} expirations, {} strikes",
               symbol, chain.exchanges.len(), chain.expirations.len(), chain.strikes.len());
        Ok(chain)
      }
      Completion::TimedOut(_) => Err(IBKRError::Timeout(format!(
        "option chain for {} not complete within {:?}", symbol, self.option_chain_timeout
      ))),
    }
  }
}

impl ReferenceDataHandler for DataRefManager {
  fn contract_details(&self, req_id: RequestId, contract_details: &ContractDetails) {
    debug!("Handler: Contract Details: ReqID={}, ConID={}", req_id, contract_details.contract.con_id);
    self.correlator.deliver_as::<Vec<ContractDetails>, _>(req_id, |list| list.push(contract_details.clone()));
  }

  fn contract_details_end(&self, req_id: RequestId) {
    debug!("Handler: Contract Details End: ReqID={}", req_id);
    self.correlator.complete(req_id);
  }

  fn security_definition_option_parameter(
    &self, req_id: RequestId, exchange: &str, underlying_con_id: i32,
    trading_class: &str, multiplier: &str, expirations: &[String], strikes: &[f64]
  ) {
    debug!("Handler: SecDefOptParams: ReqID={}, Exchange={}, UnderConID={}", req_id, exchange, underlying_con_id);
    self.correlator.deliver_as::<OptionChain, _>(req_id, |chain| {
      chain.merge(exchange, underlying_con_id, trading_class, multiplier, expirations, strikes)
    });
  }

  fn security_definition_option_parameter_end(&self, req_id: RequestId) {
    debug!("Handler: SecDefOptParams End: ReqID={}", req_id);
    self.correlator.complete(req_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::MockTransport;
  use crossbeam_channel::{unbounded, Receiver};
  use std::thread;

  fn manager(mock: MockTransport) -> Arc<DataRefManager> {
    let ids = Arc::new(IdAllocator::new());
    ids.seed(1);
    DataRefManager::new(
      Arc::new(mock), ids, Arc::new(RequestCorrelator::new()),
      Duration::from_secs(5), Duration::from_secs(5),
    )
  }

  /// Transport that forwards every submitted request to the returned channel.
  fn forwarding() -> (MockTransport, Receiver<(RequestId, OutboundRequest)>) {
    let (tx, rx) = unbounded();
    let mut mock = MockTransport::new();
    mock.expect_submit().returning(move |id, req| {
      tx.send((id, req)).unwrap();
      Ok(())
    });
    (mock, rx)
  }

  fn aapl_details(con_id: i32) -> ContractDetails {
    ContractDetails {
      contract: Contract { con_id, ..Contract::stock("AAPL") },
      market_name: "NMS".into(),
      min_tick: 0.01,
      long_name: "APPLE INC".into(),
      ..Default::default()
    }
  }

  #[test]
  fn test_contract_details_round_trip() {
    let (mock, rx) = forwarding();
    let mgr = manager(mock);
    let feeder = {
      let mgr = mgr.clone();
      thread::spawn(move || {
        let (id, req) = rx.recv().unwrap();
        assert_eq!(req, OutboundRequest::ContractDetails { contract: Contract::stock("AAPL") });
        mgr.contract_details(id, &aapl_details(265598));
        mgr.contract_details_end(id);
      })
    };
    let details = mgr.get_contract_details(&Contract::stock("AAPL")).unwrap();
    feeder.join().unwrap();
    assert_eq!(details, vec![aapl_details(265598)]);
  }

  #[test]
  fn test_resolve_con_id_is_cached() {
    let (mock, rx) = forwarding();
    let mgr = manager(mock);
    let feeder = {
      let mgr = mgr.clone();
      thread::spawn(move || {
        let (id, _) = rx.recv().unwrap();
        mgr.contract_details(id, &aapl_details(265598));
        mgr.contract_details_end(id);
        rx
      })
    };
    assert_eq!(mgr.resolve_con_id("AAPL").unwrap(), 265598);
    let rx = feeder.join().unwrap();
    assert_eq!(mgr.resolve_con_id("AAPL").unwrap(), 265598);
    assert!(rx.try_recv().is_err());
    assert_eq!(mgr.cached_con_id("AAPL"), Some(265598));
  }

  #[test]
  fn test_resolve_unknown_symbol() {
    let (mock, rx) = forwarding();
    let mgr = manager(mock);
    let feeder = {
      let mgr = mgr.clone();
      thread::spawn(move || {
        let (id, _) = rx.recv().unwrap();
        mgr.contract_details_end(id);
      })
    };
    assert!(matches!(mgr.resolve_con_id("ZZZZ"), Err(IBKRError::InvalidParameter(_))));
    feeder.join().unwrap();
    assert_eq!(mgr.cached_con_id("ZZZZ"), None);
  }

  #[test]
  fn test_option_chain_merges_exchanges() {
    let (mock, rx) = forwarding();
    let mgr = manager(mock);
    let feeder = {
      let mgr = mgr.clone();
      thread::spawn(move || {
        let (id, _) = rx.recv().unwrap();
        mgr.contract_details(id, &aapl_details(265598));
        mgr.contract_details_end(id);

        let (id, req) = rx.recv().unwrap();
        assert!(matches!(req, OutboundRequest::SecDefOptParams { underlying_con_id: 265598, .. }));
        mgr.security_definition_option_parameter(
          id, "SMART", 265598, "AAPL", "100", &["20250117".into(), "20250221".into()], &[150.0, 155.0],
        );
        mgr.security_definition_option_parameter(
          id, "CBOE", 265598, "AAPL", "100", &["20250117".into()], &[155.0, 160.0],
        );
        mgr.security_definition_option_parameter_end(id);
      })
    };
    let chain = mgr.get_option_chain("AAPL").unwrap();
    feeder.join().unwrap();
    assert_eq!(chain.underlying_con_id, 265598);
    assert_eq!(chain.exchanges, vec!["SMART".to_string(), "CBOE".to_string()]);
    assert_eq!(chain.expirations.len(), 2);
    assert_eq!(chain.strikes, vec![150.0, 155.0, 160.0]);
  }

  #[test]
  fn test_contract_details_timeout() {
    let (mock, _rx) = forwarding();
    let ids = Arc::new(IdAllocator::new());
    ids.seed(1);
    let correlator = Arc::new(RequestCorrelator::new());
    let mgr = DataRefManager::new(
      Arc::new(mock), ids, correlator.clone(), Duration::from_millis(20), Duration::from_millis(20),
    );
    let err = mgr.get_contract_details(&Contract::stock("AAPL")).unwrap_err();
    assert!(err.is_timeout());
    assert!(correlator.is_empty());
  }
}
