// twsync/src/data_market_manager.rs
use crate::base::{IBKRError, RequestId};
use crate::conn::{CancelKind, OutboundRequest, Transport};
use crate::contract::{Bar, Contract};
use crate::correlator::{Completion, RequestCorrelator};
use crate::data::{DepthSnapshot, TickRecord};
use crate::data_ref_manager::DataRefManager;
use crate::handler::MarketDataHandler;
use crate::ids::IdAllocator;
use crate::market_depth::MarketDepthBook;
use crate::tick_stream::TickStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, trace, warn};


pub struct DataMarketManager {
  transport: Arc<dyn Transport>,
  ids: Arc<IdAllocator>,
  correlator: Arc<RequestCorrelator>,
  data_ref: Arc<DataRefManager>,
  ticks: TickStream,
  depth_books: Mutex<HashMap<RequestId, MarketDepthBook>>,
  historical_timeout: Duration,
  default_depth_rows: i32,
}

impl DataMarketManager {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    transport: Arc<dyn Transport>,
    ids: Arc<IdAllocator>,
    correlator: Arc<RequestCorrelator>,
    data_ref: Arc<DataRefManager>,
    tick_buffer_capacity: usize,
    historical_timeout: Duration,
    default_depth_rows: i32,
  ) -> Arc<Self> {
    Arc::new(DataMarketManager {
      ticks: TickStream::new(transport.clone(), ids.clone(), tick_buffer_capacity),
      transport,
      ids,
      correlator,
      data_ref,
      depth_books: Mutex::new(HashMap::new()),
      historical_timeout,
      default_depth_rows,
    })
  }

  // --- Streaming quotes ---

  /// Starts streaming quotes for a stock. Returns the request id used to stop the stream.
  pub fn start_tick_stream(&self, symbol: &str) -> Result<RequestId, IBKRError> {
    self.ticks.start_stream(symbol)
  }

  pub fn stop_tick_stream(&self, req_id: RequestId) -> Result<(), IBKRError> {
    self.ticks.stop_stream(req_id)
  }

  pub fn tick_snapshot(&self, symbol: &str) -> Option<Vec<TickRecord>> {
    self.ticks.snapshot(symbol)
  }

  pub fn latest_tick(&self, symbol: &str) -> Option<TickRecord> {
    self.ticks.latest(symbol)
  }

  pub fn tick_stream(&self) -> &TickStream {
    &self.ticks
  }

  // --- Historical bars ---

  /// Requests historical bars for `contract`. Blocks until `historicalDataEnd` or the
  /// historical timeout; on timeout the request is cancelled and `Timeout` returned.
  pub fn get_historical_data(
    &self,
    contract: &Contract,
    end_date_time: &str, // "" for now
    duration_str: &str, // e.g., "1 Y", "3 M", "60 D", "3600 S"
    bar_size_setting: &str, // e.g., "1 day", "30 mins"
    what_to_show: &str, // e.g., "TRADES", "MIDPOINT", "BID_ASK"
    use_rth: bool,
  ) -> Result<Vec<Bar>, IBKRError> {
    info!("Requesting historical data: Contract={}, Duration={}, BarSize={}, What={}",
          contract.symbol, duration_str, bar_size_setting, what_to_show);
    let req_id = self.ids.next()?;
    let request = OutboundRequest::HistoricalData {
      contract: contract.clone(),
      end_date_time: end_date_time.to_string(),
      duration: duration_str.to_string(),
      bar_size: bar_size_setting.to_string(),
      what_to_show: what_to_show.to_string(),
      use_rth,
    };
    match self.correlator.issue_as::<Vec<Bar>>(self.transport.as_ref(), req_id, request, self.historical_timeout)? {
      Completion::Done(bars) => {
        debug!("Historical data request {} returned {} bars", req_id, bars.len());
        Ok(bars)
      }
      Completion::TimedOut(partial) => {
        if let Err(e) = self.transport.cancel(req_id, CancelKind::HistoricalData) {
          warn!("Failed to cancel historical data request {}: {:?}", req_id, e);
        }
        Err(IBKRError::Timeout(format!(
          "historical data for {} ({} bars before timeout of {:?})",
          contract.symbol, partial.len(), self.historical_timeout
        )))
      }
    }
  }

  /// Historical bars for a stock, resolved through its contract details first. Regular
  /// trading hours only.
  pub fn get_historical_bars(
    &self,
    symbol: &str,
    duration_str: &str,
    bar_size_setting: &str,
    what_to_show: &str,
  ) -> Result<Vec<Bar>, IBKRError> {
    let details = self.data_ref.get_contract_details(&Contract::stock(symbol))?;
    let contract = details.into_iter().next()
      .map(|d| d.contract)
      .ok_or_else(|| IBKRError::InvalidParameter(format!("no contract found for symbol {}", symbol)))?;
    self.get_historical_data(&contract, "", duration_str, bar_size_setting, what_to_show, true)
  }

  // --- Market depth ---

  /// Starts an L2 depth subscription for a stock. `num_rows` defaults to the configured rows.
  pub fn request_market_depth(&self, symbol: &str, num_rows: Option<i32>) -> Result<RequestId, IBKRError> {
    let num_rows = num_rows.unwrap_or(self.default_depth_rows);
    if num_rows <= 0 {
      return Err(IBKRError::InvalidParameter(format!("depth rows must be positive, got {}", num_rows)));
    }
    let req_id = self.ids.next()?;
    info!("Requesting market depth: ReqID={}, Symbol={}, Rows={}", req_id, symbol, num_rows);
    self.depth_books.lock().insert(req_id, MarketDepthBook::new(symbol, num_rows as usize));

    let request = OutboundRequest::MarketDepth {
      contract: Contract::stock(symbol),
      num_rows,
      is_smart_depth: false,
    };
    if let Err(e) = self.transport.submit(req_id, request) {
      self.depth_books.lock().remove(&req_id);
      return Err(e);
    }
    Ok(req_id)
  }

  pub fn market_depth(&self, req_id: RequestId) -> Option<DepthSnapshot> {
    self.depth_books.lock().get(&req_id).map(|b| b.snapshot())
  }

  pub fn cancel_market_depth(&self, req_id: RequestId) -> Result<(), IBKRError> {
    if self.depth_books.lock().remove(&req_id).is_none() {
      return Err(IBKRError::UnknownRequestId(req_id));
    }
    info!("Cancelling market depth: ReqID={}", req_id);
    if let Err(e) = self.transport.cancel(req_id, CancelKind::MarketDepth { is_smart_depth: false }) {
      warn!("Failed to cancel market depth {}: {:?}", req_id, e);
    }
    Ok(())
  }

  fn apply_depth(&self, req_id: RequestId, position: i32, operation: i32, side: i32,
                 price: f64, size: f64, market_maker: Option<&str>) {
    let mut books = self.depth_books.lock();
    match books.get_mut(&req_id) {
      Some(book) => { book.apply(position, operation, side, price, size, market_maker); }
      None => trace!("Depth update for unknown request {}", req_id),
    }
  }
}

impl MarketDataHandler for DataMarketManager {
  fn tick_price(&self, req_id: RequestId, tick_type: i32, price: f64) {
    self.ticks.on_price_tick(req_id, tick_type, price);
  }

  fn tick_size(&self, req_id: RequestId, tick_type: i32, size: f64) {
    self.ticks.on_size_tick(req_id, tick_type, size);
  }

  fn tick_string(&self, req_id: RequestId, tick_type: i32, value: &str) {
    self.ticks.on_string_tick(req_id, tick_type, value);
  }

  fn update_mkt_depth(&self, req_id: RequestId, position: i32, operation: i32, side: i32, price: f64, size: f64) {
    trace!("Handler: MktDepth Update: ID={}, Pos={}, Op={}, Side={}, Px={}, Sz={}", req_id, position, operation, side, price, size);
    self.apply_depth(req_id, position, operation, side, price, size, None);
  }

  fn update_mkt_depth_l2(&self, req_id: RequestId, position: i32, market_maker: &str, operation: i32,
                         side: i32, price: f64, size: f64, is_smart_depth: bool) {
    trace!("Handler: MktDepth L2 Update: ID={}, Pos={}, MM={}, Op={}, Side={}, Px={}, Sz={}, Smart={}",
           req_id, position, market_maker, operation, side, price, size, is_smart_depth);
    self.apply_depth(req_id, position, operation, side, price, size, Some(market_maker));
  }

  fn historical_data(&self, req_id: RequestId, bar: &Bar) {
    trace!("Handler: Historical Data: ID={}, Time={}", req_id, bar.time);
    self.correlator.deliver_as::<Vec<Bar>, _>(req_id, |bars| bars.push(bar.clone()));
  }

  fn historical_data_end(&self, req_id: RequestId, start_date: &str, end_date: &str) {
    debug!("Handler: Historical Data End: ID={}, Start={}, End={}", req_id, start_date, end_date);
    self.correlator.complete(req_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::MockTransport;
  use crate::contract::ContractDetails;
  use crate::handler::ReferenceDataHandler;
  use crossbeam_channel::unbounded;
  use std::thread;

  fn managers(mock: MockTransport, historical_timeout: Duration) -> (Arc<DataRefManager>, Arc<DataMarketManager>) {
    let transport: Arc<dyn Transport> = Arc::new(mock);
    let ids = Arc::new(IdAllocator::new());
    ids.seed(100);
    let correlator = Arc::new(RequestCorrelator::new());
    let data_ref = DataRefManager::new(
      transport.clone(), ids.clone(), correlator.clone(), Duration::from_secs(5), Duration::from_secs(5),
    );
    let market = DataMarketManager::new(transport, ids, correlator, data_ref.clone(), 100, historical_timeout, 5);
    (data_ref, market)
  }

  fn bar(time: &str, close: f64) -> Bar {
    Bar { time: time.into(), open: close, high: close, low: close, close, volume: 10.0, wap: close, count: 3 }
  }

  #[test]
  fn test_historical_bars_resolve_contract_first() {
    let (tx, rx) = unbounded();
    let mut mock = MockTransport::new();
    mock.expect_submit().returning(move |id, req| {
      tx.send((id, req)).unwrap();
      Ok(())
    });
    let (data_ref, market) = managers(mock, Duration::from_secs(5));

    let feeder = {
      let (data_ref, market) = (data_ref.clone(), market.clone());
      thread::spawn(move || {
        let (id, req) = rx.recv().unwrap();
        assert!(matches!(req, OutboundRequest::ContractDetails { .. }));
        let details = ContractDetails { contract: Contract { con_id: 8314, ..Contract::stock("IBM") }, ..Default::default() };
        data_ref.contract_details(id, &details);
        data_ref.contract_details_end(id);

        let (id, req) = rx.recv().unwrap();
        match req {
          OutboundRequest::HistoricalData { contract, duration, bar_size, what_to_show, use_rth, .. } => {
            assert_eq!(contract.con_id, 8314);
            assert_eq!((duration.as_str(), bar_size.as_str(), what_to_show.as_str()), ("1 W", "1 day", "MIDPOINT"));
            assert!(use_rth);
          }
          other => panic!("unexpected request {:?}", other),
        }
        market.historical_data(id, &bar("20250102", 1.0));
        market.historical_data(id, &bar("20250103", 2.0));
        market.historical_data_end(id, "20241227", "20250103");
      })
    };

    let bars = market.get_historical_bars("IBM", "1 W", "1 day", "MIDPOINT").unwrap();
    feeder.join().unwrap();
    assert_eq!(bars, vec![bar("20250102", 1.0), bar("20250103", 2.0)]);
  }

  #[test]
  fn test_historical_timeout_cancels_request() {
    let mut mock = MockTransport::new();
    mock.expect_submit().returning(|_, _| Ok(()));
    mock.expect_cancel()
      .withf(|id, kind| *id == 100 && *kind == CancelKind::HistoricalData)
      .times(1)
      .returning(|_, _| Ok(()));
    let (_, market) = managers(mock, Duration::from_millis(20));
    let err = market.get_historical_data(&Contract::stock("IBM"), "", "1 D", "1 hour", "TRADES", true).unwrap_err();
    assert!(err.is_timeout());
    // A bar arriving after the timeout is dropped.
    market.historical_data(100, &bar("late", 1.0));
  }

  #[test]
  fn test_market_depth_lifecycle() {
    let mut mock = MockTransport::new();
    mock.expect_submit()
      .withf(|_, req| matches!(req, OutboundRequest::MarketDepth { num_rows: 5, is_smart_depth: false, .. }))
      .times(1)
      .returning(|_, _| Ok(()));
    mock.expect_cancel()
      .withf(|_, kind| *kind == CancelKind::MarketDepth { is_smart_depth: false })
      .times(1)
      .returning(|_, _| Ok(()));
    let (_, market) = managers(mock, Duration::from_secs(1));

    let id = market.request_market_depth("AAPL", None).unwrap();
    market.update_mkt_depth(id, 0, 0, 1, 189.5, 300.0);
    market.update_mkt_depth_l2(id, 0, "ARCA", 0, 0, 189.6, 200.0, false);

    let snap = market.market_depth(id).unwrap();
    assert_eq!(snap.symbol, "AAPL");
    assert_eq!(snap.bids[0].price, 189.5);
    assert_eq!(snap.asks[0].market_maker.as_deref(), Some("ARCA"));

    market.cancel_market_depth(id).unwrap();
    assert!(market.market_depth(id).is_none());
    assert_eq!(market.cancel_market_depth(id), Err(IBKRError::UnknownRequestId(id)));
  }

  #[test]
  fn test_ticks_route_through_stream() {
    let mut mock = MockTransport::new();
    mock.expect_submit().returning(|_, _| Ok(()));
    let (_, market) = managers(mock, Duration::from_secs(1));
    let id = market.start_tick_stream("SPY").unwrap();
    market.tick_price(id, 4, 500.0);
    market.tick_size(id, 5, 3.0);
    let tick = market.latest_tick("SPY").unwrap();
    assert_eq!((tick.price, tick.size), (Some(500.0), Some(3.0)));
    assert_eq!(market.tick_snapshot("SPY").unwrap().len(), 1);
  }
}
