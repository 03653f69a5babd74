// scenario_runner.rs
// Drives a session through canned broker conversations. Use it like this:
// cargo run --bin scenario_runner -- bracket
// cargo run --bin scenario_runner -- all --config session.json
// Look for "Scenario registration" below for available scenarios.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use inventory;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use twsync::{
  account::Execution,
  contract::{Bar, ComboLeg, Contract, ContractDetails},
  order::{Direction, OrderSide, OrderStatus},
  EventDispatcher, InboundEvent, Script, ScriptedTransport, SessionConfig, TradingSession, Transport,
};

// --- Scenario Definition Infrastructure ---

type ScenarioFn = fn(harness: &Harness) -> Result<()>;

#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
  pub name: &'static str, // Name used on the command line
  pub script: fn() -> Script,
  pub func: ScenarioFn,
}

inventory::collect!(ScenarioDefinition);

static SCENARIO_REGISTRY: Lazy<HashMap<&'static str, &'static ScenarioDefinition>> = Lazy::new(|| {
  inventory::iter::<ScenarioDefinition>
    .into_iter()
    .map(|def| (def.name, def))
    .collect()
});

// --- CLI Argument Parsing ---

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Scenario to run (e.g. contract-details, bracket) or "all".
  #[arg()]
  scenario_or_all: String,

  /// Session configuration JSON. Defaults are used when absent.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Reply script JSON replacing the scenario's built-in replies.
  #[arg(long)]
  script: Option<PathBuf>,

  /// How long to wait for the first valid id.
  #[arg(long, default_value_t = 2000)]
  ready_timeout_ms: u64,
}

/// A session wired to a scripted transport, with its delivery thread running.
pub struct Harness {
  session: Arc<TradingSession>,
  transport: Arc<ScriptedTransport>,
  _dispatcher: EventDispatcher,
}

impl Harness {
  fn start(script: Script, config: SessionConfig, ready_timeout: Duration) -> Result<Self> {
    let (transport, events) = ScriptedTransport::new(script);
    let transport = Arc::new(transport);
    let (session, handler) = TradingSession::try_new(transport.clone() as Arc<dyn Transport>, config)
      .context("Invalid session configuration")?;
    let dispatcher = EventDispatcher::spawn(handler, events).context("Failed to start dispatcher")?;
    transport.ready()?;
    let first_id = session.wait_until_ready(ready_timeout).context("Session never became ready")?;
    debug!("Session ready, first id {}", first_id);
    Ok(Harness { session, transport, _dispatcher: dispatcher })
  }

  /// Waits until every event pushed so far has been handled. Open order enumeration is
  /// answered on the same channel, after anything already queued.
  fn settle(&self) -> Result<()> {
    self.session.orders().refresh_open_orders().context("Settling event queue")?;
    Ok(())
  }
}

/// Replies every scenario relies on.
fn base_script() -> Script {
  Script { first_valid_id: 1000, ..Default::default() }
    .reply("open_orders", InboundEvent::OpenOrderEnd)
}

fn details(symbol: &str, con_id: i32, long_name: &str) -> ContractDetails {
  ContractDetails {
    contract: Contract { con_id, primary_exchange: Some("NASDAQ".into()), ..Contract::stock(symbol) },
    market_name: "NMS".into(),
    min_tick: 0.01,
    long_name: long_name.into(),
    ..Default::default()
  }
}

// --- Scenario Implementations ---

mod scenarios {
  use super::*;

  pub(super) fn contract_details_script() -> Script {
    base_script()
      .reply("contract_details", InboundEvent::ContractDetails { req_id: 0, details: details("AAPL", 265598, "APPLE INC") })
      .reply("contract_details", InboundEvent::ContractDetailsEnd { req_id: 0 })
  }

  pub(super) fn contract_details_impl(h: &Harness) -> Result<()> {
    info!("--- Contract Details ---");
    let list = h.session.data_ref().get_contract_details(&Contract::stock("AAPL"))?;
    for d in &list {
      info!("  {} (ConID {}): {}, min tick {}", d.contract.summary(), d.contract.con_id, d.long_name, d.min_tick);
    }
    if list.len() != 1 {
      bail!("expected one match, got {}", list.len());
    }
    let con_id = h.session.data_ref().resolve_con_id("AAPL")?;
    info!("Resolved AAPL -> {} (cached: {:?})", con_id, h.session.data_ref().cached_con_id("AAPL"));
    Ok(())
  }

  pub(super) fn historical_script() -> Script {
    let bar = |time: &str, close: f64| Bar {
      time: time.into(), open: close - 1.0, high: close + 0.5, low: close - 1.5, close, volume: 1.2e6, wap: close, count: 5400,
    };
    base_script()
      .reply("contract_details", InboundEvent::ContractDetails { req_id: 0, details: details("MSFT", 272093, "MICROSOFT CORP") })
      .reply("contract_details", InboundEvent::ContractDetailsEnd { req_id: 0 })
      .reply("historical_data", InboundEvent::HistoricalData { req_id: 0, bar: bar("20250102", 418.6) })
      .reply("historical_data", InboundEvent::HistoricalData { req_id: 0, bar: bar("20250103", 423.4) })
      .reply("historical_data", InboundEvent::HistoricalDataEnd {
        req_id: 0, start: "20241227 00:00:00".into(), end: "20250103 00:00:00".into(),
      })
  }

  pub(super) fn historical_impl(h: &Harness) -> Result<()> {
    info!("--- Historical Bars ---");
    let bars = h.session.data_market().get_historical_bars("MSFT", "1 W", "1 day", "TRADES")?;
    for b in &bars {
      info!("  {} O={} H={} L={} C={} V={}", b.time, b.open, b.high, b.low, b.close, b.volume);
    }
    if bars.is_empty() {
      bail!("no bars returned");
    }
    Ok(())
  }

  pub(super) fn option_chain_script() -> Script {
    base_script()
      .reply("contract_details", InboundEvent::ContractDetails { req_id: 0, details: details("AAPL", 265598, "APPLE INC") })
      .reply("contract_details", InboundEvent::ContractDetailsEnd { req_id: 0 })
      .reply("sec_def_opt_params", InboundEvent::SecDefOptParams {
        req_id: 0, exchange: "SMART".into(), underlying_con_id: 265598, trading_class: "AAPL".into(),
        multiplier: "100".into(), expirations: vec!["20250117".into(), "20250221".into()], strikes: vec![180.0, 185.0, 190.0],
      })
      .reply("sec_def_opt_params", InboundEvent::SecDefOptParams {
        req_id: 0, exchange: "CBOE".into(), underlying_con_id: 265598, trading_class: "AAPL".into(),
        multiplier: "100".into(), expirations: vec!["20250117".into()], strikes: vec![190.0, 195.0],
      })
      .reply("sec_def_opt_params", InboundEvent::SecDefOptParamsEnd { req_id: 0 })
  }

  pub(super) fn option_chain_impl(h: &Harness) -> Result<()> {
    info!("--- Option Chain ---");
    let chain = h.session.data_ref().get_option_chain("AAPL")?;
    info!("Exchanges: {:?}", chain.exchanges);
    info!("Expirations: {:?}", chain.expirations);
    info!("Strikes: {:?}", chain.strikes);
    Ok(())
  }

  pub(super) fn account_script() -> Script {
    let value = |tag: &str, value: &str| InboundEvent::AccountSummary {
      req_id: 0, account: "DU123456".into(), tag: tag.into(), value: value.into(), currency: "USD".into(),
    };
    base_script()
      .reply("account_summary", value("NetLiquidation", "100523.17"))
      .reply("account_summary", value("AvailableFunds", "87210.55"))
      .reply("account_summary", value("BuyingPower", "348842.20"))
      .reply("account_summary", value("AccountType", "INDIVIDUAL"))
      .reply("account_summary", InboundEvent::AccountSummaryEnd { req_id: 0 })
  }

  pub(super) fn account_impl(h: &Harness) -> Result<()> {
    info!("--- Account Snapshot ---");
    let account = h.session.account();
    let snapshot = account.get_account_snapshot()?;
    info!("Account {:?}, complete={}", snapshot.account, snapshot.complete);
    let mut tags: Vec<_> = snapshot.values.iter().collect();
    tags.sort();
    for (tag, value) in tags {
      info!("  {} = {}", tag, value);
    }
    let funds = account.get_available_funds(Duration::from_secs(2))?;
    info!("Available funds: {}", funds);
    Ok(())
  }

  pub(super) fn positions_script() -> Script {
    let pos = |symbol: &str, con_id: i32, qty: f64, cost: f64| InboundEvent::Position {
      account: "DU123456".into(), contract: Contract { con_id, ..Contract::stock(symbol) }, position: qty, avg_cost: cost,
    };
    base_script()
      .reply("positions", pos("AAPL", 265598, 100.0, 187.25))
      .reply("positions", pos("TSLA", 76792991, 0.0, 0.0))
      .reply("positions", pos("SPY", 756733, -20.0, 501.10))
      .reply("positions", InboundEvent::PositionEnd)
  }

  pub(super) fn positions_impl(h: &Harness) -> Result<()> {
    info!("--- Positions ---");
    let snapshot = h.session.account().list_open_positions()?;
    if !snapshot.complete {
      warn!("Position list incomplete");
    }
    for p in &snapshot.positions {
      info!("  {} {} x {} @ {}", p.account, p.symbol, p.position, p.avg_cost);
    }
    Ok(())
  }

  pub(super) fn open_orders_script() -> Script {
    let order = |order_id: i32, symbol: &str, status: OrderStatus| InboundEvent::OpenOrder {
      order_id, contract: Contract::stock(symbol), status,
    };
    Script { first_valid_id: 1000, ..Default::default() }
      .reply("open_orders", order(17, "AAPL", OrderStatus::Submitted))
      .reply("open_orders", order(18, "MSFT", OrderStatus::PreSubmitted))
      .reply("open_orders", order(12, "SPY", OrderStatus::Submitted))
      .reply("open_orders", InboundEvent::OpenOrderEnd)
  }

  pub(super) fn open_orders_impl(h: &Harness) -> Result<()> {
    info!("--- Open Orders ---");
    let orders = h.session.orders();
    let snapshot = orders.refresh_open_orders()?;
    for e in &snapshot.entries {
      info!("  #{} {} {}", e.order_id, e.contract_summary, e.status);
    }
    let cancelled = orders.open_orders().cancel_matching(|e| e.contract_summary.starts_with("AAPL "))?;
    info!("Cancelled {} AAPL orders; cancels sent: {:?}", cancelled, h.transport.cancels());
    Ok(())
  }

  pub(super) fn bracket_script() -> Script {
    base_script()
      .reply("place_order", InboundEvent::OrderStatusUpdate {
        order_id: 0, status: OrderStatus::PreSubmitted, filled: 0.0, remaining: 0.0, avg_fill_price: 0.0, parent_id: 0,
      })
  }

  pub(super) fn bracket_impl(h: &Harness) -> Result<()> {
    info!("--- Bracket Order ---");
    let orders = h.session.orders();
    let ids = orders.place_bracket_order("AAPL", Direction::Long, 190.0, 195.0, 187.5, 10.0)?;
    info!("Bracket placed: {:?}", ids);

    let fill = |order_id: i32, exec_id: &str, side: &str, price: f64| InboundEvent::Execution {
      req_id: -1,
      contract: Contract::stock("AAPL"),
      execution: Execution {
        execution_id: exec_id.into(), order_id, symbol: "AAPL".into(), side: side.into(),
        shares: 10.0, price, time: String::new(),
      },
    };
    h.transport.push(fill(ids.parent, "0001f4e8.01", "BOT", 189.98))?;
    h.transport.push(fill(ids.take_profit, "0001f4e8.02", "SLD", 195.02))?;
    h.transport.push(InboundEvent::OrderStatusUpdate {
      order_id: ids.stop_loss, status: OrderStatus::Cancelled, filled: 0.0, remaining: 10.0,
      avg_fill_price: 0.0, parent_id: ids.parent,
    })?;
    h.settle()?;

    let fills = orders.drain_fills();
    for f in &fills {
      info!("  order {} {} x{} entry={:?} exit={:?} dir={:?}",
            f.order_id, f.symbol, f.shares, f.entry_price, f.exit_price, f.direction);
    }
    if fills.len() != 2 {
      bail!("expected entry and exit fills, got {}", fills.len());
    }
    info!("Orders still tracked: {}", orders.fill_tracker().tracked_orders());
    Ok(())
  }

  pub(super) fn combo_impl(h: &Harness) -> Result<()> {
    info!("--- Combo Order ---");
    let orders = h.session.orders();
    let id = orders.place_combo_order(
      "AAPL", ComboLeg::smart(265598, 1, OrderSide::Buy), ComboLeg::smart(272093, 2, OrderSide::Sell),
    )?;
    info!("Combo order {} sent: {:?}", id, h.transport.requests().last().map(|(_, r)| r.kind_name()));
    orders.cancel_order(id)?;
    Ok(())
  }

  pub(super) fn quotes_impl(h: &Harness) -> Result<()> {
    info!("--- Streaming Quotes ---");
    let market = h.session.data_market();
    let id = market.start_tick_stream("SPY")?;
    let ticks = [
      InboundEvent::TickPrice { req_id: id, tick_type: 4, price: 501.12 },
      InboundEvent::TickSize { req_id: id, tick_type: 5, size: 300.0 },
      InboundEvent::TickString { req_id: id, tick_type: 45, value: "1736170200".into() },
      InboundEvent::TickString { req_id: id, tick_type: 84, value: "ARCA".into() },
      InboundEvent::TickPrice { req_id: id, tick_type: 4, price: 501.15 },
    ];
    for t in ticks {
      h.transport.push(t)?;
    }
    h.settle()?;

    let snapshot = market.tick_snapshot("SPY").ok_or_else(|| anyhow!("no ticks buffered for SPY"))?;
    for t in &snapshot {
      info!("  {} price={:?} size={:?}", t.timestamp, t.price, t.size);
    }
    info!("Metadata: {:?}", market.tick_stream().metadata("SPY"));
    market.stop_tick_stream(id)?;
    Ok(())
  }

  pub(super) fn depth_impl(h: &Harness) -> Result<()> {
    info!("--- Market Depth ---");
    let market = h.session.data_market();
    let id = market.request_market_depth("AAPL", Some(3))?;
    let rows = [
      InboundEvent::MarketDepth { req_id: id, position: 0, operation: 0, side: 1, price: 189.97, size: 400.0 },
      InboundEvent::MarketDepth { req_id: id, position: 1, operation: 0, side: 1, price: 189.96, size: 900.0 },
      InboundEvent::MarketDepth { req_id: id, position: 0, operation: 0, side: 0, price: 189.99, size: 200.0 },
      InboundEvent::MarketDepthL2 {
        req_id: id, position: 0, market_maker: "NSDQ".into(), operation: 1, side: 0, price: 189.98, size: 100.0,
        is_smart_depth: false,
      },
    ];
    for r in rows {
      h.transport.push(r)?;
    }
    h.settle()?;
    let book = market.market_depth(id).ok_or_else(|| anyhow!("depth book {} missing", id))?;
    info!("Bids: {:?}", book.bids);
    info!("Asks: {:?}", book.asks);
    market.cancel_market_depth(id)?;
    Ok(())
  }
}

// --- Scenario registration ---
inventory::submit! { ScenarioDefinition { name: "contract-details", script: scenarios::contract_details_script, func: scenarios::contract_details_impl } }
inventory::submit! { ScenarioDefinition { name: "historical-bars", script: scenarios::historical_script, func: scenarios::historical_impl } }
inventory::submit! { ScenarioDefinition { name: "option-chain", script: scenarios::option_chain_script, func: scenarios::option_chain_impl } }
inventory::submit! { ScenarioDefinition { name: "account-snapshot", script: scenarios::account_script, func: scenarios::account_impl } }
inventory::submit! { ScenarioDefinition { name: "positions", script: scenarios::positions_script, func: scenarios::positions_impl } }
inventory::submit! { ScenarioDefinition { name: "open-orders", script: scenarios::open_orders_script, func: scenarios::open_orders_impl } }
inventory::submit! { ScenarioDefinition { name: "bracket", script: scenarios::bracket_script, func: scenarios::bracket_impl } }
inventory::submit! { ScenarioDefinition { name: "combo", script: base_script, func: scenarios::combo_impl } }
inventory::submit! { ScenarioDefinition { name: "quotes", script: base_script, func: scenarios::quotes_impl } }
inventory::submit! { ScenarioDefinition { name: "depth", script: base_script, func: scenarios::depth_impl } }

fn run_scenario(def: &ScenarioDefinition, args: &Args, config: &SessionConfig) -> Result<()> {
  let script = match &args.script {
    Some(path) => Script::from_json_file(path).with_context(|| format!("Loading script {:?}", path))?,
    None => (def.script)(),
  };
  let harness = Harness::start(script, config.clone(), Duration::from_millis(args.ready_timeout_ms))?;
  (def.func)(&harness)
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  Lazy::force(&SCENARIO_REGISTRY);

  let args = Args::parse();
  let config = match &args.config {
    Some(path) => SessionConfig::from_json_file(path).with_context(|| format!("Loading config {:?}", path))?,
    None => SessionConfig::default(),
  };

  let mut names: Vec<&'static str> = if args.scenario_or_all == "all" {
    SCENARIO_REGISTRY.keys().copied().collect()
  } else {
    match SCENARIO_REGISTRY.get_key_value(args.scenario_or_all.as_str()) {
      Some((name, _)) => vec![*name],
      None => {
        let mut known: Vec<_> = SCENARIO_REGISTRY.keys().collect();
        known.sort();
        bail!("Unknown scenario '{}'. Available: {:?}", args.scenario_or_all, known);
      }
    }
  };
  names.sort();

  let mut failed = Vec::new();
  for name in &names {
    let def = SCENARIO_REGISTRY[name];
    info!("=== Running scenario: {} ===", name);
    match run_scenario(def, &args, &config) {
      Ok(()) => info!("=== Scenario {} PASSED ===", name),
      Err(e) => {
        error!("=== Scenario {} FAILED: {:?} ===", name, e);
        failed.push(*name);
      }
    }
  }

  if failed.is_empty() {
    info!("All {} scenario(s) passed.", names.len());
    Ok(())
  } else {
    Err(anyhow!("{} of {} scenario(s) failed: {:?}", failed.len(), names.len(), failed))
  }
}
