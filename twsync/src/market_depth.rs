// twsync/src/market_depth.rs
// L2 order book rebuilt from depth updates.
//
// TWS addresses rows by position within one side: insert shifts later rows down, delete shifts
// them up, update overwrites in place.

use crate::data::{DepthOperation, DepthRow, DepthSide, DepthSnapshot};
use chrono::Utc;
use log::{trace, warn};

#[derive(Debug, Clone)]
pub struct MarketDepthBook {
  snapshot: DepthSnapshot,
  max_rows: usize,
}

impl MarketDepthBook {
  pub fn new(symbol: &str, max_rows: usize) -> Self {
    MarketDepthBook {
      snapshot: DepthSnapshot { symbol: symbol.to_string(), ..Default::default() },
      max_rows,
    }
  }

  /// Applies one depth update. Returns false if it was malformed or out of range.
  pub fn apply(
    &mut self,
    position: i32,
    operation: i32,
    side: i32,
    price: f64,
    size: f64,
    market_maker: Option<&str>,
  ) -> bool {
    let (Some(op), Some(side)) = (DepthOperation::from_code(operation), DepthSide::from_code(side)) else {
      warn!("Bad depth update for {}: operation={} side={}", self.snapshot.symbol, operation, side);
      return false;
    };
    let Ok(pos) = usize::try_from(position) else {
      warn!("Negative depth position {} for {}", position, self.snapshot.symbol);
      return false;
    };
    let rows = match side {
      DepthSide::Bid => &mut self.snapshot.bids,
      DepthSide::Ask => &mut self.snapshot.asks,
    };
    let row = DepthRow { price, size, market_maker: market_maker.map(str::to_string) };

    let applied = match op {
      DepthOperation::Insert if pos <= rows.len() => {
        rows.insert(pos, row);
        rows.truncate(self.max_rows);
        true
      }
      DepthOperation::Update if pos < rows.len() => {
        rows[pos] = row;
        true
      }
      // An update just past the end acts as an append; TWS does this when rows were trimmed.
      DepthOperation::Update if pos == rows.len() && pos < self.max_rows => {
        rows.push(row);
        true
      }
      DepthOperation::Delete if pos < rows.len() => {
        rows.remove(pos);
        true
      }
      _ => false,
    };

    if applied {
      self.snapshot.updated_at = Some(Utc::now());
      trace!("Depth {} {:?} {:?} pos={} px={} sz={}", self.snapshot.symbol, side, op, pos, price, size);
    } else {
      warn!("Depth {:?} at position {} out of range for {} {:?} side ({} rows)",
            op, pos, self.snapshot.symbol, side, rows.len());
    }
    applied
  }

  pub fn snapshot(&self) -> DepthSnapshot {
    self.snapshot.clone()
  }

  pub fn best_bid(&self) -> Option<&DepthRow> {
    self.snapshot.bids.first()
  }

  pub fn best_ask(&self) -> Option<&DepthRow> {
    self.snapshot.asks.first()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_insert_update_delete_by_position() {
    let mut book = MarketDepthBook::new("AAPL", 5);
    assert!(book.apply(0, 0, 1, 100.0, 10.0, None));
    assert!(book.apply(0, 0, 1, 100.5, 5.0, None)); // new best bid shifts the old one down
    assert!(book.apply(0, 0, 0, 101.0, 7.0, Some("NSDQ")));

    let snap = book.snapshot();
    assert_eq!(snap.bids.iter().map(|r| r.price).collect::<Vec<_>>(), vec![100.5, 100.0]);
    assert_eq!(book.best_ask().unwrap().market_maker.as_deref(), Some("NSDQ"));

    assert!(book.apply(1, 1, 1, 100.0, 20.0, None));
    assert_eq!(book.snapshot().bids[1].size, 20.0);

    assert!(book.apply(0, 2, 1, 0.0, 0.0, None));
    assert_eq!(book.best_bid().unwrap().price, 100.0);
    assert!(book.snapshot().updated_at.is_some());
  }

  #[test]
  fn test_rejects_bad_updates() {
    let mut book = MarketDepthBook::new("AAPL", 2);
    assert!(!book.apply(3, 0, 1, 1.0, 1.0, None));
    assert!(!book.apply(0, 2, 0, 1.0, 1.0, None));
    assert!(!book.apply(0, 7, 0, 1.0, 1.0, None));
    assert!(!book.apply(0, 0, 4, 1.0, 1.0, None));
    assert!(!book.apply(-1, 0, 0, 1.0, 1.0, None));
    assert!(book.snapshot().updated_at.is_none());
  }

  #[test]
  fn test_rows_capped() {
    let mut book = MarketDepthBook::new("AAPL", 2);
    for i in 0..4 {
      assert!(book.apply(0, 0, 0, 100.0 + i as f64, 1.0, None));
    }
    assert_eq!(book.snapshot().asks.len(), 2);
    assert_eq!(book.best_ask().unwrap().price, 103.0);
  }
}
