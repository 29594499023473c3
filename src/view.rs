/// Top-of-book view
///
/// Aggregates the best N levels of each side into `(price, total size)`
/// pairs. Serializes as `{"asks":[["101.00","10"]],"bids":[["100.00","8"]]}`.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::book_builder::{BookResult, BookSide, BookState};

/// `(price, aggregated size)`
pub type ViewLevel = (Decimal, Decimal);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookView {
    /// Lowest price first
    pub asks: Vec<ViewLevel>,
    /// Highest price first
    pub bids: Vec<ViewLevel>,
}

impl BookView {
    pub fn best_ask(&self) -> Option<ViewLevel> {
        self.asks.first().copied()
    }

    pub fn best_bid(&self) -> Option<ViewLevel> {
        self.bids.first().copied()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.0 - self.best_bid()?.0)
    }

    pub fn is_empty(&self) -> bool {
        self.asks.is_empty() && self.bids.is_empty()
    }
}

/// Asks from worst to best, a rule, then bids from best to worst
impl fmt::Display for BookView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (price, size) in self.asks.iter().rev() {
            writeln!(f, "{:>14} {:>18}", price, size)?;
        }
        writeln!(f, "{}", "-".repeat(33))?;
        for (price, size) in &self.bids {
            writeln!(f, "{:>14} {:>18}", price, size)?;
        }
        Ok(())
    }
}

fn aggregate(side: &BookSide, count: usize) -> Vec<ViewLevel> {
    side.best(count)
        .into_iter()
        .map(|level| (level.price(), level.total_size()))
        .collect()
}

/// Best `count` levels per side. Fails with `BookError::Crossed` when both
/// sides are populated and the best ask does not sit above the best bid.
pub fn top_n(book: &BookState, count: usize) -> BookResult<BookView> {
    book.check_no_cross()?;
    Ok(BookView {
        asks: aggregate(book.asks(), count),
        bids: aggregate(book.bids(), count),
    })
}
