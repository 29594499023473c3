/// Order book builder from incremental level-3 updates
///
/// Each side keeps its price levels in a `BTreeMap` (ascending by price) and an
/// order-id index pointing at the level that holds the order. Orders inside a
/// level are kept in arrival order. A level is removed as soon as its last
/// order leaves.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{
    BookEvent, ChangeKind, ChangeOrder, DoneOrder, MatchOrder, OpenOrder, OrderId, Side,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    #[error("no {side} level at price {price}")]
    LevelNotFound { side: Side, price: Decimal },

    #[error("order {order_id} is not resting on the {side} side")]
    OrderNotFound { side: Side, order_id: OrderId },

    #[error("order {order_id} is already resting on the {side} side")]
    DuplicateOrder { side: Side, order_id: OrderId },

    #[error("negative size {size} for order {order_id}")]
    NegativeSize { order_id: OrderId, size: Decimal },

    #[error("size mismatch for order {order_id}: book holds {resting}, feed reports {reported}")]
    SizeMismatch {
        order_id: OrderId,
        resting: Decimal,
        reported: Decimal,
    },

    #[error("trade of {trade_size} exceeds resting size {resting} of order {order_id}")]
    Overfill {
        order_id: OrderId,
        resting: Decimal,
        trade_size: Decimal,
    },

    #[error("crossed book: best ask {best_ask} <= best bid {best_bid}")]
    Crossed { best_bid: Decimal, best_ask: Decimal },
}

impl BookError {
    /// Whether the error means the mirror no longer matches the exchange.
    /// Misses (unknown order or level) are expected after a resync and are not.
    pub fn is_violation(&self) -> bool {
        !matches!(
            self,
            BookError::LevelNotFound { .. } | BookError::OrderNotFound { .. }
        )
    }
}

pub type BookResult<T> = Result<T, BookError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_id: OrderId,
    pub size: Decimal,
}

impl Order {
    pub fn new(order_id: impl Into<OrderId>, size: Decimal) -> Self {
        Order {
            order_id: order_id.into(),
            size,
        }
    }
}

/// All resting orders at one price, oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    price: Decimal,
    orders: Vec<Order>,
}

impl PriceLevel {
    fn new(price: Decimal) -> Self {
        PriceLevel {
            price,
            orders: Vec::new(),
        }
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Sum of resting sizes at this price
    pub fn total_size(&self) -> Decimal {
        self.orders.iter().map(|o| o.size).sum()
    }

    fn position(&self, order_id: &str) -> Option<usize> {
        self.orders.iter().position(|o| o.order_id == order_id)
    }
}

/// One side of the book
#[derive(Debug, Clone)]
pub struct BookSide {
    side: Side,
    levels: BTreeMap<Decimal, PriceLevel>,
    // order id -> price of the level holding it
    index: HashMap<OrderId, Decimal>,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        BookSide {
            side,
            levels: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Append an order at the tail of its price level, creating the level if needed
    pub fn insert(&mut self, price: Decimal, order: Order) -> BookResult<()> {
        if order.size.is_sign_negative() && !order.size.is_zero() {
            return Err(BookError::NegativeSize {
                order_id: order.order_id,
                size: order.size,
            });
        }
        if self.index.contains_key(&order.order_id) {
            return Err(BookError::DuplicateOrder {
                side: self.side,
                order_id: order.order_id,
            });
        }

        self.index.insert(order.order_id.clone(), price);
        self.levels
            .entry(price)
            .or_insert_with(|| PriceLevel::new(price))
            .orders
            .push(order);
        Ok(())
    }

    /// Remove an order from the level at `price`, dropping the level if it empties
    pub fn take(&mut self, price: Decimal, order_id: &str) -> BookResult<Order> {
        let level = self.levels.get_mut(&price).ok_or(BookError::LevelNotFound {
            side: self.side,
            price,
        })?;
        let idx = level.position(order_id).ok_or_else(|| BookError::OrderNotFound {
            side: self.side,
            order_id: order_id.to_string(),
        })?;

        let order = level.orders.remove(idx);
        if level.is_empty() {
            self.levels.remove(&price);
        }
        self.index.remove(order_id);
        Ok(order)
    }

    /// Find the price of the level holding `order_id`.
    ///
    /// The hinted level is checked first; the id index is only consulted
    /// when there is no hint or the hinted level does not hold the order.
    pub fn locate(&self, order_id: &str, price_hint: Option<Decimal>) -> BookResult<Decimal> {
        if let Some(price) = price_hint {
            let held = self
                .levels
                .get(&price)
                .is_some_and(|level| level.position(order_id).is_some());
            if held {
                return Ok(price);
            }
            debug!(side = %self.side, order_id, %price, "order not at hinted price, using index");
        }

        self.index
            .get(order_id)
            .copied()
            .ok_or_else(|| BookError::OrderNotFound {
                side: self.side,
                order_id: order_id.to_string(),
            })
    }

    fn order_mut(&mut self, price: Decimal, order_id: &str) -> BookResult<&mut Order> {
        let side = self.side;
        let level = self
            .levels
            .get_mut(&price)
            .ok_or(BookError::LevelNotFound { side, price })?;
        level
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| BookError::OrderNotFound {
                side,
                order_id: order_id.to_string(),
            })
    }

    pub fn level(&self, price: Decimal) -> Option<&PriceLevel> {
        self.levels.get(&price)
    }

    /// Levels in ascending price order
    pub fn levels(&self) -> impl DoubleEndedIterator<Item = &PriceLevel> {
        self.levels.values()
    }

    /// Up to `n` levels, best first: highest bids, lowest asks
    pub fn best(&self, n: usize) -> Vec<&PriceLevel> {
        match self.side {
            Side::Buy => self.levels.values().rev().take(n).collect(),
            Side::Sell => self.levels.values().take(n).collect(),
        }
    }

    pub fn best_price(&self) -> Option<Decimal> {
        match self.side {
            Side::Buy => self.levels.keys().next_back().copied(),
            Side::Sell => self.levels.keys().next().copied(),
        }
    }

    pub fn get(&self, order_id: &str) -> Option<&Order> {
        let price = self.index.get(order_id)?;
        self.levels
            .get(price)?
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.index.clear();
    }
}

/// The mirrored book: both sides plus the last applied sequence number
#[derive(Debug, Clone)]
pub struct BookState {
    sequence: u64,
    buy: BookSide,
    sell: BookSide,
}

impl BookState {
    pub fn new() -> Self {
        BookState {
            sequence: 0,
            buy: BookSide::new(Side::Buy),
            sell: BookSide::new(Side::Sell),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn side(&self, side: Side) -> &BookSide {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn bids(&self) -> &BookSide {
        &self.buy
    }

    pub fn asks(&self) -> &BookSide {
        &self.sell
    }

    /// Drop every order and set the sequence a snapshot starts from
    pub fn reset(&mut self, sequence: u64) {
        self.buy.clear();
        self.sell.clear();
        self.sequence = sequence;
    }

    /// Dispatch an event to its handler
    pub fn apply(&mut self, event: &BookEvent) -> BookResult<()> {
        match event {
            BookEvent::Open(m) => self.open(m),
            BookEvent::Done(m) => self.done(m).map(|_| ()),
            BookEvent::Match(m) => self.match_order(m),
            BookEvent::Change(m) => self.change(m),
        }
    }

    pub fn open(&mut self, msg: &OpenOrder) -> BookResult<()> {
        self.side_mut(msg.side).insert(
            msg.price,
            Order::new(msg.order_id.clone(), msg.remaining_size),
        )
    }

    /// Remove an order entirely; returns what was resting
    pub fn done(&mut self, msg: &DoneOrder) -> BookResult<Order> {
        let side = self.side_mut(msg.side);
        let price = side.locate(&msg.order_id, msg.price)?;
        side.take(price, &msg.order_id)
    }

    /// Reduce the maker order by the traded size, removing it when fully filled
    pub fn match_order(&mut self, msg: &MatchOrder) -> BookResult<()> {
        let side = self.side_mut(msg.side);
        let resting = side.order_mut(msg.price, &msg.maker_order_id)?;

        if resting.size == msg.size {
            side.take(msg.price, &msg.maker_order_id)?;
        } else if resting.size > msg.size {
            resting.size -= msg.size;
        } else {
            return Err(BookError::Overfill {
                order_id: msg.maker_order_id.clone(),
                resting: resting.size,
                trade_size: msg.size,
            });
        }
        Ok(())
    }

    pub fn change(&mut self, msg: &ChangeOrder) -> BookResult<()> {
        let side = self.side_mut(msg.side);
        match &msg.kind {
            ChangeKind::Stp { price } => {
                let price = side.locate(&msg.order_id, *price)?;
                let order = side.order_mut(price, &msg.order_id)?;
                check_old_size(order, msg.old_size)?;
                order.size = msg.new_size;
                Ok(())
            }
            ChangeKind::Modify {
                old_price,
                new_price,
            } => {
                let old_price = side.locate(&msg.order_id, *old_price)?;
                check_old_size(side.order_mut(old_price, &msg.order_id)?, msg.old_size)?;

                let mut order = side.take(old_price, &msg.order_id)?;
                order.size = msg.new_size;
                side.insert(*new_price, order)
            }
            ChangeKind::Unsupported(reason) => {
                warn!(
                    order_id = %msg.order_id,
                    reason = reason.as_deref().unwrap_or("<missing>"),
                    "ignoring change message with unsupported reason"
                );
                Ok(())
            }
        }
    }

    /// Best ask must sit strictly above best bid when both sides exist
    pub fn check_no_cross(&self) -> BookResult<()> {
        match (self.buy.best_price(), self.sell.best_price()) {
            (Some(best_bid), Some(best_ask)) if best_ask <= best_bid => {
                Err(BookError::Crossed { best_bid, best_ask })
            }
            _ => Ok(()),
        }
    }

    pub fn order_count(&self) -> usize {
        self.buy.order_count() + self.sell.order_count()
    }
}

impl Default for BookState {
    fn default() -> Self {
        Self::new()
    }
}

fn check_old_size(order: &Order, reported: Decimal) -> BookResult<()> {
    if order.size != reported {
        return Err(BookError::SizeMismatch {
            order_id: order.order_id.clone(),
            resting: order.size,
            reported,
        });
    }
    Ok(())
}
