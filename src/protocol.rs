/// Level-3 feed message model
///
/// Server messages are JSON objects tagged by `type` with an optional
/// `sequence`:
///   - open:   order_id, side, price, remaining_size
///   - done:   order_id, side, price (optional), remaining_size (optional)
///   - match:  maker_order_id, taker_order_id, trade_id, side, price, size
///   - change: order_id, side, reason, old_size, new_size, price | old_price/new_price
///
/// Prices and sizes travel as decimal strings and are held as `Decimal`.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange-assigned order identifier, opaque to the book.
pub type OrderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kinds the book cares about. Anything else is consumed for its
/// sequence number only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Subscriptions,
    Heartbeat,
    Error,
    Open,
    Done,
    Match,
    Change,
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "subscriptions" => Some(MessageType::Subscriptions),
            "heartbeat" => Some(MessageType::Heartbeat),
            "error" => Some(MessageType::Error),
            "open" => Some(MessageType::Open),
            "done" => Some(MessageType::Done),
            "match" => Some(MessageType::Match),
            "change" => Some(MessageType::Change),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Subscriptions => "subscriptions",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
            MessageType::Open => "open",
            MessageType::Done => "done",
            MessageType::Match => "match",
            MessageType::Change => "change",
        }
    }
}

/// A new order resting on the book
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub side: Side,
    pub price: Decimal,
    #[serde(alias = "size")]
    pub remaining_size: Decimal,
}

/// An order left the book (filled or canceled). Market orders carry no price.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DoneOrder {
    pub order_id: OrderId,
    pub side: Side,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub remaining_size: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A trade against a resting maker order. `side` is the maker's side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MatchOrder {
    pub maker_order_id: OrderId,
    #[serde(default)]
    pub taker_order_id: Option<OrderId>,
    #[serde(default)]
    pub trade_id: Option<u64>,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// What a `change` message does, resolved from its `reason` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Self-trade prevention shrank the order in place.
    Stp { price: Option<Decimal> },
    /// The order was amended and moves to `new_price`.
    Modify {
        old_price: Option<Decimal>,
        new_price: Decimal,
    },
    /// Missing or unrecognised reason.
    Unsupported(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOrder {
    pub order_id: OrderId,
    pub side: Side,
    pub old_size: Decimal,
    pub new_size: Decimal,
    pub kind: ChangeKind,
}

/// A decoded book mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookEvent {
    Open(OpenOrder),
    Done(DoneOrder),
    Match(MatchOrder),
    Change(ChangeOrder),
}

impl BookEvent {
    pub fn message_type(&self) -> MessageType {
        match self {
            BookEvent::Open(_) => MessageType::Open,
            BookEvent::Done(_) => MessageType::Done,
            BookEvent::Match(_) => MessageType::Match,
            BookEvent::Change(_) => MessageType::Change,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            BookEvent::Open(m) => m.side,
            BookEvent::Done(m) => m.side,
            BookEvent::Match(m) => m.side,
            BookEvent::Change(m) => m.side,
        }
    }

    /// The order this event touches (the maker for matches).
    pub fn order_id(&self) -> &str {
        match self {
            BookEvent::Open(m) => &m.order_id,
            BookEvent::Done(m) => &m.order_id,
            BookEvent::Match(m) => &m.maker_order_id,
            BookEvent::Change(m) => &m.order_id,
        }
    }
}

/// Client -> server subscribe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub product_ids: Vec<String>,
    pub channels: Vec<String>,
}

impl SubscribeRequest {
    pub fn new(product_ids: Vec<String>, channels: Vec<String>) -> Self {
        SubscribeRequest {
            kind: "subscribe",
            product_ids,
            channels,
        }
    }
}
