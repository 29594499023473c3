/// Feed message decoder
///
/// Turns one text frame into a typed `FeedMessage`. The envelope (`type`,
/// `sequence`) is read first; kind-specific fields are then validated so the
/// book handlers never see a half-formed event.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::*;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("payload is not a json object")]
    NotAnObject,

    #[error("missing message type")]
    MissingType,

    #[error("invalid sequence: {0}")]
    InvalidSequence(Value),

    #[error("malformed {kind} message: {source}")]
    MalformedBody {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} message missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("negative {field} {value} in {kind} message")]
    NegativeValue {
        kind: &'static str,
        field: &'static str,
        value: Decimal,
    },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Everything the engine needs from one server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub sequence: Option<u64>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Acknowledgement of a subscribe request
    Subscriptions,
    Heartbeat,
    /// Server-side error report
    Error { message: String },
    Event(BookEvent),
    /// A kind with no book effect (received, activate, ...). Still sequenced.
    Other(String),
}

impl FeedMessage {
    pub fn kind(&self) -> &str {
        match &self.body {
            MessageBody::Subscriptions => MessageType::Subscriptions.as_str(),
            MessageBody::Heartbeat => MessageType::Heartbeat.as_str(),
            MessageBody::Error { .. } => MessageType::Error.as_str(),
            MessageBody::Event(event) => event.message_type().as_str(),
            MessageBody::Other(kind) => kind,
        }
    }
}

#[derive(Deserialize)]
struct WireChange {
    order_id: OrderId,
    side: Side,
    #[serde(default)]
    reason: Option<String>,
    old_size: Decimal,
    new_size: Decimal,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    old_price: Option<Decimal>,
    #[serde(default)]
    new_price: Option<Decimal>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct Decoder;

impl Decoder {
    /// Decode a single text frame
    pub fn decode(text: &str) -> DecodeResult<FeedMessage> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
        Self::decode_value(value)
    }

    pub fn decode_value(value: Value) -> DecodeResult<FeedMessage> {
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();

        let sequence = match object.get("sequence") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                raw.as_u64()
                    .ok_or_else(|| DecodeError::InvalidSequence(raw.clone()))?,
            ),
        };

        let body = match MessageType::from_tag(&tag) {
            Some(MessageType::Subscriptions) => MessageBody::Subscriptions,
            Some(MessageType::Heartbeat) => MessageBody::Heartbeat,
            Some(MessageType::Error) => {
                let wire: WireError = body_from(value, "error")?;
                let message = match (wire.message, wire.reason) {
                    (Some(m), Some(r)) => format!("{m}: {r}"),
                    (Some(m), None) => m,
                    (None, Some(r)) => r,
                    (None, None) => "unspecified error".to_string(),
                };
                MessageBody::Error { message }
            }
            Some(MessageType::Open) => {
                let m: OpenOrder = body_from(value, "open")?;
                non_negative("open", "price", m.price)?;
                non_negative("open", "remaining_size", m.remaining_size)?;
                MessageBody::Event(BookEvent::Open(m))
            }
            Some(MessageType::Done) => {
                let m: DoneOrder = body_from(value, "done")?;
                if let Some(price) = m.price {
                    non_negative("done", "price", price)?;
                }
                MessageBody::Event(BookEvent::Done(m))
            }
            Some(MessageType::Match) => {
                let m: MatchOrder = body_from(value, "match")?;
                non_negative("match", "price", m.price)?;
                non_negative("match", "size", m.size)?;
                MessageBody::Event(BookEvent::Match(m))
            }
            Some(MessageType::Change) => {
                let wire: WireChange = body_from(value, "change")?;
                MessageBody::Event(BookEvent::Change(change_from_wire(wire)?))
            }
            None => MessageBody::Other(tag),
        };

        Ok(FeedMessage { sequence, body })
    }
}

fn body_from<T: DeserializeOwned>(value: Value, kind: &'static str) -> DecodeResult<T> {
    serde_json::from_value(value).map_err(|source| DecodeError::MalformedBody { kind, source })
}

fn non_negative(kind: &'static str, field: &'static str, value: Decimal) -> DecodeResult<()> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(DecodeError::NegativeValue { kind, field, value });
    }
    Ok(())
}

fn change_from_wire(wire: WireChange) -> DecodeResult<ChangeOrder> {
    non_negative("change", "old_size", wire.old_size)?;
    non_negative("change", "new_size", wire.new_size)?;

    let kind = match wire.reason.as_deref() {
        Some("STP") => ChangeKind::Stp { price: wire.price },
        Some("modify_order") => {
            let new_price = wire.new_price.ok_or(DecodeError::MissingField {
                kind: "change",
                field: "new_price",
            })?;
            non_negative("change", "new_price", new_price)?;
            ChangeKind::Modify {
                old_price: wire.old_price.or(wire.price),
                new_price,
            }
        }
        _ => ChangeKind::Unsupported(wire.reason),
    };

    Ok(ChangeOrder {
        order_id: wire.order_id,
        side: wire.side,
        old_size: wire.old_size,
        new_size: wire.new_size,
        kind,
    })
}
