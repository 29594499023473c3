/// Book Feed - Level-3 Order Book Mirror
///
/// Rebuilds a live limit order book for one instrument from a sequenced
/// market data stream and repairs it from full-depth snapshots when messages
/// are missed. Features include:
/// - JSON feed decoding with per-kind validation
/// - Order-level book state with time priority inside each price level
/// - Sequence gating with gap history
/// - Snapshot resync with retry and backoff
/// - WebSocket transport with subscribe handshake and bounded receive
/// - Top-of-book views with a no-cross check
/// - Single-writer engine with shared read handles and feed statistics

pub mod protocol;
pub mod decoder;
pub mod book_builder;
pub mod gap_detector;
pub mod recovery;
pub mod transport;
pub mod view;
pub mod engine;
pub mod config;
pub mod error;
pub mod stats;

pub use protocol::{BookEvent, ChangeKind, ChangeOrder, DoneOrder, MatchOrder, MessageType, OpenOrder, OrderId, Side, SubscribeRequest};
pub use decoder::{Decoder, DecodeError, FeedMessage, MessageBody};
pub use book_builder::{BookError, BookSide, BookState, Order, PriceLevel};
pub use gap_detector::{Admission, SequenceGate};
pub use recovery::{RecoveryManager, RestSnapshotLoader, Snapshot, SnapshotEntry, SnapshotError, SnapshotSource};
pub use transport::{FeedTransport, Frame, StreamClient, TransportError, WsTransport};
pub use view::{top_n, BookView};
pub use engine::{BookEngine, BookHandle, FeedHealth};
pub use config::{ConfigError, FeedConfig, ResyncPolicy};
pub use error::{FeedError, FeedResult, Severity};
pub use stats::{FeedStats, LatencyStats};
