/// Crate-level error and failure classification
///
/// Each component keeps its own error enum; `FeedError` gathers them so the
/// engine can decide whether to drop one message or report a stale book.

use thiserror::Error;

use crate::book_builder::BookError;
use crate::config::ConfigError;
use crate::decoder::DecodeError;
use crate::recovery::SnapshotError;
use crate::transport::TransportError;

/// How far a failure reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Drop the offending message and keep going
    Recoverable,
    /// The book may be stale or diverged; report it and resync
    Escalate,
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Book(#[from] BookError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("engine already started")]
    AlreadyStarted,
}

impl FeedError {
    pub fn severity(&self) -> Severity {
        match self {
            FeedError::Decode(_) => Severity::Recoverable,
            FeedError::Book(e) => e.severity(),
            FeedError::Snapshot(_) | FeedError::Transport(_) => Severity::Escalate,
            FeedError::Config(_) | FeedError::AlreadyStarted => Severity::Escalate,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

impl BookError {
    pub fn severity(&self) -> Severity {
        if self.is_violation() {
            Severity::Escalate
        } else {
            Severity::Recoverable
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
