/// Sequence gate and gap detection
///
/// Classifies each incoming sequence number against the book's last applied
/// sequence. Gap counts live in `FeedStats`.

use tracing::{debug, warn};

use crate::book_builder::BookState;

/// What to do with an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No sequence number; nothing to apply
    Unsequenced,
    /// Already applied or older than the current state
    Stale { sequence: u64, current: u64 },
    /// Next in line; the book sequence has been advanced to it
    InOrder(u64),
    /// Messages were missed; the book must be rebuilt from a snapshot
    Gap { expected: u64, received: u64 },
    /// A rebuild was requested earlier and is still owed
    Forced(u64),
}

#[derive(Debug, Clone, Default)]
pub struct SequenceGate {
    resync_owed: bool,
}

impl SequenceGate {
    pub fn new() -> Self {
        SequenceGate { resync_owed: false }
    }

    /// Classify `sequence` and advance the book's sequence when it is
    /// in order or opens a gap. Stale messages leave the book untouched.
    pub fn admit(&mut self, book: &mut BookState, sequence: Option<u64>) -> Admission {
        let Some(seq) = sequence else {
            return Admission::Unsequenced;
        };

        let current = book.sequence();
        if seq <= current {
            debug!(sequence = seq, current, "dropping stale message");
            return Admission::Stale {
                sequence: seq,
                current,
            };
        }

        // Recorded before any resync so stragglers behind `seq` read as stale.
        book.set_sequence(seq);

        if self.resync_owed {
            self.resync_owed = false;
            return Admission::Forced(seq);
        }

        let expected = current + 1;
        if seq > expected {
            warn!(expected, received = seq, missing = seq - expected, "sequence gap detected");
            return Admission::Gap {
                expected,
                received: seq,
            };
        }

        Admission::InOrder(seq)
    }

    /// Make the next admitted message trigger a resync whatever its sequence
    pub fn request_resync(&mut self) {
        self.resync_owed = true;
    }

    /// Drop an owed resync once the book has been rebuilt some other way
    pub fn cancel_resync(&mut self) {
        self.resync_owed = false;
    }

    pub fn resync_owed(&self) -> bool {
        self.resync_owed
    }
}
