/// Feed statistics tracking
///
/// Counts what happened to every received frame and keeps a sliding window of
/// apply latencies (decode excluded) for percentile reporting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

const WINDOW_SIZE: usize = 10000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    fn from_window(window: &VecDeque<u64>) -> Option<Self> {
        if window.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();

        let n = sorted.len();
        Some(LatencyStats {
            min_us: sorted[0],
            max_us: sorted[n - 1],
            mean_us: sorted.iter().sum::<u64>() as f64 / n as f64,
            p50_us: sorted[n / 2],
            p99_us: sorted[(n * 99) / 100],
        })
    }
}

#[derive(Debug, Clone)]
pub struct FeedStats {
    start_time: Option<Instant>,
    received: u64,
    total_bytes: u64,

    // Outcome of each received frame
    applied: u64,
    stale: u64,
    malformed: u64,
    ignored: u64,
    misses: u64,

    // Gap tracking
    gap_events: u64,
    missing_sequences: u64,

    resyncs: u64,
    failed_resyncs: u64,
    violations: u64,
    reconnects: u64,

    apply_latencies: VecDeque<u64>,
}

impl FeedStats {
    pub fn new() -> Self {
        FeedStats {
            start_time: None,
            received: 0,
            total_bytes: 0,
            applied: 0,
            stale: 0,
            malformed: 0,
            ignored: 0,
            misses: 0,
            gap_events: 0,
            missing_sequences: 0,
            resyncs: 0,
            failed_resyncs: 0,
            violations: 0,
            reconnects: 0,
            apply_latencies: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    /// Record a frame received from the transport
    pub fn record_message(&mut self, size: usize) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        self.received += 1;
        self.total_bytes += size as u64;
    }

    /// Record a book mutation and how long it held the write lock
    pub fn record_applied(&mut self, latency: Duration) {
        self.applied += 1;
        if self.apply_latencies.len() >= WINDOW_SIZE {
            self.apply_latencies.pop_front();
        }
        self.apply_latencies.push_back(latency.as_micros() as u64);
    }

    pub fn record_stale(&mut self) {
        self.stale += 1;
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    /// Frames with no book effect: unsequenced or kinds the book ignores
    pub fn record_ignored(&mut self) {
        self.ignored += 1;
    }

    /// An event referenced an order or level the book does not hold
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Record a gap event of `missing` skipped sequence numbers
    pub fn record_gap(&mut self, missing: u64) {
        self.missing_sequences = self.missing_sequences.saturating_add(missing);
        self.gap_events += 1;
    }

    pub fn record_resync(&mut self, success: bool) {
        if success {
            self.resyncs += 1;
        } else {
            self.failed_resyncs += 1;
        }
    }

    pub fn record_violation(&mut self) {
        self.violations += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    /// Get messages per second
    pub fn messages_per_sec(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) if elapsed.as_secs_f64() > 0.0 => {
                self.received as f64 / elapsed.as_secs_f64()
            }
            _ => 0.0,
        }
    }

    pub fn apply_latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_window(&self.apply_latencies)
    }

    /// Get total elapsed time since the first frame
    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|st| st.elapsed())
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn gap_events(&self) -> u64 {
        self.gap_events
    }

    pub fn missing_sequences(&self) -> u64 {
        self.missing_sequences
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn failed_resyncs(&self) -> u64 {
        self.failed_resyncs
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = FeedStats::new();
    }

    /// Emit a one-line summary at info level
    pub fn log_summary(&self) {
        let latency = self.apply_latency_stats();
        info!(
            received = self.received,
            bytes = self.total_bytes,
            msgs_per_sec = self.messages_per_sec(),
            applied = self.applied,
            stale = self.stale,
            malformed = self.malformed,
            ignored = self.ignored,
            misses = self.misses,
            gaps = self.gap_events,
            missing = self.missing_sequences,
            resyncs = self.resyncs,
            failed_resyncs = self.failed_resyncs,
            violations = self.violations,
            reconnects = self.reconnects,
            apply_p50_us = latency.map(|l| l.p50_us),
            apply_p99_us = latency.map(|l| l.p99_us),
            "feed statistics"
        );
    }
}

impl Default for FeedStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_message() {
        let mut stats = FeedStats::new();
        stats.record_message(46);
        assert_eq!(stats.received(), 1);
        assert_eq!(stats.total_bytes(), 46);
        assert!(stats.elapsed().is_some());
    }

    #[test]
    fn test_apply_latency_stats() {
        let mut stats = FeedStats::new();
        assert!(stats.apply_latency_stats().is_none());
        for i in 1..=100 {
            stats.record_applied(Duration::from_micros(i));
        }

        let latency = stats.apply_latency_stats().unwrap();
        assert_eq!(stats.applied(), 100);
        assert_eq!(latency.min_us, 1);
        assert_eq!(latency.max_us, 100);
        assert_eq!(latency.p50_us, 51);
        assert_eq!(latency.p99_us, 100);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut stats = FeedStats::new();
        for _ in 0..WINDOW_SIZE + 5 {
            stats.record_applied(Duration::from_micros(3));
        }
        assert_eq!(stats.apply_latencies.len(), WINDOW_SIZE);
        assert_eq!(stats.applied(), (WINDOW_SIZE + 5) as u64);
    }

    #[test]
    fn test_gaps_and_resyncs() {
        let mut stats = FeedStats::new();
        stats.record_gap(5);
        stats.record_gap(3);
        stats.record_resync(true);
        stats.record_resync(false);
        assert_eq!(stats.missing_sequences(), 8);
        assert_eq!(stats.gap_events(), 2);
        assert_eq!(stats.resyncs(), 1);
        assert_eq!(stats.failed_resyncs(), 1);

        stats.reset();
        assert_eq!(stats.gap_events(), 0);
        assert!(stats.elapsed().is_none());
    }
}
