//! Runtime statistics published by the worker loops.
//!
//! The loops own a [`RateMeter`] each and push their numbers into the shared
//! [`LinkStats`], which channel info queries read without locking. Every
//! field is independent, so readers see an approximate snapshot.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::config::Direction;

/// How often the data rate estimate is refreshed
pub const RATE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct LinkStats {
    rx_last_timestamp: AtomicU64,
    tx_last_timestamp: AtomicU64,
    /// Bytes per second
    rx_rate: AtomicU64,
    tx_rate: AtomicU64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn timestamp_cell(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Rx => &self.rx_last_timestamp,
            Direction::Tx => &self.tx_last_timestamp,
        }
    }

    fn rate_cell(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Rx => &self.rx_rate,
            Direction::Tx => &self.tx_rate,
        }
    }

    /// Last timestamp received from, or sent to, the hardware
    pub fn last_timestamp(&self, direction: Direction) -> u64 {
        self.timestamp_cell(direction).load(Ordering::Relaxed)
    }

    pub fn set_last_timestamp(&self, direction: Direction, timestamp: u64) {
        self.timestamp_cell(direction)
            .store(timestamp, Ordering::Relaxed);
    }

    /// Link throughput in bytes per second
    pub fn rate(&self, direction: Direction) -> u64 {
        self.rate_cell(direction).load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, direction: Direction, bytes_per_sec: u64) {
        self.rate_cell(direction)
            .store(bytes_per_sec, Ordering::Relaxed);
    }
}

/// Counts transferred bytes and turns them into a per-second rate
#[derive(Debug)]
pub struct RateMeter {
    direction: Direction,
    since: Instant,
    bytes: u64,
}

impl RateMeter {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            since: Instant::now(),
            bytes: 0,
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    /// Publish the rate once a full period has gone by
    pub fn tick(&mut self, stats: &LinkStats) {
        let elapsed = self.since.elapsed();
        if elapsed < RATE_PERIOD {
            return;
        }
        let rate = (self.bytes as f64 / elapsed.as_secs_f64()) as u64;
        debug!(
            "{}: {:.3} MB/s",
            self.direction,
            rate as f64 / 1_000_000.0
        );
        stats.set_rate(self.direction, rate);
        self.bytes = 0;
        self.since = Instant::now();
    }

    /// A transfer did not complete in time. What was counted so far becomes
    /// the rate and counting restarts.
    pub fn stalled(&mut self, stats: &LinkStats) {
        stats.set_rate(self.direction, self.bytes);
        self.bytes = 0;
    }

    pub fn stop(&mut self, stats: &LinkStats) {
        stats.set_rate(self.direction, 0);
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_are_independent() {
        let stats = LinkStats::new();
        stats.set_last_timestamp(Direction::Rx, 1360);
        stats.set_rate(Direction::Tx, 42);
        assert_eq!(stats.last_timestamp(Direction::Rx), 1360);
        assert_eq!(stats.last_timestamp(Direction::Tx), 0);
        assert_eq!(stats.rate(Direction::Tx), 42);
        assert_eq!(stats.rate(Direction::Rx), 0);
    }

    #[test]
    fn rate_waits_for_a_full_period() {
        let stats = LinkStats::new();
        let mut meter = RateMeter::new(Direction::Rx);
        meter.add(4096);
        meter.tick(&stats);
        assert_eq!(stats.rate(Direction::Rx), 0);

        meter.since -= RATE_PERIOD * 2;
        meter.tick(&stats);
        let rate = stats.rate(Direction::Rx);
        assert!(rate > 0 && rate <= 2048, "{rate}");
    }

    #[test]
    fn stall_publishes_partial_count() {
        let stats = LinkStats::new();
        let mut meter = RateMeter::new(Direction::Tx);
        meter.add(100);
        meter.stalled(&stats);
        assert_eq!(stats.rate(Direction::Tx), 100);
        meter.stalled(&stats);
        assert_eq!(stats.rate(Direction::Tx), 0);
        meter.add(7);
        meter.stop(&stats);
        assert_eq!(stats.rate(Direction::Tx), 0);
    }
}
