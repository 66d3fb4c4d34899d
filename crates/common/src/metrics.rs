//! Streaming metrics
//!
//! Thread-safe counters updated by the transfer thread and read by whoever
//! reports on the stream. Throughput is computed over a rolling window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Rolling window used for the throughput estimate
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(2);

/// Throughput sample for bandwidth calculation
#[derive(Debug, Clone, Copy)]
struct ThroughputSample {
    /// Bytes transferred
    bytes: u64,
    /// Timestamp when transfer completed
    timestamp: Instant,
}

/// Rolling throughput calculator
#[derive(Debug)]
struct RollingThroughput {
    samples: VecDeque<ThroughputSample>,
    window_duration: Duration,
}

impl RollingThroughput {
    fn new(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    fn add_sample(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(ThroughputSample {
            bytes,
            timestamp: now,
        });
        self.prune_old_samples(now);
    }

    fn prune_old_samples(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window_duration) else {
            return;
        };
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the rolling window
    fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        // The first sample marks the start of the window
        let total_bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        let first = self.samples.front().map(|s| s.timestamp);
        let last = self.samples.back().map(|s| s.timestamp);

        match (first, last) {
            (Some(first), Some(last)) => {
                let duration = last.duration_since(first);
                if duration.as_secs_f64() > 0.0 {
                    total_bytes as f64 / duration.as_secs_f64()
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

/// Point-in-time view of [`StreamMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    /// Blocks committed to the ring buffer
    pub blocks: u64,
    /// Payload bytes received
    pub bytes: u64,
    /// Completions shorter than requested
    pub short_reads: u64,
    /// Transfers that timed out and were aborted
    pub timeouts: u64,
    /// Submissions refused by the endpoint
    pub rejected: u64,
    /// Transfers that failed with a transport error
    pub failures: u64,
    /// Throughput over the rolling window
    pub bytes_per_second: f64,
}

impl StreamStats {
    /// Throughput formatted in MB/s
    pub fn format_throughput(&self) -> String {
        format!("{:.2} MB/s", self.bytes_per_second / 1_000_000.0)
    }
}

/// Transfer metrics for one streaming session
#[derive(Debug)]
pub struct StreamMetrics {
    blocks: AtomicU64,
    bytes: AtomicU64,
    short_reads: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    failures: AtomicU64,
    throughput: RwLock<RollingThroughput>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            blocks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            throughput: RwLock::new(RollingThroughput::new(THROUGHPUT_WINDOW)),
        }
    }

    /// Record one completed block of `actual` bytes out of `requested`
    pub fn record_block(&self, actual: usize, requested: usize) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(actual as u64, Ordering::Relaxed);
        if actual < requested {
            self.short_reads.fetch_add(1, Ordering::Relaxed);
        }
        self.throughput
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_sample(actual as u64, Instant::now());
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transfer that ended with a transport error
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            blocks: self.blocks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_per_second: self
                .throughput
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .bytes_per_second(),
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}
