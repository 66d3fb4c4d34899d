//! Test utilities for rust-fx3-stream
//!
//! Helpers for exercising the ring buffer and the streaming pipeline from
//! tests without risking a hung test run.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
//!
//! let answer = with_timeout(DEFAULT_TEST_TIMEOUT, || 6 * 7).unwrap();
//! assert_eq!(answer, 42);
//! ```

use crate::ring_buffer::RingBuffer;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a blocking closure on its own thread and give up after `duration`
///
/// On timeout the worker thread is left detached.
pub fn with_timeout<T, F>(duration: Duration, f: F) -> Result<T, TimeoutError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(duration)
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Copy `count` blocks out of the buffer, in read order
///
/// Stops early if the buffer is shut down.
pub fn drain_blocks<T>(buffer: &RingBuffer<T>, count: usize) -> Vec<Vec<T>>
where
    T: Clone,
{
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let block = buffer.acquire_read_slot();
        if buffer.is_shutdown() {
            break;
        }
        blocks.push(block.lock().to_vec());
        buffer.commit_read();
    }
    blocks
}

/// Spawn a consumer thread that drains `count` blocks
pub fn spawn_consumer<T>(buffer: Arc<RingBuffer<T>>, count: usize) -> JoinHandle<Vec<Vec<T>>>
where
    T: Clone + Send + 'static,
{
    thread::Builder::new()
        .name("test-consumer".to_string())
        .spawn(move || drain_blocks(&buffer, count))
        .expect("Failed to spawn consumer thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(20), || {
            thread::sleep(Duration::from_secs(1));
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_drain_blocks_in_order() {
        let buffer = RingBuffer::<u8>::with_block_size(4, 2).unwrap();
        for i in 0..3u8 {
            buffer.acquire_write_slot().lock().fill(i);
            buffer.commit_write();
        }

        let blocks = drain_blocks(&buffer, 3);
        assert_eq!(blocks, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
    }
}
