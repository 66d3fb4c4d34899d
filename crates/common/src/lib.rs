//! Common utilities for rust-fx3-stream
//!
//! This crate provides the pieces shared between the driver and the capture
//! tool: the block ring buffer that decouples the transfer thread from the
//! data consumer, streaming metrics, error handling and logging setup.

pub mod error;
pub mod logging;
pub mod metrics;
pub mod ring_buffer;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{StreamMetrics, StreamStats};
pub use ring_buffer::{Block, BlockGuard, DEFAULT_CAPACITY, RingBuffer, RingBufferError, RingStats};
