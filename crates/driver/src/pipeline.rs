//! N-buffered bulk streaming
//!
//! [`StreamingPipeline`] keeps `K` bulk transfers in flight on a dedicated
//! thread and commits completed blocks into a [`RingBuffer`] in submission
//! order.
//!
//! ```text
//!  warm-up:   slot 0 -> write+0, slot 1 -> write+1, ... slot K-1 -> write+K-1
//!
//!  steady:    wait(slot[cursor])  ──► commit_write()  ──► resubmit slot[cursor]
//!                  ▲                                        into write+K-1
//!                  └──────────── cursor = (cursor + 1) % K ◄┘
//! ```
//!
//! Each transfer lands directly in the ring buffer slot it will be read
//! from, so no copy is made between the endpoint and the consumer.

use crate::error::{DriverError, Result, TransportError};
use crate::transport::{BulkEndpoint, WaitStatus};
use common::{Block, RingBuffer, StreamMetrics};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transfers kept in flight by default
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Wait limit per transfer: one 65.536 ms block plus margin
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(80);

/// Name of the transfer thread
pub const WORKER_THREAD_NAME: &str = "fx3-stream";

/// Pipeline configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of outstanding transfers (K)
    pub concurrency: usize,
    /// How long to wait on the oldest transfer before giving up
    pub transfer_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 2 {
            return Err(DriverError::InvalidConfig(format!(
                "concurrency must be at least 2, got {}",
                self.concurrency
            )));
        }
        if self.transfer_timeout.is_zero() {
            return Err(DriverError::InvalidConfig(
                "transfer timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Streaming,
    /// Stop requested, or the transfer thread has exited on its own
    Stopping,
}

/// Why a transfer did not complete normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFailure {
    Timeout,
    ShortRead,
    Rejected,
    /// The endpoint reported a transport error
    Transport,
}

/// State of one [`TransferSlot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Submitted,
    Completed,
    Failed(TransferFailure),
}

/// Why the transfer thread stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamExit {
    /// The running flag was cleared
    Stopped,
    /// The oldest transfer did not complete within the timeout
    TimedOut,
    /// The endpoint refused a submission
    Rejected(TransportError),
    /// A transfer completed with an error
    Failed(TransportError),
}

/// One outstanding transfer and the context it runs on
///
/// The context is created on first submission and kept until the session
/// ends.
pub struct TransferSlot<C> {
    target: Option<Block<u8>>,
    requested: usize,
    context: Option<C>,
    status: SlotStatus,
}

impl<C> TransferSlot<C> {
    pub fn new() -> Self {
        Self {
            target: None,
            requested: 0,
            context: None,
            status: SlotStatus::Idle,
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Bytes requested by the current transfer
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Ring buffer block the current transfer writes into
    pub fn target(&self) -> Option<&Block<u8>> {
        self.target.as_ref()
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    fn context<B>(&mut self, bulk: &mut B) -> std::result::Result<&mut C, TransportError>
    where
        B: BulkEndpoint<Context = C>,
    {
        if self.context.is_none() {
            self.context = Some(bulk.create_context()?);
        }
        self.context
            .as_mut()
            .ok_or_else(|| TransportError::Other("transfer context unavailable".to_string()))
    }

    /// Submit a read of `len` bytes into `target`
    pub fn submit<B>(
        &mut self,
        bulk: &mut B,
        target: Block<u8>,
        len: usize,
    ) -> std::result::Result<(), TransportError>
    where
        B: BulkEndpoint<Context = C>,
    {
        let result = self
            .context(bulk)
            .and_then(|context| bulk.begin(context, target.clone(), len));

        match result {
            Ok(()) => {
                self.target = Some(target);
                self.requested = len;
                self.status = SlotStatus::Submitted;
                Ok(())
            }
            Err(e) => {
                self.target = None;
                self.status = SlotStatus::Failed(TransferFailure::Rejected);
                Err(e)
            }
        }
    }

    pub fn wait<B>(
        &mut self,
        bulk: &mut B,
        timeout: Duration,
    ) -> std::result::Result<WaitStatus, TransportError>
    where
        B: BulkEndpoint<Context = C>,
    {
        let context = self.context(bulk)?;
        bulk.wait(context, timeout)
    }

    /// Collect the completed transfer and return the bytes received
    pub fn finish<B>(&mut self, bulk: &mut B) -> std::result::Result<usize, TransportError>
    where
        B: BulkEndpoint<Context = C>,
    {
        let context = self.context(bulk)?;
        let actual = match bulk.finish(context) {
            Ok(actual) => actual,
            Err(e) => {
                self.status = SlotStatus::Failed(TransferFailure::Transport);
                return Err(e);
            }
        };
        self.status = if actual < self.requested {
            SlotStatus::Failed(TransferFailure::ShortRead)
        } else {
            SlotStatus::Completed
        };
        Ok(actual)
    }

    /// Cancel the transfer in flight, if any
    pub fn abort<B>(&mut self, bulk: &mut B, reason: TransferFailure)
    where
        B: BulkEndpoint<Context = C>,
    {
        if self.status != SlotStatus::Submitted {
            return;
        }
        if let Some(context) = self.context.as_mut() {
            bulk.abort(context);
        }
        self.status = SlotStatus::Failed(reason);
    }

    /// Abort anything in flight and drop the context
    pub fn release<B>(&mut self, bulk: &mut B)
    where
        B: BulkEndpoint<Context = C>,
    {
        if self.status == SlotStatus::Submitted
            && let Some(context) = self.context.as_mut()
        {
            bulk.abort(context);
        }
        self.context = None;
        self.target = None;
        self.status = SlotStatus::Idle;
    }
}

impl<C> Default for TransferSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the transfer thread
struct Worker<B: BulkEndpoint> {
    bulk: B,
    slots: Vec<TransferSlot<B::Context>>,
    buffer: Arc<RingBuffer<u8>>,
    transfer_size: usize,
    timeout: Duration,
    running: Arc<AtomicBool>,
    metrics: Arc<StreamMetrics>,
}

impl<B: BulkEndpoint> Worker<B> {
    fn run(mut self) -> (B, StreamExit) {
        let exit = self.stream();
        self.running.store(false, Ordering::Release);

        for slot in &mut self.slots {
            slot.release(&mut self.bulk);
        }
        debug!("Released {} transfer contexts", self.slots.len());

        (self.bulk, exit)
    }

    fn stream(&mut self) -> StreamExit {
        let k = self.slots.len();

        for (i, slot) in self.slots.iter_mut().enumerate() {
            let target = self.buffer.peek_write_slot(i as isize);
            if let Err(e) = slot.submit(&mut self.bulk, target, self.transfer_size) {
                warn!("Initial submission {} rejected: {}", i, e);
                self.metrics.record_rejected();
                return StreamExit::Rejected(e);
            }
        }
        info!(
            "Streaming with {} transfers of {} bytes in flight",
            k, self.transfer_size
        );

        let mut cursor = 0;
        while self.running.load(Ordering::Acquire) {
            let slot = &mut self.slots[cursor];

            match slot.wait(&mut self.bulk, self.timeout) {
                Ok(WaitStatus::Ready) => {}
                Ok(WaitStatus::TimedOut) => {
                    warn!(
                        "Transfer {} timed out after {:?}, stopping stream",
                        cursor, self.timeout
                    );
                    slot.abort(&mut self.bulk, TransferFailure::Timeout);
                    self.metrics.record_timeout();
                    return StreamExit::TimedOut;
                }
                Err(e) => {
                    warn!("Waiting on transfer {} failed: {}", cursor, e);
                    slot.abort(&mut self.bulk, TransferFailure::Transport);
                    self.metrics.record_failure();
                    return StreamExit::Failed(e);
                }
            }

            let actual = match slot.finish(&mut self.bulk) {
                Ok(actual) => actual,
                Err(e) => {
                    warn!("Transfer {} failed: {}", cursor, e);
                    self.metrics.record_failure();
                    return StreamExit::Failed(e);
                }
            };
            if actual < self.transfer_size {
                warn!(
                    "Short read on transfer {}: {} of {} bytes",
                    cursor, actual, self.transfer_size
                );
            }

            self.metrics.record_block(actual, self.transfer_size);
            self.buffer.commit_write();

            if !self.running.load(Ordering::Acquire) {
                break;
            }

            // Blocks while the consumer still holds any of the next K slots
            let target = self.buffer.acquire_write_slot_ahead(k - 1);
            if self.buffer.is_shutdown() {
                break;
            }
            if let Err(e) = slot.submit(&mut self.bulk, target, self.transfer_size) {
                warn!("Resubmission of transfer {} rejected: {}", cursor, e);
                self.metrics.record_rejected();
                return StreamExit::Rejected(e);
            }

            cursor = (cursor + 1) % k;
        }

        StreamExit::Stopped
    }
}

/// Bulk streaming engine for one device
pub struct StreamingPipeline<B: BulkEndpoint> {
    config: PipelineConfig,
    state: SessionState,
    bulk: Option<B>,
    buffer: Option<Arc<RingBuffer<u8>>>,
    running: Arc<AtomicBool>,
    metrics: Arc<StreamMetrics>,
    worker: Option<JoinHandle<(B, StreamExit)>>,
}

impl<B: BulkEndpoint> StreamingPipeline<B> {
    pub fn new(bulk: B, config: PipelineConfig) -> Self {
        Self {
            config,
            state: SessionState::Stopped,
            bulk: Some(bulk),
            buffer: None,
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(StreamMetrics::new()),
            worker: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current session state
    ///
    /// Reports [`SessionState::Stopping`] once the transfer thread has exited
    /// on its own and is waiting for [`StreamingPipeline::stop`].
    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Streaming && !self.running.load(Ordering::Acquire) {
            return SessionState::Stopping;
        }
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Metrics of the current or most recent session
    pub fn metrics(&self) -> Arc<StreamMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Start streaming `transfer_size`-byte blocks into `buffer`
    ///
    /// The buffer's block size is set to `transfer_size`. It must have at
    /// least `K` free slots and must not have been shut down.
    pub fn start(&mut self, buffer: Arc<RingBuffer<u8>>, transfer_size: usize) -> Result<()> {
        if self.state != SessionState::Stopped {
            return Err(DriverError::AlreadyStreaming);
        }
        self.config.validate()?;
        if transfer_size == 0 {
            return Err(DriverError::InvalidConfig(
                "transfer size must be non-zero".to_string(),
            ));
        }
        if buffer.is_shutdown() {
            return Err(DriverError::InvalidConfig(
                "ring buffer has been shut down".to_string(),
            ));
        }

        let k = self.config.concurrency;
        buffer.set_block_size(transfer_size);
        let available = buffer.free_slots();
        if available < k {
            return Err(DriverError::InsufficientCapacity {
                needed: k,
                available,
            });
        }

        let bulk = self.bulk.take().ok_or(DriverError::SessionClosed)?;
        self.state = SessionState::Starting;
        self.metrics = Arc::new(StreamMetrics::new());
        self.running.store(true, Ordering::Release);

        let worker = Worker {
            bulk,
            slots: (0..k).map(|_| TransferSlot::new()).collect(),
            buffer: Arc::clone(&buffer),
            transfer_size,
            timeout: self.config.transfer_timeout,
            running: Arc::clone(&self.running),
            metrics: Arc::clone(&self.metrics),
        };

        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.buffer = Some(buffer);
                self.state = SessionState::Streaming;
                info!(
                    "Streaming started: K={}, transfer size {} bytes",
                    k, transfer_size
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.state = SessionState::Stopped;
                Err(DriverError::Io(e))
            }
        }
    }

    /// Stop streaming and return why the transfer thread exited
    ///
    /// Shuts the ring buffer down so that a consumer parked on it wakes up.
    pub fn stop(&mut self) -> Result<StreamExit> {
        let Some(worker) = self.worker.take() else {
            return Err(DriverError::NotStreaming);
        };

        self.state = SessionState::Stopping;
        self.running.store(false, Ordering::Release);
        if let Some(buffer) = self.buffer.take() {
            buffer.shutdown();
        }

        let joined = worker.join();
        self.state = SessionState::Stopped;

        let (bulk, exit) = joined.map_err(|_| DriverError::WorkerPanicked)?;
        self.bulk = Some(bulk);

        let stats = self.metrics.snapshot();
        info!(
            "Streaming stopped ({:?}): {} blocks, {} bytes, {} short reads",
            exit, stats.blocks, stats.bytes, stats.short_reads
        );
        Ok(exit)
    }
}

impl<B: BulkEndpoint> Drop for StreamingPipeline<B> {
    fn drop(&mut self) {
        if self.worker.is_some()
            && let Err(e) = self.stop()
        {
            warn!("Failed to stop streaming on drop: {}", e);
        }
    }
}
