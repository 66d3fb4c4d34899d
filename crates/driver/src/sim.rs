//! In-memory device backend
//!
//! Implements the collaborator traits without hardware. Used by the tests
//! and by `fx3-capture --simulate`.
//!
//! [`SimulatedBulk`] stamps every block with its submission sequence number
//! (little-endian `u32` at offset 0, the rest filled with the low byte) so
//! consumers can check ordering. Counters are shared through a
//! [`TransferCounter`] that stays readable after the endpoint has moved into
//! the transfer thread.

use crate::error::TransportError;
use crate::transport::{BulkEndpoint, ControlChannel, DeviceLifecycle, WaitStatus};
use common::Block;
use protocol::{
    Addressing, Command, ControlSetup, FirmwareVersion, HardwareInfo, encode_hardware_info,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Model byte reported by the simulated hardware
pub const SIMULATED_MODEL: u8 = 0x04;

/// One request seen by [`SimulatedControl`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub setup: ControlSetup,
    /// Bytes written, empty for reads
    pub data: Vec<u8>,
    /// Bytes requested by a read
    pub read_len: usize,
}

#[derive(Debug)]
struct ControlState {
    requests: Vec<ControlRequest>,
    failures: Vec<TransportError>,
    info: HardwareInfo,
    i2c: HashMap<Addressing, Vec<u8>>,
    stats: Vec<u8>,
}

/// Shared view of a [`SimulatedControl`]'s request log
#[derive(Debug, Clone)]
pub struct ControlLog {
    state: Arc<Mutex<ControlState>>,
}

impl ControlLog {
    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every request so far, oldest first
    pub fn requests(&self) -> Vec<ControlRequest> {
        self.lock().requests.clone()
    }

    pub fn last(&self) -> Option<ControlRequest> {
        self.lock().requests.last().cloned()
    }

    /// Number of requests carrying `command`
    pub fn count(&self, command: Command) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.setup.command == command)
            .count()
    }

    /// Make the next request fail with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.lock().failures.push(error);
    }

    /// Change the firmware version reported from now on
    pub fn set_firmware(&self, firmware: FirmwareVersion) {
        self.lock().info.firmware = firmware;
    }

    /// Set the block returned for `GetStats`
    pub fn set_stats(&self, stats: &[u8]) {
        self.lock().stats = stats.to_vec();
    }
}

/// Control channel backed by a request log
///
/// Answers `Test` with the configured hardware info, keeps I2C writes per
/// `(bus, register)` and returns them on I2C reads. `GetStats` returns
/// whatever [`ControlLog::set_stats`] last stored.
#[derive(Debug)]
pub struct SimulatedControl {
    log: ControlLog,
}

impl SimulatedControl {
    pub fn new(firmware: FirmwareVersion) -> Self {
        Self {
            log: ControlLog {
                state: Arc::new(Mutex::new(ControlState {
                    requests: Vec::new(),
                    failures: Vec::new(),
                    info: HardwareInfo {
                        model: SIMULATED_MODEL,
                        firmware,
                        reserved: 0,
                    },
                    i2c: HashMap::new(),
                    stats: Vec::new(),
                })),
            },
        }
    }

    pub fn log(&self) -> ControlLog {
        self.log.clone()
    }
}

impl ControlChannel for SimulatedControl {
    fn write(&mut self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.log.lock();
        state.requests.push(ControlRequest {
            setup,
            data: data.to_vec(),
            read_len: 0,
        });
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }

        if setup.command == Command::I2cWrite {
            state.i2c.insert(setup.addressing, data.to_vec());
        }
        Ok(())
    }

    fn read(&mut self, setup: ControlSetup, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.log.lock();
        state.requests.push(ControlRequest {
            setup,
            data: Vec::new(),
            read_len: buffer.len(),
        });
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }

        let response: Vec<u8> = match setup.command {
            Command::Test => encode_hardware_info(&state.info).to_vec(),
            Command::I2cRead => state
                .i2c
                .get(&setup.addressing)
                .cloned()
                .unwrap_or_default(),
            Command::ReadDebugInfo => b"sim\n".to_vec(),
            Command::GetStats => state.stats.clone(),
            _ => Vec::new(),
        };

        let len = response.len().min(buffer.len());
        buffer[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }
}

/// Counter snapshot taken from a [`TransferCounter`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounts {
    pub submitted: u64,
    pub completed: u64,
    pub aborted: u64,
    pub outstanding: usize,
    /// Fewest transfers in flight seen when a wait began
    pub min_outstanding_at_wait: usize,
    /// Most transfers in flight at any time
    pub max_outstanding: usize,
    pub contexts_created: u64,
    pub contexts_released: u64,
}

#[derive(Debug)]
struct SharedCounts {
    submitted: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    outstanding: AtomicUsize,
    min_outstanding_at_wait: AtomicUsize,
    max_outstanding: AtomicUsize,
    contexts_created: AtomicU64,
    contexts_released: AtomicU64,
}

/// Shared counters of a [`SimulatedBulk`]
#[derive(Debug, Clone)]
pub struct TransferCounter {
    counters: Arc<SharedCounts>,
}

impl TransferCounter {
    fn new() -> Self {
        Self {
            counters: Arc::new(SharedCounts {
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                aborted: AtomicU64::new(0),
                outstanding: AtomicUsize::new(0),
                min_outstanding_at_wait: AtomicUsize::new(usize::MAX),
                max_outstanding: AtomicUsize::new(0),
                contexts_created: AtomicU64::new(0),
                contexts_released: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> TransferCounts {
        let c = &self.counters;
        let min = c.min_outstanding_at_wait.load(Ordering::Relaxed);
        TransferCounts {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            aborted: c.aborted.load(Ordering::Relaxed),
            outstanding: c.outstanding.load(Ordering::Relaxed),
            min_outstanding_at_wait: if min == usize::MAX { 0 } else { min },
            max_outstanding: c.max_outstanding.load(Ordering::Relaxed),
            contexts_created: c.contexts_created.load(Ordering::Relaxed),
            contexts_released: c.contexts_released.load(Ordering::Relaxed),
        }
    }
}

/// Transfer context of [`SimulatedBulk`]
#[derive(Debug)]
pub struct SimTransfer {
    pending: Option<(Block<u8>, usize, u64)>,
    counters: Arc<SharedCounts>,
}

impl Drop for SimTransfer {
    fn drop(&mut self) {
        self.counters
            .contexts_released
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Bulk endpoint that completes transfers from memory
#[derive(Debug)]
pub struct SimulatedBulk {
    counter: TransferCounter,
    next_sequence: u64,
    completion_delay: Duration,
    stall_after: Option<u64>,
    reject_after: Option<u64>,
    fail_after: Option<(u64, TransportError)>,
    short_every: Option<(u64, usize)>,
}

impl SimulatedBulk {
    pub fn new() -> Self {
        Self {
            counter: TransferCounter::new(),
            next_sequence: 0,
            completion_delay: Duration::ZERO,
            stall_after: None,
            reject_after: None,
            fail_after: None,
            short_every: None,
        }
    }

    /// Sleep this long in every wait, to pace the stream like real hardware
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    /// Never complete any transfer after the first `count`
    pub fn stall_after(mut self, count: u64) -> Self {
        self.stall_after = Some(count);
        self
    }

    /// Refuse every submission after the first `count`
    pub fn reject_after(mut self, count: u64) -> Self {
        self.reject_after = Some(count);
        self
    }

    /// Waiting on any transfer after the first `count` fails with `error`
    pub fn fail_after(mut self, count: u64, error: TransportError) -> Self {
        self.fail_after = Some((count, error));
        self
    }

    /// Every `period`-th transfer returns only `len` bytes
    pub fn short_every(mut self, period: u64, len: usize) -> Self {
        self.short_every = Some((period.max(1), len));
        self
    }

    pub fn counter(&self) -> TransferCounter {
        self.counter.clone()
    }

    fn stalled(&self, sequence: u64) -> bool {
        self.stall_after.is_some_and(|count| sequence >= count)
    }
}

impl Default for SimulatedBulk {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkEndpoint for SimulatedBulk {
    type Context = SimTransfer;

    fn create_context(&mut self) -> Result<Self::Context, TransportError> {
        self.counter
            .counters
            .contexts_created
            .fetch_add(1, Ordering::Relaxed);
        Ok(SimTransfer {
            pending: None,
            counters: Arc::clone(&self.counter.counters),
        })
    }

    fn begin(
        &mut self,
        context: &mut Self::Context,
        target: Block<u8>,
        len: usize,
    ) -> Result<(), TransportError> {
        if self
            .reject_after
            .is_some_and(|count| self.next_sequence >= count)
        {
            return Err(TransportError::Rejected);
        }
        if context.pending.is_some() {
            return Err(TransportError::Busy);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        context.pending = Some((target, len, sequence));

        let c = &self.counter.counters;
        c.submitted.fetch_add(1, Ordering::Relaxed);
        let outstanding = c.outstanding.fetch_add(1, Ordering::Relaxed) + 1;
        c.max_outstanding.fetch_max(outstanding, Ordering::Relaxed);
        Ok(())
    }

    fn wait(
        &mut self,
        context: &mut Self::Context,
        timeout: Duration,
    ) -> Result<WaitStatus, TransportError> {
        let Some((_, _, sequence)) = context.pending.as_ref() else {
            return Err(TransportError::Other("no transfer pending".to_string()));
        };

        let c = &self.counter.counters;
        c.min_outstanding_at_wait
            .fetch_min(c.outstanding.load(Ordering::Relaxed), Ordering::Relaxed);

        if let Some((count, error)) = &self.fail_after
            && *sequence >= *count
        {
            return Err(error.clone());
        }
        if self.stalled(*sequence) {
            thread::sleep(timeout);
            return Ok(WaitStatus::TimedOut);
        }
        if !self.completion_delay.is_zero() {
            thread::sleep(self.completion_delay.min(timeout));
        }
        Ok(WaitStatus::Ready)
    }

    fn finish(&mut self, context: &mut Self::Context) -> Result<usize, TransportError> {
        let (target, len, sequence) = context
            .pending
            .take()
            .ok_or_else(|| TransportError::Other("no transfer pending".to_string()))?;

        let actual = match self.short_every {
            Some((period, short)) if (sequence + 1) % period == 0 => short.min(len),
            _ => len,
        };

        {
            let mut block = target.lock();
            let end = actual.min(block.len());
            block[..end].fill(sequence as u8);
            let stamp = (sequence as u32).to_le_bytes();
            let n = end.min(stamp.len());
            block[..n].copy_from_slice(&stamp[..n]);
        }

        let c = &self.counter.counters;
        c.completed.fetch_add(1, Ordering::Relaxed);
        c.outstanding.fetch_sub(1, Ordering::Relaxed);
        Ok(actual)
    }

    fn abort(&mut self, context: &mut Self::Context) {
        if let Some((_, _, sequence)) = context.pending.take() {
            debug!("Aborted simulated transfer {}", sequence);
            let c = &self.counter.counters;
            c.aborted.fetch_add(1, Ordering::Relaxed);
            c.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Sequence number stamped into a block by [`SimulatedBulk`]
pub fn block_sequence(block: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = block.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Lifecycle that hands out simulated devices
///
/// Starts in bootloader mode when created with [`SimulatedLifecycle::bootloader`];
/// loading any non-empty image switches it to the streamer firmware.
#[derive(Debug)]
pub struct SimulatedLifecycle {
    firmware: FirmwareVersion,
    bootloader: bool,
    devices: usize,
    firmware_loads: usize,
    completion_delay: Duration,
    log: Option<ControlLog>,
}

impl SimulatedLifecycle {
    /// One device already running `firmware`
    pub fn new(firmware: FirmwareVersion) -> Self {
        Self {
            firmware,
            bootloader: false,
            devices: 1,
            firmware_loads: 0,
            completion_delay: Duration::ZERO,
            log: None,
        }
    }

    /// One device running only the bootloader
    pub fn bootloader(firmware: FirmwareVersion) -> Self {
        Self {
            bootloader: true,
            ..Self::new(firmware)
        }
    }

    /// Pace simulated transfers, see [`SimulatedBulk::with_completion_delay`]
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    pub fn firmware_loads(&self) -> usize {
        self.firmware_loads
    }

    /// Request log of the most recently opened device
    pub fn control_log(&self) -> Option<ControlLog> {
        self.log.clone()
    }

    fn check_index(&self, index: usize) -> Result<(), TransportError> {
        if index >= self.devices {
            return Err(TransportError::NotFound);
        }
        Ok(())
    }
}

impl DeviceLifecycle for SimulatedLifecycle {
    type Control = SimulatedControl;
    type Bulk = SimulatedBulk;

    fn is_bootloader(&mut self, index: usize) -> Result<bool, TransportError> {
        self.check_index(index)?;
        Ok(self.bootloader)
    }

    fn load_firmware(&mut self, index: usize, image: &[u8]) -> Result<(), TransportError> {
        self.check_index(index)?;
        if image.is_empty() {
            return Err(TransportError::Other("empty firmware image".to_string()));
        }
        self.firmware_loads += 1;
        self.bootloader = false;
        Ok(())
    }

    fn open(&mut self, index: usize) -> Result<(Self::Control, Self::Bulk), TransportError> {
        self.check_index(index)?;
        if self.bootloader {
            return Err(TransportError::Unsupported(
                "device runs the bootloader only".to_string(),
            ));
        }

        let control = SimulatedControl::new(self.firmware);
        self.log = Some(control.log());
        let bulk = SimulatedBulk::new().with_completion_delay(self.completion_delay);
        Ok((control, bulk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::RingBuffer;

    #[test]
    fn test_stamps_sequence() {
        let buffer = RingBuffer::<u8>::with_block_size(4, 16).unwrap();
        let mut bulk = SimulatedBulk::new();
        let mut ctx = bulk.create_context().unwrap();

        for expected in 0..3u32 {
            bulk.begin(&mut ctx, buffer.peek_write_slot(0), 16).unwrap();
            assert_eq!(
                bulk.wait(&mut ctx, Duration::from_millis(10)).unwrap(),
                WaitStatus::Ready
            );
            assert_eq!(bulk.finish(&mut ctx).unwrap(), 16);
            assert_eq!(block_sequence(&buffer.peek_write_slot(0).lock()), Some(expected));
        }
    }

    #[test]
    fn test_busy_context() {
        let buffer = RingBuffer::<u8>::with_block_size(4, 16).unwrap();
        let mut bulk = SimulatedBulk::new();
        let mut ctx = bulk.create_context().unwrap();

        bulk.begin(&mut ctx, buffer.peek_write_slot(0), 16).unwrap();
        assert_eq!(
            bulk.begin(&mut ctx, buffer.peek_write_slot(1), 16),
            Err(TransportError::Busy)
        );
        bulk.abort(&mut ctx);
        assert_eq!(bulk.counter().snapshot().aborted, 1);
    }

    #[test]
    fn test_i2c_loopback() {
        let mut control = SimulatedControl::new(FirmwareVersion::new(2, 1));
        let addressing = Addressing::new(0xC0, 0x05);
        control
            .write(ControlSetup::new(Command::I2cWrite, addressing), &[1, 2])
            .unwrap();

        let mut data = [0u8; 2];
        let n = control
            .read(ControlSetup::new(Command::I2cRead, addressing), &mut data)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(data, [1, 2]);
    }

    #[test]
    fn test_context_drop_counted() {
        let mut bulk = SimulatedBulk::new();
        let counter = bulk.counter();
        drop(bulk.create_context().unwrap());
        assert_eq!(counter.snapshot().contexts_released, 1);
    }
}
