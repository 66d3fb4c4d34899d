//! USB transfer execution
//!
//! Control and bulk transfers on an opened FX3 using nusb, with nusb errors
//! mapped to [`TransportError`].
//!
//! [`UsbBulk`] queues every transfer on the endpoint as soon as it is begun,
//! so all `K` transfers of the pipeline are pending in the kernel at once.
//! The endpoint returns completions in submission order; each one is matched
//! to its context by sequence number.

use crate::error::TransportError;
use crate::transport::{BulkEndpoint, ControlChannel, WaitStatus};
use common::Block;
use nusb::transfer::{
    Bulk, Completion, ControlIn, ControlOut, ControlType, In, Recipient, TransferError,
};
use nusb::{Endpoint, Interface, MaybeFuture};
use protocol::ControlSetup;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default timeout for control transfers (5 seconds)
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for cancelled transfers to come back
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Vendor request channel on endpoint 0
pub struct UsbControl {
    interface: Interface,
}

impl UsbControl {
    pub(crate) fn new(interface: Interface) -> Self {
        Self { interface }
    }
}

impl ControlChannel for UsbControl {
    fn write(&mut self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: setup.command.code(),
                    value: setup.addressing.value,
                    index: setup.addressing.index,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn read(&mut self, setup: ControlSetup, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let length = u16::try_from(buffer.len()).map_err(|_| TransportError::Overflow)?;
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: setup.command.code(),
                    value: setup.addressing.value,
                    index: setup.addressing.index,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(map_transfer_error)?;

        let received = data.len().min(buffer.len());
        buffer[..received].copy_from_slice(&data[..received]);
        Ok(received)
    }
}

/// Matches in-order completions to the transfers that produced them
///
/// Sequence numbers are handed out at submission. Completions arrive in the
/// same order, so the `n`-th completion belongs to sequence `n`.
#[derive(Debug)]
struct CompletionOrder<T> {
    submitted: u64,
    completed: u64,
    /// Sequences below this were cancelled and will never be delivered
    cancelled_before: u64,
    /// Completions for transfers nobody has waited on yet
    early: VecDeque<(u64, T)>,
}

impl<T> CompletionOrder<T> {
    fn new() -> Self {
        Self {
            submitted: 0,
            completed: 0,
            cancelled_before: 0,
            early: VecDeque::new(),
        }
    }

    /// Sequence number for the next submission
    fn submit(&mut self) -> u64 {
        let sequence = self.submitted;
        self.submitted += 1;
        sequence
    }

    fn is_cancelled(&self, sequence: u64) -> bool {
        sequence < self.cancelled_before
    }

    /// Completion for `sequence` that has already arrived
    fn take(&mut self, sequence: u64) -> Option<T> {
        let position = self.early.iter().position(|(s, _)| *s == sequence)?;
        self.early.remove(position).map(|(_, completion)| completion)
    }

    /// Record the next completion from the endpoint
    ///
    /// Returns it directly when it belongs to `waiting`, otherwise keeps it.
    fn arrived(&mut self, waiting: u64, completion: T) -> Option<T> {
        let sequence = self.completed;
        self.completed += 1;
        if sequence == waiting {
            Some(completion)
        } else {
            self.early.push_back((sequence, completion));
            None
        }
    }

    /// Forget everything in flight
    fn cancel(&mut self) {
        self.cancelled_before = self.submitted;
        self.completed = self.submitted;
        self.early.clear();
    }
}

/// Transfer context of [`UsbBulk`]
#[derive(Default)]
pub struct UsbTransfer {
    sequence: Option<u64>,
    target: Option<(Block<u8>, usize)>,
    completion: Option<Completion>,
}

/// Bulk IN endpoint carrying the sample stream
pub struct UsbBulk {
    endpoint: Endpoint<Bulk, In>,
    address: u8,
    order: CompletionOrder<Completion>,
}

impl UsbBulk {
    pub(crate) fn new(endpoint: Endpoint<Bulk, In>, address: u8) -> Self {
        Self {
            endpoint,
            address,
            order: CompletionOrder::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Transfers queued on the endpoint and not yet collected
    pub fn pending(&self) -> usize {
        self.endpoint.pending()
    }
}

impl BulkEndpoint for UsbBulk {
    type Context = UsbTransfer;

    fn create_context(&mut self) -> Result<Self::Context, TransportError> {
        Ok(UsbTransfer::default())
    }

    fn begin(
        &mut self,
        context: &mut Self::Context,
        target: Block<u8>,
        len: usize,
    ) -> Result<(), TransportError> {
        if context.sequence.is_some() {
            return Err(TransportError::Busy);
        }
        if len > target.len() {
            return Err(TransportError::Overflow);
        }

        let buffer = self.endpoint.allocate(len);
        self.endpoint.submit(buffer);

        let sequence = self.order.submit();
        trace!(
            "Queued bulk transfer {} of {} bytes on {:#04x}",
            sequence, len, self.address
        );
        context.sequence = Some(sequence);
        context.target = Some((target, len));
        context.completion = None;
        Ok(())
    }

    fn wait(
        &mut self,
        context: &mut Self::Context,
        timeout: Duration,
    ) -> Result<WaitStatus, TransportError> {
        if context.completion.is_some() {
            return Ok(WaitStatus::Ready);
        }
        let Some(sequence) = context.sequence else {
            return Err(TransportError::Other("no transfer pending".to_string()));
        };
        if self.order.is_cancelled(sequence) {
            return Err(TransportError::Other("transfer was cancelled".to_string()));
        }
        if let Some(completion) = self.order.take(sequence) {
            context.completion = Some(completion);
            return Ok(WaitStatus::Ready);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(completion) = self.endpoint.wait_next_complete(remaining) else {
                return Ok(WaitStatus::TimedOut);
            };
            if let Some(completion) = self.order.arrived(sequence, completion) {
                context.completion = Some(completion);
                return Ok(WaitStatus::Ready);
            }
        }
    }

    fn finish(&mut self, context: &mut Self::Context) -> Result<usize, TransportError> {
        context.sequence = None;
        let completion = context
            .completion
            .take()
            .ok_or_else(|| TransportError::Other("transfer not completed".to_string()))?;
        let (target, len) = context
            .target
            .take()
            .ok_or_else(|| TransportError::Other("transfer has no target".to_string()))?;

        if let Err(e) = &completion.status {
            debug!(
                "Bulk transfer on {:#04x} failed after {} bytes: {}",
                self.address, completion.actual_len, e
            );
            return Err(map_transfer_error(e.clone()));
        }

        let actual = completion.actual_len.min(len);
        target.lock()[..actual].copy_from_slice(&completion.buffer[..actual]);
        Ok(actual)
    }

    /// Cancel the transfer in flight
    ///
    /// The endpoint can only cancel everything it has queued, so every other
    /// outstanding context fails its next wait.
    fn abort(&mut self, context: &mut Self::Context) {
        context.target = None;
        context.completion = None;
        let Some(sequence) = context.sequence.take() else {
            return;
        };
        if self.order.is_cancelled(sequence) {
            return;
        }

        self.endpoint.cancel_all();
        while self.endpoint.pending() > 0 {
            match self.endpoint.wait_next_complete(CANCEL_DRAIN_TIMEOUT) {
                Some(completion) => trace!(
                    "Dropped cancelled transfer with {} bytes",
                    completion.actual_len
                ),
                None => {
                    warn!(
                        "{} cancelled transfers on {:#04x} did not return",
                        self.endpoint.pending(),
                        self.address
                    );
                    break;
                }
            }
        }
        self.order.cancel();
        debug!("Aborted bulk transfer {} on {:#04x}", sequence, self.address);
    }
}

/// Map nusb::transfer::TransferError to TransportError
pub fn map_transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Pipe,
        TransferError::Disconnected => TransportError::NoDevice,
        TransferError::Cancelled => TransportError::Other(err.to_string()),
        TransferError::Fault => TransportError::Io,
        _ => TransportError::Other(err.to_string()),
    }
}

/// Map nusb::Error to TransportError
pub fn map_usb_error(err: nusb::Error) -> TransportError {
    TransportError::Other(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_error() {
        assert_eq!(map_transfer_error(TransferError::Stall), TransportError::Pipe);
        assert_eq!(
            map_transfer_error(TransferError::Disconnected),
            TransportError::NoDevice
        );
        assert_eq!(map_transfer_error(TransferError::Fault), TransportError::Io);
        assert!(matches!(
            map_transfer_error(TransferError::Cancelled),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn test_completions_match_in_order() {
        let mut order = CompletionOrder::new();
        let first = order.submit();
        let second = order.submit();
        let third = order.submit();

        assert_eq!(order.arrived(first, "a"), Some("a"));
        assert_eq!(order.arrived(second, "b"), Some("b"));
        assert_eq!(order.arrived(third, "c"), Some("c"));
        assert!(order.early.is_empty());
    }

    #[test]
    fn test_completion_for_other_transfer_is_kept() {
        let mut order = CompletionOrder::new();
        let first = order.submit();
        let second = order.submit();

        // Waiting on the second transfer collects the first one on the way
        assert_eq!(order.arrived(second, "a"), None);
        assert_eq!(order.arrived(second, "b"), Some("b"));
        assert_eq!(order.take(first), Some("a"));
        assert_eq!(order.take(first), None);
    }

    #[test]
    fn test_cancel_marks_everything_in_flight() {
        let mut order = CompletionOrder::new();
        let first = order.submit();
        let second = order.submit();
        assert_eq!(order.arrived(second, "a"), None);

        order.cancel();
        assert!(order.is_cancelled(first));
        assert!(order.is_cancelled(second));
        assert!(order.early.is_empty());

        // Submissions after the cancel line up with new completions
        let third = order.submit();
        assert!(!order.is_cancelled(third));
        assert_eq!(order.arrived(third, "c"), Some("c"));
    }
}
