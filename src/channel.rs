//! Module for the host-facing ports of the diagnostic stack
//!
//! The stack consumes three host facilities through this module:
//! * [CanTransmit] - a pure frame-send callback into the CAN driver
//! * [FrameQueue](frame_queue) - a bounded MPSC queue the driver feeds inbound frames into
//! * [Clock] - a monotonic millisecond clock with a cooperative sleep

use std::sync::mpsc;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error produced by a communication channel
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// The frame queue is full, the newest frame was dropped
    #[error("frame queue is full")]
    QueueFull,
    /// Timeout waiting for a frame
    #[error("timeout waiting for frame")]
    Timeout,
    /// The other end of the queue has been dropped
    #[error("frame queue disconnected")]
    Disconnected,
    /// The CAN driver rejected a transmit request
    #[error("CAN transmit failed: {0}")]
    SendFailed(String),
}

/// A classic CAN frame. Up to 8 payload bytes with an 11 or 29 bit identifier.
/// Only data frames travel through the stack, remote frames are ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl CanFrame {
    /// Creates a new CAN frame. Payloads longer than 8 bytes are truncated.
    pub fn new(id: u32, data: &[u8], is_ext: bool) -> Self {
        let dlc = data.len().min(8);
        let mut d = [0u8; 8];
        d[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: d,
            ext: is_ext,
        }
    }

    /// Returns the arbitration ID of the frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the payload of the frame
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Returns true if the frame uses a 29bit extended identifier
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

/// Frame-send callback into the CAN driver.
///
/// The stack invokes this only from its worker thread, so the driver
/// must accept serialized synchronous writes but needs no further locking.
pub trait CanTransmit: Send {
    /// Writes a single frame to the bus
    fn transmit(&mut self, frame: &CanFrame) -> ChannelResult<()>;
}

impl<F> CanTransmit for F
where
    F: FnMut(&CanFrame) -> ChannelResult<()> + Send,
{
    fn transmit(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        self(frame)
    }
}

/// Default capacity of a frame queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Creates a bounded frame queue pair.
///
/// The sender side may be cloned into driver callbacks or ISR shims; the
/// receiver side belongs to the single worker thread of an endpoint.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Producer half of the bounded frame queue
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: SyncSender<CanFrame>,
}

impl FrameSender {
    /// Enqueues a frame without blocking. When the queue is full the frame
    /// is dropped and [ChannelError::QueueFull] returned.
    pub fn send(&self, frame: CanFrame) -> ChannelResult<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(f)) => {
                log::warn!("RX frame queue full, dropping frame ID 0x{:03X}", f.id());
                Err(ChannelError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(ChannelError::Disconnected),
        }
    }
}

/// Consumer half of the bounded frame queue
#[derive(Debug)]
pub struct FrameReceiver {
    rx: Receiver<CanFrame>,
}

impl FrameReceiver {
    /// Dequeues the next frame, waiting up to `timeout_ms`. A timeout of 0
    /// polls the queue without blocking.
    pub fn recv(&self, timeout_ms: u32) -> ChannelResult<CanFrame> {
        if timeout_ms == 0 {
            return match self.rx.try_recv() {
                Ok(f) => Ok(f),
                Err(mpsc::TryRecvError::Empty) => Err(ChannelError::Timeout),
                Err(mpsc::TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
            };
        }
        match self
            .rx
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
        {
            Ok(f) => Ok(f),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ChannelError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

/// Monotonic millisecond clock consumed by every timer in the stack.
///
/// `now_ms` must be non decreasing. Wraparound of the 32bit counter is
/// tolerated, deltas are always computed with wrapping subtraction.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u32;
    /// Cooperatively yields for at least the given duration
    fn sleep_ms(&self, ms: u32);
}

/// [Clock] implementation backed by [std::time::Instant]
#[derive(Debug)]
pub struct StdClock {
    epoch: Instant,
}

impl StdClock {
    /// Creates a clock with its epoch at the current instant
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Milliseconds elapsed from `since` to `now`, modulo the u32 range
pub(crate) fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_drops_newest_when_full() {
        let (tx, rx) = frame_queue(2);
        tx.send(CanFrame::new(0x7E0, &[1], false)).unwrap();
        tx.send(CanFrame::new(0x7E0, &[2], false)).unwrap();
        assert!(matches!(
            tx.send(CanFrame::new(0x7E0, &[3], false)),
            Err(ChannelError::QueueFull)
        ));
        assert_eq!(rx.recv(0).unwrap().data(), &[1]);
        assert_eq!(rx.recv(0).unwrap().data(), &[2]);
        assert!(matches!(rx.recv(0), Err(ChannelError::Timeout)));
    }

    #[test]
    fn elapsed_handles_wraparound() {
        assert_eq!(elapsed_ms(5, u32::MAX - 4), 10);
        assert_eq!(elapsed_ms(100, 40), 60);
    }

    #[test]
    fn frame_truncates_payload() {
        let f = CanFrame::new(0x123, &[0u8; 12], false);
        assert_eq!(f.data().len(), 8);
    }
}
