//! Simulation facilities for unit testing diagnostic endpoints without
//! hardware: an in-memory CAN bus pair and a manually advanced clock.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::channel::{
    frame_queue, CanFrame, CanTransmit, ChannelResult, Clock, FrameReceiver, FrameSender,
};

/// One end of a simulated CAN bus: a transmit callback wired to the peer's
/// frame queue, plus the receive queue fed by the peer.
#[derive(Debug)]
pub struct SimCanEnd {
    name: &'static str,
    to_peer: FrameSender,
    /// Frames the peer transmitted to this end
    pub rx: FrameReceiver,
}

impl SimCanEnd {
    /// Splits this end into its transmit sink and receive queue
    pub fn split(self) -> (SimCanTx, FrameReceiver) {
        (
            SimCanTx {
                name: self.name,
                to_peer: self.to_peer,
            },
            self.rx,
        )
    }
}

/// Transmit half of a [SimCanEnd]
#[derive(Debug, Clone)]
pub struct SimCanTx {
    name: &'static str,
    to_peer: FrameSender,
}

impl CanTransmit for SimCanTx {
    fn transmit(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        log::debug!("{} Out -> 0x{:03X} {:02X?}", self.name, frame.id(), frame.data());
        self.to_peer.send(*frame)
    }
}

/// Creates both ends of a simulated CAN bus. Everything transmitted on one
/// end shows up in the other end's receive queue.
pub fn sim_can_pair(capacity: usize) -> (SimCanEnd, SimCanEnd) {
    let (a_tx, a_rx) = frame_queue(capacity);
    let (b_tx, b_rx) = frame_queue(capacity);
    (
        SimCanEnd {
            name: "Tester",
            to_peer: b_tx,
            rx: a_rx,
        },
        SimCanEnd {
            name: "ECU",
            to_peer: a_tx,
            rx: b_rx,
        },
    )
}

/// Manually advanced [Clock] for deterministic timer tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    /// Creates a clock starting at 0 ms
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward
    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Sets the absolute time
    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u32) {
        // Time only moves when the test advances it
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pair_crosses_frames_over() {
        let (tester, ecu) = sim_can_pair(8);
        let (mut tester_tx, _tester_rx) = tester.split();
        let (_ecu_tx, ecu_rx) = ecu.split();
        tester_tx
            .transmit(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x03], false))
            .unwrap();
        let f = ecu_rx.recv(0).unwrap();
        assert_eq!(f.id(), 0x7E0);
        assert_eq!(f.data(), &[0x02, 0x10, 0x03]);
    }

    #[test]
    fn manual_clock_advances() {
        let c = ManualClock::new();
        assert_eq!(c.now_ms(), 0);
        c.advance(100);
        assert_eq!(c.now_ms(), 100);
        c.set(5);
        assert_eq!(c.now_ms(), 5);
    }
}
