//! Per address-pair ISO-TP state machines

use crate::channel::{elapsed_ms, CanFrame, CanTransmit};

use super::{IsoTpError, IsoTpResult, IsoTpSettings, LinkStatus, ISO_TP_MAX_PDU};

// PCI nibble values (high nibble of byte 0)
const PCI_SINGLE_FRAME: u8 = 0x00;
const PCI_FIRST_FRAME: u8 = 0x10;
const PCI_CONSECUTIVE_FRAME: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

// Flow status values (low nibble of a flow control PCI byte)
const FC_STATUS_CTS: u8 = 0x00;
const FC_STATUS_WAIT: u8 = 0x01;
const FC_STATUS_OVERFLOW: u8 = 0x02;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TxPhase {
    Idle,
    /// First frame sent, waiting for the peer's flow control
    WaitFlowControl,
    /// Flow control received, consecutive frames are being paced out
    SendingConsecutive,
}

#[derive(Debug)]
struct TxState {
    phase: TxPhase,
    buf: Vec<u8>,
    offset: usize,
    sn: u8,
    /// CFs left before the next flow control, `None` when BS = 0
    block_remaining: Option<u8>,
    /// Minimum gap between CFs in ms (sub-millisecond STmin rounds to 0)
    gap_ms: u32,
    last_cf_at: u32,
    fc_deadline: u32,
}

impl TxState {
    fn idle() -> Self {
        Self {
            phase: TxPhase::Idle,
            buf: Vec::new(),
            offset: 0,
            sn: 0,
            block_remaining: None,
            gap_ms: 0,
            last_cf_at: 0,
            fc_deadline: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RxPhase {
    Idle,
    InProgress,
}

#[derive(Debug)]
struct RxState {
    phase: RxPhase,
    buf: Vec<u8>,
    expected_len: usize,
    sn_expected: u8,
    /// CFs still accepted before we owe the peer another flow control
    block_remaining: u8,
    cf_deadline: u32,
}

impl RxState {
    fn idle() -> Self {
        Self {
            phase: RxPhase::Idle,
            buf: Vec::new(),
            expected_len: 0,
            sn_expected: 0,
            block_remaining: 0,
            cf_deadline: 0,
        }
    }
}

/// A single ISO-TP link bound to one address pair.
///
/// The link listens on `rx_id` and transmits on `tx_id`. At most one send
/// and one receive may be in progress at any instant; a send attempted
/// while another is running fails with [IsoTpError::Busy] without touching
/// the running transfer.
#[derive(Debug)]
pub struct IsoTpLink {
    rx_id: u32,
    tx_id: u32,
    ext_can: bool,
    cfg: IsoTpSettings,
    tx: TxState,
    rx: RxState,
    completed: Option<Vec<u8>>,
    errored: bool,
}

impl IsoTpLink {
    /// Creates a link listening on `rx_id` and transmitting on `tx_id`
    pub fn new(rx_id: u32, tx_id: u32, ext_can: bool, cfg: IsoTpSettings) -> Self {
        Self {
            rx_id,
            tx_id,
            ext_can,
            cfg,
            tx: TxState::idle(),
            rx: RxState::idle(),
            completed: None,
            errored: false,
        }
    }

    /// CAN ID this link listens on
    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    /// Current state of both machines as a bit set
    pub fn status(&self) -> LinkStatus {
        let mut s = LinkStatus::empty();
        if self.tx.phase != TxPhase::Idle {
            s |= LinkStatus::SENDING;
        }
        if self.rx.phase != RxPhase::Idle {
            s |= LinkStatus::RECEIVING;
        }
        if s.is_empty() {
            s |= LinkStatus::IDLE;
        }
        if self.errored {
            s |= LinkStatus::ERROR;
        }
        s
    }

    /// True while a segmented send is in progress
    pub fn sending(&self) -> bool {
        self.tx.phase != TxPhase::Idle
    }

    /// True while a segmented receive is in progress
    pub fn receiving(&self) -> bool {
        self.rx.phase != RxPhase::Idle
    }

    /// Takes the most recently assembled PDU off the link
    pub fn take_pdu(&mut self) -> Option<Vec<u8>> {
        self.completed.take()
    }

    /// Queues a PDU for transmission.
    ///
    /// PDUs of up to 7 bytes leave as a single frame immediately; larger
    /// ones start a segmented transfer driven by [IsoTpLink::poll].
    pub fn send(
        &mut self,
        pdu: &[u8],
        sink: &mut dyn CanTransmit,
        now: u32,
    ) -> IsoTpResult<()> {
        if self.tx.phase != TxPhase::Idle {
            return Err(IsoTpError::Busy);
        }
        let max = (self.cfg.mtu as usize).min(ISO_TP_MAX_PDU);
        if pdu.is_empty() || pdu.len() > max {
            return Err(IsoTpError::PduTooLarge {
                len: pdu.len(),
                max,
            });
        }
        self.errored = false;
        if pdu.len() <= 7 {
            let mut data = [0u8; 8];
            data[0] = PCI_SINGLE_FRAME | pdu.len() as u8;
            data[1..=pdu.len()].copy_from_slice(pdu);
            return self.emit(sink, &data, pdu.len() + 1);
        }
        // First frame: 12bit length + 6 payload bytes
        let mut data = [0u8; 8];
        data[0] = PCI_FIRST_FRAME | ((pdu.len() >> 8) & 0x0F) as u8;
        data[1] = (pdu.len() & 0xFF) as u8;
        data[2..8].copy_from_slice(&pdu[..6]);
        self.emit(sink, &data, 8)?;
        self.tx = TxState {
            phase: TxPhase::WaitFlowControl,
            buf: pdu.to_vec(),
            offset: 6,
            sn: 1,
            block_remaining: None,
            gap_ms: 0,
            last_cf_at: now,
            fc_deadline: now.wrapping_add(self.cfg.n_bs_ms),
        };
        Ok(())
    }

    /// Feeds one inbound CAN payload into the link
    pub fn on_frame(
        &mut self,
        data: &[u8],
        sink: &mut dyn CanTransmit,
        now: u32,
    ) -> IsoTpResult<()> {
        let pci = *data.first().ok_or(IsoTpError::InvalidFrame)?;
        match pci & 0xF0 {
            PCI_SINGLE_FRAME => self.on_single_frame(pci, data),
            PCI_FIRST_FRAME => self.on_first_frame(pci, data, sink, now),
            PCI_CONSECUTIVE_FRAME => self.on_consecutive_frame(pci, data, sink, now),
            PCI_FLOW_CONTROL => self.on_flow_control(pci, data, sink, now),
            _ => {
                log::warn!("invalid PCI nibble in frame {data:02X?}");
                Err(IsoTpError::InvalidFrame)
            }
        }
    }

    /// Drives the link timers and the CF pacing. Must be called with a
    /// cadence no coarser than the smallest configured timer.
    pub fn poll(&mut self, sink: &mut dyn CanTransmit, now: u32) -> IsoTpResult<()> {
        // Receiver: N_Cr expiry aborts the assembly
        if self.rx.phase == RxPhase::InProgress && deadline_passed(now, self.rx.cf_deadline) {
            log::warn!("N_Cr timeout, aborting receive on 0x{:03X}", self.rx_id);
            self.rx = RxState::idle();
            self.errored = true;
            return Err(IsoTpError::NCrTimeout);
        }
        match self.tx.phase {
            TxPhase::Idle => Ok(()),
            TxPhase::WaitFlowControl => {
                if deadline_passed(now, self.tx.fc_deadline) {
                    log::warn!("N_Bs timeout, aborting send on 0x{:03X}", self.tx_id);
                    self.tx = TxState::idle();
                    self.errored = true;
                    return Err(IsoTpError::NBsTimeout);
                }
                Ok(())
            }
            TxPhase::SendingConsecutive => self.pump_consecutive(sink, now),
        }
    }

    fn on_single_frame(&mut self, pci: u8, data: &[u8]) -> IsoTpResult<()> {
        let len = (pci & 0x0F) as usize;
        if len == 0 || len > 7 || data.len() < len + 1 {
            return Err(IsoTpError::InvalidFrame);
        }
        if self.rx.phase == RxPhase::InProgress {
            // A new transmission aborts the running assembly
            log::warn!("single frame interrupted a segmented receive, dropping assembly");
            self.rx = RxState::idle();
        }
        if self.completed.is_some() {
            log::warn!("overwriting unread PDU on 0x{:03X}", self.rx_id);
        }
        self.completed = Some(data[1..=len].to_vec());
        Ok(())
    }

    fn on_first_frame(
        &mut self,
        pci: u8,
        data: &[u8],
        sink: &mut dyn CanTransmit,
        now: u32,
    ) -> IsoTpResult<()> {
        if data.len() < 8 {
            return Err(IsoTpError::InvalidFrame);
        }
        let total = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
        if total <= 7 {
            return Err(IsoTpError::InvalidFrame);
        }
        if total > self.cfg.mtu as usize {
            // Announce we cannot take it and stay idle
            log::warn!("first frame announces {total} bytes, over MTU - sending overflow FC");
            self.send_flow_control(sink, FC_STATUS_OVERFLOW)?;
            return Err(IsoTpError::Overflow);
        }
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&data[2..8]);
        self.rx = RxState {
            phase: RxPhase::InProgress,
            buf,
            expected_len: total,
            sn_expected: 1,
            block_remaining: self.cfg.block_size,
            cf_deadline: now.wrapping_add(self.cfg.n_cr_ms),
        };
        self.send_flow_control(sink, FC_STATUS_CTS)
    }

    fn on_consecutive_frame(
        &mut self,
        pci: u8,
        data: &[u8],
        sink: &mut dyn CanTransmit,
        now: u32,
    ) -> IsoTpResult<()> {
        if self.rx.phase != RxPhase::InProgress {
            log::warn!("unexpected consecutive frame on 0x{:03X}, ignoring", self.rx_id);
            return Ok(());
        }
        let sn = pci & 0x0F;
        if sn != self.rx.sn_expected {
            let expected = self.rx.sn_expected;
            self.rx = RxState::idle();
            self.errored = true;
            return Err(IsoTpError::SequenceError { expected, got: sn });
        }
        let remaining = self.rx.expected_len - self.rx.buf.len();
        let take = remaining.min(data.len() - 1).min(7);
        self.rx.buf.extend_from_slice(&data[1..1 + take]);
        self.rx.sn_expected = (self.rx.sn_expected + 1) & 0x0F;
        self.rx.cf_deadline = now.wrapping_add(self.cfg.n_cr_ms);

        if self.rx.buf.len() >= self.rx.expected_len {
            if self.completed.is_some() {
                log::warn!("overwriting unread PDU on 0x{:03X}", self.rx_id);
            }
            self.completed = Some(std::mem::take(&mut self.rx.buf));
            self.rx = RxState::idle();
            return Ok(());
        }
        if self.cfg.block_size > 0 {
            self.rx.block_remaining -= 1;
            if self.rx.block_remaining == 0 {
                self.rx.block_remaining = self.cfg.block_size;
                self.send_flow_control(sink, FC_STATUS_CTS)?;
            }
        }
        Ok(())
    }

    fn on_flow_control(
        &mut self,
        pci: u8,
        data: &[u8],
        sink: &mut dyn CanTransmit,
        now: u32,
    ) -> IsoTpResult<()> {
        if self.tx.phase != TxPhase::WaitFlowControl {
            log::debug!("flow control outside a send, ignoring");
            return Ok(());
        }
        match pci & 0x0F {
            FC_STATUS_CTS => {
                if data.len() < 3 {
                    return Err(IsoTpError::InvalidFrame);
                }
                let bs = data[1];
                let st_min = data[2];
                self.tx.block_remaining = if bs == 0 { None } else { Some(bs) };
                self.tx.gap_ms = IsoTpSettings::st_min_micros(st_min) / 1000;
                self.tx.phase = TxPhase::SendingConsecutive;
                // First CF may leave immediately
                self.tx.last_cf_at = now.wrapping_sub(self.tx.gap_ms);
                self.pump_consecutive(sink, now)
            }
            FC_STATUS_WAIT => {
                self.tx.fc_deadline = now.wrapping_add(self.cfg.n_bs_ms);
                Ok(())
            }
            FC_STATUS_OVERFLOW => {
                self.tx = TxState::idle();
                self.errored = true;
                Err(IsoTpError::Overflow)
            }
            _ => {
                self.tx = TxState::idle();
                self.errored = true;
                Err(IsoTpError::InvalidFrame)
            }
        }
    }

    /// Emits consecutive frames until the block or STmin gate closes
    fn pump_consecutive(&mut self, sink: &mut dyn CanTransmit, now: u32) -> IsoTpResult<()> {
        while self.tx.phase == TxPhase::SendingConsecutive {
            if self.tx.gap_ms > 0 && elapsed_ms(now, self.tx.last_cf_at) < self.tx.gap_ms {
                return Ok(());
            }
            let remaining = self.tx.buf.len() - self.tx.offset;
            let take = remaining.min(7);
            let mut data = [0u8; 8];
            data[0] = PCI_CONSECUTIVE_FRAME | self.tx.sn;
            data[1..1 + take].copy_from_slice(&self.tx.buf[self.tx.offset..self.tx.offset + take]);
            self.emit_owned_cf(sink, data, take + 1)?;
            self.tx.offset += take;
            self.tx.sn = (self.tx.sn + 1) & 0x0F;
            self.tx.last_cf_at = now;

            if self.tx.offset >= self.tx.buf.len() {
                self.tx = TxState::idle();
                return Ok(());
            }
            if let Some(left) = self.tx.block_remaining {
                let left = left - 1;
                if left == 0 {
                    self.tx.phase = TxPhase::WaitFlowControl;
                    self.tx.fc_deadline = now.wrapping_add(self.cfg.n_bs_ms);
                    return Ok(());
                }
                self.tx.block_remaining = Some(left);
            }
            if self.tx.gap_ms > 0 {
                // Gate closes until the next poll tick
                return Ok(());
            }
        }
        Ok(())
    }

    fn send_flow_control(&mut self, sink: &mut dyn CanTransmit, status: u8) -> IsoTpResult<()> {
        let data = [
            PCI_FLOW_CONTROL | status,
            self.cfg.block_size,
            self.cfg.st_min,
        ];
        let mut padded = [0u8; 8];
        padded[..3].copy_from_slice(&data);
        self.emit(sink, &padded, 3)
    }

    fn emit(&mut self, sink: &mut dyn CanTransmit, data: &[u8; 8], used: usize) -> IsoTpResult<()> {
        let frame = self.build_frame(data, used);
        sink.transmit(&frame).map_err(|e| {
            self.errored = true;
            IsoTpError::Channel(e)
        })
    }

    fn emit_owned_cf(
        &mut self,
        sink: &mut dyn CanTransmit,
        data: [u8; 8],
        used: usize,
    ) -> IsoTpResult<()> {
        let frame = self.build_frame(&data, used);
        sink.transmit(&frame).map_err(|e| {
            // A failed CF aborts the whole transfer
            self.tx = TxState::idle();
            self.errored = true;
            IsoTpError::Channel(e)
        })
    }

    fn build_frame(&self, data: &[u8; 8], used: usize) -> CanFrame {
        if self.cfg.pad_frame {
            let mut padded = [self.cfg.pad_byte; 8];
            padded[..used].copy_from_slice(&data[..used]);
            CanFrame::new(self.tx_id, &padded, self.ext_can)
        } else {
            CanFrame::new(self.tx_id, &data[..used], self.ext_can)
        }
    }
}

/// Wrapping "deadline reached" comparison on the 32bit millisecond clock
fn deadline_passed(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{CanFrame, ChannelResult};

    /// Sink that records every transmitted frame
    struct FrameLog(Vec<CanFrame>);

    impl CanTransmit for FrameLog {
        fn transmit(&mut self, frame: &CanFrame) -> ChannelResult<()> {
            self.0.push(*frame);
            Ok(())
        }
    }

    fn link() -> IsoTpLink {
        IsoTpLink::new(0x7E0, 0x7E8, false, IsoTpSettings::default())
    }

    #[test]
    fn single_frame_send_is_padded() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&[0x3E, 0x00], &mut sink, 0).unwrap();
        assert_eq!(sink.0.len(), 1);
        assert_eq!(
            sink.0[0].data(),
            &[0x02, 0x3E, 0x00, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert!(l.status().contains(LinkStatus::IDLE));
    }

    #[test]
    fn seven_bytes_is_the_single_frame_limit() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&[0u8; 7], &mut sink, 0).unwrap();
        assert_eq!(sink.0[0].data()[0], 0x07);

        l.send(&[0u8; 8], &mut sink, 0).unwrap();
        // 8 bytes must leave as a first frame
        assert_eq!(sink.0[1].data()[0], 0x10);
        assert_eq!(sink.0[1].data()[1], 0x08);
    }

    #[test]
    fn send_rejected_while_busy_without_state_change() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&[0u8; 20], &mut sink, 0).unwrap();
        assert!(l.sending());
        let frames_before = sink.0.len();
        assert!(matches!(
            l.send(&[1, 2, 3], &mut sink, 1),
            Err(IsoTpError::Busy)
        ));
        assert_eq!(sink.0.len(), frames_before);
        assert!(l.sending());
    }

    #[test]
    fn segmented_send_honours_block_size() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        let pdu: Vec<u8> = (0..40u8).collect();
        l.send(&pdu, &mut sink, 0).unwrap();
        assert_eq!(sink.0.len(), 1); // FF only

        // FC CTS with BS=2, STmin=0
        l.on_frame(&[0x30, 0x02, 0x00], &mut sink, 1).unwrap();
        // 2 CFs then pause for the next FC
        assert_eq!(sink.0.len(), 3);
        assert_eq!(sink.0[1].data()[0], 0x21);
        assert_eq!(sink.0[2].data()[0], 0x22);
        assert!(l.sending());

        l.on_frame(&[0x30, 0x00, 0x00], &mut sink, 2).unwrap();
        // BS=0: everything else back to back
        assert_eq!(sink.0.len(), 6);
        assert_eq!(sink.0[5].data()[0], 0x25);
        assert!(!l.sending());

        // Reassemble and compare
        let mut out = sink.0[0].data()[2..8].to_vec();
        for f in &sink.0[1..] {
            out.extend_from_slice(&f.data()[1..]);
        }
        out.truncate(40);
        assert_eq!(out, pdu);
    }

    #[test]
    fn st_min_paces_consecutive_frames() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&(0..30u8).collect::<Vec<u8>>(), &mut sink, 0).unwrap();
        l.on_frame(&[0x30, 0x00, 0x05], &mut sink, 0).unwrap();
        // First CF leaves with the FC, the rest wait on the 5ms gap
        assert_eq!(sink.0.len(), 2);
        l.poll(&mut sink, 3).unwrap();
        assert_eq!(sink.0.len(), 2);
        l.poll(&mut sink, 5).unwrap();
        assert_eq!(sink.0.len(), 3);
        l.poll(&mut sink, 10).unwrap();
        assert_eq!(sink.0.len(), 4);
    }

    #[test]
    fn receive_single_frame() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.on_frame(&[0x03, 0x22, 0xF1, 0x90, 0xCC, 0xCC, 0xCC, 0xCC], &mut sink, 0)
            .unwrap();
        assert_eq!(l.take_pdu().unwrap(), vec![0x22, 0xF1, 0x90]);
        assert!(l.take_pdu().is_none());
    }

    #[test]
    fn receive_multi_frame_emits_flow_control() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        // 10 byte transfer
        l.on_frame(&[0x10, 0x0A, 1, 2, 3, 4, 5, 6], &mut sink, 0).unwrap();
        assert!(l.receiving());
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].data()[0], 0x30); // FC CTS
        assert_eq!(sink.0[0].data()[1], 8); // our BS
        assert_eq!(sink.0[0].data()[2], 20); // our STmin

        l.on_frame(&[0x21, 7, 8, 9, 10, 0, 0, 0], &mut sink, 1).unwrap();
        assert_eq!(l.take_pdu().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(!l.receiving());
    }

    #[test]
    fn sequence_error_aborts_without_posting_pdu() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.on_frame(&[0x10, 0x14, 1, 2, 3, 4, 5, 6], &mut sink, 0).unwrap();
        let r = l.on_frame(&[0x22, 7, 8, 9, 10, 11, 12, 13], &mut sink, 1);
        assert!(matches!(
            r,
            Err(IsoTpError::SequenceError { expected: 1, got: 2 })
        ));
        assert!(l.take_pdu().is_none());
        assert!(!l.receiving());
        assert!(l.status().contains(LinkStatus::ERROR));
    }

    #[test]
    fn sequence_numbers_wrap_at_16() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        // 130 bytes: FF(6) + 18 CFs
        let total = 130usize;
        let mut ff = vec![0x10 | ((total >> 8) as u8), (total & 0xFF) as u8];
        ff.extend_from_slice(&[0u8; 6]);
        l.on_frame(&ff, &mut sink, 0).unwrap();
        let mut sn = 1u8;
        let mut fed = 6;
        while fed < total {
            let mut cf = vec![0x20 | sn];
            cf.extend_from_slice(&[0u8; 7]);
            l.on_frame(&cf, &mut sink, 1).unwrap();
            sn = (sn + 1) & 0x0F;
            fed += 7;
        }
        assert_eq!(l.take_pdu().unwrap().len(), total);
    }

    #[test]
    fn n_bs_timeout_aborts_send() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&[0u8; 20], &mut sink, 0).unwrap();
        assert!(l.poll(&mut sink, 999).is_ok());
        assert!(matches!(l.poll(&mut sink, 1001), Err(IsoTpError::NBsTimeout)));
        assert!(!l.sending());
    }

    #[test]
    fn n_cr_timeout_aborts_receive() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.on_frame(&[0x10, 0x14, 1, 2, 3, 4, 5, 6], &mut sink, 0).unwrap();
        assert!(matches!(l.poll(&mut sink, 1500), Err(IsoTpError::NCrTimeout)));
        assert!(!l.receiving());
        assert!(l.take_pdu().is_none());
    }

    #[test]
    fn fc_wait_extends_n_bs() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&[0u8; 20], &mut sink, 0).unwrap();
        l.on_frame(&[0x31, 0x00, 0x00], &mut sink, 900).unwrap();
        // deadline moved to 1900
        assert!(l.poll(&mut sink, 1500).is_ok());
        assert!(l.sending());
        assert!(matches!(l.poll(&mut sink, 1901), Err(IsoTpError::NBsTimeout)));
    }

    #[test]
    fn fc_overflow_aborts_send() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        l.send(&[0u8; 20], &mut sink, 0).unwrap();
        assert!(matches!(
            l.on_frame(&[0x32, 0x00, 0x00], &mut sink, 1),
            Err(IsoTpError::Overflow)
        ));
        assert!(!l.sending());
    }

    #[test]
    fn oversized_first_frame_answered_with_overflow_fc() {
        let mut cfg = IsoTpSettings::default();
        cfg.mtu = 64;
        let mut l = IsoTpLink::new(0x7E0, 0x7E8, false, cfg);
        let mut sink = FrameLog(Vec::new());
        let r = l.on_frame(&[0x10, 0x80, 1, 2, 3, 4, 5, 6], &mut sink, 0);
        assert!(matches!(r, Err(IsoTpError::Overflow)));
        assert_eq!(sink.0[0].data()[0], 0x32);
        assert!(!l.receiving());
    }

    #[test]
    fn max_pdu_is_4095() {
        let mut l = link();
        let mut sink = FrameLog(Vec::new());
        assert!(matches!(
            l.send(&vec![0u8; 4096], &mut sink, 0),
            Err(IsoTpError::PduTooLarge { .. })
        ));
        assert!(l.send(&vec![0u8; 4095], &mut sink, 0).is_ok());
    }
}
