//! Binding of the physical and functional ISO-TP links of one endpoint

use crate::channel::{CanFrame, CanTransmit};

use super::{IsoTpError, IsoTpLink, IsoTpResult, IsoTpSettings, LinkStatus};

/// Which address pair an assembled PDU arrived on
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduOrigin {
    /// 1-to-1 physical addressing, multi frame capable
    Physical,
    /// Broadcast functional addressing, single frame only
    Functional,
}

/// The pair of ISO-TP links owned by one diagnostic endpoint.
///
/// Inbound 8 byte datagrams are routed to the owning link by CAN ID.
/// While a segmented receive is running on the physical link, inbound
/// functional frames are dropped rather than interleaved (ISO15765-2).
/// Outbound PDUs always leave on the physical pair, serialized through the
/// single CAN transmit callback.
pub struct IsoTpTransport {
    phys: IsoTpLink,
    func: IsoTpLink,
    /// Functional target may be absent on servers: responses are never
    /// emitted on the functional pair
    func_tx_enabled: bool,
    sink: Box<dyn CanTransmit>,
}

impl std::fmt::Debug for IsoTpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpTransport")
            .field("phys", &self.phys)
            .field("func", &self.func)
            .finish_non_exhaustive()
    }
}

impl IsoTpTransport {
    /// Creates the transport binding of an endpoint.
    ///
    /// ## Parameters
    /// * phys_rx_id / phys_tx_id - physical pair (listen / transmit)
    /// * func_rx_id - functional listen ID
    /// * func_tx_id - functional transmit ID, `None` on servers that never
    ///   answer functionally addressed requests
    /// * settings - link tuning, shared by both pairs
    /// * sink - the frame-send callback into the CAN driver
    pub fn new(
        phys_rx_id: u32,
        phys_tx_id: u32,
        func_rx_id: u32,
        func_tx_id: Option<u32>,
        settings: IsoTpSettings,
        sink: Box<dyn CanTransmit>,
    ) -> Self {
        Self {
            phys: IsoTpLink::new(phys_rx_id, phys_tx_id, false, settings),
            func: IsoTpLink::new(func_rx_id, func_tx_id.unwrap_or(0), false, settings),
            func_tx_enabled: func_tx_id.is_some(),
            sink,
        }
    }

    /// Routes one inbound CAN frame into the owning link and returns an
    /// assembled PDU once one completes. Frames with unrelated IDs are
    /// ignored silently.
    pub fn on_can_frame(&mut self, frame: &CanFrame, now: u32) -> Option<(PduOrigin, Vec<u8>)> {
        if frame.id() == self.phys.rx_id() {
            if let Err(e) = self.phys.on_frame(frame.data(), self.sink.as_mut(), now) {
                log::warn!("physical link error: {e}");
                return None;
            }
            return self.phys.take_pdu().map(|p| (PduOrigin::Physical, p));
        }
        if frame.id() == self.func.rx_id() {
            if self.phys.receiving() {
                // ISO15765-2: a functional request must not interleave with a
                // running physical segmented receive
                log::warn!("dropped functional frame, physical link is busy");
                return None;
            }
            let pci = frame.data().first().copied().unwrap_or(0xFF);
            if pci & 0xF0 != 0x00 {
                log::warn!("dropped non single-frame functional frame {:02X?}", frame.data());
                return None;
            }
            if let Err(e) = self.func.on_frame(frame.data(), self.sink.as_mut(), now) {
                log::warn!("functional link error: {e}");
                return None;
            }
            return self.func.take_pdu().map(|p| (PduOrigin::Functional, p));
        }
        log::debug!("ignoring unrelated CAN ID 0x{:03X}", frame.id());
        None
    }

    /// Sends a PDU on the physical pair
    pub fn send(&mut self, pdu: &[u8], now: u32) -> IsoTpResult<()> {
        self.phys.send(pdu, self.sink.as_mut(), now)
    }

    /// Sends a single-frame PDU on the functional pair (broadcast requests).
    /// Fails if the endpoint has no functional transmit address.
    pub fn send_functional(&mut self, pdu: &[u8], now: u32) -> IsoTpResult<()> {
        if !self.func_tx_enabled {
            return Err(IsoTpError::Channel(crate::channel::ChannelError::SendFailed(
                "no functional transmit address configured".into(),
            )));
        }
        if pdu.len() > 7 {
            return Err(IsoTpError::PduTooLarge {
                len: pdu.len(),
                max: 7,
            });
        }
        self.func.send(pdu, self.sink.as_mut(), now)
    }

    /// Drives the timers and CF pacing of both links
    pub fn poll(&mut self, now: u32) -> IsoTpResult<()> {
        self.phys.poll(self.sink.as_mut(), now)?;
        self.func.poll(self.sink.as_mut(), now)
    }

    /// True while a segmented send is in progress on either link.
    /// The worker busy-polls while this holds to keep CFs tight against STmin.
    pub fn sending_in_progress(&self) -> bool {
        self.phys.sending() || self.func.sending()
    }

    /// Union of both link states
    pub fn status(&self) -> LinkStatus {
        self.phys.status() | self.func.status()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelResult;
    use std::sync::{Arc, Mutex};

    fn collector() -> (Arc<Mutex<Vec<CanFrame>>>, Box<dyn CanTransmit>) {
        let log: Arc<Mutex<Vec<CanFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let log_c = log.clone();
        let sink = Box::new(move |f: &CanFrame| -> ChannelResult<()> {
            log_c.lock().unwrap().push(*f);
            Ok(())
        });
        (log, sink)
    }

    fn transport() -> (Arc<Mutex<Vec<CanFrame>>>, IsoTpTransport) {
        let (log, sink) = collector();
        let tp = IsoTpTransport::new(0x7E0, 0x7E8, 0x7DF, None, IsoTpSettings::default(), sink);
        (log, tp)
    }

    #[test]
    fn routes_by_can_id() {
        let (_log, mut tp) = transport();
        let r = tp.on_can_frame(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x03], false), 0);
        assert_eq!(r, Some((PduOrigin::Physical, vec![0x10, 0x03])));

        let r = tp.on_can_frame(&CanFrame::new(0x7DF, &[0x02, 0x3E, 0x80], false), 0);
        assert_eq!(r, Some((PduOrigin::Functional, vec![0x3E, 0x80])));

        // unrelated id
        assert_eq!(
            tp.on_can_frame(&CanFrame::new(0x123, &[0x02, 0x10, 0x01], false), 0),
            None
        );
    }

    #[test]
    fn functional_dropped_while_physical_receiving() {
        let (_log, mut tp) = transport();
        // Start a segmented physical receive
        assert!(tp
            .on_can_frame(&CanFrame::new(0x7E0, &[0x10, 0x0A, 1, 2, 3, 4, 5, 6], false), 0)
            .is_none());
        // Functional tester present arrives mid transfer: dropped
        assert!(tp
            .on_can_frame(&CanFrame::new(0x7DF, &[0x02, 0x3E, 0x80], false), 5)
            .is_none());
        // Physical transfer still completes normally
        let r = tp.on_can_frame(&CanFrame::new(0x7E0, &[0x21, 7, 8, 9, 10, 0, 0, 0], false), 6);
        assert_eq!(
            r,
            Some((PduOrigin::Physical, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]))
        );
        // And functional frames are accepted again afterwards
        assert!(tp
            .on_can_frame(&CanFrame::new(0x7DF, &[0x02, 0x3E, 0x80], false), 7)
            .is_some());
    }

    #[test]
    fn functional_multi_frame_is_rejected() {
        let (_log, mut tp) = transport();
        assert!(tp
            .on_can_frame(&CanFrame::new(0x7DF, &[0x10, 0x0A, 1, 2, 3, 4, 5, 6], false), 0)
            .is_none());
    }

    #[test]
    fn functional_send_requires_address() {
        let (_log, mut tp) = transport();
        assert!(tp.send_functional(&[0x3E, 0x80], 0).is_err());

        let (_log2, sink) = collector();
        let mut tp2 =
            IsoTpTransport::new(0x7E8, 0x7E0, 0x7DE, Some(0x7DF), IsoTpSettings::default(), sink);
        assert!(tp2.send_functional(&[0x3E, 0x80], 0).is_ok());
        assert!(tp2.send_functional(&[0u8; 8], 0).is_err());
    }
}
