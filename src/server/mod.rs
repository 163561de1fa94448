//! UDS diagnostic server core
//!
//! The server decodes assembled request PDUs, gates them through the
//! communication-state filter and the per-service policy table, runs the
//! [dispatcher](EventDispatcher) chain, and encodes positive or negative
//! responses. It also owns the session machine (S3 timeout), the 0x78
//! response-pending pacing, the security-access delay timer and the
//! scheduled ECU reset.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{elapsed_ms, CanFrame, Clock};
use crate::isotp::{IsoTpTransport, PduOrigin};
use crate::protocol::{
    CommState, CommunicationControlType, CommunicationScope, FileModeOfOperation,
    IoControlParameter, Nrc, ResetType, RoutineControlType, ServiceId, SessionType,
    NEGATIVE_RESPONSE_SID, SUPPRESS_POS_RESP_BIT,
};

pub mod dispatcher;

pub mod comm_control;
pub mod data_by_ident;
pub mod endpoint;
pub mod file_transfer;
pub mod io_control;
pub mod reset;
pub mod routine;
pub mod security;
pub mod sessions;

use dispatcher::{
    CommCtrlArgs, DispatchOutcome, EcuResetArgs, EventData, EventDispatcher, FileRequestArgs,
    IoControlArgs, NodeId, ReadDataArgs, RequestSeedArgs, RoutineControlArgs, ServiceNode,
    SessionChangeArgs, TransferDataArgs, TransferExitArgs, ValidateKeyArgs, WriteDataArgs,
};

/// UDS server options
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerOptions {
    /// P2 server max in the default session, ms
    pub p2_ms_std: u16,
    /// P2* server max in the default session, ms
    pub p2_star_ms_std: u32,
    /// P2 server max in non-default sessions, ms
    pub p2_ms_ext: u16,
    /// P2* server max in non-default sessions, ms
    pub p2_star_ms_ext: u32,
    /// S3 session inactivity timeout, ms
    pub s3_ms: u32,
    /// Lockout applied to security access after an invalid key, ms
    pub security_delay_ms: u32,
    /// Consecutive 0x78 responses before the request is aborted with
    /// general-reject
    pub max_response_pending: u8,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            p2_ms_std: 50,
            p2_star_ms_std: 2000,
            p2_ms_ext: 5000,
            p2_star_ms_ext: 5000,
            s3_ms: 5000,
            security_delay_ms: 10_000,
            max_response_pending: 8,
        }
    }
}

/// Session / security acceptance rule for one service
#[derive(Debug, Clone)]
pub struct PolicyEntry {
    /// Session bytes the service is accepted in
    pub sessions: Vec<u8>,
    /// Minimum granted security level (even value), 0 = none required
    pub min_security_level: u8,
}

/// Per-service policy table consulted before dispatch.
///
/// Services without an entry are accepted in every session with no security
/// requirement.
#[derive(Debug, Clone, Default)]
pub struct ServicePolicy {
    entries: HashMap<u8, PolicyEntry>,
}

impl ServicePolicy {
    /// A policy that accepts every service everywhere
    pub fn permissive() -> Self {
        Self::default()
    }

    /// The standard UDS table: adjustment and transfer services are confined
    /// to non-default sessions.
    pub fn standard() -> Self {
        let mut p = Self::default();
        let non_default = vec![
            u8::from(SessionType::Programming),
            u8::from(SessionType::Extended),
            u8::from(SessionType::SafetySystem),
        ];
        for sid in [
            ServiceId::CommunicationControl,
            ServiceId::WriteDataByIdentifier,
            ServiceId::InputOutputControlByIdentifier,
            ServiceId::RoutineControl,
            ServiceId::TransferData,
            ServiceId::RequestTransferExit,
            ServiceId::RequestFileTransfer,
        ] {
            p.set(
                sid,
                PolicyEntry {
                    sessions: non_default.clone(),
                    min_security_level: 0,
                },
            );
        }
        p
    }

    /// Installs or replaces the rule for a service
    pub fn set(&mut self, sid: ServiceId, entry: PolicyEntry) {
        self.entries.insert(sid as u8, entry);
    }

    fn check(&self, sid: ServiceId, state: &ServerState) -> Option<Nrc> {
        let entry = self.entries.get(&(sid as u8))?;
        if !entry.sessions.contains(&u8::from(state.session_type)) {
            return Some(Nrc::ServiceNotSupportedInActiveSession);
        }
        if state.security_level < entry.min_security_level {
            return Some(Nrc::SecurityAccessDenied);
        }
        None
    }
}

/// Mutable session context handed to every handler
pub struct ServerState {
    pub(crate) clock: Arc<dyn Clock>,
    /// Active diagnostic session
    pub session_type: SessionType,
    /// Granted security level; 0 = locked, even values = granted level
    pub security_level: u8,
    /// Negotiated P2 server max of the active session, ms
    pub p2_ms: u16,
    /// Negotiated P2* server max of the active session, ms
    pub p2_star_ms: u32,
    /// Communication state of normal application messages
    pub comm_normal: CommState,
    /// Communication state of network management messages
    pub comm_nm: CommState,
    pub(crate) last_activity_ms: u32,
    pub(crate) scheduled_reset: Option<(ResetType, u32)>,
    pub(crate) security_inhibit_until: Option<u32>,
    pub(crate) options: ServerOptions,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("session_type", &self.session_type)
            .field("security_level", &self.security_level)
            .field("p2_ms", &self.p2_ms)
            .field("p2_star_ms", &self.p2_star_ms)
            .field("comm_normal", &self.comm_normal)
            .field("comm_nm", &self.comm_nm)
            .finish_non_exhaustive()
    }
}

impl ServerState {
    fn new(clock: Arc<dyn Clock>, options: ServerOptions) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            session_type: SessionType::Default,
            security_level: 0,
            p2_ms: options.p2_ms_std,
            p2_star_ms: options.p2_star_ms_std,
            comm_normal: CommState::EnableRxTx,
            comm_nm: CommState::EnableRxTx,
            last_activity_ms: now,
            scheduled_reset: None,
            security_inhibit_until: None,
            options,
        }
    }

    /// Monotonic milliseconds from the server clock
    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Server configuration
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// True when the application may receive normal messages
    pub fn app_rx_enabled(&self) -> bool {
        self.comm_normal.rx_enabled()
    }

    /// True when the application may transmit normal messages
    pub fn app_tx_enabled(&self) -> bool {
        self.comm_normal.tx_enabled()
    }

    /// True when network management reception is enabled
    pub fn nm_rx_enabled(&self) -> bool {
        self.comm_nm.rx_enabled()
    }

    /// True when network management transmission is enabled
    pub fn nm_tx_enabled(&self) -> bool {
        self.comm_nm.tx_enabled()
    }

    /// Applies a communication state to the scoped message group(s)
    pub fn apply_comm_state(&mut self, new_state: CommState, scope: CommunicationScope) {
        match scope {
            CommunicationScope::Normal => self.comm_normal = new_state,
            CommunicationScope::NetworkManagement => self.comm_nm = new_state,
            CommunicationScope::Both => {
                self.comm_normal = new_state;
                self.comm_nm = new_state;
            }
        }
        log::info!(
            "comm state updated: normal={:?} nm={:?}",
            self.comm_normal,
            self.comm_nm
        );
    }

    fn security_inhibited(&self, now: u32) -> bool {
        match self.security_inhibit_until {
            Some(until) => !deadline_reached(now, until),
            None => false,
        }
    }
}

/// Node tokens of one mounted service, used to unmount it again.
/// Unmounting removes every node the service registered.
#[derive(Debug)]
pub struct ServiceHandle {
    nodes: Vec<NodeId>,
}

impl ServiceHandle {
    pub(crate) fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }

    /// Removes all of this service's handler nodes from the dispatcher
    pub fn unmount(self, server: &mut UdsServer) {
        for id in self.nodes {
            server.unregister(id);
        }
    }
}

/// One decoded request, owned across dispatch so the response can be encoded
/// from what the handlers filled in
#[derive(Debug)]
enum DecodedRequest {
    SessionChange(SessionChangeArgs),
    EcuReset(EcuResetArgs),
    SecurityRequestSeed(RequestSeedArgs),
    SecurityValidateKey {
        args: ValidateKeyArgs,
        even_sub: u8,
    },
    CommunicationControl(CommCtrlArgs),
    ReadDataByIdent(ReadDataArgs),
    WriteDataByIdent(WriteDataArgs),
    IoControl(IoControlArgs),
    RoutineControl(RoutineControlArgs),
    RequestFileTransfer(FileRequestArgs),
    TransferData(TransferDataArgs),
    RequestTransferExit(TransferExitArgs),
    TesterPresent,
}

#[derive(Debug)]
struct PendingRequest {
    request: Vec<u8>,
    suppress: bool,
    origin: PduOrigin,
    pending_count: u8,
    next_pending_at: u32,
}

/// UDS diagnostic server bound to one ISO-TP transport.
///
/// The owner pumps inbound frames into [UdsServer::on_can_frame] and calls
/// [UdsServer::poll] with a cadence no coarser than the smallest protocol
/// timer (10 ms recommended). Both are expected to run on one worker thread;
/// no internal locking is performed.
pub struct UdsServer {
    transport: IsoTpTransport,
    state: ServerState,
    dispatcher: EventDispatcher,
    policy: ServicePolicy,
    pending: Option<PendingRequest>,
    max_block_ceiling: u16,
}

impl std::fmt::Debug for UdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsServer")
            .field("state", &self.state)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl UdsServer {
    /// Creates a server over an already configured transport binding
    pub fn new(options: ServerOptions, transport: IsoTpTransport, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            state: ServerState::new(clock, options),
            dispatcher: EventDispatcher::new(),
            policy: ServicePolicy::permissive(),
            pending: None,
            max_block_ceiling: crate::isotp::ISO_TP_MAX_PDU as u16 - 2,
        }
    }

    /// Replaces the per-service acceptance policy
    pub fn set_policy(&mut self, policy: ServicePolicy) {
        self.policy = policy;
    }

    /// Registers a service handler node
    pub fn register(&mut self, node: ServiceNode) -> NodeId {
        self.dispatcher.register(node)
    }

    /// Unregisters a single service handler node
    pub fn unregister(&mut self, id: NodeId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Unregisters every service handler node
    pub fn unregister_all(&mut self) {
        self.dispatcher.unregister_all()
    }

    /// Lists the registered handler chains for debugging
    pub fn dump_services(&self) -> String {
        self.dispatcher.dump()
    }

    /// Read access to the session context
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Mutable access to the session context (test setups, application hooks)
    pub fn state_mut(&mut self) -> &mut ServerState {
        &mut self.state
    }

    /// Feeds one inbound CAN frame through the transport into the server
    pub fn on_can_frame(&mut self, frame: &CanFrame) {
        let now = self.state.clock.now_ms();
        if let Some((origin, pdu)) = self.transport.on_can_frame(frame, now) {
            log::debug!("request PDU {pdu:02X?} ({origin:?})");
            self.process_pdu(origin, pdu, now);
        }
    }

    /// True while a segmented response send is in progress; the worker
    /// busy-polls while this holds
    pub fn sending_in_progress(&self) -> bool {
        self.transport.sending_in_progress()
    }

    /// Drives the P2/S3/response-pending/scheduled-reset timers and the
    /// transport below
    pub fn poll(&mut self) {
        let now = self.state.clock.now_ms();
        if let Err(e) = self.transport.poll(now) {
            log::warn!("transport poll error: {e}");
        }

        // S3: inactivity reverts a non-default session
        if self.state.session_type != SessionType::Default
            && elapsed_ms(now, self.state.last_activity_ms) > self.state.options.s3_ms
        {
            log::warn!("S3 timeout, session falls back to default");
            self.reset_to_default_session(now);
            self.pending = None;
            let Self {
                dispatcher, state, ..
            } = self;
            dispatcher.dispatch(state, &mut EventData::SessionTimeout);
        }

        self.poll_pending(now);

        // Scheduled ECU reset
        if let Some((kind, fire_at)) = self.state.scheduled_reset {
            if deadline_reached(now, fire_at) {
                self.state.scheduled_reset = None;
                log::warn!("scheduled ECU reset fires now ({kind:?})");
                let Self {
                    dispatcher, state, ..
                } = self;
                dispatcher.dispatch(state, &mut EventData::DoScheduledReset { kind });
            }
        }
    }

    fn reset_to_default_session(&mut self, now: u32) {
        self.state.session_type = SessionType::Default;
        self.state.security_level = 0;
        self.state.p2_ms = self.state.options.p2_ms_std;
        self.state.p2_star_ms = self.state.options.p2_star_ms_std;
        self.state.last_activity_ms = now;
    }

    fn process_pdu(&mut self, origin: PduOrigin, pdu: Vec<u8>, now: u32) {
        self.state.last_activity_ms = now;
        let Some(&sid_byte) = pdu.first() else {
            return;
        };
        if self.pending.is_some() {
            log::warn!("new request while a response is pending, dropping the pending operation");
            self.pending = None;
        }
        let Some(sid) = ServiceId::from_repr(sid_byte) else {
            log::warn!("unsupported SID 0x{sid_byte:02X}");
            self.send_negative(origin, sid_byte, Nrc::ServiceNotSupported, now);
            return;
        };

        // Comm-control receive filter. Session and communication control stay
        // reachable so a tester can always restore the link.
        if !self.state.comm_normal.rx_enabled()
            && !matches!(
                sid,
                ServiceId::DiagnosticSessionControl | ServiceId::CommunicationControl
            )
        {
            log::debug!("RX disabled by communication control, dropping 0x{sid_byte:02X}");
            return;
        }

        let suppress =
            has_sub_function(sid) && pdu.get(1).is_some_and(|b| b & SUPPRESS_POS_RESP_BIT != 0);

        if let Some(nrc) = self.policy.check(sid, &self.state) {
            self.send_negative(origin, sid_byte, nrc, now);
            return;
        }
        if sid == ServiceId::SecurityAccess && self.state.security_inhibited(now) {
            self.send_negative(origin, sid_byte, Nrc::RequiredTimeDelayNotExpired, now);
            return;
        }

        let mut decoded = match decode_request(sid, &pdu, self.max_block_ceiling) {
            Ok(d) => d,
            Err(nrc) => {
                self.send_negative(origin, sid_byte, nrc, now);
                return;
            }
        };

        let mut outcome = self.dispatch_decoded(&mut decoded);
        // Tester present is a core duty: acknowledge it even when no
        // application handler subscribed to the event
        if matches!(decoded, DecodedRequest::TesterPresent)
            && outcome == DispatchOutcome::Negative(Nrc::ServiceNotSupported)
        {
            outcome = DispatchOutcome::Positive;
        }
        self.apply_core_effects(&decoded, outcome, now);

        match outcome {
            DispatchOutcome::Positive => {
                if suppress {
                    log::debug!("positive response suppressed for 0x{sid_byte:02X}");
                    return;
                }
                let resp = encode_positive(&decoded);
                self.send_response(resp, now);
            }
            DispatchOutcome::Pending => {
                let interval = pending_interval(self.state.p2_star_ms);
                self.pending = Some(PendingRequest {
                    request: pdu,
                    suppress,
                    origin,
                    pending_count: 1,
                    next_pending_at: now.wrapping_add(interval),
                });
                self.send_negative(
                    origin,
                    sid_byte,
                    Nrc::RequestCorrectlyReceivedResponsePending,
                    now,
                );
            }
            DispatchOutcome::Negative(nrc) => {
                self.send_negative(origin, sid_byte, nrc, now);
            }
        }
    }

    /// Re-runs a stored response-pending request and paces the 0x78 repeats
    fn poll_pending(&mut self, now: u32) {
        let Some(mut p) = self.pending.take() else {
            return;
        };
        let sid_byte = p.request[0];
        let Some(sid) = ServiceId::from_repr(sid_byte) else {
            return;
        };
        let mut decoded = match decode_request(sid, &p.request, self.max_block_ceiling) {
            Ok(d) => d,
            Err(nrc) => {
                self.send_negative(p.origin, sid_byte, nrc, now);
                return;
            }
        };
        let outcome = self.dispatch_decoded(&mut decoded);
        self.apply_core_effects(&decoded, outcome, now);
        match outcome {
            DispatchOutcome::Pending => {
                if !deadline_reached(now, p.next_pending_at) {
                    self.pending = Some(p);
                    return;
                }
                if p.pending_count >= self.state.options.max_response_pending {
                    log::error!(
                        "operation still pending after {} reminders, rejecting",
                        p.pending_count
                    );
                    self.send_negative(p.origin, sid_byte, Nrc::GeneralReject, now);
                    return;
                }
                p.pending_count += 1;
                p.next_pending_at = now.wrapping_add(pending_interval(self.state.p2_star_ms));
                self.send_negative(
                    p.origin,
                    sid_byte,
                    Nrc::RequestCorrectlyReceivedResponsePending,
                    now,
                );
                self.pending = Some(p);
            }
            DispatchOutcome::Positive => {
                self.state.last_activity_ms = now;
                if !p.suppress {
                    let resp = encode_positive(&decoded);
                    self.send_response(resp, now);
                }
            }
            DispatchOutcome::Negative(nrc) => {
                self.state.last_activity_ms = now;
                self.send_negative(p.origin, sid_byte, nrc, now);
            }
        }
    }

    fn dispatch_decoded(&mut self, decoded: &mut DecodedRequest) -> DispatchOutcome {
        let Self {
            dispatcher, state, ..
        } = self;
        let mut data = match decoded {
            DecodedRequest::SessionChange(a) => EventData::SessionChange(a),
            DecodedRequest::EcuReset(a) => EventData::EcuReset(a),
            DecodedRequest::SecurityRequestSeed(a) => EventData::SecurityRequestSeed(a),
            DecodedRequest::SecurityValidateKey { args, .. } => {
                EventData::SecurityValidateKey(args)
            }
            DecodedRequest::CommunicationControl(a) => EventData::CommunicationControl(a),
            DecodedRequest::ReadDataByIdent(a) => EventData::ReadDataByIdent(a),
            DecodedRequest::WriteDataByIdent(a) => EventData::WriteDataByIdent(a),
            DecodedRequest::IoControl(a) => EventData::IoControl(a),
            DecodedRequest::RoutineControl(a) => EventData::RoutineControl(a),
            DecodedRequest::RequestFileTransfer(a) => EventData::RequestFileTransfer(a),
            DecodedRequest::TransferData(a) => EventData::TransferData(a),
            DecodedRequest::RequestTransferExit(a) => EventData::RequestTransferExit(a),
            DecodedRequest::TesterPresent => EventData::TesterPresent,
        };
        dispatcher.dispatch(state, &mut data)
    }

    /// State transitions the core applies itself once a chain has ruled
    fn apply_core_effects(&mut self, decoded: &DecodedRequest, outcome: DispatchOutcome, now: u32) {
        match (decoded, outcome) {
            (DecodedRequest::SessionChange(args), DispatchOutcome::Positive) => {
                let old = self.state.session_type;
                self.state.session_type = args.target;
                self.state.security_level = 0;
                self.state.p2_ms = args.p2_ms;
                self.state.p2_star_ms = args.p2_star_ms;
                self.state.last_activity_ms = now;
                log::info!("session change {:?} -> {:?}", old, args.target);
            }
            (DecodedRequest::SecurityValidateKey { even_sub, .. }, DispatchOutcome::Positive) => {
                self.state.security_level = *even_sub;
                log::info!("security access granted, level 0x{even_sub:02X}");
            }
            (
                DecodedRequest::SecurityValidateKey { .. },
                DispatchOutcome::Negative(Nrc::InvalidKey),
            ) => {
                let until = now.wrapping_add(self.state.options.security_delay_ms);
                self.state.security_inhibit_until = Some(until);
                log::warn!(
                    "invalid key, security access inhibited for {} ms",
                    self.state.options.security_delay_ms
                );
            }
            (DecodedRequest::EcuReset(args), DispatchOutcome::Positive) => {
                let fire_at = now.wrapping_add(args.power_down_delay_ms);
                self.state.scheduled_reset = Some((args.kind, fire_at));
                log::info!(
                    "ECU reset accepted, firing in {} ms",
                    args.power_down_delay_ms
                );
            }
            (DecodedRequest::CommunicationControl(args), DispatchOutcome::Positive) => {
                // Handlers own the enhanced addressing sub-functions; global
                // ones are applied here once the chain approves.
                let ctrl = args.ctrl as u8;
                if ctrl <= CommunicationControlType::DisableRxAndTx as u8 {
                    if let (Some(new_state), Some(scope)) = (
                        CommState::from_repr(ctrl),
                        CommunicationScope::from_operand(args.comm_operand),
                    ) {
                        self.state.apply_comm_state(new_state, scope);
                    }
                }
            }
            _ => {}
        }
    }

    fn send_response(&mut self, resp: Vec<u8>, now: u32) {
        log::debug!("response PDU {resp:02X?}");
        if let Err(e) = self.transport.send(&resp, now) {
            log::error!("failed to send response: {e}");
        }
    }

    fn send_negative(&mut self, origin: PduOrigin, sid_byte: u8, nrc: Nrc, now: u32) {
        // Functionally addressed requests never see "not supported" style
        // rejections on the bus
        if origin == PduOrigin::Functional
            && matches!(
                nrc,
                Nrc::ServiceNotSupported
                    | Nrc::SubFunctionNotSupported
                    | Nrc::RequestOutOfRange
                    | Nrc::ServiceNotSupportedInActiveSession
                    | Nrc::SubFunctionNotSupportedInActiveSession
            )
        {
            log::debug!(
                "suppressing NRC 0x{:02X} for functional request 0x{sid_byte:02X}",
                nrc as u8
            );
            return;
        }
        self.send_response(vec![NEGATIVE_RESPONSE_SID, sid_byte, nrc as u8], now);
    }
}

/// Interval between consecutive 0x78 reminders: P2* shortened by a safety
/// margin so the client timer never lapses first
fn pending_interval(p2_star_ms: u32) -> u32 {
    (p2_star_ms - p2_star_ms / 10).max(1)
}

fn deadline_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

fn has_sub_function(sid: ServiceId) -> bool {
    matches!(
        sid,
        ServiceId::DiagnosticSessionControl
            | ServiceId::ECUReset
            | ServiceId::SecurityAccess
            | ServiceId::CommunicationControl
            | ServiceId::RoutineControl
            | ServiceId::TesterPresent
    )
}

fn be_u16(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

fn decode_request(
    sid: ServiceId,
    pdu: &[u8],
    max_block_ceiling: u16,
) -> Result<DecodedRequest, Nrc> {
    match sid {
        ServiceId::DiagnosticSessionControl => {
            if pdu.len() != 2 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Ok(DecodedRequest::SessionChange(SessionChangeArgs {
                target: SessionType::from(pdu[1] & !SUPPRESS_POS_RESP_BIT),
                p2_ms: 0,
                p2_star_ms: 0,
            }))
        }
        ServiceId::ECUReset => {
            if pdu.len() != 2 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Ok(DecodedRequest::EcuReset(EcuResetArgs {
                kind: ResetType::from(pdu[1] & !SUPPRESS_POS_RESP_BIT),
                power_down_delay_ms: 0,
            }))
        }
        ServiceId::SecurityAccess => {
            if pdu.len() < 2 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            let sub = pdu[1] & !SUPPRESS_POS_RESP_BIT;
            if sub == 0 {
                return Err(Nrc::SubFunctionNotSupported);
            }
            if sub % 2 == 1 {
                Ok(DecodedRequest::SecurityRequestSeed(RequestSeedArgs {
                    level: sub,
                    seed: Vec::new(),
                }))
            } else {
                Ok(DecodedRequest::SecurityValidateKey {
                    args: ValidateKeyArgs {
                        level: sub - 1,
                        key: pdu[2..].to_vec(),
                    },
                    even_sub: sub,
                })
            }
        }
        ServiceId::CommunicationControl => {
            if pdu.len() < 3 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            let ctrl_byte = pdu[1] & !SUPPRESS_POS_RESP_BIT;
            let ctrl = CommunicationControlType::from_repr(ctrl_byte)
                .ok_or(Nrc::SubFunctionNotSupported)?;
            let needs_node_id = matches!(
                ctrl,
                CommunicationControlType::EnableRxDisableTxEnhanced
                    | CommunicationControlType::EnableRxAndTxEnhanced
            );
            if needs_node_id && pdu.len() < 5 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Ok(DecodedRequest::CommunicationControl(CommCtrlArgs {
                ctrl,
                comm_operand: pdu[2],
                node_id: if needs_node_id {
                    be_u16(pdu[3], pdu[4])
                } else {
                    0
                },
            }))
        }
        ServiceId::ReadDataByIdentifier => {
            if pdu.len() != 3 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Ok(DecodedRequest::ReadDataByIdent(ReadDataArgs {
                did: be_u16(pdu[1], pdu[2]),
                data: Vec::new(),
            }))
        }
        ServiceId::WriteDataByIdentifier => {
            if pdu.len() < 4 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Ok(DecodedRequest::WriteDataByIdent(WriteDataArgs {
                did: be_u16(pdu[1], pdu[2]),
                data: pdu[3..].to_vec(),
            }))
        }
        ServiceId::InputOutputControlByIdentifier => {
            if pdu.len() < 4 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            let param =
                IoControlParameter::from_repr(pdu[3]).ok_or(Nrc::RequestOutOfRange)?;
            Ok(DecodedRequest::IoControl(IoControlArgs {
                did: be_u16(pdu[1], pdu[2]),
                param,
                state: pdu[4..].to_vec(),
                status: Vec::new(),
            }))
        }
        ServiceId::RoutineControl => {
            if pdu.len() < 4 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            let ctrl = RoutineControlType::from_repr(pdu[1] & !SUPPRESS_POS_RESP_BIT)
                .ok_or(Nrc::SubFunctionNotSupported)?;
            Ok(DecodedRequest::RoutineControl(RoutineControlArgs {
                ctrl,
                id: be_u16(pdu[2], pdu[3]),
                option: pdu[4..].to_vec(),
                status: Vec::new(),
            }))
        }
        ServiceId::RequestFileTransfer => decode_file_request(pdu, max_block_ceiling),
        ServiceId::TransferData => {
            if pdu.len() < 2 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Ok(DecodedRequest::TransferData(TransferDataArgs {
                sequence: pdu[1],
                data: pdu[2..].to_vec(),
                max_resp_len: max_block_ceiling,
                response: Vec::new(),
            }))
        }
        ServiceId::RequestTransferExit => Ok(DecodedRequest::RequestTransferExit(
            TransferExitArgs {
                data: pdu[1..].to_vec(),
                response: Vec::new(),
            },
        )),
        ServiceId::TesterPresent => {
            if pdu.len() != 2 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            if pdu[1] & !SUPPRESS_POS_RESP_BIT != 0 {
                return Err(Nrc::SubFunctionNotSupported);
            }
            Ok(DecodedRequest::TesterPresent)
        }
        ServiceId::RequestDownload | ServiceId::RequestUpload => Err(Nrc::ServiceNotSupported),
    }
}

/// Request layout: mode, pathLen (2, BE), path bytes, then per mode:
/// add/replace carry dataFormatIdentifier + fileSizeParameterLength + the
/// (un)compressed sizes, read carries dataFormatIdentifier only, delete ends
/// after the path.
fn decode_file_request(pdu: &[u8], max_block_ceiling: u16) -> Result<DecodedRequest, Nrc> {
    if pdu.len() < 4 {
        return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
    }
    let mode = FileModeOfOperation::from_repr(pdu[1]).ok_or(Nrc::SubFunctionNotSupported)?;
    let path_len = be_u16(pdu[2], pdu[3]) as usize;
    if path_len == 0 || pdu.len() < 4 + path_len {
        return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
    }
    let path = String::from_utf8(pdu[4..4 + path_len].to_vec())
        .map_err(|_| Nrc::IncorrectMessageLengthOrInvalidFormat)?;
    let rest = &pdu[4 + path_len..];

    let mut file_size = 0u64;
    if matches!(
        mode,
        FileModeOfOperation::AddFile | FileModeOfOperation::ReplaceFile
    ) {
        // dfi + size parameter length + sizes
        if rest.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let size_len = rest[1] as usize;
        if size_len == 0 || size_len > 8 || rest.len() < 2 + 2 * size_len {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        for b in &rest[2..2 + size_len] {
            file_size = (file_size << 8) | *b as u64;
        }
    }

    Ok(DecodedRequest::RequestFileTransfer(FileRequestArgs {
        mode,
        path,
        file_size,
        max_block_len: max_block_ceiling,
        response_file_size: None,
    }))
}

fn encode_positive(decoded: &DecodedRequest) -> Vec<u8> {
    match decoded {
        DecodedRequest::SessionChange(args) => {
            let p2_star_10ms = (args.p2_star_ms / 10) as u16;
            vec![
                ServiceId::DiagnosticSessionControl.response_sid(),
                u8::from(args.target),
                (args.p2_ms >> 8) as u8,
                args.p2_ms as u8,
                (p2_star_10ms >> 8) as u8,
                p2_star_10ms as u8,
            ]
        }
        DecodedRequest::EcuReset(args) => {
            vec![ServiceId::ECUReset.response_sid(), u8::from(args.kind)]
        }
        DecodedRequest::SecurityRequestSeed(args) => {
            let mut resp = vec![ServiceId::SecurityAccess.response_sid(), args.level];
            resp.extend_from_slice(&args.seed);
            resp
        }
        DecodedRequest::SecurityValidateKey { even_sub, .. } => {
            vec![ServiceId::SecurityAccess.response_sid(), *even_sub]
        }
        DecodedRequest::CommunicationControl(args) => {
            vec![
                ServiceId::CommunicationControl.response_sid(),
                args.ctrl as u8,
            ]
        }
        DecodedRequest::ReadDataByIdent(args) => {
            let mut resp = vec![
                ServiceId::ReadDataByIdentifier.response_sid(),
                (args.did >> 8) as u8,
                args.did as u8,
            ];
            resp.extend_from_slice(&args.data);
            resp
        }
        DecodedRequest::WriteDataByIdent(args) => {
            vec![
                ServiceId::WriteDataByIdentifier.response_sid(),
                (args.did >> 8) as u8,
                args.did as u8,
            ]
        }
        DecodedRequest::IoControl(args) => {
            let mut resp = vec![
                ServiceId::InputOutputControlByIdentifier.response_sid(),
                (args.did >> 8) as u8,
                args.did as u8,
                args.param as u8,
            ];
            resp.extend_from_slice(&args.status);
            resp
        }
        DecodedRequest::RoutineControl(args) => {
            let mut resp = vec![
                ServiceId::RoutineControl.response_sid(),
                args.ctrl as u8,
                (args.id >> 8) as u8,
                args.id as u8,
            ];
            resp.extend_from_slice(&args.status);
            resp
        }
        DecodedRequest::RequestFileTransfer(args) => {
            let mut resp = vec![
                ServiceId::RequestFileTransfer.response_sid(),
                args.mode as u8,
            ];
            if args.mode != FileModeOfOperation::DeleteFile {
                resp.push(0x02); // lengthFormatIdentifier
                resp.push((args.max_block_len >> 8) as u8);
                resp.push(args.max_block_len as u8);
                resp.push(0x00); // dataFormatIdentifier
            }
            if let Some(size) = args.response_file_size {
                resp.push(0x04); // fileSizeOrDirInfoParameterLength
                resp.extend_from_slice(&(size as u32).to_be_bytes());
                resp.extend_from_slice(&(size as u32).to_be_bytes());
            }
            resp
        }
        DecodedRequest::TransferData(args) => {
            let mut resp = vec![ServiceId::TransferData.response_sid(), args.sequence];
            resp.extend_from_slice(&args.response);
            resp
        }
        DecodedRequest::RequestTransferExit(args) => {
            let mut resp = vec![ServiceId::RequestTransferExit.response_sid()];
            resp.extend_from_slice(&args.response);
            resp
        }
        DecodedRequest::TesterPresent => {
            vec![ServiceId::TesterPresent.response_sid(), 0x00]
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::channel::{CanFrame, CanTransmit, ChannelResult};
    use crate::isotp::IsoTpSettings;
    use crate::sim::ManualClock;
    use std::sync::{Arc, Mutex};

    pub(crate) fn test_state() -> ServerState {
        ServerState::new(Arc::new(ManualClock::new()), ServerOptions::default())
    }

    /// Frames the test server transmitted, shared with the test body
    pub(crate) type FrameLog = Arc<Mutex<Vec<CanFrame>>>;

    pub(crate) fn frame_sink() -> (FrameLog, Box<dyn CanTransmit>) {
        let log: FrameLog = Arc::new(Mutex::new(Vec::new()));
        let log_c = log.clone();
        let sink = Box::new(move |f: &CanFrame| -> ChannelResult<()> {
            log_c.lock().unwrap().push(*f);
            Ok(())
        });
        (log, sink)
    }

    /// Server over a frame-collecting sink plus the shared manual clock
    pub(crate) fn test_server() -> (Arc<ManualClock>, FrameLog, UdsServer) {
        let clock = Arc::new(ManualClock::new());
        let (log, sink) = frame_sink();
        let transport = IsoTpTransport::new(
            0x7E0,
            0x7E8,
            0x7DF,
            None,
            IsoTpSettings::default(),
            sink,
        );
        let server = UdsServer::new(ServerOptions::default(), transport, clock.clone());
        (clock, log, server)
    }

    /// Feeds a request PDU of up to 7 bytes as a single frame
    pub(crate) fn feed_sf(server: &mut UdsServer, pdu: &[u8]) {
        assert!(pdu.len() <= 7);
        let mut data = vec![pdu.len() as u8];
        data.extend_from_slice(pdu);
        server.on_can_frame(&CanFrame::new(0x7E0, &data, false));
    }

    /// Drains and returns the PDUs the server answered with, reassembling
    /// multi-frame responses (flow controls are generated as needed)
    pub(crate) fn drain_responses(server: &mut UdsServer, log: &FrameLog) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        // Let a segmented response finish: answer FF with FC(CTS, BS=0)
        for _ in 0..600 {
            let needs_fc = {
                let frames = log.lock().unwrap();
                frames
                    .iter()
                    .any(|f| f.data()[0] & 0xF0 == 0x10)
            };
            if needs_fc && server.sending_in_progress() {
                server.on_can_frame(&CanFrame::new(0x7E0, &[0x30, 0x00, 0x00], false));
            }
            if !server.sending_in_progress() {
                break;
            }
            server.poll();
        }
        let frames = log.lock().unwrap().clone();
        log.lock().unwrap().clear();
        let mut pending: Option<(usize, Vec<u8>)> = None;
        for f in frames {
            let d = f.data();
            match d[0] & 0xF0 {
                0x00 => {
                    let len = (d[0] & 0x0F) as usize;
                    out.push(d[1..1 + len].to_vec());
                }
                0x10 => {
                    let total = (((d[0] & 0x0F) as usize) << 8) | d[1] as usize;
                    pending = Some((total, d[2..].to_vec()));
                }
                0x20 => {
                    if let Some((total, mut buf)) = pending.take() {
                        buf.extend_from_slice(&d[1..]);
                        if buf.len() >= total {
                            buf.truncate(total);
                            out.push(buf);
                        } else {
                            pending = Some((total, buf));
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::test_support::*;
    use super::*;
    use crate::server::dispatcher::HandlerResult;

    #[test]
    fn unsupported_sid_is_rejected() {
        let (_clock, log, mut server) = test_server();
        feed_sf(&mut server, &[0x99]);
        let resp = drain_responses(&mut server, &log);
        assert_eq!(resp, vec![vec![0x7F, 0x99, 0x11]]);
    }

    #[test]
    fn empty_chain_yields_service_not_supported() {
        let (_clock, log, mut server) = test_server();
        feed_sf(&mut server, &[0x31, 0x01, 0x00, 0x00]);
        let resp = drain_responses(&mut server, &log);
        assert_eq!(resp, vec![vec![0x7F, 0x31, 0x11]]);
    }

    #[test]
    fn tester_present_is_acknowledged_by_the_core() {
        let (_clock, log, mut server) = test_server();
        feed_sf(&mut server, &[0x3E, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7E, 0x00]]
        );
    }

    #[test]
    fn suppress_bit_swallows_positive_but_not_negative() {
        let (_clock, log, mut server) = test_server();
        server.register(ServiceNode {
            event: dispatcher::UdsEvent::TesterPresent,
            priority: dispatcher::priority::NORMAL,
            name: "tp",
            handler: Box::new(|_, _| HandlerResult::Handled),
        });
        feed_sf(&mut server, &[0x3E, 0x80]);
        assert!(drain_responses(&mut server, &log).is_empty());

        feed_sf(&mut server, &[0x3E, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7E, 0x00]]
        );

        // Negative responses ignore the suppress bit
        feed_sf(&mut server, &[0x3E, 0x81]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x3E, 0x12]]
        );
    }

    #[test]
    fn s3_timeout_reverts_to_default_session() {
        let (clock, log, mut server) = test_server();
        sessions::mount_session_service(&mut server);
        feed_sf(&mut server, &[0x10, 0x03]);
        let resp = drain_responses(&mut server, &log);
        assert_eq!(resp[0][0], 0x50);
        assert_eq!(server.state().session_type, SessionType::Extended);
        assert_eq!(server.state().p2_ms, 5000);

        clock.advance(5001);
        server.poll();
        assert_eq!(server.state().session_type, SessionType::Default);
        assert_eq!(server.state().security_level, 0);
        assert_eq!(server.state().p2_ms, 50);
    }

    #[test]
    fn response_pending_paces_0x78() {
        let (clock, log, mut server) = test_server();
        // Handler completes once the clock reaches 2000ms
        server.register(ServiceNode {
            event: dispatcher::UdsEvent::ReadDataByIdent,
            priority: dispatcher::priority::NORMAL,
            name: "slow",
            handler: Box::new(|state, data| {
                if state.now_ms() < 2000 {
                    return HandlerResult::Pending;
                }
                if let EventData::ReadDataByIdent(args) = data {
                    args.data = vec![0xAA];
                }
                HandlerResult::Handled
            }),
        });
        feed_sf(&mut server, &[0x22, 0xF1, 0xAA]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x22, 0x78]]
        );

        // Before the pacing interval nothing new leaves
        clock.advance(500);
        server.poll();
        assert!(drain_responses(&mut server, &log).is_empty());

        // P2* is 2000ms in the default session -> next 0x78 around 1800ms
        clock.advance(1400);
        server.poll();
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x22, 0x78]]
        );

        clock.advance(200); // now 2100
        server.poll();
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x62, 0xF1, 0xAA, 0xAA]]
        );
        // Completed: nothing further
        clock.advance(3000);
        server.poll();
        assert!(drain_responses(&mut server, &log).is_empty());
    }

    #[test]
    fn response_pending_gives_up_after_cap() {
        let (clock, log, mut server) = test_server();
        server.register(ServiceNode {
            event: dispatcher::UdsEvent::ReadDataByIdent,
            priority: dispatcher::priority::NORMAL,
            name: "stuck",
            handler: Box::new(|_, _| HandlerResult::Pending),
        });
        feed_sf(&mut server, &[0x22, 0xF1, 0xAA]);
        let mut pending_count = 0;
        let mut rejected = false;
        for _ in 0..20 {
            clock.advance(1900);
            server.poll();
            for resp in drain_responses(&mut server, &log) {
                if resp == vec![0x7F, 0x22, 0x78] {
                    pending_count += 1;
                } else if resp == vec![0x7F, 0x22, 0x10] {
                    rejected = true;
                }
            }
        }
        assert!(rejected);
        // 1 initial + 7 repeats before the cap of 8 trips
        assert_eq!(pending_count, 7);
    }

    #[test]
    fn policy_gate_blocks_sessions() {
        let (_clock, log, mut server) = test_server();
        sessions::mount_session_service(&mut server);
        server.set_policy(ServicePolicy::standard());
        server.register(ServiceNode {
            event: dispatcher::UdsEvent::RoutineControl,
            priority: dispatcher::priority::NORMAL,
            name: "routine",
            handler: Box::new(|_, _| HandlerResult::Handled),
        });
        // Default session: rejected by the policy
        feed_sf(&mut server, &[0x31, 0x01, 0xF0, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x31, 0x7F]]
        );
        // Extended session: allowed
        feed_sf(&mut server, &[0x10, 0x03]);
        drain_responses(&mut server, &log);
        feed_sf(&mut server, &[0x31, 0x01, 0xF0, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x71, 0x01, 0xF0, 0x00]]
        );
    }

    #[test]
    fn comm_filter_drops_requests_when_rx_disabled() {
        let (_clock, log, mut server) = test_server();
        server.register(ServiceNode {
            event: dispatcher::UdsEvent::TesterPresent,
            priority: dispatcher::priority::NORMAL,
            name: "tp",
            handler: Box::new(|_, _| HandlerResult::Handled),
        });
        comm_control::mount_comm_control_service(&mut server, 0x0001);
        // Disable RX+TX for normal messages
        feed_sf(&mut server, &[0x28, 0x03, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x68, 0x03]]
        );
        assert!(!server.state().app_rx_enabled());

        // Tester present is now filtered
        feed_sf(&mut server, &[0x3E, 0x00]);
        assert!(drain_responses(&mut server, &log).is_empty());

        // Communication control itself still works and restores the link
        feed_sf(&mut server, &[0x28, 0x00, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x68, 0x00]]
        );
        feed_sf(&mut server, &[0x3E, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7E, 0x00]]
        );
    }
}
