//! Priority-ordered event dispatcher of the UDS server.
//!
//! Decoded requests are mapped to one of the closed [UdsEvent] kinds and run
//! through a chain of registered handlers. Chains are kept sorted by ascending
//! priority; dispatch walks the chain until a handler claims the request.

use strum_macros::{Display, EnumCount};

use crate::protocol::{
    CommunicationControlType, FileModeOfOperation, IoControlParameter, Nrc, ResetType,
    RoutineControlType, SessionType,
};

use super::ServerState;

/// Handler priority levels. Lower values run earlier; the full 0-255 range
/// is accepted at registration.
pub mod priority {
    /// Security checks, critical intercepts
    pub const HIGHEST: u8 = 0;
    /// Core system functions
    pub const HIGH: u8 = 64;
    /// Standard application logic
    pub const NORMAL: u8 = 128;
    /// Background tasks
    pub const LOW: u8 = 192;
    /// Logging, fallback handlers
    pub const LOWEST: u8 = 255;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumCount)]
/// The closed set of dispatchable server events
pub enum UdsEvent {
    /// Diagnostic session control request (0x10)
    SessionChange,
    /// ECU reset request (0x11)
    EcuReset,
    /// Security access request-seed (0x27, odd sub-function)
    SecurityRequestSeed,
    /// Security access send-key (0x27, even sub-function)
    SecurityValidateKey,
    /// Communication control request (0x28)
    CommunicationControl,
    /// Read data by identifier (0x22)
    ReadDataByIdent,
    /// Write data by identifier (0x2E)
    WriteDataByIdent,
    /// IO control by identifier (0x2F)
    IoControl,
    /// Routine control (0x31)
    RoutineControl,
    /// Request file transfer (0x38)
    RequestFileTransfer,
    /// Transfer data block (0x36)
    TransferData,
    /// Request transfer exit (0x37)
    RequestTransferExit,
    /// Tester present heartbeat (0x3E)
    TesterPresent,
    /// The S3 timer expired and the session reverted to default
    SessionTimeout,
    /// A previously accepted ECU reset is due
    DoScheduledReset,
}

/// Arguments of a session change request. The handler fills in the timing
/// the server should advertise for the new session.
#[derive(Debug)]
pub struct SessionChangeArgs {
    /// Requested session
    pub target: SessionType,
    /// P2 server max for the new session, milliseconds
    pub p2_ms: u16,
    /// P2* server max for the new session, milliseconds
    pub p2_star_ms: u32,
}

/// Arguments of an ECU reset request. The handler sets the delay the server
/// waits before firing [UdsEvent::DoScheduledReset].
#[derive(Debug)]
pub struct EcuResetArgs {
    /// Requested reset kind
    pub kind: ResetType,
    /// Delay between the positive response and the scheduled reset event
    pub power_down_delay_ms: u32,
}

/// Arguments of a security access request-seed
#[derive(Debug)]
pub struct RequestSeedArgs {
    /// Requested security level (the odd sub-function value)
    pub level: u8,
    /// Seed the handler responds with. An all-zero seed signals the level
    /// is already unlocked.
    pub seed: Vec<u8>,
}

/// Arguments of a security access send-key
#[derive(Debug)]
pub struct ValidateKeyArgs {
    /// Security level being unlocked (even sub-function minus one)
    pub level: u8,
    /// Key bytes transmitted by the client
    pub key: Vec<u8>,
}

/// Arguments of a communication control request
#[derive(Debug)]
pub struct CommCtrlArgs {
    /// Control sub-function
    pub ctrl: CommunicationControlType,
    /// Raw communication-type operand (scope in the low bits)
    pub comm_operand: u8,
    /// Node identifier for the enhanced-addressing sub-functions
    pub node_id: u16,
}

/// Arguments of a read data by identifier request
#[derive(Debug)]
pub struct ReadDataArgs {
    /// Requested data identifier
    pub did: u16,
    /// Payload the handler responds with
    pub data: Vec<u8>,
}

/// Arguments of a write data by identifier request
#[derive(Debug)]
pub struct WriteDataArgs {
    /// Targeted data identifier
    pub did: u16,
    /// Payload to store
    pub data: Vec<u8>,
}

/// Arguments of an IO control request
#[derive(Debug)]
pub struct IoControlArgs {
    /// Targeted data identifier
    pub did: u16,
    /// Requested control action
    pub param: IoControlParameter,
    /// Control state / mask operand (only meaningful for short term adjust)
    pub state: Vec<u8>,
    /// Control status record the handler responds with
    pub status: Vec<u8>,
}

/// Arguments of a routine control request
#[derive(Debug)]
pub struct RoutineControlArgs {
    /// Start / stop / request-results
    pub ctrl: RoutineControlType,
    /// Routine identifier
    pub id: u16,
    /// Routine control option record
    pub option: Vec<u8>,
    /// Routine status record the handler responds with
    pub status: Vec<u8>,
}

/// Arguments of a request file transfer
#[derive(Debug)]
pub struct FileRequestArgs {
    /// Mode of operation
    pub mode: FileModeOfOperation,
    /// Target path on the server
    pub path: String,
    /// Announced file size for uploads (uncompressed)
    pub file_size: u64,
    /// In: the protocol ceiling (MTU - 2). Out: the negotiated
    /// maxNumberOfBlockLength the handler advertises.
    pub max_block_len: u16,
    /// Out: the file size reported back for read requests
    pub response_file_size: Option<u64>,
}

/// Arguments of a transfer data block
#[derive(Debug)]
pub struct TransferDataArgs {
    /// Block sequence counter (starts at 1, wraps 255 to 0)
    pub sequence: u8,
    /// Block payload for uploads; empty for download block requests
    pub data: Vec<u8>,
    /// Most bytes the handler may place into `response`
    pub max_resp_len: u16,
    /// Out: download chunk returned to the client
    pub response: Vec<u8>,
}

/// Arguments of a request transfer exit
#[derive(Debug)]
pub struct TransferExitArgs {
    /// Transfer request parameter record (upload CRC)
    pub data: Vec<u8>,
    /// Out: response parameter record (download CRC)
    pub response: Vec<u8>,
}

/// Event payload handed down the handler chain
#[derive(Debug)]
pub enum EventData<'a> {
    /// See [SessionChangeArgs]
    SessionChange(&'a mut SessionChangeArgs),
    /// See [EcuResetArgs]
    EcuReset(&'a mut EcuResetArgs),
    /// See [RequestSeedArgs]
    SecurityRequestSeed(&'a mut RequestSeedArgs),
    /// See [ValidateKeyArgs]
    SecurityValidateKey(&'a mut ValidateKeyArgs),
    /// See [CommCtrlArgs]
    CommunicationControl(&'a mut CommCtrlArgs),
    /// See [ReadDataArgs]
    ReadDataByIdent(&'a mut ReadDataArgs),
    /// See [WriteDataArgs]
    WriteDataByIdent(&'a mut WriteDataArgs),
    /// See [IoControlArgs]
    IoControl(&'a mut IoControlArgs),
    /// See [RoutineControlArgs]
    RoutineControl(&'a mut RoutineControlArgs),
    /// See [FileRequestArgs]
    RequestFileTransfer(&'a mut FileRequestArgs),
    /// See [TransferDataArgs]
    TransferData(&'a mut TransferDataArgs),
    /// See [TransferExitArgs]
    RequestTransferExit(&'a mut TransferExitArgs),
    /// Tester present heartbeat, no payload
    TesterPresent,
    /// Session timed out back to default, observers release their state
    SessionTimeout,
    /// A scheduled ECU reset is due
    DoScheduledReset {
        /// The accepted reset kind
        kind: ResetType,
    },
}

impl EventData<'_> {
    /// The event kind this payload belongs to
    pub fn event(&self) -> UdsEvent {
        match self {
            EventData::SessionChange(_) => UdsEvent::SessionChange,
            EventData::EcuReset(_) => UdsEvent::EcuReset,
            EventData::SecurityRequestSeed(_) => UdsEvent::SecurityRequestSeed,
            EventData::SecurityValidateKey(_) => UdsEvent::SecurityValidateKey,
            EventData::CommunicationControl(_) => UdsEvent::CommunicationControl,
            EventData::ReadDataByIdent(_) => UdsEvent::ReadDataByIdent,
            EventData::WriteDataByIdent(_) => UdsEvent::WriteDataByIdent,
            EventData::IoControl(_) => UdsEvent::IoControl,
            EventData::RoutineControl(_) => UdsEvent::RoutineControl,
            EventData::RequestFileTransfer(_) => UdsEvent::RequestFileTransfer,
            EventData::TransferData(_) => UdsEvent::TransferData,
            EventData::RequestTransferExit(_) => UdsEvent::RequestTransferExit,
            EventData::TesterPresent => UdsEvent::TesterPresent,
            EventData::SessionTimeout => UdsEvent::SessionTimeout,
            EventData::DoScheduledReset { .. } => UdsEvent::DoScheduledReset,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Verdict returned by a service handler
pub enum HandlerResult {
    /// The request was handled, stop the chain and respond positively
    Handled,
    /// The handler processed the event but later handlers may run too
    /// (observers, timeout hooks)
    Observed,
    /// The request was accepted but the operation is still running; the
    /// server starts the 0x78 response-pending pacing
    Pending,
    /// A negative verdict. [Nrc::RequestOutOfRange],
    /// [Nrc::SubFunctionNotSupported] and [Nrc::ServiceNotSupported] mean
    /// "not mine" and let the chain continue; any other code stops it.
    Negative(Nrc),
}

/// Outcome of running a full handler chain
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one handler claimed the request
    Positive,
    /// A handler reported response-pending
    Pending,
    /// The chain rejected the request
    Negative(Nrc),
}

/// Boxed handler invoked by the dispatcher
pub type Handler = Box<dyn FnMut(&mut ServerState, &mut EventData<'_>) -> HandlerResult + Send>;

/// A handler registration record
pub struct ServiceNode {
    /// Event this node subscribes to
    pub event: UdsEvent,
    /// Chain position, 0 (first) to 255 (last)
    pub priority: u8,
    /// Debug name shown in the dispatcher dump
    pub name: &'static str,
    /// The handler itself
    pub handler: Handler,
}

impl std::fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceNode")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Token returned by [EventDispatcher::register], used to unregister
pub type NodeId = u64;

struct Registered {
    id: NodeId,
    event: UdsEvent,
    priority: u8,
    name: &'static str,
    handler: Handler,
}

/// Event table of the server: one chain per [UdsEvent] kind, each sorted by
/// ascending priority. Lookup by event is O(1), dispatch O(chain length).
pub struct EventDispatcher {
    chains: Vec<Vec<Registered>>,
    next_id: NodeId,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.chains.iter().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        let mut chains = Vec::with_capacity(<UdsEvent as strum::EnumCount>::COUNT);
        for _ in 0..<UdsEvent as strum::EnumCount>::COUNT {
            chains.push(Vec::new());
        }
        Self { chains, next_id: 1 }
    }

    /// Registers a handler node, keeping its chain sorted by ascending
    /// priority. Registration among equal priorities is stable.
    pub fn register(&mut self, node: ServiceNode) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let chain = &mut self.chains[node.event as usize];
        let pos = chain
            .iter()
            .position(|n| n.priority > node.priority)
            .unwrap_or(chain.len());
        chain.insert(
            pos,
            Registered {
                id,
                event: node.event,
                priority: node.priority,
                name: node.name,
                handler: node.handler,
            },
        );
        log::debug!("registered service node '{}' for {}", node.name, node.event);
        id
    }

    /// Removes a previously registered node. Returns false if the token is
    /// unknown (already unregistered).
    pub fn unregister(&mut self, id: NodeId) -> bool {
        for chain in &mut self.chains {
            if let Some(pos) = chain.iter().position(|n| n.id == id) {
                let node = chain.remove(pos);
                log::debug!("unregistered service node '{}'", node.name);
                return true;
            }
        }
        false
    }

    /// Removes every registered node
    pub fn unregister_all(&mut self) {
        for chain in &mut self.chains {
            chain.clear();
        }
        log::info!("all service nodes unregistered");
    }

    /// Runs the chain for the event carried by `data`.
    pub(crate) fn dispatch(
        &mut self,
        state: &mut ServerState,
        data: &mut EventData<'_>,
    ) -> DispatchOutcome {
        let evt = data.event();
        let chain = &mut self.chains[evt as usize];
        log::debug!("dispatching {evt} across {} handler(s)", chain.len());

        let mut observed = false;
        let mut last_nrc = Nrc::ServiceNotSupported;
        for node in chain.iter_mut() {
            match (node.handler)(state, data) {
                HandlerResult::Observed => {
                    observed = true;
                }
                HandlerResult::Handled => return DispatchOutcome::Positive,
                HandlerResult::Pending => return DispatchOutcome::Pending,
                HandlerResult::Negative(nrc) => match nrc {
                    Nrc::RequestOutOfRange
                    | Nrc::SubFunctionNotSupported
                    | Nrc::ServiceNotSupported => {
                        last_nrc = nrc;
                    }
                    other => return DispatchOutcome::Negative(other),
                },
            }
        }
        if observed {
            DispatchOutcome::Positive
        } else {
            DispatchOutcome::Negative(last_nrc)
        }
    }

    /// Lists every registered handler (name, event, priority), one per line,
    /// in dispatch order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for chain in &self.chains {
            for node in chain {
                out.push_str(&format!(
                    "{:<24} | {:<22} | prio {:>3}\n",
                    node.name, node.event, node.priority
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::test_support::test_state;

    fn node(
        event: UdsEvent,
        priority: u8,
        name: &'static str,
        result: HandlerResult,
        order: std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>,
    ) -> ServiceNode {
        ServiceNode {
            event,
            priority,
            name,
            handler: Box::new(move |_, _| {
                order.lock().unwrap().push(name);
                result
            }),
        }
    }

    #[test]
    fn chain_runs_in_priority_order() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut d = EventDispatcher::new();
        d.register(node(
            UdsEvent::SessionTimeout,
            priority::LOW,
            "low",
            HandlerResult::Observed,
            order.clone(),
        ));
        d.register(node(
            UdsEvent::SessionTimeout,
            priority::HIGHEST,
            "first",
            HandlerResult::Observed,
            order.clone(),
        ));
        d.register(node(
            UdsEvent::SessionTimeout,
            priority::NORMAL,
            "mid",
            HandlerResult::Observed,
            order.clone(),
        ));
        let mut state = test_state();
        let out = d.dispatch(&mut state, &mut EventData::SessionTimeout);
        assert_eq!(out, DispatchOutcome::Positive);
        assert_eq!(*order.lock().unwrap(), vec!["first", "mid", "low"]);
    }

    #[test]
    fn handled_stops_the_chain() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut d = EventDispatcher::new();
        d.register(node(
            UdsEvent::TesterPresent,
            0,
            "a",
            HandlerResult::Handled,
            order.clone(),
        ));
        d.register(node(
            UdsEvent::TesterPresent,
            1,
            "b",
            HandlerResult::Handled,
            order.clone(),
        ));
        let mut state = test_state();
        assert_eq!(
            d.dispatch(&mut state, &mut EventData::TesterPresent),
            DispatchOutcome::Positive
        );
        assert_eq!(*order.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn not_mine_continues_and_surfaces_last_nrc() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut d = EventDispatcher::new();
        d.register(node(
            UdsEvent::ReadDataByIdent,
            0,
            "a",
            HandlerResult::Negative(Nrc::RequestOutOfRange),
            order.clone(),
        ));
        d.register(node(
            UdsEvent::ReadDataByIdent,
            1,
            "b",
            HandlerResult::Negative(Nrc::RequestOutOfRange),
            order.clone(),
        ));
        let mut state = test_state();
        let mut args = ReadDataArgs {
            did: 0x1234,
            data: Vec::new(),
        };
        let out = d.dispatch(&mut state, &mut EventData::ReadDataByIdent(&mut args));
        assert_eq!(out, DispatchOutcome::Negative(Nrc::RequestOutOfRange));
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test]
    fn rejection_stops_the_chain() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut d = EventDispatcher::new();
        d.register(node(
            UdsEvent::TesterPresent,
            0,
            "deny",
            HandlerResult::Negative(Nrc::SecurityAccessDenied),
            order.clone(),
        ));
        d.register(node(
            UdsEvent::TesterPresent,
            1,
            "never",
            HandlerResult::Handled,
            order.clone(),
        ));
        let mut state = test_state();
        assert_eq!(
            d.dispatch(&mut state, &mut EventData::TesterPresent),
            DispatchOutcome::Negative(Nrc::SecurityAccessDenied)
        );
        assert_eq!(*order.lock().unwrap(), vec!["deny"]);
    }

    #[test]
    fn empty_chain_is_service_not_supported() {
        let mut d = EventDispatcher::new();
        let mut state = test_state();
        assert_eq!(
            d.dispatch(&mut state, &mut EventData::TesterPresent),
            DispatchOutcome::Negative(Nrc::ServiceNotSupported)
        );
    }

    #[test]
    fn unregister_removes_single_node() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut d = EventDispatcher::new();
        let id = d.register(node(
            UdsEvent::TesterPresent,
            0,
            "a",
            HandlerResult::Handled,
            order.clone(),
        ));
        assert!(d.unregister(id));
        assert!(!d.unregister(id));
        let mut state = test_state();
        assert_eq!(
            d.dispatch(&mut state, &mut EventData::TesterPresent),
            DispatchOutcome::Negative(Nrc::ServiceNotSupported)
        );
    }
}
