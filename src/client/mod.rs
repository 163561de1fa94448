//! UDS diagnostic client
//!
//! [UdsClient] is the non-blocking transaction core: it enforces the
//! one-request-in-flight discipline, runs the P2/P2* timers, routes positive
//! responses through the [response registry](response_registry) and tracks
//! heartbeat failures for the disconnect callback.
//!
//! [UdsDiagnosticClient] wraps the core together with the inbound frame
//! queue into the blocking request API the per-service methods build on.

use std::sync::Arc;

use crate::channel::{elapsed_ms, CanFrame, ChannelError, Clock, FrameReceiver};
use crate::isotp::IsoTpTransport;
use crate::protocol::{Nrc, NEGATIVE_RESPONSE_SID, POSITIVE_RESPONSE_OFFSET};
use crate::{DiagError, DiagServerResult};

pub mod response_registry;

pub mod communication_control;
pub mod data_by_ident;
pub mod diagnostic_session_control;
pub mod ecu_reset;
pub mod file_transfer;
pub mod io_control;
pub mod routine;
pub mod security_access;
pub mod tester_present;

use response_registry::ResponseRegistry;

bitflags::bitflags! {
    /// Per-request option bits
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RequestOptions: u8 {
        /// The request carries the suppress-positive-response bit; the
        /// transaction completes as soon as the request left the bus
        const SUPPRESS_POS_RESP = 0x80;
    }
}

/// UDS client options
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientOptions {
    /// Budget for the first response of a transaction, ms
    pub p2_ms: u32,
    /// Budget restarted by each 0x78 response-pending, ms
    pub p2_star_ms: u32,
    /// Tester present interval while idle, ms
    pub heartbeat_interval_ms: u32,
    /// Consecutive transport failures before the disconnect callback fires
    pub heartbeat_fail_threshold: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            p2_ms: 2000,
            p2_star_ms: 5000,
            heartbeat_interval_ms: 2000,
            heartbeat_fail_threshold: 3,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Transaction state of the client
pub enum ClientState {
    /// No request in flight, a new one may be submitted
    Idle,
    /// A request is on the wire or awaiting its response
    AwaitingResponse,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Terminal classification of the most recent transaction
pub enum ClientError {
    /// No response arrived within P2 (or P2* after a 0x78)
    Timeout,
    /// The request could not be written to the bus
    SendFailed,
    /// The server answered with a negative response
    Nrc(u8),
    /// The segmentation layer or CAN channel failed mid-transaction
    Transport,
    /// A response arrived whose SID does not match the request
    WrongMessage,
}

impl From<ClientError> for DiagError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Timeout => DiagError::Timeout,
            ClientError::SendFailed => DiagError::SendFailed,
            ClientError::Nrc(code) => DiagError::ECUError {
                code,
                def: Some(Nrc::describe_byte(code)),
            },
            ClientError::Transport => DiagError::Transport,
            ClientError::WrongMessage => DiagError::WrongMessage,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Result of [UdsClient::send_tester_present_if_idle]
pub enum HeartbeatOutcome {
    /// The heartbeat was submitted
    Sent,
    /// A transaction is in flight, nothing was sent
    Skipped,
    /// The transport rejected the heartbeat
    Failed,
}

#[derive(Debug)]
struct InFlight {
    sid: u8,
    deadline: u32,
    expecting_response: bool,
}

/// Non-blocking UDS client transaction core.
///
/// The owner feeds inbound frames through [UdsClient::on_can_frame] and
/// calls [UdsClient::poll] with a cadence no coarser than the smallest
/// protocol timer. Exactly one request is in flight at any time.
pub struct UdsClient {
    transport: IsoTpTransport,
    clock: Arc<dyn Clock>,
    options: ClientOptions,
    in_flight: Option<InFlight>,
    outcome: Option<Result<Vec<u8>, ClientError>>,
    last_error: Option<ClientError>,
    registry: ResponseRegistry,
    heartbeat_fail_count: u32,
    disconnect_cb: Option<Box<dyn FnMut() + Send>>,
    disconnect_fired: bool,
}

impl std::fmt::Debug for UdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsClient")
            .field("state", &self.state())
            .field("last_error", &self.last_error)
            .field("heartbeat_fail_count", &self.heartbeat_fail_count)
            .finish_non_exhaustive()
    }
}

impl UdsClient {
    /// Creates a client over an already configured transport binding
    pub fn new(options: ClientOptions, transport: IsoTpTransport, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            options,
            in_flight: None,
            outcome: None,
            last_error: None,
            registry: ResponseRegistry::new(),
            heartbeat_fail_count: 0,
            disconnect_cb: None,
            disconnect_fired: false,
        }
    }

    /// Current transaction state
    pub fn state(&self) -> ClientState {
        if self.in_flight.is_some() {
            ClientState::AwaitingResponse
        } else {
            ClientState::Idle
        }
    }

    /// Terminal classification of the most recent transaction, if it failed
    pub fn last_error(&self) -> Option<ClientError> {
        self.last_error
    }

    /// Consecutive transport failures since the last positive exchange
    pub fn heartbeat_fail_count(&self) -> u32 {
        self.heartbeat_fail_count
    }

    /// Registers the listener for one response SID. Exactly one listener per
    /// SID; re-registration overwrites.
    pub fn register_response_listener(
        &mut self,
        response_sid: u8,
        listener: response_registry::ResponseListener,
    ) {
        self.registry.register(response_sid, listener);
    }

    /// Registers the callback fired exactly once per disconnection
    pub fn register_disconnect_callback<F>(&mut self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.disconnect_cb = Some(Box::new(cb));
    }

    /// True while the transport is still clocking out a segmented request
    pub fn sending_in_progress(&self) -> bool {
        self.transport.sending_in_progress()
    }

    /// Submits a request. Fails with [DiagError::Busy] unless the client is
    /// idle; the failed call does not perturb the running transaction.
    pub fn submit(&mut self, request: &[u8], options: RequestOptions) -> DiagServerResult<()> {
        if self.in_flight.is_some() {
            return Err(DiagError::Busy);
        }
        if request.is_empty() {
            return Err(DiagError::ParameterInvalid);
        }
        let now = self.clock.now_ms();
        self.outcome = None;
        self.last_error = None;
        if let Err(e) = self.transport.send(request, now) {
            log::error!("request send failed: {e}");
            self.note_transport_error();
            self.last_error = Some(ClientError::SendFailed);
            return Err(DiagError::SendFailed);
        }
        self.in_flight = Some(InFlight {
            sid: request[0],
            deadline: now.wrapping_add(self.options.p2_ms),
            expecting_response: !options.contains(RequestOptions::SUPPRESS_POS_RESP),
        });
        log::debug!("request 0x{:02X} submitted", request[0]);
        Ok(())
    }

    /// Feeds one inbound CAN frame through the transport into the client
    pub fn on_can_frame(&mut self, frame: &CanFrame) {
        let now = self.clock.now_ms();
        if let Some((_, pdu)) = self.transport.on_can_frame(frame, now) {
            self.handle_response(pdu, now);
        }
    }

    /// Drives the transport and the P2/P2* timer
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();
        if let Err(e) = self.transport.poll(now) {
            log::warn!("transport error: {e}");
            self.note_transport_error();
            if self.in_flight.is_some() {
                self.complete(Err(ClientError::Transport));
            }
        }
        let Some(flight) = &self.in_flight else {
            return;
        };
        if !flight.expecting_response {
            // Suppressed: done once the request fully left the bus
            if !self.transport.sending_in_progress() {
                self.complete(Ok(Vec::new()));
            }
            return;
        }
        if elapsed_ms(now, flight.deadline) < 0x8000_0000 {
            log::warn!("P2 timeout waiting for response to 0x{:02X}", flight.sid);
            self.complete(Err(ClientError::Timeout));
        }
    }

    /// Submits a suppressed tester present when idle. The periodic heartbeat
    /// task calls this; a running transaction skips the beat.
    pub fn send_tester_present_if_idle(&mut self) -> HeartbeatOutcome {
        if self.in_flight.is_some() {
            return HeartbeatOutcome::Skipped;
        }
        match self.submit(&[0x3E, 0x80], RequestOptions::SUPPRESS_POS_RESP) {
            Ok(()) => HeartbeatOutcome::Sent,
            Err(_) => HeartbeatOutcome::Failed,
        }
    }

    /// Takes the terminal result of the current transaction once it exists
    pub fn take_outcome(&mut self) -> Option<Result<Vec<u8>, ClientError>> {
        self.outcome.take()
    }

    fn handle_response(&mut self, pdu: Vec<u8>, now: u32) {
        if pdu.first() == Some(&NEGATIVE_RESPONSE_SID) {
            if pdu.len() < 3 {
                log::warn!("malformed negative response {pdu:02X?}");
                return;
            }
            let Some(flight) = &mut self.in_flight else {
                log::debug!("unsolicited negative response {pdu:02X?}");
                return;
            };
            if pdu[1] != flight.sid {
                log::warn!(
                    "negative response for 0x{:02X} while awaiting 0x{:02X}",
                    pdu[1],
                    flight.sid
                );
                return;
            }
            if pdu[2] == Nrc::RequestCorrectlyReceivedResponsePending as u8 {
                // The server is still working: restart with the long budget
                log::debug!("response pending, restarting P2*");
                flight.deadline = now.wrapping_add(self.options.p2_star_ms);
                return;
            }
            log::warn!("NRC 0x{:02X} ({})", pdu[2], Nrc::describe_byte(pdu[2]));
            self.complete(Err(ClientError::Nrc(pdu[2])));
            return;
        }

        // Positive response
        let Some(flight) = &self.in_flight else {
            log::debug!("unsolicited response {pdu:02X?}");
            self.registry.dispatch(&pdu);
            return;
        };
        if pdu.first() != Some(&(flight.sid.wrapping_add(POSITIVE_RESPONSE_OFFSET))) {
            log::error!(
                "SID mismatch: request 0x{:02X}, response {pdu:02X?}",
                flight.sid
            );
            self.complete(Err(ClientError::WrongMessage));
            return;
        }
        self.registry.dispatch(&pdu);
        self.heartbeat_fail_count = 0;
        self.disconnect_fired = false;
        self.complete(Ok(pdu));
    }

    fn complete(&mut self, result: Result<Vec<u8>, ClientError>) {
        if let Err(e) = &result {
            self.last_error = Some(*e);
        }
        self.in_flight = None;
        self.outcome = Some(result);
    }

    /// One discrete transport error observed at any layer counts once
    fn note_transport_error(&mut self) {
        self.heartbeat_fail_count += 1;
        log::debug!(
            "transport error, heartbeat fail count {}",
            self.heartbeat_fail_count
        );
        if self.heartbeat_fail_count >= self.options.heartbeat_fail_threshold
            && !self.disconnect_fired
        {
            self.disconnect_fired = true;
            if let Some(cb) = self.disconnect_cb.as_mut() {
                log::error!("transport failure threshold reached, firing disconnect callback");
                cb();
            }
        }
    }
}

/// Blocking client driver: owns the transaction core, the inbound frame
/// queue and the heartbeat schedule. All per-service request methods live on
/// this type.
pub struct UdsDiagnosticClient {
    client: UdsClient,
    rx: FrameReceiver,
    clock: Arc<dyn Clock>,
    last_heartbeat_at: u32,
}

impl std::fmt::Debug for UdsDiagnosticClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsDiagnosticClient")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl UdsDiagnosticClient {
    /// Creates the blocking driver around a transaction core and the frame
    /// queue the CAN driver feeds
    pub fn new(client: UdsClient, rx: FrameReceiver) -> Self {
        let clock = client.clock.clone();
        let last_heartbeat_at = clock.now_ms();
        Self {
            client,
            rx,
            clock,
            last_heartbeat_at,
        }
    }

    /// Access to the transaction core (listener / callback registration)
    pub fn client_mut(&mut self) -> &mut UdsClient {
        &mut self.client
    }

    /// Executes one request to completion: submit, pump frames and timers,
    /// and return exactly one of positive payload, NRC, timeout, send
    /// failure or transport error.
    pub fn execute(&mut self, request: &[u8]) -> DiagServerResult<Vec<u8>> {
        self.execute_with_options(request, RequestOptions::empty())
    }

    /// [UdsDiagnosticClient::execute] with explicit request options
    pub fn execute_with_options(
        &mut self,
        request: &[u8],
        options: RequestOptions,
    ) -> DiagServerResult<Vec<u8>> {
        self.client.submit(request, options)?;
        loop {
            self.pump_once()?;
            if let Some(outcome) = self.client.take_outcome() {
                return outcome.map_err(DiagError::from);
            }
        }
    }

    /// Keeps the link alive while no command is running: pumps frames and
    /// sends the tester present heartbeat on its interval.
    pub fn run_idle(&mut self, duration_ms: u32) -> DiagServerResult<()> {
        let start = self.clock.now_ms();
        loop {
            let now = self.clock.now_ms();
            if elapsed_ms(now, start) >= duration_ms {
                return Ok(());
            }
            if self.client.options.heartbeat_interval_ms > 0
                && elapsed_ms(now, self.last_heartbeat_at)
                    >= self.client.options.heartbeat_interval_ms
            {
                self.last_heartbeat_at = now;
                match self.client.send_tester_present_if_idle() {
                    HeartbeatOutcome::Sent => log::debug!("heartbeat sent"),
                    HeartbeatOutcome::Skipped => {}
                    HeartbeatOutcome::Failed => log::warn!("heartbeat send failed"),
                }
            }
            self.pump_once()?;
            let _ = self.client.take_outcome();
        }
    }

    fn pump_once(&mut self) -> DiagServerResult<()> {
        let timeout = if self.client.sending_in_progress() {
            0
        } else {
            1
        };
        match self.rx.recv(timeout) {
            Ok(frame) => self.client.on_can_frame(&frame),
            Err(ChannelError::Timeout) => {}
            Err(ChannelError::Disconnected) => return Err(DiagError::ServerNotRunning),
            Err(e) => return Err(DiagError::Channel(e)),
        }
        self.client.poll();
        Ok(())
    }
}
