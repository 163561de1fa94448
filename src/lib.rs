#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A crate providing both sides of a UDS (ISO14229-1) diagnostic link over
//! ISO-TP (ISO15765-2) segmentation on classic CAN
//!
//! ## Server side
//!
//! [server::UdsServer] decodes requests, runs them through a priority-ordered
//! chain of service handlers and encodes the responses. Built-in handlers
//! cover session control, security access, ECU reset, communication control,
//! data identifiers, IO control, the remote console routine and file
//! transfer. Application behaviour plugs in through per-service callbacks
//! and additional handler nodes.
//!
//! ## Client side
//!
//! [client::UdsClient] is the transaction core (one request in flight,
//! P2/P2* timing, response-pending handling, tester-present heartbeat);
//! [client::UdsDiagnosticClient] adds the blocking per-service request
//! methods including the multi-step security unlock and CRC-checked file
//! transfer flows.
//!
//! ## Transport
//!
//! Both sides sit on [isotp::IsoTpTransport], a software ISO-TP
//! implementation over a plain CAN frame callback, so any hardware that can
//! send and receive 8-byte frames works. Inbound frames travel through the
//! bounded queue in [channel]; each endpoint runs on a single worker thread.

use channel::ChannelError;

pub mod channel;
pub mod client;
pub mod helpers;
pub mod isotp;
pub mod protocol;
pub mod server;
pub mod sim;

/// Diagnostic operation result
pub type DiagServerResult<T> = Result<T, DiagError>;

/// Error surface of the diagnostic client API
#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    /// A request was submitted while another transaction is in flight
    #[error("a request is already in flight")]
    Busy,
    /// No response arrived within P2 (or P2* after a response-pending)
    #[error("timeout waiting for ECU response")]
    Timeout,
    /// The request could not be written to the bus
    #[error("request send failed")]
    SendFailed,
    /// The segmentation layer or CAN channel failed mid-transaction
    #[error("transport error during transaction")]
    Transport,
    /// ECU response message did not match the request
    #[error("ECU response message did not match request")]
    WrongMessage,
    /// Diagnostic error code from the ECU itself
    #[error("ECU error 0x{code:02X} ({})", .def.as_deref().unwrap_or("unknown"))]
    ECUError {
        /// Raw negative response code from the ECU
        code: u8,
        /// Negative response code definition
        def: Option<String>,
    },
    /// ECU responded with a message of unexpected length
    #[error("ECU response message was of invalid length")]
    InvalidResponseLength,
    /// The service ID matched but the echoed parameters did not
    #[error("parameter mismatched response: {0}")]
    MismatchedResponse(String),
    /// A parameter given to the function is invalid. Check the function's
    /// documentation for more information
    #[error("a parameter provided was invalid")]
    ParameterInvalid,
    /// The frame queue was torn down, the endpoint is gone
    #[error("diagnostic endpoint not running")]
    ServerNotRunning,
    /// Error with the underlying communication channel
    #[error("underlying channel error: {0}")]
    Channel(#[from] ChannelError),
    /// Local file IO failed during a transfer
    #[error("file IO error: {0}")]
    Io(#[from] std::io::Error),
}
