//! Shared ISO14229-1 protocol vocabulary used by both the server and client halves
//! of the stack: service identifiers, negative response codes, and the
//! sub-function value sets of the implemented services.

use strum_macros::FromRepr;

/// Offset added to a request SID to form its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// First byte of every negative response PDU
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Suppress-positive-response bit carried in the sub-function byte
pub const SUPPRESS_POS_RESP_BIT: u8 = 0x80;

/// Routine identifier of the remote console service (0x31 start)
pub const REMOTE_CONSOLE_RID: u16 = 0xF000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, FromRepr)]
#[repr(u8)]
/// UDS Service IDs implemented by this stack
pub enum ServiceId {
    /// Diagnostic session control
    DiagnosticSessionControl = 0x10,
    /// ECU Reset
    ECUReset = 0x11,
    /// Read data by 16bit identifier
    ReadDataByIdentifier = 0x22,
    /// Security access (seed/key)
    SecurityAccess = 0x27,
    /// Controls communication functionality of the ECU
    CommunicationControl = 0x28,
    /// Write data by 16bit identifier
    WriteDataByIdentifier = 0x2E,
    /// Input/Output control by identifier
    InputOutputControlByIdentifier = 0x2F,
    /// Routine control (hosts the remote console routine)
    RoutineControl = 0x31,
    /// Request download
    RequestDownload = 0x34,
    /// Request upload
    RequestUpload = 0x35,
    /// Transfer data block
    TransferData = 0x36,
    /// Request transfer exit
    RequestTransferExit = 0x37,
    /// Request file transfer
    RequestFileTransfer = 0x38,
    /// Tester present heartbeat
    TesterPresent = 0x3E,
}

impl ServiceId {
    /// SID of the positive response to this service
    pub fn response_sid(&self) -> u8 {
        *self as u8 + POSITIVE_RESPONSE_OFFSET
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, FromRepr)]
#[repr(u8)]
/// UDS negative response codes used by the core
pub enum Nrc {
    /// ECU rejected the request (no specific reason)
    GeneralReject = 0x10,
    /// Service is not supported by the ECU
    ServiceNotSupported = 0x11,
    /// Sub function is not supported by the ECU
    SubFunctionNotSupported = 0x12,
    /// Request message was an invalid length, or the format of the
    /// request was incorrect
    IncorrectMessageLengthOrInvalidFormat = 0x13,
    /// The requested action could not be performed as the prerequisite
    /// conditions are not correct
    ConditionsNotCorrect = 0x22,
    /// The request was sent in the incorrect order, e.g. a key was sent
    /// before a seed was requested
    RequestSequenceError = 0x24,
    /// The request message contains data outside of a valid range
    RequestOutOfRange = 0x31,
    /// The request could not be completed as security access was denied
    SecurityAccessDenied = 0x33,
    /// The transmitted security key was invalid
    InvalidKey = 0x35,
    /// Too many security attempts with incorrect keys
    ExceededNumberOfAttempts = 0x36,
    /// A new seed was requested before the security delay timer expired
    RequiredTimeDelayNotExpired = 0x37,
    /// The ECU encountered an error while programming (file write, CRC mismatch)
    GeneralProgrammingFailure = 0x72,
    /// The request was accepted, but the ECU is still processing it
    RequestCorrectlyReceivedResponsePending = 0x78,
    /// The sub function is not supported in the current diagnostic session
    SubFunctionNotSupportedInActiveSession = 0x7E,
    /// The service is not supported in the current diagnostic session
    ServiceNotSupportedInActiveSession = 0x7F,
}

impl Nrc {
    /// Human readable description of the NRC
    pub fn desc(&self) -> &'static str {
        match self {
            Nrc::GeneralReject => "general reject",
            Nrc::ServiceNotSupported => "service not supported",
            Nrc::SubFunctionNotSupported => "sub function not supported",
            Nrc::IncorrectMessageLengthOrInvalidFormat => {
                "incorrect message length or invalid format"
            }
            Nrc::ConditionsNotCorrect => "conditions not correct",
            Nrc::RequestSequenceError => "request sequence error",
            Nrc::RequestOutOfRange => "request out of range",
            Nrc::SecurityAccessDenied => "security access denied",
            Nrc::InvalidKey => "invalid key",
            Nrc::ExceededNumberOfAttempts => "exceeded number of attempts",
            Nrc::RequiredTimeDelayNotExpired => "required time delay not expired",
            Nrc::GeneralProgrammingFailure => "general programming failure",
            Nrc::RequestCorrectlyReceivedResponsePending => {
                "request correctly received, response pending"
            }
            Nrc::SubFunctionNotSupportedInActiveSession => {
                "sub function not supported in active session"
            }
            Nrc::ServiceNotSupportedInActiveSession => "service not supported in active session",
        }
    }

    /// Description of an arbitrary NRC byte, including codes outside the core set
    pub fn describe_byte(code: u8) -> String {
        match Nrc::from_repr(code) {
            Some(nrc) => nrc.desc().to_string(),
            None => format!("unknown NRC 0x{code:02X}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// UDS diagnostic session modes, handled by SID 0x10
pub enum SessionType {
    /// Default diagnostic session (the ECU boots into this mode)
    Default,
    /// Programming session, enables flashing related services
    Programming,
    /// Extended diagnostic session, enables adjustment services
    Extended,
    /// Safety system diagnostic session
    SafetySystem,
    /// Manufacturer or supplier specific session mode
    Other(u8),
}

impl From<SessionType> for u8 {
    fn from(from: SessionType) -> u8 {
        match from {
            SessionType::Default => 0x01,
            SessionType::Programming => 0x02,
            SessionType::Extended => 0x03,
            SessionType::SafetySystem => 0x04,
            SessionType::Other(x) => x,
        }
    }
}

impl From<u8> for SessionType {
    fn from(b: u8) -> Self {
        match b {
            0x01 => SessionType::Default,
            0x02 => SessionType::Programming,
            0x03 => SessionType::Extended,
            0x04 => SessionType::SafetySystem,
            x => SessionType::Other(x),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// ECU reset modes, handled by SID 0x11
pub enum ResetType {
    /// Hard reset, simulating a power off/on cycle
    HardReset,
    /// Simulated key off/on cycle
    KeyOffReset,
    /// Soft reset, rebooting the running application only
    SoftReset,
    /// Enables rapid power shutdown
    EnableRapidPowerShutDown,
    /// Disables rapid power shutdown
    DisableRapidPowerShutDown,
    /// OEM defined reset mode
    Other(u8),
}

impl From<ResetType> for u8 {
    fn from(from: ResetType) -> u8 {
        match from {
            ResetType::HardReset => 0x01,
            ResetType::KeyOffReset => 0x02,
            ResetType::SoftReset => 0x03,
            ResetType::EnableRapidPowerShutDown => 0x04,
            ResetType::DisableRapidPowerShutDown => 0x05,
            ResetType::Other(x) => x,
        }
    }
}

impl From<u8> for ResetType {
    fn from(b: u8) -> Self {
        match b {
            0x01 => ResetType::HardReset,
            0x02 => ResetType::KeyOffReset,
            0x03 => ResetType::SoftReset,
            0x04 => ResetType::EnableRapidPowerShutDown,
            0x05 => ResetType::DisableRapidPowerShutDown,
            x => ResetType::Other(x),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// Communication control sub-functions (SID 0x28)
pub enum CommunicationControlType {
    /// Enable both reception and transmission
    EnableRxAndTx = 0x00,
    /// Enable reception, disable transmission
    EnableRxDisableTx = 0x01,
    /// Disable reception, enable transmission
    DisableRxEnableTx = 0x02,
    /// Disable both reception and transmission
    DisableRxAndTx = 0x03,
    /// Enable reception, disable transmission, with enhanced address information
    EnableRxDisableTxEnhanced = 0x04,
    /// Enable reception and transmission, with enhanced address information
    EnableRxAndTxEnhanced = 0x05,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Message group scope operand of communication control requests
pub enum CommunicationScope {
    /// Normal application messages
    Normal,
    /// Network management messages
    NetworkManagement,
    /// Both message groups
    Both,
}

impl CommunicationScope {
    /// Decodes the low two bits of the communication-type operand
    pub fn from_operand(operand: u8) -> Option<Self> {
        match operand & 0x03 {
            0x01 => Some(CommunicationScope::Normal),
            0x02 => Some(CommunicationScope::NetworkManagement),
            0x03 => Some(CommunicationScope::Both),
            _ => None,
        }
    }
}

impl From<CommunicationScope> for u8 {
    fn from(s: CommunicationScope) -> u8 {
        match s {
            CommunicationScope::Normal => 0x01,
            CommunicationScope::NetworkManagement => 0x02,
            CommunicationScope::Both => 0x03,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// Communication state of a message group on the server
pub enum CommState {
    /// Reception and transmission enabled (power up default)
    EnableRxTx = 0x00,
    /// Reception enabled, transmission disabled
    EnableRxDisableTx = 0x01,
    /// Reception disabled, transmission enabled
    DisableRxEnableTx = 0x02,
    /// Reception and transmission disabled
    DisableRxTx = 0x03,
}

impl CommState {
    /// True when the state allows receiving messages of the group
    pub fn rx_enabled(&self) -> bool {
        matches!(self, CommState::EnableRxTx | CommState::EnableRxDisableTx)
    }

    /// True when the state allows transmitting messages of the group
    pub fn tx_enabled(&self) -> bool {
        matches!(self, CommState::EnableRxTx | CommState::DisableRxEnableTx)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// Input/Output control parameter (SID 0x2F)
pub enum IoControlParameter {
    /// Return control of the signal to the ECU
    ReturnControlToEcu = 0x00,
    /// Reset the signal to its default value
    ResetToDefault = 0x01,
    /// Freeze the signal at its current value
    FreezeCurrentState = 0x02,
    /// Set the signal to the transmitted control state
    ShortTermAdjustment = 0x03,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// Routine control sub-functions (SID 0x31)
pub enum RoutineControlType {
    /// Start a routine
    Start = 0x01,
    /// Stop a running routine
    Stop = 0x02,
    /// Request the results of a routine
    RequestResults = 0x03,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u8)]
/// Mode of operation operand of RequestFileTransfer (SID 0x38)
pub enum FileModeOfOperation {
    /// Create a new file on the server and transfer data to it
    AddFile = 0x01,
    /// Delete a file from the server
    DeleteFile = 0x02,
    /// Replace an existing file on the server
    ReplaceFile = 0x03,
    /// Read a file from the server
    ReadFile = 0x04,
    /// Resume an interrupted file transfer
    ResumeFile = 0x05,
}
