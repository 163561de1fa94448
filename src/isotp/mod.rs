//! Software ISO-TP (ISO15765-2) segmentation layer
//!
//! This module implements the transport protocol entirely in software on top
//! of a raw CAN frame callback, for hardware layers that only speak CAN:
//! * [IsoTpLink] - a single address pair with its send and receive state machines
//! * [IsoTpTransport] - the physical + functional pair binding of one endpoint

use crate::channel::ChannelError;

mod link;
mod transport;

pub use link::IsoTpLink;
pub use transport::{IsoTpTransport, PduOrigin};

/// Largest PDU expressible in the standard 12bit first-frame length field
pub const ISO_TP_MAX_PDU: usize = 4095;

/// ISO-TP result type
pub type IsoTpResult<T> = Result<T, IsoTpError>;

/// Error raised by the segmentation layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum IsoTpError {
    /// A send was requested while a previous send is still in progress
    #[error("link is busy with a previous send")]
    Busy,
    /// The PDU exceeds the link MTU
    #[error("PDU of {len} bytes exceeds MTU of {max}")]
    PduTooLarge {
        /// Requested PDU length
        len: usize,
        /// Maximum the link accepts
        max: usize,
    },
    /// The peer signalled flow control overflow, or announced a transfer
    /// larger than our MTU
    #[error("flow control overflow")]
    Overflow,
    /// A consecutive frame arrived with the wrong sequence number
    #[error("sequence error, expected SN {expected} got {got}")]
    SequenceError {
        /// Sequence number the receiver was waiting for
        expected: u8,
        /// Sequence number actually received
        got: u8,
    },
    /// No flow control arrived within N_Bs
    #[error("N_Bs timeout waiting for flow control")]
    NBsTimeout,
    /// No consecutive frame arrived within N_Cr
    #[error("N_Cr timeout waiting for consecutive frame")]
    NCrTimeout,
    /// A frame with a malformed PCI was received
    #[error("invalid ISO-TP frame")]
    InvalidFrame,
    /// The underlying CAN channel failed
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

bitflags::bitflags! {
    /// Observable state of an ISO-TP link
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct LinkStatus: u8 {
        /// Neither a send nor a receive is in progress
        const IDLE = 0b0001;
        /// A segmented send is in progress
        const SENDING = 0b0010;
        /// A segmented receive is in progress
        const RECEIVING = 0b0100;
        /// The last transfer aborted with an error
        const ERROR = 0b1000;
    }
}

/// ISO-TP configuration options for one link
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsoTpSettings {
    /// Largest PDU the link will send or assemble (capped at 4095)
    pub mtu: u16,
    /// Block size advertised in our flow control frames (0 = no limit)
    pub block_size: u8,
    /// Raw STmin byte advertised in our flow control frames
    /// (0x00-0x7F = milliseconds, 0xF1-0xF9 = 100-900 microseconds)
    pub st_min: u8,
    /// Pad outgoing frames to 8 bytes
    pub pad_frame: bool,
    /// Fill byte used for padding
    pub pad_byte: u8,
    /// CAN-level transmit deadline in ms (N_As/N_Ar)
    pub n_as_ms: u32,
    /// Sender timeout from CF to the next flow control, in ms (N_Bs)
    pub n_bs_ms: u32,
    /// Receiver budget from first frame to our flow control, in ms (N_Br)
    pub n_br_ms: u32,
    /// Sender budget from flow control to the first CF, in ms (N_Cs)
    pub n_cs_ms: u32,
    /// Receiver timeout between consecutive frames, in ms (N_Cr)
    pub n_cr_ms: u32,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            mtu: ISO_TP_MAX_PDU as u16,
            block_size: 8,
            st_min: 20,
            pad_frame: true,
            pad_byte: 0xCC,
            n_as_ms: 1000,
            n_bs_ms: 1000,
            n_br_ms: 100,
            n_cs_ms: 900,
            n_cr_ms: 1000,
        }
    }
}

impl IsoTpSettings {
    /// Decodes the configured STmin byte into the minimum gap between
    /// consecutive frames, in microseconds. Reserved values decode to 127 ms
    /// as ISO15765-2 prescribes for invalid STmin.
    pub fn st_min_micros(st_min: u8) -> u32 {
        match st_min {
            0x00..=0x7F => st_min as u32 * 1000,
            0xF1..=0xF9 => (st_min as u32 - 0xF0) * 100,
            _ => 127 * 1000,
        }
    }
}
