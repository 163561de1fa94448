//! Provides methods to manipulate the server's diagnostic session mode

use crate::protocol::{ServiceId, SessionType};
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

/// Timing the server advertised for the entered session
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// P2 server max, ms
    pub p2_ms: u16,
    /// P2* server max, ms
    pub p2_star_ms: u32,
}

impl UdsDiagnosticClient {
    /// Requests a diagnostic session change (0x10) and returns the timing
    /// the server negotiated for it.
    ///
    /// ## Parameters
    /// * session - The session mode to enter
    pub fn set_session_mode(&mut self, session: SessionType) -> DiagServerResult<SessionTiming> {
        let resp = self.execute(&[
            ServiceId::DiagnosticSessionControl as u8,
            session.into(),
        ])?;
        if resp.len() < 6 {
            return Err(DiagError::InvalidResponseLength);
        }
        if resp[1] != u8::from(session) {
            return Err(DiagError::MismatchedResponse(format!(
                "session echo 0x{:02X}",
                resp[1]
            )));
        }
        Ok(SessionTiming {
            p2_ms: ((resp[2] as u16) << 8) | resp[3] as u16,
            // P2* travels in 10ms units
            p2_star_ms: ((((resp[4] as u32) << 8) | resp[5] as u32) * 10),
        })
    }

    /// Puts the server into the default diagnostic session
    pub fn enter_default_mode(&mut self) -> DiagServerResult<SessionTiming> {
        self.set_session_mode(SessionType::Default)
    }

    /// Puts the server into the extended diagnostic session
    pub fn enter_extended_mode(&mut self) -> DiagServerResult<SessionTiming> {
        self.set_session_mode(SessionType::Extended)
    }

    /// Puts the server into the programming session
    pub fn enter_programming_mode(&mut self) -> DiagServerResult<SessionTiming> {
        self.set_session_mode(SessionType::Programming)
    }
}
