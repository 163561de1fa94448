//! Provides methods to reset the server ECU

use crate::protocol::{ResetType, ServiceId};
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Requests an ECU reset (0x11). The server answers before the reset
    /// actually fires, so a reconnect is usually required afterwards.
    ///
    /// ## Parameters
    /// * kind - The reset mode to request
    pub fn ecu_reset(&mut self, kind: ResetType) -> DiagServerResult<()> {
        let resp = self.execute(&[ServiceId::ECUReset as u8, kind.into()])?;
        if resp.len() < 2 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(())
    }

    /// Asks the server to perform a hard reset
    pub fn ecu_hard_reset(&mut self) -> DiagServerResult<()> {
        self.ecu_reset(ResetType::HardReset)
    }

    /// Asks the server to perform a soft reset
    pub fn ecu_soft_reset(&mut self) -> DiagServerResult<()> {
        self.ecu_reset(ResetType::SoftReset)
    }
}
