//! Input/Output control by identifier (0x2F)

use crate::protocol::{IoControlParameter, ServiceId};
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Requests an IO override action on a DID and returns the control
    /// status record the server reported.
    ///
    /// ## Parameters
    /// * did - The hardware point's data identifier
    /// * param - The control action
    /// * state - Control state / mask bytes (used by short term adjust)
    pub fn io_control(
        &mut self,
        did: u16,
        param: IoControlParameter,
        state: &[u8],
    ) -> DiagServerResult<Vec<u8>> {
        let mut req = Vec::with_capacity(4 + state.len());
        req.push(ServiceId::InputOutputControlByIdentifier as u8);
        req.push((did >> 8) as u8);
        req.push(did as u8);
        req.push(param as u8);
        req.extend_from_slice(state);
        let resp = self.execute(&req)?;
        if resp.len() < 4 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(resp[4..].to_vec())
    }

    /// Returns control of a DID to the server's own logic
    pub fn io_return_control(&mut self, did: u16) -> DiagServerResult<Vec<u8>> {
        self.io_control(did, IoControlParameter::ReturnControlToEcu, &[])
    }

    /// Freezes a DID at its current state
    pub fn io_freeze(&mut self, did: u16) -> DiagServerResult<Vec<u8>> {
        self.io_control(did, IoControlParameter::FreezeCurrentState, &[])
    }

    /// Overrides a DID with the given control state
    pub fn io_short_term_adjust(&mut self, did: u16, state: &[u8]) -> DiagServerResult<Vec<u8>> {
        self.io_control(did, IoControlParameter::ShortTermAdjustment, state)
    }
}
