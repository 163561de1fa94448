//! Routine control (0x31) and the remote console built on top of it

use crate::protocol::{RoutineControlType, ServiceId, REMOTE_CONSOLE_RID};
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Runs a routine control request and returns the routine status record.
    ///
    /// ## Parameters
    /// * ctrl - Start / stop / request-results
    /// * routine_id - The 16bit routine identifier
    /// * option - Routine control option record
    pub fn routine_control(
        &mut self,
        ctrl: RoutineControlType,
        routine_id: u16,
        option: &[u8],
    ) -> DiagServerResult<Vec<u8>> {
        let mut req = Vec::with_capacity(4 + option.len());
        req.push(ServiceId::RoutineControl as u8);
        req.push(ctrl as u8);
        req.push((routine_id >> 8) as u8);
        req.push(routine_id as u8);
        req.extend_from_slice(option);
        let resp = self.execute(&req)?;
        if resp.len() < 4 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(resp[4..].to_vec())
    }

    /// Executes a command line on the server's remote console (routine
    /// 0xF000) and returns the captured output.
    ///
    /// ## Parameters
    /// * command - The UTF-8 command line to run
    pub fn remote_execute(&mut self, command: &str) -> DiagServerResult<String> {
        let captured = self.routine_control(
            RoutineControlType::Start,
            REMOTE_CONSOLE_RID,
            command.as_bytes(),
        )?;
        Ok(String::from_utf8_lossy(&captured).into_owned())
    }
}
