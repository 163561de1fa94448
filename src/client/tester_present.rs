//! Tester present (0x3E) keep-alive

use crate::protocol::ServiceId;
use crate::DiagServerResult;

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Sends a tester present and waits for the acknowledgement. The
    /// background heartbeat uses the suppressed form instead, see
    /// [UdsClient::send_tester_present_if_idle](super::UdsClient::send_tester_present_if_idle).
    pub fn tester_present(&mut self) -> DiagServerResult<()> {
        self.execute(&[ServiceId::TesterPresent as u8, 0x00])
            .map(|_| ())
    }
}
