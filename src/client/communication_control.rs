//! Provides methods to control normal server communication (0x28)

use crate::protocol::{CommunicationControlType, CommunicationScope, ServiceId};
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Modifies the server's communication settings. These settings persist
    /// until the server is power cycled or the session times out.
    ///
    /// ## Parameters
    /// * ctrl - Control mode to apply
    /// * scope - The message group(s) to modify
    pub fn communication_control(
        &mut self,
        ctrl: CommunicationControlType,
        scope: CommunicationScope,
    ) -> DiagServerResult<()> {
        if matches!(
            ctrl,
            CommunicationControlType::EnableRxDisableTxEnhanced
                | CommunicationControlType::EnableRxAndTxEnhanced
        ) {
            // The enhanced sub-functions carry a node id
            return Err(DiagError::ParameterInvalid);
        }
        self.execute(&[
            ServiceId::CommunicationControl as u8,
            ctrl as u8,
            scope.into(),
        ])
        .map(|_| ())
    }

    /// Communication control with enhanced address information: only the
    /// server whose configured node id matches applies the state change.
    pub fn communication_control_with_node_id(
        &mut self,
        ctrl: CommunicationControlType,
        scope: CommunicationScope,
        node_id: u16,
    ) -> DiagServerResult<()> {
        self.execute(&[
            ServiceId::CommunicationControl as u8,
            ctrl as u8,
            scope.into(),
            (node_id >> 8) as u8,
            node_id as u8,
        ])
        .map(|_| ())
    }
}
