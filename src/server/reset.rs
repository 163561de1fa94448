//! Built-in handler for ECU reset (0x11)
//!
//! The reset is two-staged: the request handler validates the sub-function
//! and schedules the reset far enough in the future for the positive
//! response to flush out of the transmit path; the execution node then runs
//! the application hook when the scheduled event fires.

use crate::protocol::{Nrc, ResetType};

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Delay between the positive response and the reset hook, long enough to
/// flush the response frame out of the CAN mailbox
pub const DEFAULT_RESET_DELAY_MS: u32 = 50;

/// Mounts the ECU reset service with an application hook that performs the
/// physical reset once the scheduled event fires.
pub fn mount_reset_service<F>(server: &mut UdsServer, mut on_reset: F) -> ServiceHandle
where
    F: FnMut(ResetType) + Send + 'static,
{
    let request_node = ServiceNode {
        event: UdsEvent::EcuReset,
        priority: priority::NORMAL,
        name: "reset_request",
        handler: Box::new(|_, data| {
            let EventData::EcuReset(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            log::info!("ECU reset request, type {:?}", args.kind);
            match args.kind {
                ResetType::HardReset | ResetType::KeyOffReset | ResetType::SoftReset => {
                    args.power_down_delay_ms = DEFAULT_RESET_DELAY_MS;
                    HandlerResult::Handled
                }
                // Rapid power shutdown needs hardware support this server
                // does not model
                _ => HandlerResult::Negative(Nrc::SubFunctionNotSupported),
            }
        }),
    };

    let exec_node = ServiceNode {
        event: UdsEvent::DoScheduledReset,
        priority: priority::NORMAL,
        name: "reset_exec",
        handler: Box::new(move |_, data| {
            let EventData::DoScheduledReset { kind } = data else {
                return HandlerResult::Observed;
            };
            log::warn!("performing scheduled ECU reset ({kind:?})");
            on_reset(*kind);
            HandlerResult::Observed
        }),
    };

    let ids = vec![server.register(request_node), server.register(exec_node)];
    ServiceHandle::new(ids)
}
