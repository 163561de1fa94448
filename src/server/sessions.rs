//! Built-in handler for diagnostic session control (0x10)
//!
//! Validates the requested session and negotiates the P2/P2* timing the
//! server advertises for it: standard timing in the default session, relaxed
//! timing in programming/extended/safety sessions so segmented transfers and
//! long operations do not starve the client timers.

use crate::protocol::{Nrc, SessionType};

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Mounts the session control handler
pub fn mount_session_service(server: &mut UdsServer) -> ServiceHandle {
    let node = ServiceNode {
        event: UdsEvent::SessionChange,
        priority: priority::NORMAL,
        name: "session_control",
        handler: Box::new(|state, data| {
            let EventData::SessionChange(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            log::info!("requested session type: 0x{:02X}", u8::from(args.target));
            match args.target {
                SessionType::Default => {
                    args.p2_ms = state.options.p2_ms_std;
                    args.p2_star_ms = state.options.p2_star_ms_std;
                    HandlerResult::Handled
                }
                SessionType::Programming
                | SessionType::Extended
                | SessionType::SafetySystem => {
                    args.p2_ms = state.options.p2_ms_ext;
                    args.p2_star_ms = state.options.p2_star_ms_ext;
                    HandlerResult::Handled
                }
                SessionType::Other(x) => {
                    log::warn!("invalid session type 0x{x:02X}");
                    HandlerResult::Negative(Nrc::SubFunctionNotSupported)
                }
            }
        }),
    };
    let id = server.register(node);
    ServiceHandle::new(vec![id])
}
