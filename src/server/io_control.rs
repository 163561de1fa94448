//! Built-in handler for IO control by identifier (0x2F)
//!
//! Each registered DID maps to a hardware point behind a user callback. The
//! service tracks an override flag per DID: short-term-adjust and freeze set
//! it, return-control and reset-to-default clear it, and a session timeout
//! force-releases every overridden point by invoking its callback with
//! return-control exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::{IoControlParameter, Nrc};

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// User callback for IO operations on one DID.
///
/// `state` carries the control state / mask operand (meaningful for short
/// term adjust); the callback writes its control status record into `out`.
pub type IoHandler =
    Box<dyn FnMut(u16, IoControlParameter, &[u8], &mut Vec<u8>) -> Result<(), Nrc> + Send>;

struct IoNode {
    handler: IoHandler,
    overridden: bool,
}

/// Registry of IO points backing one mounted 0x2F service instance
#[derive(Clone, Default)]
pub struct IoControlService {
    nodes: Arc<Mutex<HashMap<u16, IoNode>>>,
}

impl std::fmt::Debug for IoControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoControlService")
            .field("nodes", &self.nodes.lock().unwrap().len())
            .finish()
    }
}

impl IoControlService {
    /// Creates an empty IO registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hardware point. Re-registration replaces the callback and
    /// clears the override flag.
    pub fn register_node(&self, did: u16, handler: IoHandler) {
        self.nodes.lock().unwrap().insert(
            did,
            IoNode {
                handler,
                overridden: false,
            },
        );
    }

    /// Removes a hardware point. Does not reset the hardware state if the
    /// point is currently overridden.
    pub fn unregister_node(&self, did: u16) {
        self.nodes.lock().unwrap().remove(&did);
    }

    /// Whether a DID is currently controlled by the tester.
    /// `None` if the DID is not registered.
    pub fn is_overridden(&self, did: u16) -> Option<bool> {
        self.nodes.lock().unwrap().get(&did).map(|n| n.overridden)
    }

    /// Mounts the 0x2F control node and the session-timeout release node
    pub fn mount(&self, server: &mut UdsServer) -> ServiceHandle {
        let ctrl_nodes = self.nodes.clone();
        let ctrl_node = ServiceNode {
            event: UdsEvent::IoControl,
            priority: priority::NORMAL,
            name: "io_ctrl",
            handler: Box::new(move |_, data| {
                let EventData::IoControl(args) = data else {
                    return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
                };
                let mut nodes = ctrl_nodes.lock().unwrap();
                let Some(node) = nodes.get_mut(&args.did) else {
                    return HandlerResult::Negative(Nrc::RequestOutOfRange);
                };
                log::info!("IO request DID 0x{:04X} action {:?}", args.did, args.param);

                let mut status = Vec::new();
                if let Err(nrc) = (node.handler)(args.did, args.param, &args.state, &mut status) {
                    return HandlerResult::Negative(nrc);
                }
                match args.param {
                    IoControlParameter::ShortTermAdjustment
                    | IoControlParameter::FreezeCurrentState => node.overridden = true,
                    IoControlParameter::ReturnControlToEcu
                    | IoControlParameter::ResetToDefault => node.overridden = false,
                }
                args.status = status;
                HandlerResult::Handled
            }),
        };

        let tmo_nodes = self.nodes.clone();
        let timeout_node = ServiceNode {
            event: UdsEvent::SessionTimeout,
            priority: priority::HIGH,
            name: "io_timeout",
            handler: Box::new(move |_, _| {
                let mut nodes = tmo_nodes.lock().unwrap();
                for (did, node) in nodes.iter_mut() {
                    if !node.overridden {
                        continue;
                    }
                    log::warn!("session timeout, auto-releasing DID 0x{did:04X}");
                    let mut scratch = Vec::new();
                    if let Err(nrc) = (node.handler)(
                        *did,
                        IoControlParameter::ReturnControlToEcu,
                        &[],
                        &mut scratch,
                    ) {
                        log::error!("failed to release DID 0x{did:04X} (NRC 0x{:02X})", nrc as u8);
                    }
                    // Flag is cleared even if the callback failed, to stay
                    // consistent with the session state
                    node.overridden = false;
                }
                HandlerResult::Observed
            }),
        };

        let ids = vec![server.register(ctrl_node), server.register(timeout_node)];
        ServiceHandle::new(ids)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::sessions::mount_session_service;
    use crate::server::test_support::{drain_responses, feed_sf, test_server};

    /// IO point recording every action it saw
    fn recording_node(
        seen: Arc<Mutex<Vec<IoControlParameter>>>,
    ) -> IoHandler {
        Box::new(move |_, param, _, out| {
            seen.lock().unwrap().push(param);
            out.push(0x42);
            Ok(())
        })
    }

    #[test]
    fn override_transitions() {
        let (_clock, log, mut server) = test_server();
        let io = IoControlService::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        io.register_node(0x0100, recording_node(seen.clone()));
        io.mount(&mut server);

        // Short term adjust sets the override
        feed_sf(&mut server, &[0x2F, 0x01, 0x00, 0x03, 0x55]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x6F, 0x01, 0x00, 0x03, 0x42]]
        );
        assert_eq!(io.is_overridden(0x0100), Some(true));

        // Return control clears it
        feed_sf(&mut server, &[0x2F, 0x01, 0x00, 0x00]);
        drain_responses(&mut server, &log);
        assert_eq!(io.is_overridden(0x0100), Some(false));

        // Freeze sets it again
        feed_sf(&mut server, &[0x2F, 0x01, 0x00, 0x02]);
        drain_responses(&mut server, &log);
        assert_eq!(io.is_overridden(0x0100), Some(true));
    }

    #[test]
    fn session_timeout_releases_overridden_dids() {
        let (clock, log, mut server) = test_server();
        mount_session_service(&mut server);
        let io = IoControlService::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        io.register_node(0x0100, recording_node(seen.clone()));
        io.register_node(0x0200, recording_node(seen.clone()));
        io.mount(&mut server);

        feed_sf(&mut server, &[0x10, 0x03]);
        drain_responses(&mut server, &log);
        feed_sf(&mut server, &[0x2F, 0x01, 0x00, 0x03, 0x11]);
        drain_responses(&mut server, &log);
        assert_eq!(io.is_overridden(0x0100), Some(true));
        seen.lock().unwrap().clear();

        clock.advance(5001);
        server.poll();

        // Only the overridden DID got exactly one return-control call
        assert_eq!(
            *seen.lock().unwrap(),
            vec![IoControlParameter::ReturnControlToEcu]
        );
        assert_eq!(io.is_overridden(0x0100), Some(false));
        assert_eq!(io.is_overridden(0x0200), Some(false));
    }

    #[test]
    fn unknown_did_is_out_of_range() {
        let (_clock, log, mut server) = test_server();
        let io = IoControlService::new();
        io.mount(&mut server);
        feed_sf(&mut server, &[0x2F, 0x01, 0x00, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x2F, 0x31]]
        );
    }

    #[test]
    fn handler_rejection_propagates() {
        let (_clock, log, mut server) = test_server();
        let io = IoControlService::new();
        io.register_node(
            0x0100,
            Box::new(|_, _, _, _| Err(Nrc::ConditionsNotCorrect)),
        );
        io.mount(&mut server);
        feed_sf(&mut server, &[0x2F, 0x01, 0x00, 0x02]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x2F, 0x22]]
        );
        assert_eq!(io.is_overridden(0x0100), Some(false));
    }
}
