//! Built-in handler for communication control (0x28)
//!
//! Global sub-functions (0x00-0x03) are approved here and applied by the
//! server core after the chain rules. The enhanced-addressing sub-functions
//! (0x04/0x05) carry a node identifier the core cannot judge, so this
//! handler matches it against the configured local node id and applies the
//! equivalent global state itself on a match.

use crate::protocol::{CommState, CommunicationControlType, CommunicationScope, Nrc};

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Mounts the communication control service for the given local node id
pub fn mount_comm_control_service(server: &mut UdsServer, node_id: u16) -> ServiceHandle {
    let node = ServiceNode {
        event: UdsEvent::CommunicationControl,
        priority: priority::NORMAL,
        name: "comm_control",
        handler: Box::new(move |state, data| {
            let EventData::CommunicationControl(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            let Some(scope) = CommunicationScope::from_operand(args.comm_operand) else {
                return HandlerResult::Negative(Nrc::RequestOutOfRange);
            };

            match args.ctrl {
                CommunicationControlType::EnableRxAndTx
                | CommunicationControlType::EnableRxDisableTx
                | CommunicationControlType::DisableRxEnableTx
                | CommunicationControlType::DisableRxAndTx => {
                    // Global control: the core applies the state on approval
                    log::info!(
                        "comm control: ctrl={:?} scope={:?}",
                        args.ctrl,
                        scope
                    );
                    HandlerResult::Handled
                }
                CommunicationControlType::EnableRxDisableTxEnhanced => {
                    if args.node_id == node_id {
                        log::info!("comm control match (0x{:04X}): disabling TX", args.node_id);
                        state.apply_comm_state(CommState::EnableRxDisableTx, scope);
                    } else {
                        log::debug!(
                            "comm control ignore (0x{:04X} != 0x{:04X})",
                            args.node_id,
                            node_id
                        );
                    }
                    HandlerResult::Handled
                }
                CommunicationControlType::EnableRxAndTxEnhanced => {
                    if args.node_id == node_id {
                        log::info!("comm control match (0x{:04X}): enabling all", args.node_id);
                        state.apply_comm_state(CommState::EnableRxTx, scope);
                    } else {
                        log::debug!(
                            "comm control ignore (0x{:04X} != 0x{:04X})",
                            args.node_id,
                            node_id
                        );
                    }
                    HandlerResult::Handled
                }
            }
        }),
    };
    let id = server.register(node);
    ServiceHandle::new(vec![id])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::test_support::{drain_responses, feed_sf, test_server};

    #[test]
    fn global_control_updates_scoped_state() {
        let (_clock, log, mut server) = test_server();
        mount_comm_control_service(&mut server, 0x0001);

        // Disable TX for NM messages only
        feed_sf(&mut server, &[0x28, 0x01, 0x02]);
        assert_eq!(drain_responses(&mut server, &log), vec![vec![0x68, 0x01]]);
        assert!(server.state().app_tx_enabled());
        assert!(!server.state().nm_tx_enabled());
        assert!(server.state().nm_rx_enabled());

        // Both groups silent
        feed_sf(&mut server, &[0x28, 0x03, 0x03]);
        drain_responses(&mut server, &log);
        assert!(!server.state().app_tx_enabled());
        assert!(!server.state().nm_tx_enabled());
    }

    #[test]
    fn enhanced_addressing_matches_node_id() {
        let (_clock, log, mut server) = test_server();
        mount_comm_control_service(&mut server, 0x00A5);

        // Addressed to someone else: acknowledged, state untouched
        feed_sf(&mut server, &[0x28, 0x04, 0x01, 0x00, 0x01]);
        assert_eq!(drain_responses(&mut server, &log), vec![vec![0x68, 0x04]]);
        assert!(server.state().app_tx_enabled());

        // Addressed to us: TX disabled for normal messages
        feed_sf(&mut server, &[0x28, 0x04, 0x01, 0x00, 0xA5]);
        assert_eq!(drain_responses(&mut server, &log), vec![vec![0x68, 0x04]]);
        assert!(!server.state().app_tx_enabled());
        assert!(server.state().app_rx_enabled());

        // And back on
        feed_sf(&mut server, &[0x28, 0x05, 0x01, 0x00, 0xA5]);
        drain_responses(&mut server, &log);
        assert!(server.state().app_tx_enabled());
    }

    #[test]
    fn invalid_scope_is_out_of_range() {
        let (_clock, log, mut server) = test_server();
        mount_comm_control_service(&mut server, 0x0001);
        feed_sf(&mut server, &[0x28, 0x00, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x28, 0x31]]
        );
    }

    #[test]
    fn missing_node_id_is_a_format_error() {
        let (_clock, log, mut server) = test_server();
        mount_comm_control_service(&mut server, 0x0001);
        feed_sf(&mut server, &[0x28, 0x04, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x28, 0x13]]
        );
    }
}
