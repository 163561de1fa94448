//! Built-in handler for routine control (0x31): the remote console
//!
//! Routine identifier 0xF000 with the start sub-function carries a UTF-8
//! command line. The host-supplied executor runs the command with its output
//! redirected into a fixed-capacity capture buffer; the captured bytes form
//! the positive response payload. The capture is reset on every invocation,
//! so no state leaks between commands.

use std::io::Write;

use crate::protocol::{Nrc, RoutineControlType, SessionType, REMOTE_CONSOLE_RID};

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Capacity of the console capture buffer
pub const CONSOLE_CAPTURE_CAPACITY: usize = 4096;

/// Marker appended when command output exceeded the capture capacity
pub const TRUNCATION_MARKER: &str = "\n[TRUNCATED]\n";

/// Longest accepted command line
pub const CONSOLE_CMD_MAX: usize = 128;

/// Fixed-capacity capture buffer command output is redirected into.
///
/// Writes beyond the capacity keep what fits and append
/// [TRUNCATION_MARKER] once; later writes are swallowed.
#[derive(Debug)]
pub struct ConsoleCapture {
    buf: Vec<u8>,
    capacity: usize,
    overflow: bool,
}

impl ConsoleCapture {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            overflow: false,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.overflow = false;
    }

    /// Captured bytes, including the truncation marker if it applies
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// True once output was truncated
    pub fn overflowed(&self) -> bool {
        self.overflow
    }
}

impl Write for ConsoleCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.overflow {
            return Ok(data.len());
        }
        let available = self.capacity.saturating_sub(self.buf.len());
        if data.len() <= available {
            self.buf.extend_from_slice(data);
            return Ok(data.len());
        }
        let marker = TRUNCATION_MARKER.as_bytes();
        let keep = available.saturating_sub(marker.len());
        self.buf.extend_from_slice(&data[..keep]);
        if self.buf.len() + marker.len() > self.capacity {
            self.buf.truncate(self.capacity - marker.len());
        }
        self.buf.extend_from_slice(marker);
        self.overflow = true;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Host-supplied command executor. Writes whatever the command prints into
/// the capture buffer; must not block for longer than the client's P2*.
pub type CommandExecutor = Box<dyn FnMut(&str, &mut ConsoleCapture) -> std::io::Result<()> + Send>;

/// Configuration of the remote console service
pub struct ConsoleServiceConfig {
    /// The command executor
    pub executor: CommandExecutor,
    /// Require a non-default (extended or programming) session
    pub require_extended_session: bool,
    /// Minimum granted security level, 0 = none
    pub required_security_level: u8,
}

impl std::fmt::Debug for ConsoleServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleServiceConfig")
            .field("require_extended_session", &self.require_extended_session)
            .field("required_security_level", &self.required_security_level)
            .finish_non_exhaustive()
    }
}

impl ConsoleServiceConfig {
    /// Console with no session or security requirements
    pub fn open(executor: CommandExecutor) -> Self {
        Self {
            executor,
            require_extended_session: false,
            required_security_level: 0,
        }
    }
}

/// Mounts the remote console routine handler
pub fn mount_console_service(server: &mut UdsServer, config: ConsoleServiceConfig) -> ServiceHandle {
    let mut executor = config.executor;
    let require_session = config.require_extended_session;
    let required_level = config.required_security_level;
    let mut capture = ConsoleCapture::new(CONSOLE_CAPTURE_CAPACITY);

    let node = ServiceNode {
        event: UdsEvent::RoutineControl,
        priority: priority::NORMAL,
        name: "console_exec",
        handler: Box::new(move |state, data| {
            let EventData::RoutineControl(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            if args.id != REMOTE_CONSOLE_RID {
                return HandlerResult::Negative(Nrc::RequestOutOfRange);
            }
            if require_session
                && !matches!(
                    state.session_type,
                    SessionType::Extended | SessionType::Programming
                )
            {
                return HandlerResult::Negative(Nrc::ServiceNotSupportedInActiveSession);
            }
            if state.security_level < required_level {
                return HandlerResult::Negative(Nrc::SecurityAccessDenied);
            }
            if args.ctrl != RoutineControlType::Start {
                return HandlerResult::Negative(Nrc::SubFunctionNotSupported);
            }
            if args.option.is_empty() || args.option.len() > CONSOLE_CMD_MAX {
                return HandlerResult::Negative(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            let Ok(cmd) = std::str::from_utf8(&args.option) else {
                return HandlerResult::Negative(Nrc::IncorrectMessageLengthOrInvalidFormat);
            };

            log::debug!("remote exec: {cmd}");
            capture.reset();
            // Echo the command at the head of the capture for context
            let _ = writeln!(capture, "> {cmd}");
            if let Err(e) = executor(cmd, &mut capture) {
                log::error!("command executor failed: {e}");
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            }
            args.status = capture.as_bytes().to_vec();
            HandlerResult::Handled
        }),
    };
    let id = server.register(node);
    ServiceHandle::new(vec![id])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::test_support::{drain_responses, feed_sf, test_server};

    fn echo_console() -> ConsoleServiceConfig {
        ConsoleServiceConfig::open(Box::new(|cmd, capture| {
            writeln!(capture, "ran: {cmd}")
        }))
    }

    fn exec_request(cmd: &str) -> Vec<u8> {
        let mut pdu = vec![0x31, 0x01, 0xF0, 0x00];
        pdu.extend_from_slice(cmd.as_bytes());
        pdu
    }

    #[test]
    fn command_output_is_captured() {
        let (_clock, log, mut server) = test_server();
        mount_console_service(&mut server, echo_console());
        feed_sf(&mut server, &exec_request("ps"));
        let resp = drain_responses(&mut server, &log);
        assert_eq!(resp.len(), 1);
        assert_eq!(&resp[0][..4], &[0x71, 0x01, 0xF0, 0x00]);
        assert_eq!(
            std::str::from_utf8(&resp[0][4..]).unwrap(),
            "> ps\nran: ps\n"
        );
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let (_clock, log, mut server) = test_server();
        mount_console_service(
            &mut server,
            ConsoleServiceConfig::open(Box::new(|_, capture| {
                for _ in 0..600 {
                    writeln!(capture, "0123456789")?;
                }
                Ok(())
            })),
        );
        feed_sf(&mut server, &exec_request("s"));
        let resp = drain_responses(&mut server, &log);
        let body = &resp[0][4..];
        assert!(body.len() <= CONSOLE_CAPTURE_CAPACITY);
        assert!(
            std::str::from_utf8(body)
                .unwrap()
                .ends_with(TRUNCATION_MARKER)
        );
    }

    #[test]
    fn capture_resets_between_commands() {
        let (_clock, log, mut server) = test_server();
        mount_console_service(&mut server, echo_console());
        feed_sf(&mut server, &exec_request("one"));
        drain_responses(&mut server, &log);
        feed_sf(&mut server, &exec_request("two"));
        let resp = drain_responses(&mut server, &log);
        assert_eq!(
            std::str::from_utf8(&resp[0][4..]).unwrap(),
            "> two\nran: two\n"
        );
    }

    #[test]
    fn wrong_routine_id_and_sub_function() {
        let (_clock, log, mut server) = test_server();
        mount_console_service(&mut server, echo_console());
        feed_sf(&mut server, &[0x31, 0x01, 0x12, 0x34, 0x61]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x31, 0x31]]
        );
        feed_sf(&mut server, &[0x31, 0x02, 0xF0, 0x00, 0x61]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x31, 0x12]]
        );
    }

    #[test]
    fn gated_console_requires_session_and_security() {
        let (_clock, log, mut server) = test_server();
        crate::server::sessions::mount_session_service(&mut server);
        let mut cfg = echo_console();
        cfg.require_extended_session = true;
        cfg.required_security_level = 0x02;
        mount_console_service(&mut server, cfg);

        feed_sf(&mut server, &exec_request("ls"));
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x31, 0x7F]]
        );

        feed_sf(&mut server, &[0x10, 0x03]);
        drain_responses(&mut server, &log);
        feed_sf(&mut server, &exec_request("ls"));
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x31, 0x33]]
        );

        server.state_mut().security_level = 0x02;
        feed_sf(&mut server, &exec_request("ls"));
        let resp = drain_responses(&mut server, &log);
        assert_eq!(resp[0][0], 0x71);
    }
}
