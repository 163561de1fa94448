//! Built-in handler for security access (0x27)
//!
//! Each mounted instance manages one security level with its own seed source
//! and seed-to-key transform, so multiple levels can coexist as separate
//! instances. The chain semantics make that work: an instance answers
//! sub-function-not-supported for levels it does not manage, letting the
//! next instance take the request.

use std::sync::{Arc, Mutex};

use crate::protocol::Nrc;

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Pluggable seed-to-key transform
pub type SeedKeyTransform = Box<dyn Fn(u32) -> u32 + Send>;

/// Pluggable seed generator
pub type SeedSource = Box<dyn FnMut() -> u32 + Send>;

/// Configuration of one security access instance
pub struct SecurityServiceConfig {
    /// The request-seed level this instance manages (odd)
    pub level: u8,
    /// Seed generator. `None` derives seeds from the server clock, which is
    /// fine for bench use but not for production.
    pub seed_source: Option<SeedSource>,
    /// Computes the expected key from a seed
    pub transform: SeedKeyTransform,
}

impl SecurityServiceConfig {
    /// Instance using the plain XOR-mask transform
    pub fn with_xor_mask(level: u8, mask: u32) -> Self {
        Self {
            level,
            seed_source: None,
            transform: Box::new(move |seed| seed ^ mask),
        }
    }
}

impl std::fmt::Debug for SecurityServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityServiceConfig")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

struct SecurityState {
    level: u8,
    seed_source: Option<SeedSource>,
    transform: SeedKeyTransform,
    /// Seed awaiting validation, 0 = none pending
    current_seed: u32,
}

/// Mounts a security access instance: one node for request-seed, one for
/// send-key, and a session-timeout observer that clears a pending seed.
pub fn mount_security_service(
    server: &mut UdsServer,
    config: SecurityServiceConfig,
) -> ServiceHandle {
    let shared = Arc::new(Mutex::new(SecurityState {
        level: config.level,
        seed_source: config.seed_source,
        transform: config.transform,
        current_seed: 0,
    }));

    let seed_ctx = shared.clone();
    let seed_node = ServiceNode {
        event: UdsEvent::SecurityRequestSeed,
        priority: priority::NORMAL,
        name: "security_seed",
        handler: Box::new(move |state, data| {
            let EventData::SecurityRequestSeed(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            let mut ctx = seed_ctx.lock().unwrap();
            if args.level != ctx.level {
                return HandlerResult::Negative(Nrc::SubFunctionNotSupported);
            }
            log::info!("request seed, level 0x{:02X}", args.level);

            // Already unlocked: the granted (even) level is request level + 1.
            // ISO 14229-1 requires a zero seed in that case.
            if state.security_level == args.level + 1 {
                log::debug!("already unlocked, sending zero seed");
                args.seed = vec![0, 0, 0, 0];
                return HandlerResult::Handled;
            }

            let seed = match ctx.seed_source.as_mut() {
                Some(src) => src(),
                None => state.now_ms() ^ 0x1234_5678,
            };
            // 0 marks "no seed pending", never hand it out
            let seed = if seed == 0 { 0x5A5A_5A5A } else { seed };
            ctx.current_seed = seed;
            args.seed = seed.to_be_bytes().to_vec();
            log::debug!("generated seed 0x{seed:08X}");
            HandlerResult::Handled
        }),
    };

    let key_ctx = shared.clone();
    let key_node = ServiceNode {
        event: UdsEvent::SecurityValidateKey,
        priority: priority::NORMAL,
        name: "security_key",
        handler: Box::new(move |_state, data| {
            let EventData::SecurityValidateKey(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            let mut ctx = key_ctx.lock().unwrap();
            if args.level != ctx.level {
                return HandlerResult::Negative(Nrc::SubFunctionNotSupported);
            }
            log::info!("validate key, level 0x{:02X}", args.level);
            if ctx.current_seed == 0 {
                log::warn!("key sent without a preceding seed request");
                return HandlerResult::Negative(Nrc::RequestSequenceError);
            }
            if args.key.len() != 4 {
                return HandlerResult::Negative(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            let received = u32::from_be_bytes([args.key[0], args.key[1], args.key[2], args.key[3]]);
            let expected = (ctx.transform)(ctx.current_seed);
            // Seeds are single use, cleared regardless of the outcome
            ctx.current_seed = 0;
            if received == expected {
                HandlerResult::Handled
            } else {
                log::warn!("invalid key, recv 0x{received:08X} expected 0x{expected:08X}");
                HandlerResult::Negative(Nrc::InvalidKey)
            }
        }),
    };

    let tmo_ctx = shared;
    let timeout_node = ServiceNode {
        event: UdsEvent::SessionTimeout,
        priority: priority::HIGH,
        name: "security_timeout",
        handler: Box::new(move |_, _| {
            let mut ctx = tmo_ctx.lock().unwrap();
            if ctx.current_seed != 0 {
                log::debug!("session timeout, clearing pending seed");
                ctx.current_seed = 0;
            }
            HandlerResult::Observed
        }),
    };

    let ids = vec![
        server.register(seed_node),
        server.register(key_node),
        server.register(timeout_node),
    ];
    ServiceHandle::new(ids)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::test_support::{drain_responses, feed_sf, test_server};

    fn fixed_seed_config() -> SecurityServiceConfig {
        SecurityServiceConfig {
            level: 0x01,
            seed_source: Some(Box::new(|| 0x1122_3344)),
            transform: Box::new(|seed| seed ^ 0xA5A5_A5A5),
        }
    }

    #[test]
    fn seed_then_key_grants_access() {
        let (_clock, log, mut server) = test_server();
        mount_security_service(&mut server, fixed_seed_config());

        feed_sf(&mut server, &[0x27, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x67, 0x01, 0x11, 0x22, 0x33, 0x44]]
        );

        // key = 0x11223344 ^ 0xA5A5A5A5 = 0xB48796E1
        feed_sf(&mut server, &[0x27, 0x02, 0xB4, 0x87, 0x96, 0xE1]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x67, 0x02]]
        );
        assert_eq!(server.state().security_level, 0x02);
    }

    #[test]
    fn key_without_seed_is_a_sequence_error() {
        let (_clock, log, mut server) = test_server();
        mount_security_service(&mut server, fixed_seed_config());
        feed_sf(&mut server, &[0x27, 0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x27, 0x24]]
        );
    }

    #[test]
    fn invalid_key_arms_the_delay_timer() {
        let (clock, log, mut server) = test_server();
        mount_security_service(&mut server, fixed_seed_config());
        feed_sf(&mut server, &[0x27, 0x01]);
        drain_responses(&mut server, &log);

        feed_sf(&mut server, &[0x27, 0x02, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x27, 0x35]]
        );
        assert_eq!(server.state().security_level, 0);

        // Every 0x27 request is inhibited while the delay runs
        feed_sf(&mut server, &[0x27, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x27, 0x37]]
        );

        // After the delay expires a new seed can be requested
        clock.advance(10_001);
        feed_sf(&mut server, &[0x27, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x67, 0x01, 0x11, 0x22, 0x33, 0x44]]
        );
    }

    #[test]
    fn seed_is_single_use() {
        let (_clock, log, mut server) = test_server();
        mount_security_service(&mut server, fixed_seed_config());
        feed_sf(&mut server, &[0x27, 0x01]);
        drain_responses(&mut server, &log);
        // Wrong key consumes the seed
        feed_sf(&mut server, &[0x27, 0x02, 0x00, 0x00, 0x00, 0x00]);
        drain_responses(&mut server, &log);
        // Right key now fails with sequence error: no seed pending
        // (and the server is inside the delay window anyway)
        let _ = server.state_mut().security_inhibit_until.take();
        feed_sf(&mut server, &[0x27, 0x02, 0xB4, 0x87, 0x96, 0xE1]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x27, 0x24]]
        );
    }

    #[test]
    fn unlocked_level_returns_zero_seed() {
        let (_clock, log, mut server) = test_server();
        mount_security_service(&mut server, fixed_seed_config());
        feed_sf(&mut server, &[0x27, 0x01]);
        drain_responses(&mut server, &log);
        feed_sf(&mut server, &[0x27, 0x02, 0xB4, 0x87, 0x96, 0xE1]);
        drain_responses(&mut server, &log);

        feed_sf(&mut server, &[0x27, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x67, 0x01, 0x00, 0x00, 0x00, 0x00]]
        );
    }

    #[test]
    fn foreign_level_falls_through_the_chain() {
        let (_clock, log, mut server) = test_server();
        mount_security_service(&mut server, fixed_seed_config());
        feed_sf(&mut server, &[0x27, 0x03]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x27, 0x12]]
        );
    }
}
