//! Provides methods for security seed/key access to unlock protected
//! server functions
//!
//! The full sequence is two transactions: request-seed at the odd level,
//! then send-key at level + 1 with the key computed by the caller-supplied
//! transform. A zero seed means the level is already unlocked and the key
//! step is skipped.

use crate::protocol::ServiceId;
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Requests a security seed (0x27, odd sub-function) and returns the raw
    /// seed bytes.
    pub fn security_request_seed(&mut self, level: u8) -> DiagServerResult<Vec<u8>> {
        if level % 2 == 0 {
            return Err(DiagError::ParameterInvalid);
        }
        let mut resp = self.execute(&[ServiceId::SecurityAccess as u8, level])?;
        if resp.len() < 2 || resp[1] != level {
            return Err(DiagError::MismatchedResponse(format!(
                "seed response for level 0x{:02X}",
                resp.get(1).copied().unwrap_or(0)
            )));
        }
        resp.drain(0..2);
        Ok(resp)
    }

    /// Sends the computed key (0x27, even sub-function)
    pub fn security_send_key(&mut self, level: u8, key: &[u8]) -> DiagServerResult<()> {
        let mut req = Vec::with_capacity(2 + key.len());
        req.push(ServiceId::SecurityAccess as u8);
        req.push(level + 1);
        req.extend_from_slice(key);
        self.execute(&req).map(|_| ())
    }

    /// Performs the full seed/key unlock sequence for one level.
    ///
    /// ## Parameters
    /// * level - The security level to unlock (odd)
    /// * transform - Computes the key from the received 32bit seed; must
    ///   match the algorithm the server validates with
    pub fn security_unlock<F>(&mut self, level: u8, transform: F) -> DiagServerResult<()>
    where
        F: Fn(u32) -> u32,
    {
        log::info!("starting security access, level 0x{level:02X}");
        let seed = self.security_request_seed(level)?;

        // A missing or all-zero seed signals the level is already unlocked
        if seed.is_empty() || seed.iter().all(|b| *b == 0) {
            log::info!("already unlocked");
            return Ok(());
        }
        if seed.len() != 4 {
            return Err(DiagError::InvalidResponseLength);
        }
        let seed_val = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]);
        let key_val = transform(seed_val);
        log::debug!("seed 0x{seed_val:08X} -> key 0x{key_val:08X}");

        self.security_send_key(level, &key_val.to_be_bytes())?;
        log::info!("security access granted");
        Ok(())
    }
}
