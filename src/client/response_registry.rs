//! Response registry: positive responses dispatched by their SID
//!
//! Service modules subscribe to the response SIDs they care about (e.g. the
//! RDBI printer on 0x62). Listeners produce side effects only; transaction
//! success is judged solely by the client core's P2 bookkeeping.

use std::collections::HashMap;

/// Listener invoked with the full response PDU, SID included
pub type ResponseListener = Box<dyn FnMut(&[u8]) + Send>;

/// Response-SID to listener mapping
#[derive(Default)]
pub struct ResponseRegistry {
    table: HashMap<u8, ResponseListener>,
}

impl std::fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRegistry")
            .field("listeners", &self.table.len())
            .finish()
    }
}

impl ResponseRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the listener for a response SID, replacing any previous one
    pub fn register(&mut self, sid: u8, listener: ResponseListener) {
        if self.table.insert(sid, listener).is_some() {
            log::debug!("listener for response SID 0x{sid:02X} replaced");
        }
    }

    /// Removes the listener for a response SID
    pub fn unregister(&mut self, sid: u8) {
        self.table.remove(&sid);
    }

    /// Invokes the listener matching the response's first byte, if any
    pub fn dispatch(&mut self, pdu: &[u8]) {
        let Some(&sid) = pdu.first() else {
            return;
        };
        if let Some(listener) = self.table.get_mut(&sid) {
            listener(pdu);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dispatch_routes_by_sid() {
        let mut reg = ResponseRegistry::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits_c = hits.clone();
        reg.register(
            0x62,
            Box::new(move |pdu| hits_c.lock().unwrap().push(pdu.to_vec())),
        );
        reg.dispatch(&[0x62, 0x01]);
        reg.dispatch(&[0x71, 0x01]); // no listener: ignored
        assert_eq!(*hits.lock().unwrap(), vec![vec![0x62, 0x01]]);
    }

    #[test]
    fn re_registration_overwrites() {
        let mut reg = ResponseRegistry::new();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));
        let f = first.clone();
        reg.register(0x62, Box::new(move |_| *f.lock().unwrap() += 1));
        let s = second.clone();
        reg.register(0x62, Box::new(move |_| *s.lock().unwrap() += 1));
        reg.dispatch(&[0x62]);
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }
}
