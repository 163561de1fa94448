//! Built-in handlers for data identifier access (0x22 read / 0x2E write)
//!
//! Application data lives behind plain per-DID callbacks. The service keeps
//! a shared identifier table; a DID neither registered for reading nor
//! writing falls through the chain as request-out-of-range, so several
//! instances with disjoint tables can be mounted side by side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::Nrc;

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Callback producing the payload of a data identifier
pub type ReadHandler = Box<dyn FnMut() -> Result<Vec<u8>, Nrc> + Send>;

/// Callback storing the payload of a data identifier
pub type WriteHandler = Box<dyn FnMut(&[u8]) -> Result<(), Nrc> + Send>;

#[derive(Default)]
struct Entry {
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
}

/// Identifier table backing one mounted RDBI/WDBI service instance.
///
/// Clones share the same table, so identifiers may be registered before or
/// after mounting.
#[derive(Clone, Default)]
pub struct DataIdentService {
    table: Arc<Mutex<HashMap<u16, Entry>>>,
}

impl std::fmt::Debug for DataIdentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataIdentService")
            .field("identifiers", &self.table.lock().unwrap().len())
            .finish()
    }
}

impl DataIdentService {
    /// Creates an empty identifier table
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a read callback for a DID
    pub fn register_read(&self, did: u16, handler: ReadHandler) {
        self.table.lock().unwrap().entry(did).or_default().read = Some(handler);
    }

    /// Registers a write callback for a DID
    pub fn register_write(&self, did: u16, handler: WriteHandler) {
        self.table.lock().unwrap().entry(did).or_default().write = Some(handler);
    }

    /// Registers a read-only constant blob (identification data such as a VIN)
    pub fn register_const(&self, did: u16, value: Vec<u8>) {
        self.register_read(did, Box::new(move || Ok(value.clone())));
    }

    /// Registers a plain in-memory register: writes are stored, reads return
    /// the stored bytes verbatim.
    pub fn register_register(&self, did: u16, initial: Vec<u8>) {
        let cell = Arc::new(Mutex::new(initial));
        let read_cell = cell.clone();
        self.register_read(did, Box::new(move || Ok(read_cell.lock().unwrap().clone())));
        self.register_write(
            did,
            Box::new(move |data| {
                *cell.lock().unwrap() = data.to_vec();
                Ok(())
            }),
        );
    }

    /// Removes a DID from the table
    pub fn unregister(&self, did: u16) {
        self.table.lock().unwrap().remove(&did);
    }

    /// Mounts the RDBI and WDBI handler nodes
    pub fn mount(&self, server: &mut UdsServer) -> ServiceHandle {
        let read_table = self.table.clone();
        let rdbi_node = ServiceNode {
            event: UdsEvent::ReadDataByIdent,
            priority: priority::NORMAL,
            name: "param_rdbi",
            handler: Box::new(move |_, data| {
                let EventData::ReadDataByIdent(args) = data else {
                    return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
                };
                let mut table = read_table.lock().unwrap();
                let Some(read) = table.get_mut(&args.did).and_then(|e| e.read.as_mut()) else {
                    return HandlerResult::Negative(Nrc::RequestOutOfRange);
                };
                match read() {
                    Ok(payload) => {
                        log::debug!("RDBI 0x{:04X}: {} bytes", args.did, payload.len());
                        args.data = payload;
                        HandlerResult::Handled
                    }
                    Err(nrc) => HandlerResult::Negative(nrc),
                }
            }),
        };

        let write_table = self.table.clone();
        let wdbi_node = ServiceNode {
            event: UdsEvent::WriteDataByIdent,
            priority: priority::NORMAL,
            name: "param_wdbi",
            handler: Box::new(move |_, data| {
                let EventData::WriteDataByIdent(args) = data else {
                    return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
                };
                let mut table = write_table.lock().unwrap();
                let Some(write) = table.get_mut(&args.did).and_then(|e| e.write.as_mut()) else {
                    return HandlerResult::Negative(Nrc::RequestOutOfRange);
                };
                log::debug!("WDBI 0x{:04X}: {} bytes", args.did, args.data.len());
                match write(&args.data) {
                    Ok(()) => HandlerResult::Handled,
                    Err(nrc) => HandlerResult::Negative(nrc),
                }
            }),
        };

        let ids = vec![server.register(rdbi_node), server.register(wdbi_node)];
        ServiceHandle::new(ids)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::test_support::{drain_responses, feed_sf, test_server};

    #[test]
    fn vin_read() {
        let (_clock, log, mut server) = test_server();
        let params = DataIdentService::new();
        params.register_const(0xF190, b"0123456789A".to_vec());
        params.mount(&mut server);

        feed_sf(&mut server, &[0x22, 0xF1, 0x90]);
        let resp = drain_responses(&mut server, &log);
        assert_eq!(
            resp,
            vec![vec![
                0x62, 0xF1, 0x90, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x41
            ]]
        );
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_clock, log, mut server) = test_server();
        let params = DataIdentService::new();
        params.register_register(0x0100, vec![0x00]);
        params.mount(&mut server);

        feed_sf(&mut server, &[0x2E, 0x01, 0x00, 0xDE, 0xAD]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x6E, 0x01, 0x00]]
        );

        feed_sf(&mut server, &[0x22, 0x01, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x62, 0x01, 0x00, 0xDE, 0xAD]]
        );
    }

    #[test]
    fn unknown_did_is_out_of_range() {
        let (_clock, log, mut server) = test_server();
        let params = DataIdentService::new();
        params.register_const(0xF190, vec![0x01]);
        params.mount(&mut server);

        feed_sf(&mut server, &[0x22, 0xF1, 0x91]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x22, 0x31]]
        );
        // Read-only DID rejects writes the same way
        feed_sf(&mut server, &[0x2E, 0xF1, 0x90, 0x00]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x7F, 0x2E, 0x31]]
        );
    }

    #[test]
    fn two_tables_chain_together() {
        let (_clock, log, mut server) = test_server();
        let local = DataIdentService::new();
        local.register_const(0x0001, vec![0xAA]);
        local.mount(&mut server);
        let common = DataIdentService::new();
        common.register_const(0x0002, vec![0xBB]);
        common.mount(&mut server);

        feed_sf(&mut server, &[0x22, 0x00, 0x01]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x62, 0x00, 0x01, 0xAA]]
        );
        feed_sf(&mut server, &[0x22, 0x00, 0x02]);
        assert_eq!(
            drain_responses(&mut server, &log),
            vec![vec![0x62, 0x00, 0x02, 0xBB]]
        );
    }
}
