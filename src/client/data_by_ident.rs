//! Data identifier access (0x22 read / 0x2E write)

use crate::helpers::hex_ascii_dump;
use crate::protocol::ServiceId;
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

impl UdsDiagnosticClient {
    /// Reads a data identifier (0x22) and returns its payload with the SID
    /// and DID echo stripped.
    ///
    /// ## Parameters
    /// * did - The 16bit data identifier to read
    pub fn read_data_by_identifier(&mut self, did: u16) -> DiagServerResult<Vec<u8>> {
        let resp = self.execute(&[
            ServiceId::ReadDataByIdentifier as u8,
            (did >> 8) as u8,
            did as u8,
        ])?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        let echoed = ((resp[1] as u16) << 8) | resp[2] as u16;
        if echoed != did {
            return Err(DiagError::MismatchedResponse(format!(
                "DID echo 0x{echoed:04X}, requested 0x{did:04X}"
            )));
        }
        Ok(resp[3..].to_vec())
    }

    /// Writes a data identifier (0x2E)
    ///
    /// ## Parameters
    /// * did - The 16bit data identifier to write
    /// * data - The payload to store
    pub fn write_data_by_identifier(&mut self, did: u16, data: &[u8]) -> DiagServerResult<()> {
        let mut req = Vec::with_capacity(3 + data.len());
        req.push(ServiceId::WriteDataByIdentifier as u8);
        req.push((did >> 8) as u8);
        req.push(did as u8);
        req.extend_from_slice(data);
        let resp = self.execute(&req)?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        let echoed = ((resp[1] as u16) << 8) | resp[2] as u16;
        if echoed != did {
            return Err(DiagError::MismatchedResponse(format!(
                "DID echo 0x{echoed:04X}, requested 0x{did:04X}"
            )));
        }
        Ok(())
    }

    /// Registers the default 0x62 listener that logs every RDBI payload as a
    /// hex + ASCII dump.
    pub fn install_rdbi_printer(&mut self) {
        self.client_mut().register_response_listener(
            ServiceId::ReadDataByIdentifier.response_sid(),
            Box::new(|pdu| {
                if pdu.len() < 3 {
                    return;
                }
                let did = ((pdu[1] as u16) << 8) | pdu[2] as u16;
                log::info!("DID 0x{did:04X}: {}", hex_ascii_dump(&pdu[3..]));
            }),
        );
    }
}
