//! File transfer flows (0x38 / 0x36 / 0x37) and the raw memory transfer
//! request builders (0x34 / 0x35)
//!
//! Uploads stream local file chunks with a wrapping block sequence counter
//! and finish with the accumulated CRC-32; downloads request chunks until
//! the advertised size is reached or the server returns an empty block, then
//! verify the server's CRC-32 against the locally accumulated one.

use std::fs;
use std::path::Path;

use crate::helpers::{crc32, TransferProgress};
use crate::protocol::{FileModeOfOperation, ServiceId};
use crate::{DiagError, DiagServerResult};

use super::UdsDiagnosticClient;

/// Decoded positive response of RequestFileTransfer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileTransferResponse {
    /// Negotiated maxNumberOfBlockLength (SID + sequence byte included)
    pub max_block_len: u16,
    /// Size of the remote file, present on read requests
    pub file_size: Option<u64>,
}

/// Progress callback invoked after every transferred block
pub type ProgressSink<'a> = Option<&'a mut dyn FnMut(TransferProgress)>;

impl UdsDiagnosticClient {
    /// Issues a RequestFileTransfer (0x38).
    ///
    /// ## Parameters
    /// * mode - The mode of operation
    /// * remote_path - Path of the file on the server
    /// * file_size - Size announcement, required for add/replace
    pub fn request_file_transfer(
        &mut self,
        mode: FileModeOfOperation,
        remote_path: &str,
        file_size: Option<u32>,
    ) -> DiagServerResult<FileTransferResponse> {
        let path = remote_path.as_bytes();
        if path.is_empty() || path.len() > u16::MAX as usize {
            return Err(DiagError::ParameterInvalid);
        }
        let mut req = Vec::with_capacity(8 + path.len());
        req.push(ServiceId::RequestFileTransfer as u8);
        req.push(mode as u8);
        req.push((path.len() >> 8) as u8);
        req.push(path.len() as u8);
        req.extend_from_slice(path);
        match mode {
            FileModeOfOperation::AddFile | FileModeOfOperation::ReplaceFile => {
                let size = file_size.ok_or(DiagError::ParameterInvalid)?;
                req.push(0x00); // dataFormatIdentifier
                req.push(0x04); // fileSizeParameterLength
                req.extend_from_slice(&size.to_be_bytes());
                req.extend_from_slice(&size.to_be_bytes());
            }
            FileModeOfOperation::ReadFile => req.push(0x00),
            _ => {}
        }
        let resp = self.execute(&req)?;
        parse_file_transfer_response(&resp)
    }

    /// Issues a TransferData (0x36). For uploads `data` carries the block;
    /// an empty `data` requests the next download chunk. Returns the
    /// response payload behind the sequence echo.
    pub fn transfer_data(&mut self, sequence: u8, data: &[u8]) -> DiagServerResult<Vec<u8>> {
        let mut req = Vec::with_capacity(2 + data.len());
        req.push(ServiceId::TransferData as u8);
        req.push(sequence);
        req.extend_from_slice(data);
        let resp = self.execute(&req)?;
        if resp.len() < 2 {
            return Err(DiagError::InvalidResponseLength);
        }
        if resp[1] != sequence {
            return Err(DiagError::MismatchedResponse(format!(
                "block sequence echo {} != {sequence}",
                resp[1]
            )));
        }
        Ok(resp[2..].to_vec())
    }

    /// Issues a RequestTransferExit (0x37) and returns the response
    /// parameter record
    pub fn transfer_exit(&mut self, data: &[u8]) -> DiagServerResult<Vec<u8>> {
        let mut req = Vec::with_capacity(1 + data.len());
        req.push(ServiceId::RequestTransferExit as u8);
        req.extend_from_slice(data);
        let resp = self.execute(&req)?;
        Ok(resp[1..].to_vec())
    }

    /// Issues a RequestDownload (0x34) with 4-byte address and size fields
    /// and returns the raw response
    pub fn request_download(&mut self, address: u32, size: u32) -> DiagServerResult<Vec<u8>> {
        let mut req = vec![ServiceId::RequestDownload as u8, 0x00, 0x44];
        req.extend_from_slice(&address.to_be_bytes());
        req.extend_from_slice(&size.to_be_bytes());
        self.execute(&req)
    }

    /// Issues a RequestUpload (0x35) with 4-byte address and size fields
    /// and returns the raw response
    pub fn request_upload(&mut self, address: u32, size: u32) -> DiagServerResult<Vec<u8>> {
        let mut req = vec![ServiceId::RequestUpload as u8, 0x00, 0x44];
        req.extend_from_slice(&address.to_be_bytes());
        req.extend_from_slice(&size.to_be_bytes());
        self.execute(&req)
    }

    /// Uploads a local file to the server.
    ///
    /// ## Parameters
    /// * local_path - File to read on this machine
    /// * remote_path - Target path on the server
    /// * progress - Invoked after every transferred block
    pub fn upload_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        mut progress: ProgressSink<'_>,
    ) -> DiagServerResult<()> {
        let payload = fs::read(local_path)?;
        let total = payload.len() as u64;
        log::info!("uploading {local_path:?} ({total} bytes) to {remote_path}");

        let resp = self.request_file_transfer(
            FileModeOfOperation::AddFile,
            remote_path,
            Some(payload.len() as u32),
        )?;
        let chunk_len = block_payload_len(resp.max_block_len);

        let mut seq: u8 = 1;
        let mut sent = 0u64;
        let mut crc = 0u32;
        for chunk in payload.chunks(chunk_len) {
            crc = crc32(crc, chunk);
            self.transfer_data(seq, chunk)?;
            seq = seq.wrapping_add(1);
            sent += chunk.len() as u64;
            if let Some(cb) = progress.as_mut() {
                cb(TransferProgress {
                    current: sent,
                    total,
                });
            }
        }

        self.transfer_exit(&crc.to_be_bytes())?;
        log::info!("upload complete, CRC 0x{crc:08X}");
        Ok(())
    }

    /// Downloads a file from the server.
    ///
    /// ## Parameters
    /// * remote_path - File to read on the server
    /// * local_path - Target path on this machine
    /// * progress - Invoked after every received block
    pub fn download_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        mut progress: ProgressSink<'_>,
    ) -> DiagServerResult<()> {
        let resp =
            self.request_file_transfer(FileModeOfOperation::ReadFile, remote_path, None)?;
        let total = resp.file_size.unwrap_or(0);
        log::info!("downloading {remote_path} ({total} bytes) to {local_path:?}");

        let mut received: Vec<u8> = Vec::new();
        let mut seq: u8 = 1;
        let mut crc = 0u32;
        loop {
            let chunk = self.transfer_data(seq, &[])?;
            if chunk.is_empty() {
                break;
            }
            crc = crc32(crc, &chunk);
            received.extend_from_slice(&chunk);
            seq = seq.wrapping_add(1);
            if let Some(cb) = progress.as_mut() {
                cb(TransferProgress {
                    current: received.len() as u64,
                    total,
                });
            }
            if total > 0 && received.len() as u64 >= total {
                break;
            }
        }

        let exit = self.transfer_exit(&[])?;
        if exit.len() >= 4 {
            let server_crc = u32::from_be_bytes([exit[0], exit[1], exit[2], exit[3]]);
            if server_crc != crc {
                return Err(DiagError::MismatchedResponse(format!(
                    "CRC32 mismatch: server 0x{server_crc:08X}, local 0x{crc:08X}"
                )));
            }
        }
        fs::write(local_path, &received)?;
        log::info!("download complete, {} bytes, CRC 0x{crc:08X}", received.len());
        Ok(())
    }
}

/// Usable data bytes per TransferData block: the negotiated block length
/// minus the SID and sequence bytes. Implausibly small advertisements fall
/// back to the protocol maximum.
fn block_payload_len(max_block_len: u16) -> usize {
    let effective = if max_block_len < 3 {
        4095
    } else {
        max_block_len as usize
    };
    effective - 2
}

fn parse_file_transfer_response(resp: &[u8]) -> DiagServerResult<FileTransferResponse> {
    if resp.len() < 2 {
        return Err(DiagError::InvalidResponseLength);
    }
    // Delete responses end after the mode echo
    if resp.len() == 2 {
        return Ok(FileTransferResponse {
            max_block_len: 0,
            file_size: None,
        });
    }
    let lfi = resp[2] as usize;
    if lfi == 0 || lfi > 2 || resp.len() < 3 + lfi + 1 {
        return Err(DiagError::InvalidResponseLength);
    }
    let mut max_block_len = 0u16;
    for b in &resp[3..3 + lfi] {
        max_block_len = (max_block_len << 8) | *b as u16;
    }
    // Skip the dataFormatIdentifier
    let mut idx = 3 + lfi + 1;
    let mut file_size = None;
    if idx < resp.len() {
        let fs_len = resp[idx] as usize;
        idx += 1;
        if fs_len == 0 || fs_len > 8 || resp.len() < idx + fs_len {
            return Err(DiagError::InvalidResponseLength);
        }
        let mut size = 0u64;
        for b in &resp[idx..idx + fs_len] {
            size = (size << 8) | *b as u64;
        }
        file_size = Some(size);
    }
    Ok(FileTransferResponse {
        max_block_len,
        file_size,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_upload_grant() {
        let resp = [0x78, 0x01, 0x02, 0x04, 0x00, 0x00];
        assert_eq!(
            parse_file_transfer_response(&resp).unwrap(),
            FileTransferResponse {
                max_block_len: 0x0400,
                file_size: None,
            }
        );
    }

    #[test]
    fn parse_read_grant_with_size() {
        let mut resp = vec![0x78, 0x04, 0x02, 0x04, 0x00, 0x00, 0x04];
        resp.extend_from_slice(&300u32.to_be_bytes());
        resp.extend_from_slice(&300u32.to_be_bytes());
        assert_eq!(
            parse_file_transfer_response(&resp).unwrap(),
            FileTransferResponse {
                max_block_len: 0x0400,
                file_size: Some(300),
            }
        );
    }

    #[test]
    fn parse_delete_ack() {
        assert_eq!(
            parse_file_transfer_response(&[0x78, 0x02]).unwrap(),
            FileTransferResponse {
                max_block_len: 0,
                file_size: None,
            }
        );
    }

    #[test]
    fn block_payload_guard() {
        assert_eq!(block_payload_len(0), 4093);
        assert_eq!(block_payload_len(1024), 1022);
    }
}
