//! Built-in handlers for the file transfer subset (0x38 / 0x36 / 0x37)
//!
//! At most one transfer session runs per mounted instance. RequestFileTransfer
//! opens or creates the target path and negotiates the block length,
//! TransferData moves blocks while a CRC-32 runs over every byte, and
//! RequestTransferExit verifies (upload) or reports (download) the checksum.
//! Any terminal path - exit, CRC mismatch, session timeout - closes the file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::helpers::crc32;
use crate::protocol::{FileModeOfOperation, Nrc};

use super::dispatcher::{priority, EventData, HandlerResult, ServiceNode, UdsEvent};
use super::{ServiceHandle, UdsServer};

/// Server-side configuration of the file transfer service
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileTransferConfig {
    /// Upper bound on the negotiated maxNumberOfBlockLength, typically the
    /// size of the server's file IO buffer
    pub chunk_limit: u16,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self { chunk_limit: 1024 }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TransferMode {
    Idle,
    /// Upload, client to server
    Writing,
    /// Download, server to client
    Reading,
}

struct TransferState {
    file: Option<File>,
    mode: TransferMode,
    path: PathBuf,
    total_size: u64,
    offset: u64,
    crc: u32,
    chunk_limit: u16,
}

impl TransferState {
    fn close(&mut self) {
        self.file = None;
        self.mode = TransferMode::Idle;
    }
}

/// Mounts the file transfer service: request, data, exit, and a
/// session-timeout observer that abandons a running transfer.
pub fn mount_file_transfer_service(
    server: &mut UdsServer,
    config: FileTransferConfig,
) -> ServiceHandle {
    let shared = Arc::new(Mutex::new(TransferState {
        file: None,
        mode: TransferMode::Idle,
        path: PathBuf::new(),
        total_size: 0,
        offset: 0,
        crc: 0,
        chunk_limit: config.chunk_limit,
    }));

    let req_ctx = shared.clone();
    let req_node = ServiceNode {
        event: UdsEvent::RequestFileTransfer,
        priority: priority::NORMAL,
        name: "file_req",
        handler: Box::new(move |_, data| {
            let EventData::RequestFileTransfer(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            let mut ctx = req_ctx.lock().unwrap();

            // A new request abandons any previous session
            if ctx.file.is_some() {
                log::warn!("abandoning unfinished transfer of {:?}", ctx.path);
                ctx.close();
            }

            args.max_block_len = args.max_block_len.min(ctx.chunk_limit);
            ctx.crc = 0;
            ctx.offset = 0;
            ctx.path = PathBuf::from(&args.path);

            match args.mode {
                FileModeOfOperation::AddFile | FileModeOfOperation::ReplaceFile => {
                    let file = match OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&ctx.path)
                    {
                        Ok(f) => f,
                        Err(e) => {
                            log::error!("cannot create {:?}: {e}", ctx.path);
                            return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
                        }
                    };
                    ctx.file = Some(file);
                    ctx.total_size = args.file_size;
                    ctx.mode = TransferMode::Writing;
                    log::info!(
                        "upload of {:?} started ({} bytes announced)",
                        ctx.path,
                        ctx.total_size
                    );
                    HandlerResult::Handled
                }
                FileModeOfOperation::ReadFile => {
                    let file = match File::open(&ctx.path) {
                        Ok(f) => f,
                        Err(e) => {
                            log::warn!("cannot open {:?}: {e}", ctx.path);
                            return HandlerResult::Negative(Nrc::RequestOutOfRange);
                        }
                    };
                    let size = match file.metadata() {
                        Ok(m) => m.len(),
                        Err(_) => return HandlerResult::Negative(Nrc::ConditionsNotCorrect),
                    };
                    ctx.file = Some(file);
                    ctx.total_size = size;
                    ctx.mode = TransferMode::Reading;
                    args.response_file_size = Some(size);
                    log::info!("download of {:?} started ({size} bytes)", ctx.path);
                    HandlerResult::Handled
                }
                FileModeOfOperation::DeleteFile => {
                    match fs::remove_file(&ctx.path) {
                        Ok(()) => {
                            log::info!("deleted {:?}", ctx.path);
                            HandlerResult::Handled
                        }
                        Err(e) => {
                            log::warn!("cannot delete {:?}: {e}", ctx.path);
                            HandlerResult::Negative(Nrc::RequestOutOfRange)
                        }
                    }
                }
                FileModeOfOperation::ResumeFile => {
                    HandlerResult::Negative(Nrc::SubFunctionNotSupported)
                }
            }
        }),
    };

    let data_ctx = shared.clone();
    let data_node = ServiceNode {
        event: UdsEvent::TransferData,
        priority: priority::NORMAL,
        name: "file_data",
        handler: Box::new(move |_, data| {
            let EventData::TransferData(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            let mut ctx = data_ctx.lock().unwrap();
            if ctx.file.is_none() {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            }
            match ctx.mode {
                TransferMode::Writing => {
                    let payload = std::mem::take(&mut args.data);
                    if let Err(e) = ctx.file.as_mut().unwrap().write_all(&payload) {
                        log::error!("write failed at offset {}: {e}", ctx.offset);
                        ctx.close();
                        return HandlerResult::Negative(Nrc::GeneralProgrammingFailure);
                    }
                    ctx.offset += payload.len() as u64;
                    ctx.crc = crc32(ctx.crc, &payload);
                    HandlerResult::Handled
                }
                TransferMode::Reading => {
                    // The response carries SID + sequence ahead of the data
                    let budget = (args.max_resp_len as usize)
                        .min(ctx.chunk_limit as usize)
                        .saturating_sub(2);
                    let mut buf = vec![0u8; budget];
                    let n = match ctx.file.as_mut().unwrap().read(&mut buf) {
                        Ok(n) => n,
                        Err(e) => {
                            log::error!("read failed at offset {}: {e}", ctx.offset);
                            ctx.close();
                            return HandlerResult::Negative(Nrc::GeneralProgrammingFailure);
                        }
                    };
                    buf.truncate(n);
                    ctx.offset += n as u64;
                    ctx.crc = crc32(ctx.crc, &buf);
                    args.response = buf;
                    HandlerResult::Handled
                }
                TransferMode::Idle => HandlerResult::Negative(Nrc::ConditionsNotCorrect),
            }
        }),
    };

    let exit_ctx = shared.clone();
    let exit_node = ServiceNode {
        event: UdsEvent::RequestTransferExit,
        priority: priority::NORMAL,
        name: "file_exit",
        handler: Box::new(move |_, data| {
            let EventData::RequestTransferExit(args) = data else {
                return HandlerResult::Negative(Nrc::ConditionsNotCorrect);
            };
            let mut ctx = exit_ctx.lock().unwrap();
            if ctx.file.is_none() {
                return HandlerResult::Negative(Nrc::RequestSequenceError);
            }
            match ctx.mode {
                TransferMode::Writing => {
                    if args.data.len() >= 4 {
                        let client_crc = u32::from_be_bytes([
                            args.data[0],
                            args.data[1],
                            args.data[2],
                            args.data[3],
                        ]);
                        if client_crc != ctx.crc {
                            log::error!(
                                "CRC32 mismatch, server 0x{:08X} client 0x{client_crc:08X}",
                                ctx.crc
                            );
                            ctx.close();
                            let _ = fs::remove_file(&ctx.path);
                            return HandlerResult::Negative(Nrc::GeneralProgrammingFailure);
                        }
                    }
                    log::info!(
                        "upload of {:?} complete ({} bytes, CRC 0x{:08X})",
                        ctx.path,
                        ctx.offset,
                        ctx.crc
                    );
                    ctx.close();
                    HandlerResult::Handled
                }
                TransferMode::Reading => {
                    args.response = ctx.crc.to_be_bytes().to_vec();
                    log::info!(
                        "download of {:?} complete ({} bytes, CRC 0x{:08X})",
                        ctx.path,
                        ctx.offset,
                        ctx.crc
                    );
                    ctx.close();
                    HandlerResult::Handled
                }
                TransferMode::Idle => HandlerResult::Negative(Nrc::RequestSequenceError),
            }
        }),
    };

    let tmo_ctx = shared;
    let timeout_node = ServiceNode {
        event: UdsEvent::SessionTimeout,
        priority: priority::HIGHEST,
        name: "file_timeout",
        handler: Box::new(move |_, _| {
            let mut ctx = tmo_ctx.lock().unwrap();
            if ctx.file.is_some() {
                log::warn!("session timeout, closing {:?}", ctx.path);
                ctx.close();
            }
            HandlerResult::Observed
        }),
    };

    let ids = vec![
        server.register(req_node),
        server.register(data_node),
        server.register(exit_node),
        server.register(timeout_node),
    ];
    ServiceHandle::new(ids)
}
