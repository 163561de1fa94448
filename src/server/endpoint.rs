//! Worker thread runner for a server instance
//!
//! One dedicated thread per endpoint pumps the inbound frame queue into the
//! server and drives its timers. While a segmented send is in progress the
//! queue wait drops to zero so consecutive frames stay tight against STmin;
//! otherwise the worker blocks for the poll interval and yields the CPU.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::channel::{ChannelError, FrameReceiver};

use super::UdsServer;

/// Poll cadence while idle; no protocol timer is finer than this
const IDLE_POLL_MS: u32 = 10;

/// Handle of a running server worker
#[derive(Debug)]
pub struct ServerEndpoint {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<UdsServer>>,
}

impl ServerEndpoint {
    /// Spawns the worker thread. The driver side keeps the matching
    /// [FrameSender](crate::channel::FrameSender) and feeds received frames in.
    pub fn spawn(mut server: UdsServer, rx: FrameReceiver) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_t = running.clone();

        let thread = std::thread::spawn(move || {
            log::info!("UDS server worker started");
            while running_t.load(Ordering::Relaxed) {
                let timeout = if server.sending_in_progress() {
                    0
                } else {
                    IDLE_POLL_MS
                };
                match rx.recv(timeout) {
                    Ok(frame) => server.on_can_frame(&frame),
                    Err(ChannelError::Timeout) => {}
                    Err(e) => {
                        log::error!("frame queue failed: {e}, stopping worker");
                        break;
                    }
                }
                server.poll();
                if timeout == 0 {
                    std::thread::yield_now();
                }
            }
            log::info!("UDS server worker stopped");
            server
        });

        Self {
            running,
            thread: Some(thread),
        }
    }

    /// True while the worker is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the worker and returns the server for inspection or reuse
    pub fn stop(mut self) -> Option<UdsServer> {
        self.running.store(false, Ordering::Relaxed);
        self.thread.take().and_then(|t| t.join().ok())
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
