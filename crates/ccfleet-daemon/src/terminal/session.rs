//! A single PTY-backed session.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use portable_pty::{ChildKiller, MasterPty, PtySize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{TerminalError, TerminalEvent};
use crate::monitor::OutputAnalyzer;

/// Live PTY handles and the session's event channel.
pub(crate) struct TerminalSession {
    pub session_id: String,
    pub connection_id: String,
    pub pid: Option<u32>,
    pub event_tx: broadcast::Sender<TerminalEvent>,
    pub analyzer: Option<Arc<OutputAnalyzer>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: AtomicBool,
}

impl TerminalSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        connection_id: String,
        pid: Option<u32>,
        event_tx: broadcast::Sender<TerminalEvent>,
        analyzer: Option<Arc<OutputAnalyzer>>,
        master: Box<dyn MasterPty + Send>,
        writer: Box<dyn Write + Send>,
        killer: Box<dyn ChildKiller + Send + Sync>,
    ) -> Self {
        Self {
            session_id,
            connection_id,
            pid,
            event_tx,
            analyzer,
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            exited: AtomicBool::new(false),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Mark the session exited. Returns `false` if it already was.
    pub fn mark_exited(&self) -> bool {
        !self.exited.swap(true, Ordering::SeqCst)
    }

    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Pty(e.to_string()))
    }

    /// Ask the process to stop with SIGTERM. Falls back to the PTY killer
    /// when there is no pid or the signal cannot be delivered.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: pid belongs to a child we spawned and still track.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret == 0 {
                debug!(session_id = %self.session_id, pid, "Sent SIGTERM");
                return;
            }
            let err = std::io::Error::last_os_error();
            warn!(session_id = %self.session_id, pid, error = %err, "Failed to send SIGTERM");
        }
        self.kill();
    }

    /// Kill the process outright.
    pub fn kill(&self) {
        if let Err(e) = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
        {
            debug!(session_id = %self.session_id, error = %e, "Kill failed");
        }
    }
}
