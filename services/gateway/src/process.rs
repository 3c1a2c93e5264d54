//! Process control: single-instance pid file and control signals.
//!
//! SIGHUP asks a running gateway to reload its configuration, SIGINT and
//! SIGTERM ask it to stop. The `reload` and `stop` commands deliver those
//! signals to the pid recorded in the pid file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tracing::{debug, info, warn};

/// Process control errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    #[error("no running instance found via {0}")]
    NotRunning(String),

    #[error("pid file {path}: {source}")]
    PidFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

/// Whether `pid` names a live process.
///
/// Probes with signal 0. A process we may not signal still exists.
pub fn is_running(pid: i32) -> bool {
    // 0 and negatives address process groups, never a single instance.
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The pid file guarding against a second instance.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, source: io::Error) -> ProcessError {
        ProcessError::PidFile {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// The recorded pid. `None` when the file is missing or unreadable as a
    /// pid.
    pub fn read(&self) -> Result<Option<i32>, ProcessError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.error(e)),
        }
    }

    /// Record this process, failing if a live process already holds the
    /// file. Stale files are overwritten.
    ///
    /// The file is removed when the returned guard drops.
    pub fn acquire(&self) -> Result<PidGuard, ProcessError> {
        if let Some(pid) = self.read()? {
            if is_running(pid) {
                return Err(ProcessError::AlreadyRunning { pid });
            }
            warn!(path = %self.path.display(), stale_pid = pid, "Overwriting stale pid file");
        }

        let pid = std::process::id();
        fs::write(&self.path, pid.to_string()).map_err(|e| self.error(e))?;
        debug!(path = %self.path.display(), pid = pid, "Pid file written");

        Ok(PidGuard {
            path: self.path.clone(),
        })
    }

    /// Deliver `signal` to the recorded process. Returns its pid.
    pub fn signal(&self, signal: Signal) -> Result<i32, ProcessError> {
        let pid = match self.read()? {
            Some(pid) if is_running(pid) => pid,
            _ => return Err(ProcessError::NotRunning(self.path.display().to_string())),
        };

        kill(Pid::from_raw(pid), signal).map_err(|source| ProcessError::Signal { pid, source })?;
        info!(pid = pid, signal = ?signal, "Signal sent");
        Ok(pid)
    }
}

/// Removes the pid file on drop.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// Operator requests delivered to a running gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Reload,
    Stop,
}

/// Control events from SIGHUP, SIGINT and SIGTERM.
pub struct ControlSignals {
    sighup: SignalStream,
    sigint: SignalStream,
    sigterm: SignalStream,
}

impl ControlSignals {
    /// Install the handlers. Must run inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sighup: signal(SignalKind::hangup())?,
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next event. `None` once no signal can arrive anymore.
    pub async fn recv(&mut self) -> Option<ControlEvent> {
        tokio::select! {
            Some(()) = self.sighup.recv() => Some(ControlEvent::Reload),
            Some(()) = self.sigint.recv() => Some(ControlEvent::Stop),
            Some(()) = self.sigterm.recv() => Some(ControlEvent::Stop),
            else => None,
        }
    }
}
