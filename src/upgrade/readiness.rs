//! Readiness rendezvous between a parent and its successor.
//!
//! The parent keeps one end of a Unix stream pair; the child finds the other
//! end at `READY_PIPE_FD` and writes `READY_TOKEN` once it can serve.

use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::config::{ReadinessMode, UpgradeConfig};
use crate::net::descriptor::{self, READY_PIPE_ENV, READY_PIPE_FD};
use crate::upgrade::SpawnError;

/// Bytes a ready child writes to its parent.
pub const READY_TOKEN: &[u8; 2] = b"OK";

/// How the self-managed strategy waits for its successor before draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessWait {
    /// Drain right after spawning.
    #[default]
    Disabled,
    /// Drain after a fixed pause.
    Delay(Duration),
    /// Drain once the child reports readiness; give up after `timeout`.
    Handshake { timeout: Duration },
}

impl ReadinessWait {
    pub fn from_config(config: &UpgradeConfig) -> Self {
        match config.readiness {
            ReadinessMode::Disabled => ReadinessWait::Disabled,
            ReadinessMode::Delay => {
                ReadinessWait::Delay(Duration::from_millis(config.readiness_delay_ms))
            }
            ReadinessMode::Handshake => ReadinessWait::Handshake {
                timeout: Duration::from_secs(config.readiness_timeout_secs),
            },
        }
    }

    pub fn needs_pipe(&self) -> bool {
        matches!(self, ReadinessWait::Handshake { .. })
    }
}

/// Parent end of a readiness pipe.
#[derive(Debug)]
pub struct ReadinessPipe {
    stream: UnixStream,
}

/// Create a readiness pipe: the parent end and the descriptor for the child.
pub fn pipe() -> io::Result<(ReadinessPipe, OwnedFd)> {
    let (parent, child) = UnixStream::pair()?;
    Ok((ReadinessPipe { stream: parent }, OwnedFd::from(child)))
}

impl ReadinessPipe {
    /// Wait until the child at `pid` writes its token, closes the pipe, or
    /// `timeout` elapses.
    pub async fn wait(self, pid: u32, timeout: Duration) -> Result<(), SpawnError> {
        let failed = |reason: String| SpawnError::ReadinessFailed { pid, reason };

        self.stream
            .set_nonblocking(true)
            .map_err(|e| failed(e.to_string()))?;
        let mut stream =
            tokio::net::UnixStream::from_std(self.stream).map_err(|e| failed(e.to_string()))?;

        let mut token = [0u8; 2];
        match tokio::time::timeout(timeout, stream.read_exact(&mut token)).await {
            Err(_) => Err(SpawnError::ReadinessTimeout { pid, timeout }),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(failed("pipe closed before readiness".to_string()))
            }
            Ok(Err(e)) => Err(failed(e.to_string())),
            Ok(Ok(_)) if &token == READY_TOKEN => Ok(()),
            Ok(Ok(_)) => Err(failed(format!("unexpected token {:?}", token))),
        }
    }
}

/// Child side: report readiness if the parent handed us a pipe.
///
/// Returns `Ok(false)` when this process was not started with a pipe, or
/// when readiness was already reported.
pub fn notify_parent() -> io::Result<bool> {
    if !descriptor::env_marker(READY_PIPE_ENV) {
        return Ok(false);
    }
    let pipe = match descriptor::claim_inherited(READY_PIPE_FD) {
        Ok(pipe) => pipe,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut stream = UnixStream::from(pipe);
    stream.write_all(READY_TOKEN)?;
    Ok(true)
}
