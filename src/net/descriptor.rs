//! Descriptor-slot protocol between a parent and its replacement.
//!
//! A replacement process finds its listening socket at a fixed slot, directly
//! after stdin/stdout/stderr, and learns that it should look there from an
//! environment marker. With a readiness handshake the write end of a pipe
//! sits in the slot after it.

use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};

/// Slot holding the inherited listening socket.
pub const LISTENER_FD: RawFd = 3;

/// Slot holding the readiness pipe, when one is handed over.
pub const READY_PIPE_FD: RawFd = 4;

/// Environment marker telling a process to inherit instead of bind.
pub const RELOAD_MARKER_ENV: &str = "GRACEFUL_RESTART";

/// Environment marker telling a process that `READY_PIPE_FD` is open.
pub const READY_PIPE_ENV: &str = "GRACEFUL_READY_PIPE";

/// Value written into both markers.
pub const MARKER_VALUE: &str = "true";

/// Interpret a marker value. Only `true`/`1` (any case) count as set.
pub fn marker_is_set(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some(v) if v.eq_ignore_ascii_case("true") || v == "1")
}

/// Read a marker from this process's environment.
pub fn env_marker(name: &str) -> bool {
    marker_is_set(std::env::var(name).ok().as_deref())
}

/// Set once the protocol slots have been claimed, successfully or not.
static LISTENER_CLAIMED: AtomicBool = AtomicBool::new(false);
static READY_PIPE_CLAIMED: AtomicBool = AtomicBool::new(false);

fn claim_flag(fd: RawFd) -> Option<&'static AtomicBool> {
    match fd {
        LISTENER_FD => Some(&LISTENER_CLAIMED),
        READY_PIPE_FD => Some(&READY_PIPE_CLAIMED),
        _ => None,
    }
}

/// Take ownership of a descriptor inherited at `fd`.
///
/// Fails with `NotFound` when nothing is open at that slot. The descriptor is
/// marked close-on-exec so it does not leak into unrelated children.
///
/// `LISTENER_FD` and `READY_PIPE_FD` can be claimed once per process. Any later
/// attempt fails with `AlreadyExists` without touching the slot, even when the
/// first attempt failed: whatever occupies the slot afterwards is not ours.
pub fn claim_inherited(fd: RawFd) -> io::Result<OwnedFd> {
    if let Some(flag) = claim_flag(fd) {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("slot {fd} was already claimed by this process"),
            ));
        }
    }

    match fcntl(fd, FcntlArg::F_GETFD) {
        Ok(_) => {}
        Err(Errno::EBADF) => {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no descriptor open at slot {fd}"),
            ))
        }
        Err(errno) => return Err(io::Error::from(errno)),
    }
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;

    // SAFETY: the slot is open and nothing else in this process owns it; the
    // spawning parent reserved it for us.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Duplicate a descriptor for hand-off. The copy is close-on-exec until the
/// child's `dup2` moves it into its slot.
pub fn duplicate(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}
