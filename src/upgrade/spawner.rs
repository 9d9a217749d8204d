//! Process spawner.
//!
//! # Responsibilities
//! - Resolve the running executable and its argument vector
//! - Duplicate the active listener for the child
//! - Build the child environment (current environment + reload marker)
//! - Start the child with `{stdin, stdout, stderr, listener[, ready pipe]}`
//!   at slots `{0, 1, 2, 3[, 4]}`
//!
//! # Design Decisions
//! - Fire-and-forget: spawning never waits for the child to accept; any
//!   readiness wait is layered on top by the caller
//! - The process-start call sits behind `ProcessLauncher` so the exact
//!   parameters can be intercepted

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, Pid};
use thiserror::Error;

use crate::lifecycle::ProcessIdentity;
use crate::net::descriptor::{self, LISTENER_FD, MARKER_VALUE, READY_PIPE_ENV, RELOAD_MARKER_ENV};
use crate::net::{ListenerSlot, Network};
use crate::upgrade::readiness::{self, ReadinessPipe};

/// Most descriptors a plan may hand over beyond the standard streams.
const MAX_INHERITED: usize = 8;

/// Child launch failure. The reload is abandoned; the parent keeps running.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no active listener to hand over")]
    NoListener,

    #[error("cannot hand over a {0} listener; only TCP listeners are supported")]
    UnsupportedTransport(Network),

    #[error("failed to resolve executable path: {0}")]
    Executable(io::Error),

    #[error("failed to duplicate listener descriptor: {0}")]
    Duplicate(io::Error),

    #[error("failed to create readiness pipe: {0}")]
    Pipe(io::Error),

    #[error("failed to start new process: {0}")]
    Launch(io::Error),

    #[error("new process {pid} not ready after {timeout:?}")]
    ReadinessTimeout { pid: u32, timeout: Duration },

    #[error("new process {pid} failed readiness: {reason}")]
    ReadinessFailed { pid: u32, reason: String },

    #[error("an upgrade is already in progress")]
    InProgress,

    #[error("this process has already handed off or stopped")]
    Finished,
}

/// Everything needed to start the successor process.
#[derive(Debug)]
pub struct SpawnPlan {
    pub program: PathBuf,
    /// Full argument vector, `argv[0]` included.
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    /// Descriptors placed at slots `3, 4, ...` in order.
    pub inherited: Vec<OwnedFd>,
}

impl SpawnPlan {
    /// Descriptors in child slot order: the standard streams, then `inherited`.
    pub fn descriptor_slots(&self) -> Vec<RawFd> {
        let mut slots = vec![
            io::stdin().as_raw_fd(),
            io::stdout().as_raw_fd(),
            io::stderr().as_raw_fd(),
        ];
        slots.extend(self.inherited.iter().map(AsRawFd::as_raw_fd));
        slots
    }

    pub fn env_value(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }
}

/// Starts and signals OS processes.
pub trait ProcessLauncher: Send + Sync {
    /// Start the process described by `plan` and return its pid.
    fn launch(&self, plan: &SpawnPlan) -> io::Result<u32>;

    /// Ask a previously launched process to exit.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Launches real processes with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(&self, plan: &SpawnPlan) -> io::Result<u32> {
        if plan.inherited.len() > MAX_INHERITED {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("at most {MAX_INHERITED} inherited descriptors"),
            ));
        }

        let mut command = Command::new(&plan.program);
        if let Some((arg0, rest)) = plan.args.split_first() {
            command.arg0(arg0).args(rest);
        }
        command
            .env_clear()
            .envs(plan.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut sources = [-1; MAX_INHERITED];
        for (source, fd) in sources.iter_mut().zip(&plan.inherited) {
            *source = fd.as_raw_fd();
        }
        let count = plan.inherited.len();

        // SAFETY: the closure only issues fcntl/dup2 on descriptors owned by
        // the plan and does not allocate.
        unsafe {
            command.pre_exec(move || place_in_slots(&sources[..count]));
        }

        let child = command.spawn()?;
        Ok(child.id())
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }
}

/// Runs in the forked child: move `sources[i]` onto slot `LISTENER_FD + i`.
///
/// Every source is first copied above the target range so no `dup2` can
/// clobber a source that has not been placed yet. The copies stay
/// close-on-exec; the placed descriptors do not.
fn place_in_slots(sources: &[RawFd]) -> io::Result<()> {
    let floor = LISTENER_FD + sources.len() as RawFd;
    let mut parked = [-1; MAX_INHERITED];
    for (park, &source) in parked.iter_mut().zip(sources) {
        *park = fcntl(source, FcntlArg::F_DUPFD_CLOEXEC(floor)).map_err(io::Error::from)?;
    }
    for (offset, &park) in parked[..sources.len()].iter().enumerate() {
        dup2(park, LISTENER_FD + offset as RawFd).map_err(io::Error::from)?;
    }
    Ok(())
}

/// A started successor.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    /// Present when the child was asked to report readiness.
    pub readiness: Option<ReadinessPipe>,
}

/// Builds spawn plans from the active listener and launches them.
#[derive(Clone)]
pub struct Spawner {
    launcher: Arc<dyn ProcessLauncher>,
    identity: ProcessIdentity,
}

impl Spawner {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, identity: ProcessIdentity) -> Self {
        Self { launcher, identity }
    }

    /// Build the plan for a successor of this process.
    ///
    /// With `ready_pipe` the plan also carries the child end of a readiness
    /// pipe and the returned `ReadinessPipe` is the parent end.
    pub fn plan(
        &self,
        slot: &ListenerSlot,
        ready_pipe: bool,
    ) -> Result<(SpawnPlan, Option<ReadinessPipe>), SpawnError> {
        let program = std::env::current_exe().map_err(SpawnError::Executable)?;
        let args: Vec<OsString> = std::env::args_os().collect();

        let listener = slot
            .with_active(|handle| {
                if !handle.network().is_tcp() {
                    return Err(SpawnError::UnsupportedTransport(handle.network()));
                }
                descriptor::duplicate(handle.socket().as_fd()).map_err(SpawnError::Duplicate)
            })
            .ok_or(SpawnError::NoListener)??;

        let mut env: Vec<(OsString, OsString)> = std::env::vars_os()
            .filter(|(key, _)| key != RELOAD_MARKER_ENV && key != READY_PIPE_ENV)
            .collect();
        env.push((RELOAD_MARKER_ENV.into(), MARKER_VALUE.into()));

        let mut inherited = vec![listener];
        let parent_end = if ready_pipe {
            let (parent_end, child_end) = readiness::pipe().map_err(SpawnError::Pipe)?;
            inherited.push(child_end);
            env.push((READY_PIPE_ENV.into(), MARKER_VALUE.into()));
            Some(parent_end)
        } else {
            None
        };

        Ok((
            SpawnPlan {
                program,
                args,
                env,
                inherited,
            },
            parent_end,
        ))
    }

    /// Start a successor process. Returns as soon as the process exists.
    pub fn spawn(&self, slot: &ListenerSlot, ready_pipe: bool) -> Result<SpawnedChild, SpawnError> {
        tracing::info!(old_pid = self.identity.pid, "Starting graceful reload");

        let (plan, readiness) = self.plan(slot, ready_pipe)?;
        let pid = self.launcher.launch(&plan).map_err(SpawnError::Launch)?;
        // Dropping the plan closes the parent's copies of the child's slots.
        drop(plan);

        tracing::info!(
            old_pid = self.identity.pid,
            new_pid = pid,
            "Started new process"
        );
        Ok(SpawnedChild { pid, readiness })
    }

    /// Terminate a successor that never became ready.
    pub fn abandon(&self, pid: u32) {
        match self.launcher.terminate(pid) {
            Ok(()) => tracing::warn!(new_pid = pid, "Terminated unready process"),
            Err(e) => tracing::error!(new_pid = pid, error = %e, "Failed to terminate unready process"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::OsSockets;
    use std::sync::Mutex;

    /// Captures what would have been passed to the OS.
    ///
    /// Keeps copies of the inherited descriptors, standing in for the child
    /// that would have owned them.
    #[derive(Default)]
    pub(crate) struct CapturingLauncher {
        pub plans: Mutex<Vec<CapturedPlan>>,
        pub held: Mutex<Vec<OwnedFd>>,
        pub terminated: Mutex<Vec<u32>>,
        pub fail: bool,
    }

    impl CapturingLauncher {
        /// Act as the latest child and write the readiness token.
        pub fn report_ready(&self) {
            use std::io::Write;

            let held = self.held.lock().unwrap();
            let pipe = held.last().unwrap().try_clone().unwrap();
            std::os::unix::net::UnixStream::from(pipe)
                .write_all(readiness::READY_TOKEN)
                .unwrap();
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct CapturedPlan {
        pub env: Vec<(OsString, OsString)>,
        pub slots: Vec<RawFd>,
        pub inherited: usize,
    }

    impl ProcessLauncher for CapturingLauncher {
        fn launch(&self, plan: &SpawnPlan) -> io::Result<u32> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            let mut held = self.held.lock().unwrap();
            for fd in &plan.inherited {
                held.push(fd.try_clone()?);
            }
            let mut plans = self.plans.lock().unwrap();
            plans.push(CapturedPlan {
                env: plan.env.clone(),
                slots: plan.descriptor_slots(),
                inherited: plan.inherited.len(),
            });
            Ok(40_000 + plans.len() as u32)
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn spawner(launcher: Arc<CapturingLauncher>) -> Spawner {
        Spawner::new(launcher, ProcessIdentity::current())
    }

    #[test]
    fn plan_orders_slots_and_sets_marker() {
        let slot = ListenerSlot::new();
        slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();

        let (plan, pipe) = spawner(Arc::default()).plan(&slot, false).unwrap();
        assert!(pipe.is_none());
        assert_eq!(plan.env_value(RELOAD_MARKER_ENV), Some(OsStr::new("true")));
        assert_eq!(plan.env_value(READY_PIPE_ENV), None);

        let slots = plan.descriptor_slots();
        assert_eq!(slots.len(), 4);
        assert_eq!(&slots[..3], &[0, 1, 2]);
        let listener_fd = slot.with_active(|h| h.socket().as_fd().as_raw_fd()).unwrap();
        assert_ne!(slots[3], listener_fd, "child gets a duplicate, not the original");
    }

    #[test]
    fn plan_with_pipe_adds_fifth_slot() {
        let slot = ListenerSlot::new();
        slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();

        let (plan, pipe) = spawner(Arc::default()).plan(&slot, true).unwrap();
        assert!(pipe.is_some());
        assert_eq!(plan.descriptor_slots().len(), 5);
        assert_eq!(plan.env_value(READY_PIPE_ENV), Some(OsStr::new("true")));
    }

    #[test]
    fn plan_without_listener_fails() {
        let err = spawner(Arc::default()).plan(&ListenerSlot::new(), false).unwrap_err();
        assert!(matches!(err, SpawnError::NoListener));
    }

    #[test]
    fn unix_listener_is_unsupported() {
        let path = std::env::temp_dir().join(format!("handoff-spawn-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let slot = ListenerSlot::new();
        slot.acquire("unix", path.to_str().unwrap(), false, &OsSockets).unwrap();

        let err = spawner(Arc::default()).plan(&slot, false).unwrap_err();
        assert!(matches!(err, SpawnError::UnsupportedTransport(Network::Unix)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn launch_failure_is_reported() {
        let slot = ListenerSlot::new();
        slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();
        let launcher = Arc::new(CapturingLauncher {
            fail: true,
            ..Default::default()
        });

        let err = spawner(launcher).spawn(&slot, false).unwrap_err();
        assert!(matches!(err, SpawnError::Launch(_)));
    }

    #[test]
    fn spawn_passes_plan_to_launcher() {
        let slot = ListenerSlot::new();
        slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();
        let launcher = Arc::new(CapturingLauncher::default());

        let child = spawner(launcher.clone()).spawn(&slot, false).unwrap();
        assert_eq!(child.pid, 40_001);

        let plans = launcher.plans.lock().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].inherited, 1);
        assert!(plans[0]
            .env
            .iter()
            .any(|(k, v)| k == RELOAD_MARKER_ENV && v == MARKER_VALUE));
    }
}
