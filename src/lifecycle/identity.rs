//! Process identity captured once at startup.

use std::fmt;

/// `{pid, parent_pid}` of this process. Used for diagnostics and log framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub parent_pid: u32,
}

impl ProcessIdentity {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            parent_pid: std::os::unix::process::parent_id(),
        }
    }

    /// Span that frames every lifecycle log line with the process identity.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("process", pid = self.pid, ppid = self.parent_pid)
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} (parent {})", self.pid, self.parent_pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_matches_std() {
        let identity = ProcessIdentity::current();
        assert_eq!(identity.pid, std::process::id());
        assert_ne!(identity.pid, identity.parent_pid);
    }
}
