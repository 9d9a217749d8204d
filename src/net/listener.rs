//! Listener acquisition.
//!
//! # Responsibilities
//! - Bind a fresh listening socket, or wrap the one inherited at `LISTENER_FD`
//! - Never fall back to binding once inheritance was signalled
//! - Remember the process's single active listener for later hand-off
//!
//! # Design Decisions
//! - Syscalls sit behind `SocketSource` so acquisition can be exercised
//!   without touching the real descriptor table
//! - The recorded handle and the serving socket are independent duplicates;
//!   closing one never closes the other

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::net::descriptor::{self, LISTENER_FD};

const LISTEN_BACKLOG: i32 = 1024;

/// Transport requested by `Listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    pub fn is_tcp(self) -> bool {
        !matches!(self, Network::Unix)
    }
}

impl FromStr for Network {
    type Err = AcquireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            other => Err(AcquireError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
        };
        f.write_str(name)
    }
}

/// Where a listener came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Fresh,
    Inherited,
}

/// Listener bind or inheritance failure. Always fatal to startup.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to bind {network} {address}: {source}")]
    Bind {
        network: Network,
        address: String,
        source: io::Error,
    },

    #[error("no inherited listener at descriptor {fd}: {source}")]
    InheritedMissing { fd: RawFd, source: io::Error },

    #[error("descriptor {fd} is not a usable {network} listener: {source}")]
    InheritedInvalid {
        fd: RawFd,
        network: Network,
        source: io::Error,
    },

    #[error("failed to duplicate listener for serving: {0}")]
    Duplicate(io::Error),

    #[error("a listener is already active in this process")]
    AlreadyListening,
}

/// A bound, listening std socket.
#[derive(Debug)]
pub enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BoundSocket {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            BoundSocket::Tcp(l) => l.try_clone().map(BoundSocket::Tcp),
            BoundSocket::Unix(l) => l.try_clone().map(BoundSocket::Unix),
        }
    }

    /// Local TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundSocket::Tcp(l) => l.local_addr().ok(),
            BoundSocket::Unix(_) => None,
        }
    }

    /// Convert into a Tokio listener. Must run inside a runtime.
    pub fn into_accept(self) -> io::Result<AcceptSocket> {
        match self {
            BoundSocket::Tcp(l) => {
                l.set_nonblocking(true)?;
                tokio::net::TcpListener::from_std(l).map(AcceptSocket::Tcp)
            }
            BoundSocket::Unix(l) => {
                l.set_nonblocking(true)?;
                tokio::net::UnixListener::from_std(l).map(AcceptSocket::Unix)
            }
        }
    }
}

impl AsFd for BoundSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            BoundSocket::Tcp(l) => l.as_fd(),
            BoundSocket::Unix(l) => l.as_fd(),
        }
    }
}

/// An async listener ready for an accept loop.
#[derive(Debug)]
pub enum AcceptSocket {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl AcceptSocket {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            AcceptSocket::Tcp(l) => l.local_addr().ok(),
            AcceptSocket::Unix(_) => None,
        }
    }
}

/// The process's listening socket plus how it was obtained.
#[derive(Debug)]
pub struct ListenerHandle {
    network: Network,
    address: String,
    socket: BoundSocket,
    origin: Origin,
}

impl ListenerHandle {
    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn socket(&self) -> &BoundSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }
}

/// The syscalls acquisition needs.
pub trait SocketSource: Send + Sync {
    fn bind_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener>;

    fn bind_unix(&self, path: &Path) -> io::Result<UnixListener>;

    /// Wrap the descriptor at `fd` as a listener of kind `network`.
    /// A missing descriptor is reported as `ErrorKind::NotFound`, a slot this
    /// process already claimed as `ErrorKind::AlreadyExists`.
    fn inherit(&self, network: Network, fd: RawFd) -> io::Result<BoundSocket>;
}

/// Real sockets from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSockets;

impl SocketSource for OsSockets {
    fn bind_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    }

    fn bind_unix(&self, path: &Path) -> io::Result<UnixListener> {
        UnixListener::bind(path)
    }

    fn inherit(&self, network: Network, fd: RawFd) -> io::Result<BoundSocket> {
        let socket = Socket::from(descriptor::claim_inherited(fd)?);

        if socket.r#type()? != Type::STREAM {
            return Err(invalid("not a stream socket"));
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if !socket.is_listener()? {
            return Err(invalid("socket is not listening"));
        }

        let local = socket.local_addr()?;
        match (network, local.as_socket()) {
            (Network::Unix, None) => Ok(BoundSocket::Unix(UnixListener::from(OwnedFd::from(socket)))),
            (Network::Unix, Some(_)) => Err(invalid("expected a unix socket, found inet")),
            (_, None) => Err(invalid("expected an inet socket")),
            (Network::Tcp4, Some(addr)) if !addr.is_ipv4() => Err(invalid("expected an IPv4 socket")),
            (Network::Tcp6, Some(addr)) if !addr.is_ipv6() => Err(invalid("expected an IPv6 socket")),
            (_, Some(_)) => Ok(BoundSocket::Tcp(socket.into())),
        }
    }
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, reason.to_string())
}

/// Resolve a TCP address. A bare `:port` means every interface.
fn resolve(network: Network, address: &str) -> Result<SocketAddr, AcquireError> {
    let normalized = match (address.strip_prefix(':'), network) {
        (Some(port), Network::Tcp6) => format!("[::]:{port}"),
        (Some(port), _) => format!("0.0.0.0:{port}"),
        (None, _) => address.to_string(),
    };

    let candidates = normalized
        .to_socket_addrs()
        .map_err(|e| AcquireError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    candidates
        .into_iter()
        .find(|addr| match network {
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| AcquireError::InvalidAddress {
            address: address.to_string(),
            reason: format!("no {network} address"),
        })
}

/// Obtain a listener: inherit it when `inherit` is set, otherwise bind fresh.
pub fn acquire(
    network: &str,
    address: &str,
    inherit: bool,
    sockets: &dyn SocketSource,
) -> Result<ListenerHandle, AcquireError> {
    let network: Network = network.parse()?;

    if inherit {
        let socket = sockets
            .inherit(network, LISTENER_FD)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => AcquireError::AlreadyListening,
                io::ErrorKind::NotFound => AcquireError::InheritedMissing { fd: LISTENER_FD, source },
                _ => AcquireError::InheritedInvalid { fd: LISTENER_FD, network, source },
            })?;
        tracing::info!(
            %network,
            address,
            fd = LISTENER_FD,
            local_addr = ?socket.local_addr(),
            "Inherited listener from parent process"
        );
        return Ok(ListenerHandle {
            network,
            address: address.to_string(),
            socket,
            origin: Origin::Inherited,
        });
    }

    let bind_error = |source| AcquireError::Bind {
        network,
        address: address.to_string(),
        source,
    };
    let socket = match network {
        Network::Unix => BoundSocket::Unix(sockets.bind_unix(Path::new(address)).map_err(bind_error)?),
        tcp => BoundSocket::Tcp(sockets.bind_tcp(resolve(tcp, address)?).map_err(bind_error)?),
    };
    tracing::info!(
        %network,
        address,
        local_addr = ?socket.local_addr(),
        "Listener bound"
    );

    Ok(ListenerHandle {
        network,
        address: address.to_string(),
        socket,
        origin: Origin::Fresh,
    })
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    Active(ListenerHandle),
    Released,
}

/// Holds the process's sole active listener.
///
/// A slot accepts exactly one successful acquisition; once released it stays
/// released.
#[derive(Debug, Default)]
pub struct ListenerSlot {
    state: Mutex<SlotState>,
}

impl ListenerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a listener, record it, and return an independent serving copy.
    pub fn acquire(
        &self,
        network: &str,
        address: &str,
        inherit: bool,
        sockets: &dyn SocketSource,
    ) -> Result<BoundSocket, AcquireError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, SlotState::Empty) {
            return Err(AcquireError::AlreadyListening);
        }

        let handle = acquire(network, address, inherit, sockets)?;
        let serving = handle.socket().try_clone().map_err(AcquireError::Duplicate)?;
        *state = SlotState::Active(handle);
        Ok(serving)
    }

    /// Run `f` against the active handle, if there is one.
    pub fn with_active<R>(&self, f: impl FnOnce(&ListenerHandle) -> R) -> Option<R> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            SlotState::Active(handle) => Some(f(handle)),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.with_active(|_| ()).is_some()
    }

    /// Close this process's recorded copy. Returns whether one was open.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, SlotState::Released) {
            SlotState::Active(handle) => {
                tracing::debug!(
                    network = %handle.network(),
                    address = handle.address(),
                    "Listener released"
                );
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Move `fd` well above the protocol slots so tests never claim them.
    fn above_protocol_slots(fd: impl AsRawFd) -> RawFd {
        fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(64)).unwrap()
    }

    /// Records calls; inheritance hands back a loopback listener or an error.
    #[derive(Default)]
    struct RecordingSockets {
        binds: AtomicUsize,
        inherits: AtomicUsize,
        inherit_error: Option<io::ErrorKind>,
    }

    impl SocketSource for RecordingSockets {
        fn bind_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            TcpListener::bind(addr)
        }

        fn bind_unix(&self, path: &Path) -> io::Result<UnixListener> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            UnixListener::bind(path)
        }

        fn inherit(&self, _network: Network, _fd: RawFd) -> io::Result<BoundSocket> {
            self.inherits.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = self.inherit_error {
                return Err(io::Error::new(kind, "refused"));
            }
            TcpListener::bind("127.0.0.1:0").map(BoundSocket::Tcp)
        }
    }

    #[test]
    fn marker_present_never_binds() {
        let sockets = RecordingSockets::default();
        let handle = acquire("tcp", "127.0.0.1:0", true, &sockets).unwrap();

        assert_eq!(handle.origin(), Origin::Inherited);
        assert_eq!(sockets.inherits.load(Ordering::SeqCst), 1);
        assert_eq!(sockets.binds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_inherited_descriptor_has_no_fallback() {
        let sockets = RecordingSockets {
            inherit_error: Some(io::ErrorKind::NotFound),
            ..Default::default()
        };
        let err = acquire("tcp", "127.0.0.1:0", true, &sockets).unwrap_err();

        assert!(matches!(err, AcquireError::InheritedMissing { fd: LISTENER_FD, .. }));
        assert_eq!(sockets.binds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn claimed_slot_reports_already_listening() {
        let sockets = RecordingSockets {
            inherit_error: Some(io::ErrorKind::AlreadyExists),
            ..Default::default()
        };
        let slot = ListenerSlot::new();
        let err = slot.acquire("tcp", ":0", true, &sockets).unwrap_err();

        assert!(matches!(err, AcquireError::AlreadyListening));
        assert_eq!(sockets.binds.load(Ordering::SeqCst), 0);
        assert!(!slot.is_active());
    }

    #[test]
    fn marker_absent_binds_fresh() {
        let handle = acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();
        assert_eq!(handle.origin(), Origin::Fresh);
        assert_ne!(handle.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn address_in_use_is_a_bind_error() {
        let first = acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let err = acquire("tcp", &taken, false, &OsSockets).unwrap_err();
        assert!(matches!(err, AcquireError::Bind { .. }));
    }

    #[test]
    fn bare_port_means_all_interfaces() {
        assert_eq!(resolve(Network::Tcp, ":8080").unwrap(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(resolve(Network::Tcp6, ":8080").unwrap(), "[::]:8080".parse().unwrap());
        assert!(resolve(Network::Tcp6, "127.0.0.1:80").is_err());
    }

    #[test]
    fn unknown_network_is_rejected() {
        let err = acquire("udp", ":0", false, &OsSockets).unwrap_err();
        assert!(matches!(err, AcquireError::UnsupportedNetwork(n) if n == "udp"));
    }

    #[test]
    fn os_inherit_accepts_a_listening_tcp_socket() {
        let original = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        let fd = above_protocol_slots(original);

        let socket = OsSockets.inherit(Network::Tcp, fd).unwrap();
        assert_eq!(socket.local_addr(), Some(addr));
    }

    #[test]
    fn os_inherit_rejects_datagram_sockets() {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = above_protocol_slots(udp);

        let err = OsSockets.inherit(Network::Tcp, fd).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn slot_accepts_a_single_listen() {
        let slot = ListenerSlot::new();
        let serving = slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap();
        assert!(slot.is_active());
        assert_eq!(
            serving.local_addr(),
            slot.with_active(|h| h.local_addr()).flatten()
        );

        let err = slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets).unwrap_err();
        assert!(matches!(err, AcquireError::AlreadyListening));

        assert!(slot.release());
        assert!(!slot.release());
        assert!(!slot.is_active());
        assert!(matches!(
            slot.acquire("tcp", "127.0.0.1:0", false, &OsSockets),
            Err(AcquireError::AlreadyListening)
        ));
    }
}
