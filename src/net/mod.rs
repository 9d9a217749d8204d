//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listen(network, address)
//!     → reload marker set?  yes → descriptor.rs claims slot 3 (once per process) → validate stream listener
//!                           no  → listener.rs binds fresh (socket2)
//!     → ListenerSlot records the handle (one per process)
//!     → serving duplicate handed to the HTTP layer
//!
//! Reload:
//!     ListenerSlot → duplicate descriptor → spawner maps it onto slot 3 of the child
//! ```
//!
//! # Design Decisions
//! - Inheritance, once signalled, never falls back to binding
//! - The slot convention is a constant, not a negotiated format
//! - Parent and child hold duplicated descriptors of one kernel socket

pub mod descriptor;
pub mod listener;

pub use listener::{
    acquire, AcceptSocket, AcquireError, BoundSocket, ListenerHandle, ListenerSlot, Network,
    Origin, OsSockets, SocketSource,
};
