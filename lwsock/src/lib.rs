//! Blocking POSIX-style sockets over a callback-driven TCP/IP engine.
//!
//! The engine ([`engine::Engine`]) is single-threaded and reports progress
//! through events. A [`Stack`] owns it behind one lock, runs it on its own
//! thread and routes each event to the socket that owns the handle.
//! Application threads call into [`Socket`]s, which retry their operation
//! each time the socket's state changes until it succeeds, fails or times
//! out.
//!
//! Drivers:
//! - stream (`tcp`): connect, listen/accept, byte streams, half-close
//! - datagram and raw (`udp`): record-preserving messages
//! - resolver (`dns`): one lookup per send, answer per receive
//! - TLS (`tls`): a session layered over a stream socket
//!
//! [`api::SocketApi`] adds a descriptor table and `getaddrinfo`.

pub mod addr;
pub mod api;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod klog;
pub mod lock;
pub mod socket;
pub mod stack;

#[cfg(test)]
mod testing;

pub use addr::{AddressFamily, SockType};
pub use api::{AddrInfo, AddrInfoHints, AiFlags, SocketApi};
pub use config::{LoopbackConfig, RaggedEof, StackConfig, TlsOptions};
pub use engine::{Engine, LoopbackEngine};
pub use error::{AddrInfoError, Errno, Result, StackError};
pub use event::{Events, MsgFlags};
pub use socket::{
    LookupRequest, Shutdown, SockOpt, SockOptName, Socket, SocketKind, TlsError, TlsIo, TlsPhase,
    TlsSession,
};
pub use stack::Stack;
