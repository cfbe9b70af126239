//! Protocol engine interface.
//!
//! The socket layer drives a callback-style TCP/IP engine through this
//! trait. Every method is called with the stack lock held; the engine never
//! calls back into the socket layer directly. Instead it queues
//! [`StackEvent`]s that the stack thread collects with
//! [`Engine::poll_events`] and dispatches to the owning sockets.
//!
//! ## Module Structure
//!
//! - `loopback` - in-process engine that pairs local connections

pub mod loopback;

use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};

use crate::addr::AddressFamily;
use crate::error::StackError;

pub use loopback::{LoopbackEngine, LoopbackStats};

pub type EngineResult<T> = core::result::Result<T, StackError>;

/// Identifies one engine object (connection, datagram endpoint or query).
///
/// Handles are never reused for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a name lookup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Answered immediately (literal, cached or local name); `None` means
    /// the name does not exist.
    Done(Option<IpAddress>),
    /// Answer follows as a [`StackEvent::Resolved`] for this handle.
    Pending(Handle),
}

/// Callback queued by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// Outgoing connection established
    Connected { conn: Handle },
    /// In-order stream data; counts against the receive window until
    /// acknowledged with `tcp_recved`
    Received { conn: Handle, data: Vec<u8> },
    /// Peer closed its sending direction
    Fin { conn: Handle },
    /// Peer acknowledged `len` bytes; send space is available
    Sent { conn: Handle, len: usize },
    /// Fatal error. The engine has already freed `conn`.
    Error { conn: Handle, err: StackError },
    /// A listener produced a new connection
    Accepted {
        listener: Handle,
        conn: Handle,
        local: IpEndpoint,
        remote: IpEndpoint,
    },
    /// A datagram (UDP payload, or full IP packet for raw endpoints)
    Datagram {
        pcb: Handle,
        data: Vec<u8>,
        from: IpEndpoint,
    },
    /// A pending lookup finished
    Resolved {
        query: Handle,
        addr: Option<IpAddress>,
    },
}

impl StackEvent {
    /// Handle whose owner receives this event.
    pub fn target(&self) -> Handle {
        match self {
            StackEvent::Connected { conn }
            | StackEvent::Received { conn, .. }
            | StackEvent::Fin { conn }
            | StackEvent::Sent { conn, .. }
            | StackEvent::Error { conn, .. } => *conn,
            StackEvent::Accepted { listener, .. } => *listener,
            StackEvent::Datagram { pcb, .. } => *pcb,
            StackEvent::Resolved { query, .. } => *query,
        }
    }
}

/// A TCP/IP engine serialized by the stack lock.
pub trait Engine: Send {
    // ------------------------------------------------------------------
    // TCP
    // ------------------------------------------------------------------

    fn tcp_new(&mut self, family: AddressFamily) -> EngineResult<Handle>;

    /// Bind to a local endpoint; port 0 picks an ephemeral port. Returns the
    /// endpoint actually bound.
    fn tcp_bind(&mut self, conn: Handle, local: IpListenEndpoint) -> EngineResult<IpEndpoint>;

    fn tcp_listen(&mut self, conn: Handle, backlog: u8) -> EngineResult<()>;

    /// Start connecting; completion arrives as `Connected` or `Error`.
    fn tcp_connect(&mut self, conn: Handle, remote: IpEndpoint) -> EngineResult<()>;

    /// Bytes `tcp_write` currently accepts.
    fn tcp_sndbuf(&self, conn: Handle) -> usize;

    /// Queue data for sending; never more than `tcp_sndbuf`.
    fn tcp_write(&mut self, conn: Handle, data: &[u8]) -> EngineResult<()>;

    /// Acknowledge `len` received bytes, reopening the receive window.
    fn tcp_recved(&mut self, conn: Handle, len: usize);

    /// Close one or both directions without freeing the connection.
    fn tcp_shutdown(&mut self, conn: Handle, rx: bool, tx: bool) -> EngineResult<()>;

    /// Graceful close. Frees `conn` on success.
    fn tcp_close(&mut self, conn: Handle) -> EngineResult<()>;

    /// Reset and free `conn` immediately.
    fn tcp_abort(&mut self, conn: Handle);

    /// Release the listener backlog slot held by an accepted connection.
    fn tcp_backlog_accepted(&mut self, conn: Handle);

    fn tcp_set_nodelay(&mut self, conn: Handle, enabled: bool);

    // ------------------------------------------------------------------
    // Datagram endpoints (UDP and raw IP)
    // ------------------------------------------------------------------

    fn udp_new(&mut self, family: AddressFamily) -> EngineResult<Handle>;

    /// Raw endpoint for one IP protocol number.
    fn raw_new(&mut self, family: AddressFamily, protocol: u8) -> EngineResult<Handle>;

    fn dgram_bind(&mut self, pcb: Handle, local: IpListenEndpoint) -> EngineResult<IpEndpoint>;

    /// Fix the default destination and filter inbound traffic to it.
    fn dgram_connect(&mut self, pcb: Handle, remote: IpEndpoint) -> EngineResult<()>;

    /// Send one datagram; `to == None` uses the connected destination.
    fn dgram_sendto(&mut self, pcb: Handle, data: &[u8], to: Option<IpEndpoint>) -> EngineResult<()>;

    fn dgram_remove(&mut self, pcb: Handle);

    // ------------------------------------------------------------------
    // Common
    // ------------------------------------------------------------------

    fn local_endpoint(&self, handle: Handle) -> Option<IpEndpoint>;

    fn remote_endpoint(&self, handle: Handle) -> Option<IpEndpoint>;

    /// Start a name lookup. `Err(NoResolver)` when none is configured.
    fn resolve(&mut self, name: &str, family: AddressFamily) -> EngineResult<Lookup>;

    /// Take every queued callback, oldest first.
    fn poll_events(&mut self) -> Vec<StackEvent>;

    /// Whether callbacks are waiting to be polled.
    fn has_events(&self) -> bool;
}
