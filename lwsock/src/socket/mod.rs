//! Socket core.
//!
//! A [`Socket`] is a shared handle to one socket object. The object is
//! reference counted: consumer threads hold `Socket` clones and the stack's
//! handler registry holds one more reference for as long as the engine may
//! still call back for it, so a callback can never observe a freed socket.
//!
//! ## Module Structure
//!
//! - `tcp` - stream driver (connect, listen/accept, send/recv, half-close)
//! - `udp` - datagram and raw driver
//! - `dns` - name-resolution pseudo-socket
//! - `tls` - TLS layer over an inner stream socket
//! - `options` - socket options
//!
//! Every blocking operation goes through [`SocketInner::block_on`]: try the
//! engine operation once, and on `EAGAIN` wait for the socket's readiness
//! sequence to move, bounded by the socket's timeout.

pub mod dns;
pub mod options;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use smoltcp::wire::{IpAddress, IpEndpoint};

use crate::addr::{AddressFamily, SockType};
use crate::buffer::{ByteBuffer, RecordQueue};
use crate::config::TlsOptions;
use crate::engine::{Handle, StackEvent};
use crate::error::{Errno, Result};
use crate::event::{Events, MsgFlags, SockFlags};
use crate::lock::{SocketGuard, SocketLock};
use crate::stack::{Stack, StackCore};

pub use dns::LookupRequest;
pub use options::{SockOpt, SockOptName};
pub use tls::{TlsError, TlsIo, TlsPhase, TlsSession};

/// Forwards readiness raised on one socket to another.
pub(crate) type Relay = Arc<dyn Fn(Events) + Send + Sync>;

/// A relay call captured under the socket lock, fired after releasing it.
#[must_use]
pub(crate) struct Wakeup {
    relay: Relay,
    events: Events,
}

impl Wakeup {
    pub fn fire(self) {
        (self.relay)(self.events);
    }
}

/// Public view of a socket's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
    Raw,
    Resolver,
    Tls,
}

/// Directions closed by [`Socket::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl Shutdown {
    pub fn read(self) -> bool {
        matches!(self, Shutdown::Read | Shutdown::Both)
    }

    pub fn write(self) -> bool {
        matches!(self, Shutdown::Write | Shutdown::Both)
    }
}

/// Driver selected at creation.
pub(crate) enum Kind {
    Stream,
    Datagram,
    Raw(u8),
    Resolver,
    Tls(tls::TlsLayer),
}

impl Kind {
    fn public(&self) -> SocketKind {
        match self {
            Kind::Stream => SocketKind::Stream,
            Kind::Datagram => SocketKind::Datagram,
            Kind::Raw(_) => SocketKind::Raw,
            Kind::Resolver => SocketKind::Resolver,
            Kind::Tls(_) => SocketKind::Tls,
        }
    }
}

/// What the stack context delivers into a socket.
pub(crate) enum Inbox {
    Empty,
    Stream(ByteBuffer),
    Accept(RecordQueue<tcp::AcceptRecord>),
    Datagram(RecordQueue<udp::Datagram>),
    Lookup(RecordQueue<dns::LookupRecord>),
}

impl Inbox {
    /// Bytes or records waiting to be read.
    pub fn queued(&self) -> usize {
        match self {
            Inbox::Empty => 0,
            Inbox::Stream(buf) => buf.len(),
            Inbox::Accept(q) => q.len(),
            Inbox::Datagram(q) => q.iter().map(|d| d.data.len()).sum(),
            Inbox::Lookup(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Inbox::Empty => true,
            Inbox::Stream(buf) => buf.is_empty(),
            Inbox::Accept(q) => q.is_empty(),
            Inbox::Datagram(q) => q.is_empty(),
            Inbox::Lookup(q) => q.is_empty(),
        }
    }
}

/// Options stored on the socket.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StoredOptions {
    pub nodelay: bool,
    pub reuse_addr: bool,
    pub keepalive: bool,
}

/// Mutable socket state, guarded by the socket lock.
pub(crate) struct SocketState {
    /// Engine object; `None` before creation on the engine side and after
    /// teardown
    pub handle: Option<Handle>,
    pub flags: SockFlags,
    /// First fatal error, reported until close
    pub error: Option<Errno>,
    /// `error` until `SO_ERROR` has reported it once
    pub pending_error: Option<Errno>,
    pub local: Option<IpEndpoint>,
    pub remote: Option<IpEndpoint>,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub options: StoredOptions,
    pub inbox: Inbox,
    /// Current readiness
    pub events: Events,
    /// Bumped on every raised event; waiters sleep until it moves
    pub seq: u64,
    pub relay: Option<Relay>,
}

impl SocketState {
    pub fn new(handle: Option<Handle>, inbox: Inbox) -> Self {
        Self {
            handle,
            flags: SockFlags::empty(),
            error: None,
            pending_error: None,
            local: None,
            remote: None,
            recv_timeout: None,
            send_timeout: None,
            options: StoredOptions::default(),
            inbox,
            events: Events::empty(),
            seq: 0,
            relay: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(SockFlags::USER_CLOSED)
    }

    /// Record `err` unless an earlier error is already latched.
    pub fn latch(&mut self, err: Errno) {
        if self.error.is_none() {
            self.error = Some(err);
            self.pending_error = Some(err);
        }
        self.events |= Events::ERR;
    }

    /// Fail with `EBADF` once the owner has closed the socket.
    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Errno::EBADF)
        } else {
            Ok(())
        }
    }
}

/// The shared socket object.
pub(crate) struct SocketInner {
    pub id: u64,
    pub stack: Arc<Stack>,
    pub family: AddressFamily,
    pub kind: Kind,
    pub state: SocketLock<SocketState>,
}

impl SocketInner {
    pub fn new(stack: &Arc<Stack>, family: AddressFamily, kind: Kind, state: SocketState) -> Arc<Self> {
        Arc::new(Self {
            id: stack.next_socket_id(),
            stack: stack.clone(),
            family,
            kind,
            state: SocketLock::new(state),
        })
    }

    pub fn lock(&self) -> SocketGuard<'_, SocketState> {
        self.state.lock()
    }

    /// Publish `events` with the guard held; returns the relay to call once
    /// the guard is released.
    pub fn signal(&self, st: &mut SocketState, events: Events) -> Option<Wakeup> {
        st.events |= events;
        st.seq = st.seq.wrapping_add(1);
        self.state.notify_all();
        st.relay.clone().map(|relay| Wakeup { relay, events })
    }

    /// Raise readiness and wake every waiter.
    pub fn raise(&self, events: Events) {
        let wakeup = {
            let mut st = self.lock();
            self.signal(&mut st, events)
        };
        if let Some(wakeup) = wakeup {
            wakeup.fire();
        }
    }

    /// Latch a fatal error and wake every waiter.
    pub fn fail(&self, err: Errno) {
        let wakeup = {
            let mut st = self.lock();
            st.latch(err);
            self.signal(&mut st, Events::ERR)
        };
        if let Some(wakeup) = wakeup {
            wakeup.fire();
        }
    }

    pub fn seq(&self) -> u64 {
        self.lock().seq
    }

    pub fn is_nonblocking(&self) -> bool {
        self.lock().flags.contains(SockFlags::NONBLOCKING)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.lock().recv_timeout
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.lock().send_timeout
    }

    /// Sleep until the readiness sequence moves past `seq`.
    fn wait_change(&self, seq: u64, deadline: Option<Instant>) -> Result<()> {
        let mut st = self.lock();
        loop {
            if st.is_closed() {
                return Err(st.error.unwrap_or(Errno::EBADF));
            }
            if st.seq != seq {
                return Ok(());
            }
            let (guard, timed_out) = self.state.wait_until(st, deadline);
            st = guard;
            if timed_out && st.seq == seq && !st.is_closed() {
                return Err(Errno::ETIMEDOUT);
            }
        }
    }

    /// Run `attempt` until it stops reporting `EAGAIN`.
    ///
    /// Non-blocking sockets, `MSG_DONTWAIT` and a zero timeout make a single
    /// attempt. Otherwise each `EAGAIN` sleeps until the socket raises an
    /// event, the deadline passes (`ETIMEDOUT`) or the socket is closed (the
    /// latched error).
    pub fn block_on<T>(
        &self,
        timeout: Option<Duration>,
        flags: MsgFlags,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let once = flags.contains(MsgFlags::DONTWAIT)
            || self.is_nonblocking()
            || timeout == Some(Duration::ZERO);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seq = self.seq();
            match attempt() {
                Err(e) if e.is_would_block() && !once => self.wait_change(seq, deadline)?,
                result => return result,
            }
        }
    }

    /// Enter `USER_CLOSED`, latch `EBADF` for anyone still waiting and wake
    /// them. Returns the engine handle and the inbox for the driver to tear
    /// down.
    pub fn mark_closed(&self) -> Result<(Option<Handle>, Inbox)> {
        let mut st = self.lock();
        st.check_open()?;
        st.flags |= SockFlags::USER_CLOSED;
        st.latch(Errno::EBADF);
        st.events |= Events::NVAL;
        st.seq = st.seq.wrapping_add(1);
        st.relay = None;
        self.state.notify_all();
        let handle = st.handle.take();
        let inbox = core::mem::replace(&mut st.inbox, Inbox::Empty);
        trace!("socket {} closed", self.id);
        Ok((handle, inbox))
    }

    /// Current engine handle, or the error explaining its absence.
    pub fn handle(&self) -> Result<Handle> {
        let st = self.lock();
        st.check_open()?;
        st.handle.ok_or(st.error.unwrap_or(Errno::ENOTCONN))
    }
}

/// Dispatch one engine event to the driver owning `sock`.
pub(crate) fn on_event(core: &mut StackCore, sock: &Arc<SocketInner>, event: StackEvent) {
    match &sock.kind {
        Kind::Stream => tcp::on_event(core, sock, event),
        Kind::Datagram | Kind::Raw(_) => udp::on_event(core, sock, event),
        Kind::Resolver => dns::on_event(core, sock, event),
        Kind::Tls(_) => trace!("tls socket {} got engine event {:?}", sock.id, event),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// A socket. Clones share the same underlying socket.
///
/// The socket stays open until [`Socket::close`]; dropping handles does not
/// close it.
#[derive(Clone)]
pub struct Socket {
    pub(crate) inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .finish()
    }
}

impl Socket {
    pub(crate) fn from_inner(inner: Arc<SocketInner>) -> Self {
        Self { inner }
    }

    /// Create a stream, datagram or raw socket.
    ///
    /// `protocol` is the IP protocol number for raw sockets; for the other
    /// types it must be 0 or the type's own protocol.
    pub fn new(stack: &Arc<Stack>, family: AddressFamily, ty: SockType, protocol: u8) -> Result<Socket> {
        if family == AddressFamily::Unspec {
            return Err(Errno::EAFNOSUPPORT);
        }
        let inner = match ty {
            SockType::Stream if protocol == 0 || protocol == 6 => tcp::new(stack, family)?,
            SockType::Datagram if protocol == 0 || protocol == 17 => udp::new(stack, family, None)?,
            SockType::Raw if protocol != 0 => udp::new(stack, family, Some(protocol))?,
            _ => return Err(Errno::EPROTONOSUPPORT),
        };
        Ok(Socket { inner })
    }

    /// Create a name-resolution pseudo-socket.
    pub fn resolver(stack: &Arc<Stack>) -> Result<Socket> {
        Ok(Socket {
            inner: dns::new(stack),
        })
    }

    /// Layer TLS over a stream socket. The new socket owns `inner` and
    /// closes it on close.
    pub fn tls(inner: Socket, session: Box<dyn TlsSession>, options: TlsOptions) -> Result<Socket> {
        tls::wrap(inner, session, options).map(|inner| Socket { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> SocketKind {
        self.inner.kind.public()
    }

    pub fn family(&self) -> AddressFamily {
        self.inner.family
    }

    pub fn bind(&self, local: IpEndpoint) -> Result<()> {
        match &self.inner.kind {
            Kind::Stream => tcp::bind(&self.inner, local),
            Kind::Datagram | Kind::Raw(_) => udp::bind(&self.inner, local),
            Kind::Tls(layer) => layer.inner().bind(local),
            Kind::Resolver => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Start accepting connections; a backlog of 0 picks the default.
    pub fn listen(&self, backlog: u8) -> Result<()> {
        match &self.inner.kind {
            Kind::Stream => tcp::listen(&self.inner, backlog),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Connect to `remote`.
    ///
    /// On a non-blocking stream socket the first call returns `EINPROGRESS`,
    /// later calls `EALREADY` until the connection completes and `EISCONN`
    /// after. On a TLS socket the handshake follows the connect.
    pub fn connect(&self, remote: IpEndpoint) -> Result<()> {
        match &self.inner.kind {
            Kind::Stream => tcp::connect(&self.inner, remote),
            Kind::Datagram | Kind::Raw(_) => udp::connect(&self.inner, remote),
            Kind::Tls(layer) => tls::connect(&self.inner, layer, Some(remote)),
            Kind::Resolver => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Drive the TLS handshake of a socket whose inner stream is already
    /// connected (or connecting).
    pub fn handshake(&self) -> Result<()> {
        match &self.inner.kind {
            Kind::Tls(layer) => tls::connect(&self.inner, layer, None),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    /// TLS state, for TLS sockets.
    pub fn tls_phase(&self) -> Option<TlsPhase> {
        match &self.inner.kind {
            Kind::Tls(layer) => Some(layer.phase()),
            _ => None,
        }
    }

    /// Take the next connection from a listening socket.
    pub fn accept(&self) -> Result<(Socket, IpEndpoint)> {
        match &self.inner.kind {
            Kind::Stream => tcp::accept(&self.inner).map(|(s, remote)| (Socket { inner: s }, remote)),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    pub fn send(&self, data: &[u8], flags: MsgFlags) -> Result<usize> {
        match &self.inner.kind {
            Kind::Stream => tcp::send(&self.inner, data, flags),
            Kind::Datagram | Kind::Raw(_) => udp::send_to(&self.inner, data, None, flags),
            Kind::Tls(layer) => tls::send(&self.inner, layer, data, flags),
            Kind::Resolver => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Send to an explicit destination. Stream sockets ignore `to` when
    /// connected, as POSIX allows.
    pub fn send_to(&self, data: &[u8], to: IpEndpoint, flags: MsgFlags) -> Result<usize> {
        match &self.inner.kind {
            Kind::Datagram | Kind::Raw(_) => udp::send_to(&self.inner, data, Some(to), flags),
            _ => self.send(data, flags),
        }
    }

    pub fn recv(&self, buf: &mut [u8], flags: MsgFlags) -> Result<usize> {
        self.recv_from(buf, flags).map(|(n, _)| n)
    }

    /// Receive, also reporting the source for datagram sockets.
    pub fn recv_from(&self, buf: &mut [u8], flags: MsgFlags) -> Result<(usize, Option<IpEndpoint>)> {
        match &self.inner.kind {
            Kind::Stream => tcp::recv(&self.inner, buf, flags).map(|n| (n, None)),
            Kind::Datagram | Kind::Raw(_) => udp::recv_from(&self.inner, buf, flags),
            Kind::Tls(layer) => tls::recv(&self.inner, layer, buf, flags).map(|n| (n, None)),
            Kind::Resolver => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Submit a lookup on a resolver socket.
    pub fn send_query(&self, request: &LookupRequest) -> Result<()> {
        match &self.inner.kind {
            Kind::Resolver => dns::send(&self.inner, request),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Wait for the answer to the submitted lookup; `None` means the name
    /// does not exist.
    pub fn recv_answer(&self) -> Result<Option<IpAddress>> {
        match &self.inner.kind {
            Kind::Resolver => dns::recv(&self.inner),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        match &self.inner.kind {
            Kind::Stream => tcp::shutdown(&self.inner, how),
            Kind::Datagram | Kind::Raw(_) => udp::shutdown(&self.inner, how),
            Kind::Tls(layer) => tls::shutdown(&self.inner, layer, how),
            Kind::Resolver => Err(Errno::EOPNOTSUPP),
        }
    }

    /// Close the socket, waking every thread blocked on it.
    pub fn close(&self) -> Result<()> {
        match &self.inner.kind {
            Kind::Stream => tcp::close(&self.inner),
            Kind::Datagram | Kind::Raw(_) => udp::close(&self.inner),
            Kind::Resolver => dns::close(&self.inner),
            Kind::Tls(layer) => tls::close(&self.inner, layer),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed()
    }

    /// Local endpoint (`getsockname`).
    pub fn local_addr(&self) -> Result<IpEndpoint> {
        if let Kind::Tls(layer) = &self.inner.kind {
            return layer.inner().local_addr();
        }
        let st = self.inner.lock();
        st.check_open()?;
        Ok(st
            .local
            .unwrap_or_else(|| IpEndpoint::new(self.inner.family.unspecified(), 0)))
    }

    /// Remote endpoint (`getpeername`).
    pub fn peer_addr(&self) -> Result<IpEndpoint> {
        if let Kind::Tls(layer) = &self.inner.kind {
            return layer.inner().peer_addr();
        }
        let st = self.inner.lock();
        st.check_open()?;
        match st.remote {
            Some(remote) if st.flags.contains(SockFlags::CONNECTED) => Ok(remote),
            _ => Err(Errno::ENOTCONN),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let mut st = self.inner.lock();
        st.check_open()?;
        st.flags.set(SockFlags::NONBLOCKING, nonblocking);
        Ok(())
    }

    pub fn is_nonblocking(&self) -> bool {
        self.inner.is_nonblocking()
    }

    /// Current readiness, as `poll(2)` would report it.
    pub fn readiness(&self) -> Events {
        let st = self.inner.lock();
        let mut events = st.events;
        if st.error.is_some() {
            events |= Events::ERR;
        }
        if !st.inbox.is_empty() {
            events |= Events::IN;
        }
        events
    }

    pub fn set_option(&self, option: SockOpt) -> Result<()> {
        options::set(&self.inner, option)
    }

    pub fn option(&self, name: SockOptName) -> Result<SockOpt> {
        options::get(&self.inner, name)
    }
}

impl embedded_io::ErrorType for Socket {
    type Error = Errno;
}

impl embedded_io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv(buf, MsgFlags::empty())
    }
}

impl embedded_io::Write for Socket {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.send(buf, MsgFlags::empty())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
