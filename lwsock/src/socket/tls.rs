//! TLS layered over a stream socket.
//!
//! The TLS socket owns an inner stream socket, switches it to non-blocking
//! and drives a [`TlsSession`] over it. The session sees the inner socket
//! through [`TlsIo`], where the inner `EAGAIN` becomes `WantRead` or
//! `WantWrite`; the layer turns those back into `EAGAIN` for the blocking
//! retry. Every readiness change of the inner socket is relayed to the TLS
//! socket, so a TLS waiter wakes whenever the transport moves.
//!
//! Phases: `Initial -> Connecting -> Handshaking -> Done`. The handshake is
//! driven by `connect`/`handshake` and implicitly by the first `send` or
//! `recv`. Calls in `Handshaking` continue the session's handshake; calls in
//! `Done` are no-ops.
//!
//! A session write that reports `WantWrite` must be retried with the same
//! data, as with most TLS engines. Blocking sends do this on their own.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};
use smoltcp::wire::IpEndpoint;

use super::{tcp, Inbox, Kind, Relay, Shutdown, Socket, SocketInner, SocketKind, SocketState};
use crate::config::{RaggedEof, TlsOptions, TLS_RECORD_MAX};
use crate::error::{Errno, Result};
use crate::event::{Events, MsgFlags, SockFlags};

// ═══════════════════════════════════════════════════════════════════════════════
// TLS ENGINE INTERFACE
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome codes of a TLS engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsError {
    /// Needs more input from the transport
    WantRead,
    /// Needs room to write to the transport
    WantWrite,
    /// Transport hit EOF without a close-notify alert
    ConnectionClosed,
    /// Fatal alert
    Protocol(u8),
    /// Transport failure
    Io(Errno),
}

impl TlsError {
    pub fn is_want(self) -> bool {
        matches!(self, TlsError::WantRead | TlsError::WantWrite)
    }

    pub fn to_errno(self) -> Errno {
        match self {
            TlsError::WantRead | TlsError::WantWrite => Errno::EAGAIN,
            TlsError::ConnectionClosed => Errno::ECONNRESET,
            TlsError::Protocol(_) => Errno::EPROTO,
            TlsError::Io(err) => err,
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::WantRead => write!(f, "want read"),
            TlsError::WantWrite => write!(f, "want write"),
            TlsError::ConnectionClosed => write!(f, "connection closed without close-notify"),
            TlsError::Protocol(alert) => write!(f, "fatal alert {}", alert),
            TlsError::Io(err) => write!(f, "transport: {}", err),
        }
    }
}

/// Transport as seen by a TLS session. Never blocks.
pub trait TlsIo {
    /// Write ciphertext; `WantWrite` when the transport is full.
    fn send(&mut self, data: &[u8]) -> core::result::Result<usize, TlsError>;
    /// Read ciphertext; `Ok(0)` at transport EOF, `WantRead` when empty.
    fn recv(&mut self, buf: &mut [u8]) -> core::result::Result<usize, TlsError>;
}

/// A TLS engine session.
pub trait TlsSession: Send {
    /// Advance the handshake; `Ok` once it has completed.
    fn handshake(&mut self, io: &mut dyn TlsIo) -> core::result::Result<(), TlsError>;
    /// Decrypt into `buf`; `Ok(0)` after the peer's close-notify.
    fn read(&mut self, io: &mut dyn TlsIo, buf: &mut [u8]) -> core::result::Result<usize, TlsError>;
    /// Encrypt and send `data`, all or nothing.
    fn write(&mut self, io: &mut dyn TlsIo, data: &[u8]) -> core::result::Result<usize, TlsError>;
    /// Send a close-notify alert.
    fn close_notify(&mut self, io: &mut dyn TlsIo) -> core::result::Result<(), TlsError>;
}

/// Inner socket adapted to [`TlsIo`].
struct InnerIo<'a> {
    sock: &'a Socket,
}

impl TlsIo for InnerIo<'_> {
    fn send(&mut self, data: &[u8]) -> core::result::Result<usize, TlsError> {
        match self.sock.send(data, MsgFlags::DONTWAIT) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(TlsError::WantWrite),
            Err(err) => Err(TlsError::Io(err)),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> core::result::Result<usize, TlsError> {
        match self.sock.recv(buf, MsgFlags::DONTWAIT) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(TlsError::WantRead),
            Err(err) => Err(TlsError::Io(err)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAYER
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress of a TLS socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPhase {
    /// Inner socket not connected yet
    Initial,
    /// Inner connect in flight
    Connecting,
    Handshaking,
    Done,
}

struct TlsCtx {
    phase: TlsPhase,
    session: Box<dyn TlsSession>,
}

/// TLS half of a socket: the owned inner socket and the session.
///
/// The session mutex sits outside the lock tiers: it is held across calls
/// into the inner socket, which take the stack lock.
pub(crate) struct TlsLayer {
    inner: Socket,
    ctx: Mutex<TlsCtx>,
    options: TlsOptions,
}

impl TlsLayer {
    pub fn inner(&self) -> &Socket {
        &self.inner
    }

    pub fn phase(&self) -> TlsPhase {
        self.ctx().phase
    }

    fn ctx(&self) -> MutexGuard<'_, TlsCtx> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io(&self) -> InnerIo<'_> {
        InnerIo { sock: &self.inner }
    }
}

/// Wrap the stream socket `inner`, taking ownership of it.
pub(crate) fn wrap(inner: Socket, session: Box<dyn TlsSession>, options: TlsOptions) -> Result<Arc<SocketInner>> {
    if inner.kind() != SocketKind::Stream {
        return Err(Errno::EINVAL);
    }
    inner.set_nonblocking(true)?;

    let (phase, readiness) = {
        let st = inner.inner.lock();
        let phase = if st.flags.contains(SockFlags::CONNECTED) {
            TlsPhase::Handshaking
        } else if st.flags.contains(SockFlags::CONNECTING) {
            TlsPhase::Connecting
        } else {
            TlsPhase::Initial
        };
        (phase, st.events)
    };

    let mut state = SocketState::new(None, Inbox::Empty);
    state.events = readiness & !Events::OUT;
    let stack = inner.inner.stack.clone();
    let family = inner.family();
    let transport = inner.clone();
    let layer = TlsLayer {
        inner,
        ctx: Mutex::new(TlsCtx { phase, session }),
        options,
    };
    let sock = SocketInner::new(&stack, family, Kind::Tls(layer), state);

    let weak = Arc::downgrade(&sock);
    let relay: Relay = Arc::new(move |events: Events| {
        if let Some(tls) = weak.upgrade() {
            tls.raise(events);
        }
    });
    transport.inner.lock().relay = Some(relay);
    debug!(
        "socket {}: tls over socket {} ({:?})",
        sock.id,
        transport.id(),
        phase
    );
    Ok(sock)
}

/// Record a fatal session error on the TLS socket.
fn fatal(sock: &SocketInner, err: TlsError) -> Errno {
    if err.is_want() {
        return Errno::EAGAIN;
    }
    let errno = err.to_errno();
    warn!("socket {}: tls failed: {}", sock.id, err);
    sock.fail(errno);
    errno
}

/// Advance through the phases until `Done` or something would block.
fn advance(sock: &SocketInner, layer: &TlsLayer, ctx: &mut TlsCtx, remote: Option<IpEndpoint>) -> Result<()> {
    loop {
        match ctx.phase {
            TlsPhase::Initial => {
                let remote = remote.ok_or(Errno::ENOTCONN)?;
                match layer.inner.connect(remote) {
                    Ok(()) | Err(Errno::EISCONN) => ctx.phase = TlsPhase::Handshaking,
                    Err(Errno::EINPROGRESS) | Err(Errno::EALREADY) => {
                        ctx.phase = TlsPhase::Connecting;
                        return Err(Errno::EAGAIN);
                    }
                    Err(err) => return Err(err),
                }
            }
            TlsPhase::Connecting => {
                tcp::connect_status(&layer.inner.inner)?;
                ctx.phase = TlsPhase::Handshaking;
            }
            TlsPhase::Handshaking => {
                if let Err(err) = ctx.session.handshake(&mut layer.io()) {
                    return Err(fatal(sock, err));
                }
                ctx.phase = TlsPhase::Done;
                let wakeup = {
                    let mut st = sock.lock();
                    st.flags |= SockFlags::CONNECTED | SockFlags::BOUND;
                    sock.signal(&mut st, Events::OUT)
                };
                if let Some(wakeup) = wakeup {
                    wakeup.fire();
                }
                debug!("socket {}: handshake complete", sock.id);
            }
            TlsPhase::Done => return Ok(()),
        }
    }
}

/// Fail fast on a closed or failed TLS socket.
fn check(sock: &SocketInner) -> Result<SockFlags> {
    let st = sock.lock();
    st.check_open()?;
    match st.error {
        Some(err) => Err(err),
        None => Ok(st.flags),
    }
}

pub(crate) fn connect(sock: &Arc<SocketInner>, layer: &TlsLayer, remote: Option<IpEndpoint>) -> Result<()> {
    let first = layer.phase() == TlsPhase::Initial;
    let timeout = sock.send_timeout();
    let result = sock.block_on(timeout, MsgFlags::empty(), || {
        check(sock)?;
        let mut ctx = layer.ctx();
        advance(sock, layer, &mut ctx, remote)
    });
    match result {
        Err(Errno::EAGAIN) if first => Err(Errno::EINPROGRESS),
        Err(Errno::EAGAIN) => Err(Errno::EALREADY),
        other => other,
    }
}

pub(crate) fn send(sock: &Arc<SocketInner>, layer: &TlsLayer, data: &[u8], flags: MsgFlags) -> Result<usize> {
    let timeout = sock.send_timeout();
    sock.block_on(timeout, flags, || {
        let state = check(sock)?;
        if state.contains(SockFlags::TX_SHUTDOWN) {
            return Err(Errno::EPIPE);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let mut ctx = layer.ctx();
        advance(sock, layer, &mut ctx, None)?;
        let chunk = &data[..data.len().min(TLS_RECORD_MAX)];
        match ctx.session.write(&mut layer.io(), chunk) {
            Ok(n) => {
                trace!("socket {}: sealed {} bytes", sock.id, n);
                Ok(n)
            }
            Err(err) => Err(fatal(sock, err)),
        }
    })
}

pub(crate) fn recv(sock: &Arc<SocketInner>, layer: &TlsLayer, buf: &mut [u8], flags: MsgFlags) -> Result<usize> {
    if flags.contains(MsgFlags::PEEK) {
        return Err(Errno::EOPNOTSUPP);
    }
    let timeout = sock.recv_timeout();
    sock.block_on(timeout, flags, || {
        let state = {
            let st = sock.lock();
            st.check_open()?;
            st.flags
        };
        if state.intersects(SockFlags::RX_SHUTDOWN | SockFlags::PEER_CLOSED) {
            return Ok(0);
        }
        check(sock)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut ctx = layer.ctx();
        advance(sock, layer, &mut ctx, None)?;
        match ctx.session.read(&mut layer.io(), buf) {
            Ok(0) => {
                debug!("socket {}: close-notify received", sock.id);
                end_of_stream(sock);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(TlsError::ConnectionClosed) if layer.options.ragged_eof == RaggedEof::Eof => {
                debug!("socket {}: ragged eof treated as end of stream", sock.id);
                end_of_stream(sock);
                Ok(0)
            }
            Err(err) => Err(fatal(sock, err)),
        }
    })
}

fn end_of_stream(sock: &SocketInner) {
    let wakeup = {
        let mut st = sock.lock();
        st.flags |= SockFlags::PEER_CLOSED;
        sock.signal(&mut st, Events::IN | Events::RDHUP)
    };
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
}

pub(crate) fn shutdown(sock: &Arc<SocketInner>, layer: &TlsLayer, how: Shutdown) -> Result<()> {
    {
        let st = sock.lock();
        st.check_open()?;
    }
    if how.write() {
        let mut ctx = layer.ctx();
        if ctx.phase == TlsPhase::Done {
            if let Err(err) = ctx.session.close_notify(&mut layer.io()) {
                debug!("socket {}: close-notify not sent: {}", sock.id, err);
            }
        }
    }
    let wakeup = {
        let mut st = sock.lock();
        let mut events = Events::empty();
        if how.read() {
            st.flags |= SockFlags::RX_SHUTDOWN;
            events |= Events::IN;
        }
        if how.write() {
            st.flags |= SockFlags::TX_SHUTDOWN;
        }
        sock.signal(&mut st, events)
    };
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
    layer.inner.shutdown(how)
}

/// Close the TLS socket and the inner socket it owns.
///
/// One close-notify is attempted without blocking; a peer that is not
/// reading does not hold up the close.
pub(crate) fn close(sock: &Arc<SocketInner>, layer: &TlsLayer) -> Result<()> {
    sock.mark_closed()?;
    {
        let mut ctx = layer.ctx();
        if ctx.phase == TlsPhase::Done {
            match ctx.session.close_notify(&mut layer.io()) {
                Ok(()) => trace!("socket {}: close-notify sent", sock.id),
                Err(err) => debug!("socket {}: close-notify not sent: {}", sock.id, err),
            }
        }
    }
    layer.inner.inner.lock().relay = None;
    match layer.inner.close() {
        Ok(()) | Err(Errno::EBADF) => Ok(()),
        Err(err) => Err(err),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{AddressFamily, SockType};
    use crate::socket::SockOpt;
    use crate::testing::{connected_pair, listener, lo, loopback, manual, FramedSession};
    use std::thread;
    use std::time::{Duration, Instant};

    fn tls(sock: Socket, options: TlsOptions) -> (Socket, FramedSession) {
        let session = FramedSession::new();
        let tls = Socket::tls(sock, Box::new(session.clone()), options).unwrap();
        tls.set_option(SockOpt::RecvTimeout(Some(Duration::from_secs(5))))
            .unwrap();
        tls.set_option(SockOpt::SendTimeout(Some(Duration::from_secs(5))))
            .unwrap();
        (tls, session)
    }

    #[test]
    fn test_wrap_requires_stream() {
        let (stack, _) = loopback();
        let udp = Socket::new(&stack, AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        let err = Socket::tls(udp, Box::new(FramedSession::new()), TlsOptions::default()).unwrap_err();
        assert_eq!(err, Errno::EINVAL);
    }

    #[test]
    fn test_round_trip_and_close_notify() {
        let (stack, _) = loopback();
        let (client, server) = connected_pair(&stack, 9001);
        let (client, _) = tls(client, TlsOptions::default());
        let (server, _) = tls(server, TlsOptions::default());
        assert_eq!(client.tls_phase(), Some(TlsPhase::Handshaking));

        let peer = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let n = server.recv(&mut buf, MsgFlags::empty()).unwrap();
            server.send(&buf[..n], MsgFlags::empty()).unwrap();
            // Close-notify from the client ends the stream cleanly
            let eof = server.recv(&mut buf, MsgFlags::empty());
            server.close().unwrap();
            eof
        });

        client.handshake().unwrap();
        assert_eq!(client.tls_phase(), Some(TlsPhase::Done));
        assert_eq!(client.send(b"sealed", MsgFlags::empty()), Ok(6));
        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"sealed");
        client.close().unwrap();
        assert_eq!(peer.join().unwrap(), Ok(0));
    }

    #[test]
    fn test_connect_through_inner_socket() {
        let (stack, _) = loopback();
        let l = listener(&stack, 9002);
        let server = thread::spawn(move || {
            let (s, _) = l.accept().unwrap();
            let (s, _) = tls(s, TlsOptions::default());
            let mut buf = [0u8; 16];
            let n = s.recv(&mut buf, MsgFlags::empty()).unwrap();
            s.close().unwrap();
            buf[..n].to_vec()
        });

        let raw = Socket::new(&stack, AddressFamily::Inet, SockType::Stream, 0).unwrap();
        let (client, session) = tls(raw, TlsOptions::default());
        assert_eq!(client.tls_phase(), Some(TlsPhase::Initial));
        client.connect(lo(9002)).unwrap();
        assert_eq!(client.tls_phase(), Some(TlsPhase::Done));
        assert_eq!(client.peer_addr(), Ok(lo(9002)));
        client.send(b"hi", MsgFlags::empty()).unwrap();
        assert_eq!(server.join().unwrap(), b"hi");
        assert_eq!(session.handshake_starts(), 1);
    }

    #[test]
    fn test_repeated_connect_continues_handshake() {
        let (stack, _) = manual();
        let (client, server) = connected_pair(&stack, 9003);
        let (client, session) = tls(client, TlsOptions::default());
        let (server, _) = tls(server, TlsOptions::default());
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();

        // Client hello goes out, no answer yet
        assert_eq!(client.connect(lo(9003)), Err(Errno::EALREADY));
        assert_eq!(client.tls_phase(), Some(TlsPhase::Handshaking));
        assert_eq!(client.connect(lo(9003)), Err(Errno::EALREADY));
        assert_eq!(session.handshake_starts(), 1);
        assert!(session.handshake_steps() >= 2);

        // Server answers
        stack.run_once();
        assert_eq!(server.handshake(), Ok(()));
        stack.run_once();
        assert_eq!(client.connect(lo(9003)), Ok(()));
        assert_eq!(client.tls_phase(), Some(TlsPhase::Done));

        // Done: no-op
        let steps = session.handshake_steps();
        assert_eq!(client.connect(lo(9003)), Ok(()));
        assert_eq!(client.handshake(), Ok(()));
        assert_eq!(session.handshake_steps(), steps);
        assert_eq!(session.handshake_starts(), 1);
    }

    #[test]
    fn test_close_does_not_wait_for_stalled_peer() {
        let (stack, _) = manual();
        let (client, server) = connected_pair(&stack, 9006);
        let (client, _) = tls(client, TlsOptions::default());
        let (server, _) = tls(server, TlsOptions::default());
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        assert_eq!(client.connect(lo(9006)), Err(Errno::EALREADY));
        stack.run_once();
        assert_eq!(server.handshake(), Ok(()));
        stack.run_once();
        assert_eq!(client.connect(lo(9006)), Ok(()));

        // The server never reads, so the inner window fills up
        let chunk = [0x5au8; 4000];
        let mut stalled = false;
        for _ in 0..20 {
            match client.send(&chunk, MsgFlags::empty()) {
                Ok(_) => {}
                Err(Errno::EAGAIN) => {
                    stalled = true;
                    break;
                }
                Err(err) => panic!("send failed: {}", err),
            }
        }
        assert!(stalled);

        let started = Instant::now();
        assert_eq!(client.close(), Ok(()));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(client.is_closed());
        server.close().unwrap();
    }

    #[test]
    fn test_ragged_eof_is_configurable() {
        for (ragged_eof, expected) in [
            (RaggedEof::Error, Err(Errno::ECONNRESET)),
            (RaggedEof::Eof, Ok(0)),
        ] {
            let (stack, _) = loopback();
            let (client, server) = connected_pair(&stack, 9004);
            let options = TlsOptions { ragged_eof };
            let transport = server.clone();
            let (client, _) = tls(client, options);
            let (server, _) = tls(server, options);
            let peer = thread::spawn(move || {
                server.handshake().unwrap();
                // Drop the transport without a close-notify
                transport.close().unwrap();
                server
            });
            client.handshake().unwrap();
            let server = peer.join().unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(client.recv(&mut buf, MsgFlags::empty()), expected);
            drop(server);
        }
    }

    #[test]
    fn test_inner_readiness_is_relayed() {
        let (stack, _) = loopback();
        let (client, server) = connected_pair(&stack, 9005);
        let (client, _) = tls(client, TlsOptions::default());
        let (server, _) = tls(server, TlsOptions::default());
        let peer = thread::spawn(move || {
            server.handshake().unwrap();
            thread::sleep(Duration::from_millis(20));
            server.send(b"late", MsgFlags::empty()).unwrap();
            server
        });
        // Blocks until the relayed inner IN wakes it
        let mut buf = [0u8; 8];
        let n = client.recv(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"late");
        assert!(client.readiness().contains(Events::IN));
        let server = peer.join().unwrap();
        server.close().unwrap();
        client.close().unwrap();
        assert_eq!(client.close(), Err(Errno::EBADF));
    }
}
