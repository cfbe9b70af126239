//! Stream driver.
//!
//! States: unbound, bound, connecting, connected, half-closed (either
//! direction), closed. A listening socket queues one [`AcceptRecord`] per
//! connection the engine accepted; until `accept()` claims it the
//! connection's callbacks go to a [`PendingConn`] so nothing is lost and
//! nothing reaches a socket that does not exist yet.
//!
//! `shutdown` never frees the engine connection; only `close` (or an engine
//! error) does.

use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use smoltcp::wire::IpEndpoint;

use super::{Inbox, Kind, Shutdown, SocketInner, SocketState, Wakeup};
use crate::addr::{self, AddressFamily};
use crate::buffer::{ByteBuffer, RecordQueue};
use crate::config::{DEFAULT_BACKLOG, MAX_BACKLOG};
use crate::engine::{Handle, StackEvent};
use crate::error::{Errno, Result, StackError};
use crate::event::{Events, MsgFlags, SockFlags};
use crate::lock::SocketLock;
use crate::stack::{Handler, Stack, StackCore};

// ═══════════════════════════════════════════════════════════════════════════════
// ACCEPT RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// What happened to a connection before anyone accepted it.
#[derive(Default)]
pub(crate) struct PendingState {
    data: ByteBuffer,
    fin: bool,
    error: Option<Errno>,
    /// The engine freed the connection
    dead: bool,
    /// Ownership moved to an accepted socket
    claimed: bool,
}

/// Callback target for an accepted, not yet claimed connection.
pub(crate) struct PendingConn {
    state: SocketLock<PendingState>,
}

impl PendingConn {
    pub fn new() -> Self {
        Self {
            state: SocketLock::new(PendingState::default()),
        }
    }
}

/// One queued incoming connection.
///
/// Dropping an unclaimed record aborts its connection, so a listener closed
/// with records queued tears every one of them down exactly once.
pub(crate) struct AcceptRecord {
    conn: Handle,
    pending: Arc<PendingConn>,
    local: IpEndpoint,
    remote: IpEndpoint,
    stack: Weak<Stack>,
}

impl Drop for AcceptRecord {
    fn drop(&mut self) {
        let unclaimed = {
            let st = self.pending.state.lock();
            !st.claimed && !st.dead
        };
        if unclaimed {
            if let Some(stack) = self.stack.upgrade() {
                stack.defer_abort(self.conn);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn new(stack: &Arc<Stack>, family: AddressFamily) -> Result<Arc<SocketInner>> {
    let mut core = stack.lock();
    let handle = core.engine.tcp_new(family)?;
    let mut state = SocketState::new(Some(handle), Inbox::Stream(ByteBuffer::new()));
    state.events = Events::OUT;
    let sock = SocketInner::new(stack, family, Kind::Stream, state);
    core.register(handle, Handler::Socket(sock.clone()));
    trace!("socket {}: stream on {}", sock.id, handle);
    Ok(sock)
}

pub(crate) fn bind(sock: &Arc<SocketInner>, local: IpEndpoint) -> Result<()> {
    addr::check_family(sock.family, &local)?;
    let mut core = sock.stack.lock();
    let handle = sock.handle()?;
    if sock.lock().flags.contains(SockFlags::BOUND) {
        return Err(Errno::EINVAL);
    }
    let bound = core.engine.tcp_bind(handle, addr::listen_endpoint(&local))?;
    let mut st = sock.lock();
    st.local = Some(bound);
    st.flags |= SockFlags::BOUND;
    debug!("socket {}: bound to {}", sock.id, bound);
    Ok(())
}

pub(crate) fn listen(sock: &Arc<SocketInner>, backlog: u8) -> Result<()> {
    let backlog = match backlog {
        0 => DEFAULT_BACKLOG,
        n => n.min(MAX_BACKLOG),
    };
    let mut core = sock.stack.lock();
    let handle = sock.handle()?;
    if sock
        .lock()
        .flags
        .intersects(SockFlags::CONNECTED | SockFlags::CONNECTING)
    {
        return Err(Errno::EINVAL);
    }
    core.engine.tcp_listen(handle, backlog)?;
    let local = core.engine.local_endpoint(handle);

    let mut st = sock.lock();
    st.flags |= SockFlags::LISTENING | SockFlags::BOUND;
    if local.is_some() {
        st.local = local;
    }
    match &mut st.inbox {
        Inbox::Accept(queue) => queue.set_limit(Some(usize::from(backlog))),
        inbox => *inbox = Inbox::Accept(RecordQueue::with_limit(usize::from(backlog))),
    }
    st.events.remove(Events::OUT);
    debug!("socket {}: listening on {:?}, backlog {}", sock.id, st.local, backlog);
    Ok(())
}

pub(crate) fn connect(sock: &Arc<SocketInner>, remote: IpEndpoint) -> Result<()> {
    addr::check_family(sock.family, &remote)?;
    {
        let mut core = sock.stack.lock();
        let mut st = sock.lock();
        st.check_open()?;
        if st.flags.contains(SockFlags::LISTENING) {
            return Err(Errno::EINVAL);
        }
        if st.flags.contains(SockFlags::CONNECTED) {
            return Err(Errno::EISCONN);
        }
        if st.flags.contains(SockFlags::CONNECTING) {
            if st.flags.contains(SockFlags::NONBLOCKING) {
                return Err(Errno::EALREADY);
            }
        } else {
            if let Some(err) = st.error {
                return Err(err);
            }
            let handle = st.handle.ok_or(Errno::ECONNABORTED)?;
            core.engine.tcp_connect(handle, remote)?;
            st.flags |= SockFlags::CONNECTING | SockFlags::BOUND;
            st.remote = Some(remote);
            if let Some(local) = core.engine.local_endpoint(handle) {
                st.local = Some(local);
            }
            debug!("socket {}: connecting to {}", sock.id, remote);
            if st.flags.contains(SockFlags::NONBLOCKING) {
                return Err(Errno::EINPROGRESS);
            }
        }
    }
    let timeout = sock.send_timeout();
    sock.block_on(timeout, MsgFlags::empty(), || connect_status(sock))
}

/// `Ok` once connected, `EAGAIN` while the connect is in flight.
pub(crate) fn connect_status(sock: &SocketInner) -> Result<()> {
    let st = sock.lock();
    st.check_open()?;
    if st.flags.contains(SockFlags::CONNECTED) {
        Ok(())
    } else if let Some(err) = st.error {
        Err(err)
    } else if st.flags.contains(SockFlags::CONNECTING) {
        Err(Errno::EAGAIN)
    } else {
        Err(Errno::ENOTCONN)
    }
}

pub(crate) fn accept(sock: &Arc<SocketInner>) -> Result<(Arc<SocketInner>, IpEndpoint)> {
    let timeout = sock.recv_timeout();
    sock.block_on(timeout, MsgFlags::empty(), || {
        let record = {
            let mut st = sock.lock();
            st.check_open()?;
            if !st.flags.contains(SockFlags::LISTENING) {
                return Err(Errno::EINVAL);
            }
            let Inbox::Accept(queue) = &mut st.inbox else {
                return Err(Errno::EINVAL);
            };
            let record = queue.pop();
            if queue.is_empty() {
                st.events.remove(Events::IN);
            }
            match record {
                Some(record) => record,
                None => return Err(st.error.unwrap_or(Errno::EAGAIN)),
            }
        };
        claim(sock, record)
    })
}

/// Turn a popped record into a connected socket.
fn claim(listener: &Arc<SocketInner>, record: AcceptRecord) -> Result<(Arc<SocketInner>, IpEndpoint)> {
    let mut core = listener.stack.lock();
    let mut pending = record.pending.state.lock();
    pending.claimed = true;
    if pending.dead {
        debug!(
            "socket {}: {} died before accept ({:?})",
            listener.id, record.conn, pending.error
        );
        return Err(Errno::ECONNABORTED);
    }

    let data = std::mem::take(&mut pending.data);
    let mut state = SocketState::new(Some(record.conn), Inbox::Stream(data));
    state.flags = SockFlags::BOUND | SockFlags::CONNECTED;
    state.local = Some(record.local);
    state.remote = Some(record.remote);
    state.events = Events::OUT;
    if pending.fin {
        state.flags |= SockFlags::PEER_CLOSED;
        state.events |= Events::IN | Events::RDHUP;
    }
    if !state.inbox.is_empty() {
        state.events |= Events::IN;
    }

    let sock = SocketInner::new(&listener.stack, listener.family, Kind::Stream, state);
    core.register(record.conn, Handler::Socket(sock.clone()));
    core.engine.tcp_backlog_accepted(record.conn);
    debug!(
        "socket {}: accepted {} from {} as socket {}",
        listener.id, record.conn, record.remote, sock.id
    );
    Ok((sock, record.remote))
}

pub(crate) fn send(sock: &Arc<SocketInner>, data: &[u8], flags: MsgFlags) -> Result<usize> {
    let timeout = sock.send_timeout();
    sock.block_on(timeout, flags, || try_send(sock, data))
}

/// Write what the send window allows; `EAGAIN` only when it is zero.
fn try_send(sock: &SocketInner, data: &[u8]) -> Result<usize> {
    let mut core = sock.stack.lock();
    let (handle, window) = {
        let mut st = sock.lock();
        st.check_open()?;
        if st.flags.contains(SockFlags::TX_SHUTDOWN) {
            return Err(Errno::EPIPE);
        }
        if let Some(err) = st.error {
            return Err(err);
        }
        if !st.flags.contains(SockFlags::CONNECTED) {
            return Err(if st.flags.contains(SockFlags::CONNECTING) {
                Errno::EAGAIN
            } else {
                Errno::ENOTCONN
            });
        }
        if data.is_empty() {
            return Ok(0);
        }
        let handle = st.handle.ok_or(Errno::EPIPE)?;
        let window = core.engine.tcp_sndbuf(handle);
        if window == 0 {
            st.events.remove(Events::OUT);
            return Err(Errno::EAGAIN);
        }
        (handle, window)
    };
    let n = window.min(data.len());
    core.engine.tcp_write(handle, &data[..n])?;
    trace!("socket {}: wrote {}/{} bytes", sock.id, n, data.len());
    Ok(n)
}

pub(crate) fn recv(sock: &Arc<SocketInner>, buf: &mut [u8], flags: MsgFlags) -> Result<usize> {
    if buf.is_empty() {
        return sock.lock().check_open().map(|()| 0);
    }
    let timeout = sock.recv_timeout();
    let peek = flags.contains(MsgFlags::PEEK);
    sock.block_on(timeout, flags, || try_recv(sock, buf, peek))
}

/// Drain the byte buffer; 0 only at end of stream.
fn try_recv(sock: &SocketInner, buf: &mut [u8], peek: bool) -> Result<usize> {
    let n = {
        let mut st = sock.lock();
        st.check_open()?;
        if st.flags.contains(SockFlags::LISTENING) {
            return Err(Errno::ENOTCONN);
        }
        if st.flags.contains(SockFlags::RX_SHUTDOWN) {
            return Ok(0);
        }
        let peer_closed = st.flags.contains(SockFlags::PEER_CLOSED);
        let Inbox::Stream(data) = &mut st.inbox else {
            return Err(Errno::ENOTCONN);
        };
        if data.is_empty() {
            return if peer_closed {
                Ok(0)
            } else if let Some(err) = st.error {
                Err(err)
            } else if st
                .flags
                .intersects(SockFlags::CONNECTED | SockFlags::CONNECTING)
            {
                Err(Errno::EAGAIN)
            } else {
                Err(Errno::ENOTCONN)
            };
        }
        if peek {
            return Ok(data.peek(buf));
        }
        let n = data.pop(buf);
        if data.is_empty() && !peer_closed {
            st.events.remove(Events::IN);
        }
        n
    };
    acknowledge(sock, n);
    Ok(n)
}

/// Return flow-control credit for bytes that left the buffer.
fn acknowledge(sock: &SocketInner, n: usize) {
    let mut core = sock.stack.lock();
    let handle = sock.lock().handle;
    if let Some(handle) = handle {
        core.engine.tcp_recved(handle, n);
    }
}

pub(crate) fn shutdown(sock: &Arc<SocketInner>, how: Shutdown) -> Result<()> {
    let mut core = sock.stack.lock();
    let (handle, dropped, wakeup) = {
        let mut st = sock.lock();
        st.check_open()?;
        if !st.flags.contains(SockFlags::CONNECTED) {
            return Err(Errno::ENOTCONN);
        }
        let mut dropped = 0;
        let mut events = Events::empty();
        if how.read() {
            st.flags |= SockFlags::RX_SHUTDOWN;
            if let Inbox::Stream(data) = &mut st.inbox {
                dropped = data.discard();
            }
            // Reads return 0 from now on
            events |= Events::IN;
        }
        if how.write() {
            st.flags |= SockFlags::TX_SHUTDOWN;
        }
        if st
            .flags
            .contains(SockFlags::RX_SHUTDOWN | SockFlags::TX_SHUTDOWN)
        {
            events |= Events::HUP;
        }
        let wakeup = sock.signal(&mut st, events);
        (st.handle, dropped, wakeup)
    };
    let result = match handle {
        Some(handle) => {
            let result = core.engine.tcp_shutdown(handle, how.read(), how.write());
            if dropped > 0 {
                core.engine.tcp_recved(handle, dropped);
            }
            result.map_err(Errno::from)
        }
        None => Ok(()),
    };
    drop(core);
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
    debug!("socket {}: shutdown {:?}", sock.id, how);
    result
}

pub(crate) fn close(sock: &Arc<SocketInner>) -> Result<()> {
    let mut core = sock.stack.lock();
    let (handle, inbox) = sock.mark_closed()?;
    if let Some(handle) = handle {
        core.unregister(handle);
        if let Err(StackError::Mem) = core.engine.tcp_close(handle) {
            warn!("socket {}: close of {} failed, aborting", sock.id, handle);
            core.engine.tcp_abort(handle);
        }
    }
    // Unclaimed connections are aborted as their records drop
    if let Inbox::Accept(queue) = &inbox {
        if !queue.is_empty() {
            debug!("socket {}: dropping {} queued connections", sock.id, queue.len());
        }
    }
    drop(inbox);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACKS (stack lock held)
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn on_event(core: &mut StackCore, sock: &Arc<SocketInner>, event: StackEvent) {
    let wakeup = match event {
        StackEvent::Connected { conn } => {
            let local = core.engine.local_endpoint(conn);
            let mut st = sock.lock();
            st.flags.remove(SockFlags::CONNECTING);
            st.flags |= SockFlags::CONNECTED | SockFlags::BOUND;
            if local.is_some() {
                st.local = local;
            }
            debug!("socket {}: connected", sock.id);
            sock.signal(&mut st, Events::OUT)
        }
        StackEvent::Received { conn, data } => on_received(core, sock, conn, &data),
        StackEvent::Fin { .. } => {
            let mut st = sock.lock();
            st.flags |= SockFlags::PEER_CLOSED;
            let mut events = Events::IN | Events::RDHUP;
            if st.flags.contains(SockFlags::TX_SHUTDOWN) {
                events |= Events::HUP;
            }
            trace!("socket {}: peer closed", sock.id);
            sock.signal(&mut st, events)
        }
        StackEvent::Sent { .. } => {
            let mut st = sock.lock();
            sock.signal(&mut st, Events::OUT)
        }
        StackEvent::Error { conn, err } => {
            core.unregister(conn);
            let mut st = sock.lock();
            st.handle = None;
            st.flags.remove(SockFlags::CONNECTED | SockFlags::CONNECTING);
            st.latch(err.to_errno());
            debug!("socket {}: {} failed: {}", sock.id, conn, err);
            sock.signal(&mut st, Events::ERR | Events::HUP | Events::IN | Events::OUT)
        }
        StackEvent::Accepted {
            conn,
            local,
            remote,
            ..
        } => on_accepted(core, sock, conn, local, remote),
        other => {
            trace!("socket {}: ignoring {:?}", sock.id, other);
            None
        }
    };
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
}

fn on_received(core: &mut StackCore, sock: &Arc<SocketInner>, conn: Handle, data: &[u8]) -> Option<Wakeup> {
    let mut st = sock.lock();
    if st.flags.contains(SockFlags::RX_SHUTDOWN) {
        drop(st);
        core.engine.tcp_recved(conn, data.len());
        return None;
    }
    let pushed = match &mut st.inbox {
        Inbox::Stream(buf) => buf.push(data),
        _ => Err(Errno::EPROTO),
    };
    match pushed {
        Ok(()) => sock.signal(&mut st, Events::IN),
        Err(err) => {
            warn!(
                "socket {}: cannot buffer {} bytes ({}), aborting {}",
                sock.id,
                data.len(),
                err,
                conn
            );
            st.handle = None;
            st.flags.remove(SockFlags::CONNECTED | SockFlags::CONNECTING);
            st.latch(err);
            let wakeup = sock.signal(&mut st, Events::ERR | Events::HUP);
            drop(st);
            core.unregister(conn);
            core.engine.tcp_abort(conn);
            wakeup
        }
    }
}

fn on_accepted(
    core: &mut StackCore,
    listener: &Arc<SocketInner>,
    conn: Handle,
    local: IpEndpoint,
    remote: IpEndpoint,
) -> Option<Wakeup> {
    let pending = Arc::new(PendingConn::new());
    core.register(conn, Handler::Pending(pending.clone()));
    let record = AcceptRecord {
        conn,
        pending,
        local,
        remote,
        stack: Arc::downgrade(&listener.stack),
    };

    let mut st = listener.lock();
    let open = !st.is_closed() && st.flags.contains(SockFlags::LISTENING);
    let pushed = match &mut st.inbox {
        Inbox::Accept(queue) if open => queue.push(record),
        _ => Err(record),
    };
    match pushed {
        Ok(()) => {
            trace!("socket {}: queued {} from {}", listener.id, conn, remote);
            listener.signal(&mut st, Events::IN)
        }
        Err(record) => {
            drop(st);
            warn!("socket {}: cannot queue {}, aborting", listener.id, conn);
            drop(record);
            None
        }
    }
}

/// Callbacks for a connection still waiting in an accept queue.
pub(crate) fn on_pending_event(core: &mut StackCore, pending: &Arc<PendingConn>, event: StackEvent) {
    let mut st = pending.state.lock();
    match event {
        StackEvent::Received { conn, data } => {
            let pushed = st.data.push(&data);
            if let Err(err) = pushed {
                warn!("pending {}: cannot buffer {} bytes, aborting", conn, data.len());
                st.dead = true;
                st.error = Some(err);
                drop(st);
                core.unregister(conn);
                core.engine.tcp_abort(conn);
            }
        }
        StackEvent::Fin { .. } => st.fin = true,
        StackEvent::Error { conn, err } => {
            st.dead = true;
            st.error = Some(err.to_errno());
            drop(st);
            core.unregister(conn);
            debug!("pending {}: failed before accept: {}", conn, err);
        }
        other => trace!("pending {}: ignoring {:?}", other.target(), other),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
