//! Datagram and raw driver.
//!
//! Every datagram the engine delivers becomes one [`Datagram`] record. A
//! receive takes exactly one record; whatever does not fit the caller's
//! buffer is dropped with it. Sends are single-shot: datagrams are not flow
//! controlled, so `OUT` stays raised for the socket's lifetime.

use std::sync::Arc;

use log::{debug, trace};
use smoltcp::wire::IpEndpoint;

use super::{Inbox, Kind, Shutdown, SocketInner, SocketState};
use crate::addr::{self, AddressFamily};
use crate::buffer::RecordQueue;
use crate::config::{DGRAM_QUEUE_LEN, MAX_DATAGRAM};
use crate::engine::StackEvent;
use crate::error::{Errno, Result};
use crate::event::{Events, MsgFlags, SockFlags};
use crate::stack::{Handler, Stack, StackCore};

/// One received datagram and its source.
pub(crate) struct Datagram {
    pub data: Vec<u8>,
    pub from: IpEndpoint,
}

/// Create a UDP socket, or a raw socket for `protocol`.
pub(crate) fn new(stack: &Arc<Stack>, family: AddressFamily, protocol: Option<u8>) -> Result<Arc<SocketInner>> {
    let mut core = stack.lock();
    let (handle, kind) = match protocol {
        None => (core.engine.udp_new(family)?, Kind::Datagram),
        Some(p) => (core.engine.raw_new(family, p)?, Kind::Raw(p)),
    };
    let mut state = SocketState::new(
        Some(handle),
        Inbox::Datagram(RecordQueue::with_limit(DGRAM_QUEUE_LEN)),
    );
    state.events = Events::OUT;
    let sock = SocketInner::new(stack, family, kind, state);
    core.register(handle, Handler::Socket(sock.clone()));
    trace!("socket {}: datagram on {} ({:?})", sock.id, handle, protocol);
    Ok(sock)
}

pub(crate) fn bind(sock: &Arc<SocketInner>, local: IpEndpoint) -> Result<()> {
    addr::check_family(sock.family, &local)?;
    let mut core = sock.stack.lock();
    let handle = sock.handle()?;
    if sock.lock().flags.contains(SockFlags::BOUND) {
        return Err(Errno::EINVAL);
    }
    let bound = core.engine.dgram_bind(handle, addr::listen_endpoint(&local))?;
    let mut st = sock.lock();
    st.local = Some(bound);
    st.flags |= SockFlags::BOUND;
    debug!("socket {}: bound to {}", sock.id, bound);
    Ok(())
}

/// Fix the default destination and only accept datagrams from it.
pub(crate) fn connect(sock: &Arc<SocketInner>, remote: IpEndpoint) -> Result<()> {
    addr::check_family(sock.family, &remote)?;
    let mut core = sock.stack.lock();
    let handle = sock.handle()?;
    core.engine.dgram_connect(handle, remote)?;
    let local = core.engine.local_endpoint(handle);

    let mut st = sock.lock();
    st.remote = Some(remote);
    st.flags |= SockFlags::CONNECTED;
    if local.is_some() {
        st.local = local;
        st.flags |= SockFlags::BOUND;
    }
    debug!("socket {}: default peer {}", sock.id, remote);
    Ok(())
}

/// Send one datagram in a single pass.
pub(crate) fn send_to(
    sock: &Arc<SocketInner>,
    data: &[u8],
    to: Option<IpEndpoint>,
    flags: MsgFlags,
) -> Result<usize> {
    if data.len() > MAX_DATAGRAM {
        return Err(Errno::EMSGSIZE);
    }
    let mut core = sock.stack.lock();
    let (handle, dest) = {
        let st = sock.lock();
        st.check_open()?;
        if st.flags.contains(SockFlags::TX_SHUTDOWN) {
            return Err(Errno::EPIPE);
        }
        let connected = st.remote.filter(|_| st.flags.contains(SockFlags::CONNECTED));
        let dest = to.or(connected).ok_or(Errno::EDESTADDRREQ)?;
        let handle = st.handle.ok_or(Errno::EBADF)?;
        (handle, dest)
    };
    addr::check_family(sock.family, &dest)?;
    core.engine.dgram_sendto(handle, data, Some(dest))?;

    // An implicit bind happens on the first send
    if let Some(local) = core.engine.local_endpoint(handle) {
        let mut st = sock.lock();
        if st.local.is_none() {
            st.local = Some(local);
            st.flags |= SockFlags::BOUND;
        }
    }
    trace!("socket {}: {} bytes to {} ({:?})", sock.id, data.len(), dest, flags);
    Ok(data.len())
}

pub(crate) fn recv_from(
    sock: &Arc<SocketInner>,
    buf: &mut [u8],
    flags: MsgFlags,
) -> Result<(usize, Option<IpEndpoint>)> {
    let timeout = sock.recv_timeout();
    let peek = flags.contains(MsgFlags::PEEK);
    sock.block_on(timeout, flags, || {
        let mut st = sock.lock();
        st.check_open()?;
        if st.flags.contains(SockFlags::RX_SHUTDOWN) {
            return Ok((0, None));
        }
        let error = st.error;
        let Inbox::Datagram(queue) = &mut st.inbox else {
            return Err(Errno::EBADF);
        };
        let received = if peek {
            queue.front().map(|d| copy_out(d, buf))
        } else {
            queue.pop().map(|d| {
                let (n, from) = copy_out(&d, buf);
                if n < d.data.len() {
                    trace!("socket {}: truncated {} of {} bytes", sock.id, d.data.len() - n, d.data.len());
                }
                (n, from)
            })
        };
        let drained = queue.is_empty();
        match received {
            Some(result) => {
                if drained && !peek {
                    st.events.remove(Events::IN);
                }
                Ok(result)
            }
            None => Err(error.unwrap_or(Errno::EAGAIN)),
        }
    })
}

fn copy_out(d: &Datagram, buf: &mut [u8]) -> (usize, Option<IpEndpoint>) {
    let n = d.data.len().min(buf.len());
    buf[..n].copy_from_slice(&d.data[..n]);
    (n, Some(d.from))
}

pub(crate) fn shutdown(sock: &Arc<SocketInner>, how: Shutdown) -> Result<()> {
    let wakeup = {
        let mut st = sock.lock();
        st.check_open()?;
        if !st.flags.contains(SockFlags::CONNECTED) {
            return Err(Errno::ENOTCONN);
        }
        let mut events = Events::empty();
        if how.read() {
            st.flags |= SockFlags::RX_SHUTDOWN;
            if let Inbox::Datagram(queue) = &mut st.inbox {
                let dropped = queue.drain().count();
                trace!("socket {}: dropped {} queued datagrams", sock.id, dropped);
            }
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
    Ok(())
}

pub(crate) fn close(sock: &Arc<SocketInner>) -> Result<()> {
    let mut core = sock.stack.lock();
    let (handle, inbox) = sock.mark_closed()?;
    if let Some(handle) = handle {
        core.unregister(handle);
        core.engine.dgram_remove(handle);
    }
    drop(inbox);
    Ok(())
}

pub(crate) fn on_event(_core: &mut StackCore, sock: &Arc<SocketInner>, event: StackEvent) {
    let StackEvent::Datagram { pcb, data, from } = event else {
        trace!("socket {}: ignoring {:?}", sock.id, event);
        return;
    };
    let wakeup = {
        let mut st = sock.lock();
        if st.flags.contains(SockFlags::RX_SHUTDOWN) {
            return;
        }
        let len = data.len();
        let pushed = match &mut st.inbox {
            Inbox::Datagram(queue) => queue.push(Datagram { data, from }).is_ok(),
            _ => false,
        };
        if !pushed {
            debug!("socket {}: queue full, dropped {} bytes from {} on {}", sock.id, len, from, pcb);
            return;
        }
        sock.signal(&mut st, Events::IN)
    };
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::SockType;
    use crate::socket::{SockOpt, SockOptName, Socket};
    use crate::testing::{lo, loopback, manual};
    use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet};
    use std::time::Duration;

    fn udp(stack: &Arc<Stack>, port: u16) -> Socket {
        let sock = Socket::new(stack, AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        sock.bind(lo(port)).unwrap();
        sock.set_option(SockOpt::RecvTimeout(Some(Duration::from_secs(5))))
            .unwrap();
        sock
    }

    #[test]
    fn test_truncation_discards_remainder() {
        let (stack, _) = loopback();
        let rx = udp(&stack, 6001);
        let tx = udp(&stack, 6002);
        let payload: Vec<u8> = (0..100u8).collect();
        assert_eq!(tx.send_to(&payload, lo(6001), MsgFlags::empty()), Ok(100));
        assert_eq!(tx.send_to(b"next", lo(6001), MsgFlags::empty()), Ok(4));

        let mut small = [0u8; 10];
        let (n, from) = rx.recv_from(&mut small, MsgFlags::empty()).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&small[..], &payload[..10]);
        assert_eq!(from, Some(lo(6002)));

        let mut buf = [0u8; 64];
        let (n, _) = rx.recv_from(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[test]
    fn test_peek_keeps_record() {
        let (stack, _) = loopback();
        let rx = udp(&stack, 6003);
        let tx = udp(&stack, 0);
        tx.send_to(b"twice", lo(6003), MsgFlags::empty()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(rx.recv(&mut buf, MsgFlags::PEEK), Ok(5));
        assert_eq!(rx.recv(&mut buf, MsgFlags::empty()), Ok(5));
        assert_eq!(rx.recv(&mut buf, MsgFlags::DONTWAIT), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_send_needs_destination() {
        let (stack, _) = loopback();
        let sock = Socket::new(&stack, AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        assert_eq!(sock.send(b"x", MsgFlags::empty()), Err(Errno::EDESTADDRREQ));
        assert_eq!(sock.shutdown(Shutdown::Write), Err(Errno::ENOTCONN));
    }

    #[test]
    fn test_connected_socket_filters_sources() {
        let (stack, _) = loopback();
        let rx = udp(&stack, 6004);
        let friend = udp(&stack, 6005);
        let stranger = udp(&stack, 6006);
        rx.connect(lo(6005)).unwrap();
        assert_eq!(rx.peer_addr(), Ok(lo(6005)));

        stranger.send_to(b"spam", lo(6004), MsgFlags::empty()).unwrap();
        friend.send_to(b"hi", lo(6004), MsgFlags::empty()).unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = rx.recv_from(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, Some(lo(6005)));

        // Connected sockets send without an address
        assert_eq!(rx.send(b"back", MsgFlags::empty()), Ok(4));
        let (n, _) = friend.recv_from(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn test_raw_socket_sees_ipv4_header() {
        let (stack, _) = loopback();
        let raw = Socket::new(&stack, AddressFamily::Inet, SockType::Raw, 253).unwrap();
        raw.set_option(SockOpt::RecvTimeout(Some(Duration::from_secs(5))))
            .unwrap();
        raw.send_to(b"probe", lo(0), MsgFlags::empty()).unwrap();

        let mut buf = [0u8; 128];
        let (n, from) = raw.recv_from(&mut buf, MsgFlags::empty()).unwrap();
        let packet = Ipv4Packet::new_checked(&buf[..n]).unwrap();
        assert_eq!(packet.next_header(), IpProtocol::from(253u8));
        assert_eq!(packet.payload(), b"probe");
        assert_eq!(from.map(|f| f.addr), Some(IpAddress::Ipv4(crate::config::LOOPBACK)));
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (stack, _) = manual();
        let rx = udp(&stack, 6007);
        let tx = udp(&stack, 0);
        for i in 0..DGRAM_QUEUE_LEN + 5 {
            tx.send_to(&[i as u8], lo(6007), MsgFlags::empty()).unwrap();
        }
        stack.run_once();
        assert_eq!(
            rx.option(SockOptName::RecvBuffer),
            Ok(SockOpt::RecvBuffer(DGRAM_QUEUE_LEN))
        );
        let mut buf = [0u8; 1];
        rx.recv(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_read_shutdown_returns_zero() {
        let (stack, _) = loopback();
        let rx = udp(&stack, 6008);
        rx.connect(lo(6009)).unwrap();
        rx.shutdown(Shutdown::Read).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(rx.recv_from(&mut buf, MsgFlags::empty()), Ok((0, None)));
        rx.close().unwrap();
        assert_eq!(rx.recv(&mut buf, MsgFlags::empty()), Err(Errno::EBADF));
    }
}
