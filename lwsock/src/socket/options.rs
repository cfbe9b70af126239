//! Socket options (`getsockopt`/`setsockopt`).

use core::time::Duration;
use std::sync::Arc;

use log::debug;

use super::{Kind, SocketInner, SocketKind};
use crate::error::{Errno, Result};
use crate::event::{Events, SockFlags};

/// An option together with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// `SO_RCVTIMEO`; `None` blocks forever
    RecvTimeout(Option<Duration>),
    /// `SO_SNDTIMEO`; also bounds a blocking connect
    SendTimeout(Option<Duration>),
    /// `TCP_NODELAY`
    NoDelay(bool),
    /// `SO_REUSEADDR` (stored)
    ReuseAddr(bool),
    /// `SO_KEEPALIVE` (stored)
    KeepAlive(bool),
    /// `SO_ERROR`; reports the latched error once, later calls still fail with it
    Error(Option<Errno>),
    /// `SO_TYPE`
    Type(SocketKind),
    /// `SO_ACCEPTCONN`
    AcceptConn(bool),
    /// `SO_RCVBUF`: bytes (or records) currently queued
    RecvBuffer(usize),
}

/// Names for [`SockOpt`] queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptName {
    RecvTimeout,
    SendTimeout,
    NoDelay,
    ReuseAddr,
    KeepAlive,
    Error,
    Type,
    AcceptConn,
    RecvBuffer,
}

impl SockOpt {
    pub fn name(&self) -> SockOptName {
        match self {
            SockOpt::RecvTimeout(_) => SockOptName::RecvTimeout,
            SockOpt::SendTimeout(_) => SockOptName::SendTimeout,
            SockOpt::NoDelay(_) => SockOptName::NoDelay,
            SockOpt::ReuseAddr(_) => SockOptName::ReuseAddr,
            SockOpt::KeepAlive(_) => SockOptName::KeepAlive,
            SockOpt::Error(_) => SockOptName::Error,
            SockOpt::Type(_) => SockOptName::Type,
            SockOpt::AcceptConn(_) => SockOptName::AcceptConn,
            SockOpt::RecvBuffer(_) => SockOptName::RecvBuffer,
        }
    }
}

pub(crate) fn set(sock: &Arc<SocketInner>, option: SockOpt) -> Result<()> {
    match option {
        SockOpt::RecvTimeout(t) => {
            let mut st = sock.lock();
            st.check_open()?;
            st.recv_timeout = t;
        }
        SockOpt::SendTimeout(t) => {
            let mut st = sock.lock();
            st.check_open()?;
            st.send_timeout = t;
        }
        SockOpt::NoDelay(enabled) => match &sock.kind {
            Kind::Stream => {
                let mut core = sock.stack.lock();
                let handle = {
                    let mut st = sock.lock();
                    st.check_open()?;
                    st.options.nodelay = enabled;
                    st.handle
                };
                if let Some(handle) = handle {
                    core.engine.tcp_set_nodelay(handle, enabled);
                }
            }
            Kind::Tls(layer) => set(&layer.inner().inner, option)?,
            _ => return Err(Errno::ENOPROTOOPT),
        },
        SockOpt::ReuseAddr(enabled) => {
            let mut st = sock.lock();
            st.check_open()?;
            st.options.reuse_addr = enabled;
        }
        SockOpt::KeepAlive(enabled) => {
            let mut st = sock.lock();
            st.check_open()?;
            st.options.keepalive = enabled;
        }
        SockOpt::Error(_) | SockOpt::Type(_) | SockOpt::AcceptConn(_) | SockOpt::RecvBuffer(_) => {
            return Err(Errno::ENOPROTOOPT);
        }
    }
    debug!("socket {}: {:?}", sock.id, option);
    Ok(())
}

pub(crate) fn get(sock: &Arc<SocketInner>, name: SockOptName) -> Result<SockOpt> {
    if let (SockOptName::NoDelay, Kind::Tls(layer)) = (name, &sock.kind) {
        return get(&layer.inner().inner, name);
    }

    let mut st = sock.lock();
    st.check_open()?;
    let option = match name {
        SockOptName::RecvTimeout => SockOpt::RecvTimeout(st.recv_timeout),
        SockOptName::SendTimeout => SockOpt::SendTimeout(st.send_timeout),
        SockOptName::NoDelay => match sock.kind {
            Kind::Stream => SockOpt::NoDelay(st.options.nodelay),
            _ => return Err(Errno::ENOPROTOOPT),
        },
        SockOptName::ReuseAddr => SockOpt::ReuseAddr(st.options.reuse_addr),
        SockOptName::KeepAlive => SockOpt::KeepAlive(st.options.keepalive),
        SockOptName::Error => {
            let err = st.pending_error.take();
            st.events.remove(Events::ERR);
            SockOpt::Error(err)
        }
        SockOptName::Type => SockOpt::Type(sock.kind.public()),
        SockOptName::AcceptConn => SockOpt::AcceptConn(st.flags.contains(SockFlags::LISTENING)),
        SockOptName::RecvBuffer => SockOpt::RecvBuffer(st.inbox.queued()),
    };
    Ok(option)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{AddressFamily, SockType};
    use crate::socket::Socket;
    use crate::event::MsgFlags;
    use crate::testing::{lo, loopback};

    #[test]
    fn test_timeouts_round_trip() {
        let (stack, _) = loopback();
        let sock = Socket::new(&stack, AddressFamily::Inet, SockType::Stream, 0).unwrap();
        let t = Some(Duration::from_millis(250));
        sock.set_option(SockOpt::RecvTimeout(t)).unwrap();
        assert_eq!(sock.option(SockOptName::RecvTimeout), Ok(SockOpt::RecvTimeout(t)));
        assert_eq!(sock.option(SockOptName::SendTimeout), Ok(SockOpt::SendTimeout(None)));
    }

    #[test]
    fn test_nodelay_is_stream_only() {
        let (stack, _) = loopback();
        let tcp = Socket::new(&stack, AddressFamily::Inet, SockType::Stream, 0).unwrap();
        tcp.set_option(SockOpt::NoDelay(true)).unwrap();
        assert_eq!(tcp.option(SockOptName::NoDelay), Ok(SockOpt::NoDelay(true)));

        let udp = Socket::new(&stack, AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        assert_eq!(udp.set_option(SockOpt::NoDelay(true)), Err(Errno::ENOPROTOOPT));
    }

    #[test]
    fn test_read_only_options() {
        let (stack, _) = loopback();
        let sock = Socket::new(&stack, AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        assert_eq!(sock.option(SockOptName::Type), Ok(SockOpt::Type(SocketKind::Datagram)));
        assert_eq!(sock.option(SockOptName::AcceptConn), Ok(SockOpt::AcceptConn(false)));
        assert_eq!(sock.option(SockOptName::Error), Ok(SockOpt::Error(None)));
        assert_eq!(sock.set_option(SockOpt::RecvBuffer(10)), Err(Errno::ENOPROTOOPT));
    }

    #[test]
    fn test_error_option_keeps_error_latched() {
        let (stack, _) = loopback();
        let sock = Socket::new(&stack, AddressFamily::Inet, SockType::Stream, 0).unwrap();
        assert_eq!(sock.connect(lo(7301)), Err(Errno::ECONNREFUSED));
        assert_eq!(
            sock.option(SockOptName::Error),
            Ok(SockOpt::Error(Some(Errno::ECONNREFUSED)))
        );
        // Reported once through the option
        assert_eq!(sock.option(SockOptName::Error), Ok(SockOpt::Error(None)));

        // Every later call still sees it
        let mut buf = [0u8; 4];
        assert_eq!(sock.send(b"x", MsgFlags::empty()), Err(Errno::ECONNREFUSED));
        assert_eq!(sock.recv(&mut buf, MsgFlags::empty()), Err(Errno::ECONNREFUSED));
        assert_eq!(sock.connect(lo(7301)), Err(Errno::ECONNREFUSED));
        assert!(sock.readiness().contains(Events::ERR));
    }
}
