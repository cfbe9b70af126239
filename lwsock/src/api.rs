//! POSIX-style descriptor interface.
//!
//! `SocketApi` maps small integers onto [`Socket`]s the way a descriptor
//! table does and converts between `std::net::SocketAddr` and engine
//! endpoints. The table lock is only held to look a socket up; every socket
//! call runs after it is released, so a blocked `recv` never holds up other
//! descriptors.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use log::{debug, warn};

use crate::addr::{self, AddressFamily, SockType};
use crate::config::{TlsOptions, DNS_TIMEOUT, FD_BASE, MAX_SOCKETS};
use crate::error::{AddrInfoError, Errno, Result};
use crate::event::MsgFlags;
use crate::socket::{dns, Shutdown, SockOpt, SockOptName, Socket, TlsSession};
use crate::stack::Stack;

bitflags! {
    /// `ai_flags` for [`SocketApi::getaddrinfo`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AiFlags: u32 {
        /// No node: return the wildcard address instead of loopback
        const PASSIVE = 0x0001;
        /// Node must be a numeric address; never resolve
        const NUMERICHOST = 0x0004;
    }
}

/// Constraints on `getaddrinfo` results.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrInfoHints {
    pub family: AddressFamily,
    /// `None` returns one entry per socket type
    pub socktype: Option<SockType>,
    pub flags: AiFlags,
}

/// One `getaddrinfo` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: AddressFamily,
    pub socktype: SockType,
    pub protocol: u8,
    pub addr: SocketAddr,
}

/// Socket descriptor table over one stack.
pub struct SocketApi {
    stack: Arc<Stack>,
    table: Mutex<BTreeMap<i32, Socket>>,
}

impl SocketApi {
    pub fn new(stack: Arc<Stack>) -> Self {
        Self {
            stack,
            table: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<i32, Socket>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `sock` the lowest free descriptor; closes it on `EMFILE`.
    fn install(&self, sock: Socket) -> Result<i32> {
        let fd = {
            let mut table = self.table();
            if table.len() >= MAX_SOCKETS {
                None
            } else {
                let fd = (FD_BASE..)
                    .find(|fd| !table.contains_key(fd))
                    .ok_or(Errno::EMFILE)?;
                table.insert(fd, sock.clone());
                Some(fd)
            }
        };
        match fd {
            Some(fd) => Ok(fd),
            None => {
                warn!("descriptor table full, closing socket {}", sock.id());
                if let Err(err) = sock.close() {
                    debug!("close of untabled socket {}: {}", sock.id(), err);
                }
                Err(Errno::EMFILE)
            }
        }
    }

    /// Socket behind `fd`.
    pub fn get(&self, fd: i32) -> Result<Socket> {
        self.table().get(&fd).cloned().ok_or(Errno::EBADF)
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.table().len()
    }

    pub fn socket(&self, family: AddressFamily, ty: SockType, protocol: u8) -> Result<i32> {
        let sock = Socket::new(&self.stack, family, ty, protocol)?;
        let fd = self.install(sock)?;
        debug!("socket({:?}, {:?}, {}) = {}", family, ty, protocol, fd);
        Ok(fd)
    }

    pub fn bind(&self, fd: i32, addr: SocketAddr) -> Result<()> {
        self.get(fd)?.bind(addr::to_endpoint(addr))
    }

    pub fn listen(&self, fd: i32, backlog: u8) -> Result<()> {
        self.get(fd)?.listen(backlog)
    }

    pub fn connect(&self, fd: i32, addr: SocketAddr) -> Result<()> {
        self.get(fd)?.connect(addr::to_endpoint(addr))
    }

    pub fn accept(&self, fd: i32) -> Result<(i32, SocketAddr)> {
        let (sock, remote) = self.get(fd)?.accept()?;
        let new_fd = self.install(sock)?;
        Ok((new_fd, addr::to_socket_addr(remote)))
    }

    pub fn send(&self, fd: i32, data: &[u8], flags: MsgFlags) -> Result<usize> {
        self.get(fd)?.send(data, flags)
    }

    pub fn sendto(&self, fd: i32, data: &[u8], flags: MsgFlags, to: SocketAddr) -> Result<usize> {
        self.get(fd)?.send_to(data, addr::to_endpoint(to), flags)
    }

    pub fn recv(&self, fd: i32, buf: &mut [u8], flags: MsgFlags) -> Result<usize> {
        self.get(fd)?.recv(buf, flags)
    }

    pub fn recvfrom(&self, fd: i32, buf: &mut [u8], flags: MsgFlags) -> Result<(usize, Option<SocketAddr>)> {
        let (n, from) = self.get(fd)?.recv_from(buf, flags)?;
        Ok((n, from.map(addr::to_socket_addr)))
    }

    pub fn shutdown(&self, fd: i32, how: Shutdown) -> Result<()> {
        self.get(fd)?.shutdown(how)
    }

    /// Release `fd` and close its socket.
    pub fn close(&self, fd: i32) -> Result<()> {
        let sock = self.table().remove(&fd).ok_or(Errno::EBADF)?;
        debug!("close({})", fd);
        sock.close()
    }

    pub fn getsockname(&self, fd: i32) -> Result<SocketAddr> {
        self.get(fd)?.local_addr().map(addr::to_socket_addr)
    }

    pub fn getpeername(&self, fd: i32) -> Result<SocketAddr> {
        self.get(fd)?.peer_addr().map(addr::to_socket_addr)
    }

    pub fn getsockopt(&self, fd: i32, name: SockOptName) -> Result<SockOpt> {
        self.get(fd)?.option(name)
    }

    pub fn setsockopt(&self, fd: i32, option: SockOpt) -> Result<()> {
        self.get(fd)?.set_option(option)
    }

    /// `fcntl(fd, F_SETFL, O_NONBLOCK)` analogue.
    pub fn set_nonblocking(&self, fd: i32, nonblocking: bool) -> Result<()> {
        self.get(fd)?.set_nonblocking(nonblocking)
    }

    /// Layer TLS over the stream socket `fd`.
    ///
    /// On success `fd` is released and the TLS socket is given the lowest
    /// free descriptor, which is normally `fd` itself. The TLS socket owns
    /// the old socket from then on. On failure `fd` is left as it was.
    pub fn tls_wrap(&self, fd: i32, session: Box<dyn TlsSession>, options: TlsOptions) -> Result<i32> {
        let inner = self.table().remove(&fd).ok_or(Errno::EBADF)?;
        let tls = match Socket::tls(inner.clone(), session, options) {
            Ok(tls) => tls,
            Err(err) => {
                self.table().insert(fd, inner);
                return Err(err);
            }
        };
        let new_fd = self.install(tls)?;
        debug!("tls_wrap({}) = {}", fd, new_fd);
        Ok(new_fd)
    }

    /// Translate `node`/`service` into socket addresses.
    pub fn getaddrinfo(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrInfoHints,
    ) -> core::result::Result<Vec<AddrInfo>, AddrInfoError> {
        if node.is_none() && service.is_none() {
            return Err(AddrInfoError::NoName);
        }
        let port = match service {
            None => 0,
            Some(s) => s.parse::<u16>().map_err(|_| AddrInfoError::Service)?,
        };

        let ip = match node {
            None if hints.flags.contains(AiFlags::PASSIVE) => hints.family.unspecified(),
            None => hints.family.loopback(),
            Some(name) => match addr::parse_numeric(name) {
                Some(ip) if hints.family.admits(&ip) => ip,
                Some(_) => return Err(AddrInfoError::Family),
                None if hints.flags.contains(AiFlags::NUMERICHOST) => return Err(AddrInfoError::NoName),
                None => dns::resolve(&self.stack, name, hints.family, Some(DNS_TIMEOUT))?
                    .ok_or(AddrInfoError::NoName)?,
            },
        };

        let socktypes: &[SockType] = match &hints.socktype {
            Some(SockType::Stream) => &[SockType::Stream],
            Some(SockType::Datagram) => &[SockType::Datagram],
            Some(SockType::Raw) => &[SockType::Raw],
            None => &[SockType::Stream, SockType::Datagram],
        };
        let addr = addr::to_socket_addr(smoltcp::wire::IpEndpoint::new(ip, port));
        Ok(socktypes
            .iter()
            .map(|&socktype| AddrInfo {
                family: AddressFamily::of(&ip),
                socktype,
                protocol: match socktype {
                    SockType::Stream => 6,
                    SockType::Datagram => 17,
                    SockType::Raw => 0,
                },
                addr,
            })
            .collect())
    }
}

impl Drop for SocketApi {
    fn drop(&mut self) {
        let sockets = std::mem::take(&mut *self.table());
        for (fd, sock) in sockets {
            if let Err(err) = sock.close() {
                debug!("close({}) on teardown: {}", fd, err);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopbackConfig;
    use crate::socket::{SocketKind, TlsPhase};
    use crate::testing::{loopback, loopback_with, FramedSession};
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_descriptor_lifecycle() {
        let (stack, _) = loopback();
        let api = Arc::new(SocketApi::new(stack));
        let l = api.socket(AddressFamily::Inet, SockType::Stream, 0).unwrap();
        assert_eq!(l, FD_BASE);
        api.bind(l, local(7101)).unwrap();
        api.listen(l, 0).unwrap();
        assert_eq!(api.getsockname(l), Ok(local(7101)));
        assert_eq!(api.getsockopt(l, SockOptName::AcceptConn), Ok(SockOpt::AcceptConn(true)));

        let server = {
            let api = api.clone();
            thread::spawn(move || {
                let (fd, _) = api.accept(l).unwrap();
                let mut buf = [0u8; 16];
                let n = api.recv(fd, &mut buf, MsgFlags::empty()).unwrap();
                api.send(fd, &buf[..n], MsgFlags::empty()).unwrap();
                fd
            })
        };

        let c = api.socket(AddressFamily::Inet, SockType::Stream, 0).unwrap();
        api.connect(c, local(7101)).unwrap();
        assert_eq!(api.getpeername(c), Ok(local(7101)));
        api.send(c, b"fd echo", MsgFlags::empty()).unwrap();
        let mut buf = [0u8; 16];
        let n = api.recv(c, &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"fd echo");
        let accepted = server.join().unwrap();
        assert_eq!(api.open_count(), 3);

        api.close(accepted).unwrap();
        assert_eq!(api.close(accepted), Err(Errno::EBADF));
        assert_eq!(api.send(accepted, b"x", MsgFlags::empty()), Err(Errno::EBADF));
        // Lowest free descriptor is reused
        assert_eq!(api.socket(AddressFamily::Inet, SockType::Datagram, 0), Ok(accepted));
    }

    #[test]
    fn test_table_limit() {
        let (stack, _) = loopback();
        let api = SocketApi::new(stack.clone());
        for _ in 0..MAX_SOCKETS {
            api.socket(AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        }
        assert_eq!(
            api.socket(AddressFamily::Inet, SockType::Datagram, 0),
            Err(Errno::EMFILE)
        );
        assert_eq!(stack.registered(), MAX_SOCKETS);
        drop(api);
        assert_eq!(stack.registered(), 0);
    }

    #[test]
    fn test_datagram_addresses() {
        let (stack, _) = loopback();
        let api = SocketApi::new(stack);
        let a = api.socket(AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        let b = api.socket(AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        api.bind(a, local(7102)).unwrap();
        api.bind(b, local(7103)).unwrap();
        assert_eq!(api.sendto(b, b"dg", MsgFlags::empty(), local(7102)), Ok(2));
        let mut buf = [0u8; 8];
        assert_eq!(api.recvfrom(a, &mut buf, MsgFlags::empty()), Ok((2, Some(local(7103)))));
        assert_eq!(api.getpeername(a), Err(Errno::ENOTCONN));
    }

    #[test]
    fn test_tls_wrap_replaces_descriptor() {
        let (stack, _) = loopback();
        let api = SocketApi::new(stack);
        let s = api.socket(AddressFamily::Inet, SockType::Stream, 0).unwrap();
        let t = api
            .tls_wrap(s, Box::new(FramedSession::new()), TlsOptions::default())
            .unwrap();
        // The released number is the lowest free one
        assert_eq!(t, s);
        assert_eq!(api.open_count(), 1);
        let tls = api.get(t).unwrap();
        assert_eq!(tls.kind(), SocketKind::Tls);
        assert_eq!(tls.tls_phase(), Some(TlsPhase::Initial));
        assert_eq!(api.getsockopt(t, SockOptName::Type), Ok(SockOpt::Type(SocketKind::Tls)));

        let d = api.socket(AddressFamily::Inet, SockType::Datagram, 0).unwrap();
        assert_eq!(
            api.tls_wrap(d, Box::new(FramedSession::new()), TlsOptions::default()),
            Err(Errno::EINVAL)
        );
        assert!(api.get(d).is_ok());
    }

    #[test]
    fn test_getaddrinfo() {
        let mut config = LoopbackConfig::default();
        let host = addr::parse_numeric("10.9.8.7").unwrap();
        config.hosts = Some(vec![(String::from("files.lan"), host)]);
        let (stack, _) = loopback_with(config);
        let api = SocketApi::new(stack);

        let hints = AddrInfoHints {
            family: AddressFamily::Inet,
            socktype: Some(SockType::Stream),
            flags: AiFlags::empty(),
        };
        let res = api.getaddrinfo(Some("files.lan"), Some("8080"), &hints).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].addr, "10.9.8.7:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(res[0].protocol, 6);

        let passive = AddrInfoHints {
            flags: AiFlags::PASSIVE,
            ..AddrInfoHints::default()
        };
        let res = api.getaddrinfo(None, Some("53"), &passive).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].addr, "0.0.0.0:53".parse::<SocketAddr>().unwrap());
        assert_eq!(res[1].socktype, SockType::Datagram);

        let res = api.getaddrinfo(None, Some("80"), &hints).unwrap();
        assert_eq!(res[0].addr, local(80));

        assert_eq!(api.getaddrinfo(Some("missing.lan"), None, &hints), Err(AddrInfoError::NoName));
        assert_eq!(api.getaddrinfo(None, Some("http"), &hints), Err(AddrInfoError::Service));
        assert_eq!(api.getaddrinfo(None, None, &hints), Err(AddrInfoError::NoName));
        let numeric = AddrInfoHints {
            flags: AiFlags::NUMERICHOST,
            ..hints
        };
        assert_eq!(
            api.getaddrinfo(Some("files.lan"), None, &numeric),
            Err(AddrInfoError::NoName)
        );
        assert_eq!(api.getaddrinfo(Some("::1"), None, &hints), Err(AddrInfoError::Family));
    }
}
