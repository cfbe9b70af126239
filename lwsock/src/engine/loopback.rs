//! In-process loopback engine.
//!
//! Connections, datagram endpoints and lookups are paired entirely in
//! memory: a connect to a local listener produces an `Accepted` event on the
//! listener and a `Connected` event on the client, writes land as `Received`
//! events on the peer, and acknowledgements flow back as `Sent` events.
//! Raw IPv4 endpoints see packets with a real IPv4 header built by smoltcp.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpEndpoint, IpListenEndpoint, IpProtocol, Ipv4Packet, Ipv4Repr,
};

use super::{Engine, EngineResult, Handle, Lookup, StackEvent};
use crate::addr::{self, AddressFamily};
use crate::config::{LoopbackConfig, EPHEMERAL_PORT_START};
use crate::error::StackError;

/// Counters shared with whoever created the engine.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub connects: AtomicUsize,
    pub refused: AtomicUsize,
    pub closed: AtomicUsize,
    pub aborted: AtomicUsize,
    /// Calls naming a handle the engine no longer (or never) knew
    pub stale_handle_ops: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub datagrams_sent: AtomicUsize,
    pub datagrams_dropped: AtomicUsize,
}

impl LoopbackStats {
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn stale_handle_ops(&self) -> usize {
        self.stale_handle_ops.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Closed,
    Listen { backlog: u8, pending: u8 },
    Established,
}

#[derive(Debug)]
struct TcpConn {
    family: AddressFamily,
    state: TcpState,
    local: Option<IpListenEndpoint>,
    remote: Option<IpEndpoint>,
    peer: Option<Handle>,
    /// Listener holding a backlog slot for this connection
    listener: Option<Handle>,
    /// Created by a listener rather than by `tcp_new`
    server: bool,
    /// Bytes this side can still receive
    rcv_wnd: usize,
    tx_closed: bool,
    rx_closed: bool,
    nodelay: bool,
}

#[derive(Debug)]
struct DgramPcb {
    family: AddressFamily,
    /// Raw protocol number; `None` for UDP
    protocol: Option<u8>,
    local: Option<IpListenEndpoint>,
    remote: Option<IpEndpoint>,
}

fn overlaps(a: Option<IpAddress>, b: Option<IpAddress>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Engine that only talks to itself.
pub struct LoopbackEngine {
    config: LoopbackConfig,
    next_handle: u32,
    next_port: u16,
    tcp: HashMap<Handle, TcpConn>,
    dgram: HashMap<Handle, DgramPcb>,
    events: VecDeque<StackEvent>,
    stats: Arc<LoopbackStats>,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            next_handle: 1,
            next_port: EPHEMERAL_PORT_START,
            tcp: HashMap::new(),
            dgram: HashMap::new(),
            events: VecDeque::new(),
            stats: Arc::new(LoopbackStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        self.stats.clone()
    }

    fn alloc_handle(&mut self) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn stale(&self, op: &str, handle: Handle) {
        self.stats.stale_handle_ops.fetch_add(1, Ordering::SeqCst);
        warn!("{} on unknown handle {}", op, handle);
    }

    fn is_local(&self, addr: &IpAddress) -> bool {
        addr::to_std_addr(*addr).is_loopback() || self.config.local_addrs.contains(addr)
    }

    fn tcp_port_taken(&self, except: Handle, local: &IpListenEndpoint) -> bool {
        self.tcp.iter().any(|(h, c)| {
            *h != except
                && !c.server
                && c.local.is_some_and(|l| l.port == local.port && overlaps(l.addr, local.addr))
        })
    }

    fn udp_port_taken(&self, except: Handle, local: &IpListenEndpoint) -> bool {
        self.dgram.iter().any(|(h, p)| {
            *h != except
                && p.protocol.is_none()
                && p.local.is_some_and(|l| l.port == local.port && overlaps(l.addr, local.addr))
        })
    }

    /// Next free ephemeral port for `handle`.
    fn ephemeral(&mut self, handle: Handle, addr: Option<IpAddress>, udp: bool) -> EngineResult<u16> {
        let span = u32::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            let candidate = IpListenEndpoint { addr, port };
            let taken = if udp {
                self.udp_port_taken(handle, &candidate)
            } else {
                self.tcp_port_taken(handle, &candidate)
            };
            if !taken {
                return Ok(port);
            }
        }
        Err(StackError::Use)
    }

    fn check_bind_addr(&self, family: AddressFamily, local: &IpListenEndpoint) -> EngineResult<()> {
        match local.addr {
            Some(addr) if !family.admits(&addr) => Err(StackError::Val),
            Some(addr) if !self.is_local(&addr) => Err(StackError::Val),
            _ => Ok(()),
        }
    }

    fn listener_for(&self, remote: &IpEndpoint) -> Option<Handle> {
        self.tcp
            .iter()
            .filter(|(_, c)| matches!(c.state, TcpState::Listen { .. }))
            .filter(|(_, c)| c.family.admits(&remote.addr))
            .find(|(_, c)| {
                c.local
                    .is_some_and(|l| l.port == remote.port && overlaps(l.addr, Some(remote.addr)))
            })
            .map(|(h, _)| *h)
    }

    fn release_backlog_slot(&mut self, conn: Handle) {
        let listener = self.tcp.get_mut(&conn).and_then(|c| c.listener.take());
        if let Some(listener) = listener {
            if let Some(TcpConn {
                state: TcpState::Listen { pending, .. },
                ..
            }) = self.tcp.get_mut(&listener)
            {
                *pending = pending.saturating_sub(1);
            }
        }
    }

    /// Detach connections still waiting in a listener's backlog.
    fn orphan_backlog(&mut self, listener: Handle) {
        for conn in self.tcp.values_mut() {
            if conn.listener == Some(listener) {
                conn.listener = None;
            }
        }
    }

    /// Free `conn` and report `err` to its owner.
    fn reset(&mut self, conn: Handle, err: StackError) {
        self.release_backlog_slot(conn);
        if let Some(freed) = self.tcp.remove(&conn) {
            if let Some(peer) = freed.peer.and_then(|p| self.tcp.get_mut(&p)) {
                peer.peer = None;
            }
        }
        self.events.push_back(StackEvent::Error { conn, err });
    }

    fn refuse(&mut self, conn: Handle) {
        self.stats.refused.fetch_add(1, Ordering::SeqCst);
        debug!("connection {} refused", conn);
        self.reset(conn, StackError::Refused);
    }

    fn deliver_udp(&mut self, data: &[u8], from: IpEndpoint, to: IpEndpoint) -> bool {
        let target = self
            .dgram
            .iter()
            .filter(|(_, p)| p.protocol.is_none() && p.family.admits(&to.addr))
            .filter(|(_, p)| p.remote.map_or(true, |r| r == from))
            .find(|(_, p)| {
                p.local
                    .is_some_and(|l| l.port == to.port && overlaps(l.addr, Some(to.addr)))
            })
            .map(|(h, _)| *h);

        match target {
            Some(pcb) => {
                self.events.push_back(StackEvent::Datagram {
                    pcb,
                    data: data.to_vec(),
                    from,
                });
                true
            }
            None => false,
        }
    }

    fn deliver_raw(&mut self, protocol: u8, data: &[u8], src: IpAddress, dst: IpAddress) -> EngineResult<bool> {
        let mut targets: Vec<Handle> = self
            .dgram
            .iter()
            .filter(|(_, p)| p.protocol == Some(protocol) && p.family.admits(&dst))
            .filter(|(_, p)| p.local.map_or(true, |l| overlaps(l.addr, Some(dst))))
            .filter(|(_, p)| p.remote.map_or(true, |r| r.addr == src))
            .map(|(h, _)| *h)
            .collect();
        if targets.is_empty() {
            return Ok(false);
        }
        targets.sort();

        let packet = match (src, dst) {
            (IpAddress::Ipv4(src_addr), IpAddress::Ipv4(dst_addr)) => {
                ipv4_packet(protocol, src_addr, dst_addr, data)?
            }
            _ => data.to_vec(),
        };
        let from = IpEndpoint::new(src, 0);
        for pcb in targets {
            self.events.push_back(StackEvent::Datagram {
                pcb,
                data: packet.clone(),
                from,
            });
        }
        Ok(true)
    }
}

/// Prefix `payload` with an IPv4 header.
fn ipv4_packet(
    protocol: u8,
    src_addr: smoltcp::wire::Ipv4Address,
    dst_addr: smoltcp::wire::Ipv4Address,
    payload: &[u8],
) -> EngineResult<Vec<u8>> {
    let repr = Ipv4Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::from(protocol),
        payload_len: payload.len(),
        hop_limit: 64,
    };
    let total = repr.buffer_len() + payload.len();
    if total > usize::from(u16::MAX) {
        return Err(StackError::Buf);
    }
    let mut buf = vec![0u8; total];
    let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);
    Ok(buf)
}

impl Engine for LoopbackEngine {
    fn tcp_new(&mut self, family: AddressFamily) -> EngineResult<Handle> {
        let handle = self.alloc_handle();
        self.tcp.insert(
            handle,
            TcpConn {
                family,
                state: TcpState::Closed,
                local: None,
                remote: None,
                peer: None,
                listener: None,
                server: false,
                rcv_wnd: self.config.window,
                tx_closed: false,
                rx_closed: false,
                nodelay: false,
            },
        );
        trace!("tcp_new -> {}", handle);
        Ok(handle)
    }

    fn tcp_bind(&mut self, conn: Handle, local: IpListenEndpoint) -> EngineResult<IpEndpoint> {
        let Some(c) = self.tcp.get(&conn) else {
            self.stale("tcp_bind", conn);
            return Err(StackError::Clsd);
        };
        if c.local.is_some() || c.state != TcpState::Closed {
            return Err(StackError::Val);
        }
        let family = c.family;
        self.check_bind_addr(family, &local)?;

        let port = if local.port == 0 {
            self.ephemeral(conn, local.addr, false)?
        } else if self.tcp_port_taken(conn, &local) {
            return Err(StackError::Use);
        } else {
            local.port
        };
        let bound = IpListenEndpoint {
            addr: local.addr,
            port,
        };
        if let Some(c) = self.tcp.get_mut(&conn) {
            c.local = Some(bound);
        }
        Ok(IpEndpoint::new(local.addr.unwrap_or(family.unspecified()), port))
    }

    fn tcp_listen(&mut self, conn: Handle, backlog: u8) -> EngineResult<()> {
        let Some((state, bound)) = self.tcp.get(&conn).map(|c| (c.state, c.local.is_some())) else {
            self.stale("tcp_listen", conn);
            return Err(StackError::Clsd);
        };
        match state {
            TcpState::Established => return Err(StackError::IsConn),
            TcpState::Listen { pending, .. } => {
                if let Some(c) = self.tcp.get_mut(&conn) {
                    c.state = TcpState::Listen { backlog, pending };
                }
                return Ok(());
            }
            TcpState::Closed => {}
        }
        if !bound {
            self.tcp_bind(conn, IpListenEndpoint { addr: None, port: 0 })?;
        }
        if let Some(c) = self.tcp.get_mut(&conn) {
            c.state = TcpState::Listen {
                backlog,
                pending: 0,
            };
        }
        debug!("{} listening, backlog {}", conn, backlog);
        Ok(())
    }

    fn tcp_connect(&mut self, conn: Handle, remote: IpEndpoint) -> EngineResult<()> {
        let Some(c) = self.tcp.get(&conn) else {
            self.stale("tcp_connect", conn);
            return Err(StackError::Clsd);
        };
        match c.state {
            TcpState::Established => return Err(StackError::IsConn),
            TcpState::Listen { .. } => return Err(StackError::Val),
            TcpState::Closed => {}
        }
        if !c.family.admits(&remote.addr) {
            return Err(StackError::Val);
        }
        if !self.is_local(&remote.addr) {
            return Err(StackError::Rte);
        }
        let family = c.family;
        if c.local.is_none() {
            self.tcp_bind(conn, IpListenEndpoint { addr: None, port: 0 })?;
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);

        let Some(listener) = self.listener_for(&remote) else {
            self.refuse(conn);
            return Ok(());
        };
        let room = match self.tcp.get(&listener).map(|l| l.state) {
            Some(TcpState::Listen { backlog, pending }) => pending < backlog.max(1),
            _ => false,
        };
        if !room {
            self.refuse(conn);
            return Ok(());
        }

        let client_port = self
            .tcp
            .get(&conn)
            .and_then(|c| c.local)
            .map(|l| l.port)
            .unwrap_or(0);
        let client_addr = self
            .tcp
            .get(&conn)
            .and_then(|c| c.local)
            .and_then(|l| l.addr)
            .unwrap_or(remote.addr);
        let client_ep = IpEndpoint::new(client_addr, client_port);

        let server = self.alloc_handle();
        self.tcp.insert(
            server,
            TcpConn {
                family,
                state: TcpState::Established,
                local: Some(IpListenEndpoint {
                    addr: Some(remote.addr),
                    port: remote.port,
                }),
                remote: Some(client_ep),
                peer: Some(conn),
                listener: Some(listener),
                server: true,
                rcv_wnd: self.config.window,
                tx_closed: false,
                rx_closed: false,
                nodelay: false,
            },
        );
        if let Some(TcpConn {
            state: TcpState::Listen { pending, .. },
            ..
        }) = self.tcp.get_mut(&listener)
        {
            *pending += 1;
        }
        if let Some(c) = self.tcp.get_mut(&conn) {
            c.state = TcpState::Established;
            c.local = Some(IpListenEndpoint {
                addr: Some(client_addr),
                port: client_port,
            });
            c.remote = Some(remote);
            c.peer = Some(server);
        }

        debug!("{} connected to {} via listener {} as {}", conn, remote, listener, server);
        self.events.push_back(StackEvent::Accepted {
            listener,
            conn: server,
            local: remote,
            remote: client_ep,
        });
        self.events.push_back(StackEvent::Connected { conn });
        Ok(())
    }

    fn tcp_sndbuf(&self, conn: Handle) -> usize {
        let Some(c) = self.tcp.get(&conn) else {
            return 0;
        };
        if c.state != TcpState::Established || c.tx_closed {
            return 0;
        }
        match c.peer.and_then(|p| self.tcp.get(&p)) {
            Some(peer) => peer.rcv_wnd,
            // Peer is gone; the next write draws a reset
            None => self.config.window,
        }
    }

    fn tcp_write(&mut self, conn: Handle, data: &[u8]) -> EngineResult<()> {
        let Some(c) = self.tcp.get(&conn) else {
            self.stale("tcp_write", conn);
            return Err(StackError::Clsd);
        };
        if c.state != TcpState::Established {
            return Err(StackError::Conn);
        }
        if c.tx_closed {
            return Err(StackError::Clsd);
        }
        if data.is_empty() {
            return Ok(());
        }
        let nodelay = c.nodelay;

        let Some(peer) = c.peer else {
            debug!("{} wrote to a closed peer, resetting", conn);
            self.reset(conn, StackError::Rst);
            return Ok(());
        };
        let Some(p) = self.tcp.get_mut(&peer) else {
            self.reset(conn, StackError::Rst);
            return Ok(());
        };
        if data.len() > p.rcv_wnd {
            return Err(StackError::Mem);
        }
        self.stats.bytes_sent.fetch_add(data.len(), Ordering::Relaxed);
        if p.rx_closed {
            trace!("{} discarding {} bytes, receive side shut down", peer, data.len());
            return Ok(());
        }
        p.rcv_wnd -= data.len();
        if nodelay {
            trace!("{} -> {} {} bytes, nodelay", conn, peer, data.len());
        }
        self.events.push_back(StackEvent::Received {
            conn: peer,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn tcp_recved(&mut self, conn: Handle, len: usize) {
        let window = self.config.window;
        let Some(c) = self.tcp.get_mut(&conn) else {
            self.stale("tcp_recved", conn);
            return;
        };
        c.rcv_wnd = (c.rcv_wnd + len).min(window);
        if let Some(peer) = c.peer {
            self.events.push_back(StackEvent::Sent { conn: peer, len });
        }
    }

    fn tcp_shutdown(&mut self, conn: Handle, rx: bool, tx: bool) -> EngineResult<()> {
        let Some(c) = self.tcp.get_mut(&conn) else {
            self.stale("tcp_shutdown", conn);
            return Err(StackError::Clsd);
        };
        if c.state != TcpState::Established {
            return Err(StackError::Conn);
        }
        if rx {
            c.rx_closed = true;
        }
        if tx && !c.tx_closed {
            c.tx_closed = true;
            if let Some(peer) = c.peer {
                self.events.push_back(StackEvent::Fin { conn: peer });
            }
        }
        Ok(())
    }

    fn tcp_close(&mut self, conn: Handle) -> EngineResult<()> {
        if !self.tcp.contains_key(&conn) {
            self.stale("tcp_close", conn);
            return Err(StackError::Clsd);
        }
        self.release_backlog_slot(conn);
        let Some(c) = self.tcp.remove(&conn) else {
            return Err(StackError::Clsd);
        };
        if matches!(c.state, TcpState::Listen { .. }) {
            self.orphan_backlog(conn);
        }
        if let Some(peer) = c.peer {
            if let Some(p) = self.tcp.get_mut(&peer) {
                p.peer = None;
                if !c.tx_closed {
                    self.events.push_back(StackEvent::Fin { conn: peer });
                }
            }
        }
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        trace!("tcp_close {}", conn);
        Ok(())
    }

    fn tcp_abort(&mut self, conn: Handle) {
        if !self.tcp.contains_key(&conn) {
            self.stale("tcp_abort", conn);
            return;
        }
        self.release_backlog_slot(conn);
        let Some(c) = self.tcp.remove(&conn) else {
            return;
        };
        if matches!(c.state, TcpState::Listen { .. }) {
            self.orphan_backlog(conn);
        }
        self.stats.aborted.fetch_add(1, Ordering::SeqCst);
        debug!("tcp_abort {}", conn);
        if let Some(peer) = c.peer {
            if self.tcp.contains_key(&peer) {
                self.reset(peer, StackError::Rst);
            }
        }
    }

    fn tcp_backlog_accepted(&mut self, conn: Handle) {
        if !self.tcp.contains_key(&conn) {
            self.stale("tcp_backlog_accepted", conn);
            return;
        }
        self.release_backlog_slot(conn);
    }

    fn tcp_set_nodelay(&mut self, conn: Handle, enabled: bool) {
        match self.tcp.get_mut(&conn) {
            Some(c) => c.nodelay = enabled,
            None => self.stale("tcp_set_nodelay", conn),
        }
    }

    fn udp_new(&mut self, family: AddressFamily) -> EngineResult<Handle> {
        let handle = self.alloc_handle();
        self.dgram.insert(
            handle,
            DgramPcb {
                family,
                protocol: None,
                local: None,
                remote: None,
            },
        );
        Ok(handle)
    }

    fn raw_new(&mut self, family: AddressFamily, protocol: u8) -> EngineResult<Handle> {
        let handle = self.alloc_handle();
        self.dgram.insert(
            handle,
            DgramPcb {
                family,
                protocol: Some(protocol),
                local: None,
                remote: None,
            },
        );
        Ok(handle)
    }

    fn dgram_bind(&mut self, pcb: Handle, local: IpListenEndpoint) -> EngineResult<IpEndpoint> {
        let Some(p) = self.dgram.get(&pcb) else {
            self.stale("dgram_bind", pcb);
            return Err(StackError::Clsd);
        };
        let family = p.family;
        let udp = p.protocol.is_none();
        self.check_bind_addr(family, &local)?;

        let port = if !udp {
            0
        } else if local.port == 0 {
            self.ephemeral(pcb, local.addr, true)?
        } else if self.udp_port_taken(pcb, &local) {
            return Err(StackError::Use);
        } else {
            local.port
        };
        if let Some(p) = self.dgram.get_mut(&pcb) {
            p.local = Some(IpListenEndpoint {
                addr: local.addr,
                port,
            });
        }
        Ok(IpEndpoint::new(local.addr.unwrap_or(family.unspecified()), port))
    }

    fn dgram_connect(&mut self, pcb: Handle, remote: IpEndpoint) -> EngineResult<()> {
        let Some(p) = self.dgram.get(&pcb) else {
            self.stale("dgram_connect", pcb);
            return Err(StackError::Clsd);
        };
        if !p.family.admits(&remote.addr) {
            return Err(StackError::Val);
        }
        if p.local.is_none() {
            self.dgram_bind(pcb, IpListenEndpoint { addr: None, port: 0 })?;
        }
        if let Some(p) = self.dgram.get_mut(&pcb) {
            p.remote = Some(remote);
        }
        Ok(())
    }

    fn dgram_sendto(&mut self, pcb: Handle, data: &[u8], to: Option<IpEndpoint>) -> EngineResult<()> {
        let Some(p) = self.dgram.get(&pcb) else {
            self.stale("dgram_sendto", pcb);
            return Err(StackError::Clsd);
        };
        let dest = to.or(p.remote).ok_or(StackError::Conn)?;
        if !p.family.admits(&dest.addr) {
            return Err(StackError::Val);
        }
        if data.len() > self.config.max_datagram {
            return Err(StackError::Buf);
        }
        if !self.is_local(&dest.addr) {
            return Err(StackError::Rte);
        }
        let protocol = p.protocol;
        let bound_addr = p.local.and_then(|l| l.addr);

        let src = bound_addr.unwrap_or(dest.addr);
        let delivered = match protocol {
            None => {
                if self.dgram.get(&pcb).is_some_and(|p| p.local.is_none()) {
                    self.dgram_bind(pcb, IpListenEndpoint { addr: None, port: 0 })?;
                }
                let port = self
                    .dgram
                    .get(&pcb)
                    .and_then(|p| p.local)
                    .map(|l| l.port)
                    .unwrap_or(0);
                self.deliver_udp(data, IpEndpoint::new(src, port), dest)
            }
            Some(protocol) => self.deliver_raw(protocol, data, src, dest.addr)?,
        };

        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        if !delivered {
            self.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("datagram from {} to {} dropped, no receiver", pcb, dest);
        }
        Ok(())
    }

    fn dgram_remove(&mut self, pcb: Handle) {
        if self.dgram.remove(&pcb).is_none() {
            self.stale("dgram_remove", pcb);
        }
    }

    fn local_endpoint(&self, handle: Handle) -> Option<IpEndpoint> {
        let (family, local) = match self.tcp.get(&handle) {
            Some(c) => (c.family, c.local),
            None => {
                let p = self.dgram.get(&handle)?;
                (p.family, p.local)
            }
        };
        local.map(|l| IpEndpoint::new(l.addr.unwrap_or(family.unspecified()), l.port))
    }

    fn remote_endpoint(&self, handle: Handle) -> Option<IpEndpoint> {
        match self.tcp.get(&handle) {
            Some(c) => c.remote,
            None => self.dgram.get(&handle)?.remote,
        }
    }

    fn resolve(&mut self, name: &str, family: AddressFamily) -> EngineResult<Lookup> {
        if name.is_empty() {
            return Err(StackError::Arg);
        }
        let Some(hosts) = &self.config.hosts else {
            return Err(StackError::NoResolver);
        };

        if let Some(addr) = addr::parse_numeric(name) {
            return Ok(Lookup::Done(family.admits(&addr).then_some(addr)));
        }
        if name.eq_ignore_ascii_case("localhost") {
            return Ok(Lookup::Done(Some(family.loopback())));
        }

        let addr = hosts
            .iter()
            .find(|(host, addr)| host.eq_ignore_ascii_case(name) && family.admits(addr))
            .map(|(_, addr)| *addr);
        let query = self.alloc_handle();
        debug!("lookup {} for {:?} -> {:?}", query, name, addr);
        self.events.push_back(StackEvent::Resolved { query, addr });
        Ok(Lookup::Pending(query))
    }

    fn poll_events(&mut self) -> Vec<StackEvent> {
        self.events.drain(..).collect()
    }

    fn has_events(&self) -> bool {
        !self.events.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
