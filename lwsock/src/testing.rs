//! Fixtures shared by the unit tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rand_core::RngCore;
use smoltcp::wire::{IpAddress, IpEndpoint};

use crate::addr::{AddressFamily, SockType};
use crate::config::{LoopbackConfig, StackConfig, LOOPBACK};
use crate::engine::{LoopbackEngine, LoopbackStats};
use crate::error::Errno;
use crate::socket::{Socket, TlsError, TlsIo, TlsSession};
use crate::stack::Stack;

/// Small seeded generator for randomized tests.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }
}

impl RngCore for XorShift {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

pub fn lo(port: u16) -> IpEndpoint {
    IpEndpoint::new(IpAddress::Ipv4(LOOPBACK), port)
}

/// Stack with its own thread over a default loopback engine.
pub fn loopback() -> (Arc<Stack>, Arc<LoopbackStats>) {
    loopback_with(LoopbackConfig::default())
}

pub fn loopback_with(config: LoopbackConfig) -> (Arc<Stack>, Arc<LoopbackStats>) {
    let engine = LoopbackEngine::new(config);
    let stats = engine.stats();
    let config = StackConfig {
        tick: Duration::from_millis(10),
        ..StackConfig::default()
    };
    let stack = Stack::start(Box::new(engine), config).unwrap();
    (stack, stats)
}

/// Stack driven only by explicit `run_once` calls.
pub fn manual() -> (Arc<Stack>, Arc<LoopbackStats>) {
    let engine = LoopbackEngine::new(LoopbackConfig::default());
    let stats = engine.stats();
    (Stack::manual(Box::new(engine)), stats)
}

pub fn listener(stack: &Arc<Stack>, port: u16) -> Socket {
    let l = Socket::new(stack, AddressFamily::Inet, SockType::Stream, 0).unwrap();
    l.bind(lo(port)).unwrap();
    l.listen(0).unwrap();
    l
}

/// A connected (client, server) stream pair; works on manual stacks too.
pub fn connected_pair(stack: &Arc<Stack>, port: u16) -> (Socket, Socket) {
    let l = listener(stack, port);
    l.set_nonblocking(true).unwrap();
    let client = Socket::new(stack, AddressFamily::Inet, SockType::Stream, 0).unwrap();
    client.set_nonblocking(true).unwrap();
    assert_eq!(client.connect(lo(port)), Err(Errno::EINPROGRESS));

    let server = loop {
        stack.run_once();
        match l.accept() {
            Ok((s, _)) => break s,
            Err(Errno::EAGAIN) => thread::yield_now(),
            Err(err) => panic!("accept failed: {}", err),
        }
    };
    loop {
        match client.connect(lo(port)) {
            Err(Errno::EISCONN) => break,
            Err(Errno::EALREADY) => {
                stack.run_once();
                thread::yield_now();
            }
            other => panic!("connect: {:?}", other),
        }
    }
    client.set_nonblocking(false).unwrap();
    l.close().unwrap();
    (client, server)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TLS DOUBLE
// ═══════════════════════════════════════════════════════════════════════════════

const HANDSHAKE: u8 = 0x16;
const DATA: u8 = 0x17;
const ALERT: u8 = 0x15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hello {
    Start,
    Sent,
    Done,
}

struct Framing {
    hello: Hello,
    /// Framed bytes not yet accepted by the transport
    out: Vec<u8>,
    /// Plaintext length of the record waiting in `out`
    pending: usize,
    input: Vec<u8>,
    plain: Vec<u8>,
    peer_closed: bool,
    close_sent: bool,
    starts: usize,
    steps: usize,
}

/// Session that frames records in the clear: type, length, payload. Both
/// ends send a hello record and finish the handshake on the peer's hello.
#[derive(Clone)]
pub struct FramedSession {
    shared: Arc<Mutex<Framing>>,
}

impl FramedSession {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Framing {
                hello: Hello::Start,
                out: Vec::new(),
                pending: 0,
                input: Vec::new(),
                plain: Vec::new(),
                peer_closed: false,
                close_sent: false,
                starts: 0,
                steps: 0,
            })),
        }
    }

    /// Times a handshake was begun from scratch.
    pub fn handshake_starts(&self) -> usize {
        self.framing().starts
    }

    /// Calls into `handshake`.
    pub fn handshake_steps(&self) -> usize {
        self.framing().steps
    }

    fn framing(&self) -> std::sync::MutexGuard<'_, Framing> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Framing {
    fn frame(&mut self, ty: u8, payload: &[u8]) {
        self.out.push(ty);
        self.out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        self.out.extend_from_slice(payload);
    }

    fn flush(&mut self, io: &mut dyn TlsIo) -> Result<(), TlsError> {
        while !self.out.is_empty() {
            let n = io.send(&self.out)?;
            self.out.drain(..n);
        }
        Ok(())
    }

    /// Read until the transport runs dry; `true` at EOF.
    fn pull(&mut self, io: &mut dyn TlsIo) -> Result<bool, TlsError> {
        let mut tmp = [0u8; 2048];
        loop {
            match io.recv(&mut tmp) {
                Ok(0) => return Ok(true),
                Ok(n) => self.input.extend_from_slice(&tmp[..n]),
                Err(TlsError::WantRead) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
    }

    fn next_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.input.len() < 3 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.input[1], self.input[2]]));
        if self.input.len() < 3 + len {
            return None;
        }
        let ty = self.input[0];
        let payload = self.input[3..3 + len].to_vec();
        self.input.drain(..3 + len);
        Some((ty, payload))
    }

    /// Pull more input; errors when nothing new arrived.
    fn more(&mut self, io: &mut dyn TlsIo) -> Result<(), TlsError> {
        let before = self.input.len();
        let eof = self.pull(io)?;
        if self.input.len() > before {
            Ok(())
        } else if eof {
            Err(TlsError::ConnectionClosed)
        } else {
            Err(TlsError::WantRead)
        }
    }

    fn take_plain(&mut self, buf: &mut [u8]) -> usize {
        let n = self.plain.len().min(buf.len());
        buf[..n].copy_from_slice(&self.plain[..n]);
        self.plain.drain(..n);
        n
    }
}

impl TlsSession for FramedSession {
    fn handshake(&mut self, io: &mut dyn TlsIo) -> Result<(), TlsError> {
        let mut f = self.framing();
        if f.hello == Hello::Done {
            return Ok(());
        }
        f.steps += 1;
        if f.hello == Hello::Start {
            f.starts += 1;
            f.frame(HANDSHAKE, b"hello");
            f.hello = Hello::Sent;
        }
        f.flush(io)?;
        loop {
            match f.next_frame() {
                Some((HANDSHAKE, _)) => {
                    f.hello = Hello::Done;
                    return Ok(());
                }
                Some((_, _)) => return Err(TlsError::Protocol(10)),
                None => f.more(io)?,
            }
        }
    }

    fn read(&mut self, io: &mut dyn TlsIo, buf: &mut [u8]) -> Result<usize, TlsError> {
        let mut f = self.framing();
        match f.flush(io) {
            Ok(()) | Err(TlsError::WantWrite) => {}
            Err(err) => return Err(err),
        }
        loop {
            if !f.plain.is_empty() {
                return Ok(f.take_plain(buf));
            }
            if f.peer_closed {
                return Ok(0);
            }
            match f.next_frame() {
                Some((DATA, payload)) => f.plain.extend_from_slice(&payload),
                Some((ALERT, _)) => f.peer_closed = true,
                Some((HANDSHAKE, _)) => {}
                Some((_, _)) => return Err(TlsError::Protocol(10)),
                None => f.more(io)?,
            }
        }
    }

    fn write(&mut self, io: &mut dyn TlsIo, data: &[u8]) -> Result<usize, TlsError> {
        let mut f = self.framing();
        if f.pending == 0 {
            f.frame(DATA, data);
            f.pending = data.len();
        }
        f.flush(io)?;
        let n = f.pending;
        f.pending = 0;
        Ok(n)
    }

    fn close_notify(&mut self, io: &mut dyn TlsIo) -> Result<(), TlsError> {
        let mut f = self.framing();
        if !f.close_sent {
            f.close_sent = true;
            f.frame(ALERT, &[0]);
        }
        f.flush(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_is_deterministic() {
        let mut a = XorShift::new(7);
        let mut b = XorShift::new(7);
        let mut bytes = [0u8; 13];
        a.fill_bytes(&mut bytes);
        let mut other = [0u8; 13];
        b.fill_bytes(&mut other);
        assert_eq!(bytes, other);
        assert_ne!(XorShift::new(7).next_u64(), XorShift::new(8).next_u64());
    }
}
