//! Tunables and defaults for the socket layer and the loopback engine.

use core::time::Duration;

use smoltcp::wire::{IpAddress, Ipv4Address};

/// Socket buffers grow in multiples of this many bytes
pub const BUFFER_BLOCK_SIZE: usize = 512;

/// Upper bound for a single chunk in a buffer chain
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Listen backlog used when the caller passes zero
pub const DEFAULT_BACKLOG: u8 = 8;
/// Larger listen backlogs are cut down to this
pub const MAX_BACKLOG: u8 = 64;

/// Name lookups give up after this long
pub const DNS_TIMEOUT: Duration = Duration::from_millis(5000);

/// Stack thread wakes at least this often even without a kick
pub const TCPIP_TICK: Duration = Duration::from_millis(100);

/// First descriptor handed out by the socket table
pub const FD_BASE: i32 = 3;
/// Maximum number of open sockets per table
pub const MAX_SOCKETS: usize = 64;

/// Loopback address
pub const LOOPBACK: Ipv4Address = Ipv4Address::new(127, 0, 0, 1);

/// Receive window of a loopback connection
pub const TCP_WND: usize = 8 * 1024;

/// Largest datagram the loopback engine carries
pub const MAX_DATAGRAM: usize = 65_507;
/// Datagrams queued per socket before new ones are dropped
pub const DGRAM_QUEUE_LEN: usize = 32;

/// First port used for ephemeral binds
pub const EPHEMERAL_PORT_START: u16 = 49_152;

/// Largest plaintext fragment handed to a TLS session in one write
pub const TLS_RECORD_MAX: usize = 16 * 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the stack processing thread.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Maximum sleep between two engine polls
    pub tick: Duration,
    /// Name given to the stack thread
    pub thread_name: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tick: TCPIP_TICK,
            thread_name: String::from("tcpip"),
        }
    }
}

/// Settings for the in-process loopback engine.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Receive window per connection
    pub window: usize,
    /// Datagrams larger than this are refused with `Buf`
    pub max_datagram: usize,
    /// Addresses the engine answers for
    pub local_addrs: Vec<IpAddress>,
    /// Host table for the resolver; `None` means no resolver is configured
    pub hosts: Option<Vec<(String, IpAddress)>>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            window: TCP_WND,
            max_datagram: MAX_DATAGRAM,
            local_addrs: vec![IpAddress::Ipv4(LOOPBACK)],
            hosts: Some(Vec::new()),
        }
    }
}

/// What a TLS socket does when the record layer hits EOF without a
/// close-notify alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaggedEof {
    /// Report `ECONNRESET`
    #[default]
    Error,
    /// Report end of stream
    Eof,
}

/// Options for a TLS-layered socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsOptions {
    pub ragged_eof: RaggedEof,
}
