//! Readiness events and socket flags.

use bitflags::bitflags;

bitflags! {
    /// Readiness bitmask raised by a socket to wake blocked waiters.
    ///
    /// Bit values follow `poll(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Events: u16 {
        /// Data (or an accept record, or EOF) is ready to be read
        const IN = 0x0001;
        /// Space is available to write
        const OUT = 0x0004;
        /// An error is latched
        const ERR = 0x0008;
        /// Both directions are closed
        const HUP = 0x0010;
        /// Descriptor is not open
        const NVAL = 0x0020;
        /// Peer closed its write side
        const RDHUP = 0x2000;
    }
}

bitflags! {
    /// Connection state flags kept in the socket core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SockFlags: u16 {
        const BOUND = 1 << 0;
        const CONNECTING = 1 << 1;
        const CONNECTED = 1 << 2;
        const LISTENING = 1 << 3;
        /// Peer half-closed; reads return 0 once drained
        const PEER_CLOSED = 1 << 4;
        /// The owner closed the socket
        const USER_CLOSED = 1 << 5;
        const RX_SHUTDOWN = 1 << 6;
        const TX_SHUTDOWN = 1 << 7;
        const NONBLOCKING = 1 << 8;
    }
}

bitflags! {
    /// Per-call flags for send and receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Return data without consuming it
        const PEEK = 0x02;
        /// Make this call non-blocking
        const DONTWAIT = 0x40;
    }
}
