//! Error types for the socket layer.
//!
//! Every public operation reports failure as a POSIX [`Errno`]. The engine
//! speaks its own dialect ([`StackError`]) and is translated exactly once, at
//! the point where a stack result is first observed, by
//! [`StackError::to_errno`]. Nothing past that point reasons about engine
//! codes.

use core::fmt;

/// A convenience wrapper around `Result` for [`Errno`].
pub type Result<T> = core::result::Result<T, Errno>;

// ═══════════════════════════════════════════════════════════════════════════════
// POSIX ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

/// POSIX error numbers surfaced by socket calls (Linux numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EINTR = 4,
    EIO = 5,
    EBADF = 9,
    /// Would block; also `EWOULDBLOCK`.
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    EPIPE = 32,
    ENOSYS = 38,
    EPROTO = 71,
    ENOTSOCK = 88,
    EDESTADDRREQ = 89,
    EMSGSIZE = 90,
    EPROTOTYPE = 91,
    ENOPROTOOPT = 92,
    EPROTONOSUPPORT = 93,
    EOPNOTSUPP = 95,
    EAFNOSUPPORT = 97,
    EADDRINUSE = 98,
    EADDRNOTAVAIL = 99,
    ENETUNREACH = 101,
    ECONNABORTED = 103,
    ECONNRESET = 104,
    ENOBUFS = 105,
    EISCONN = 106,
    ENOTCONN = 107,
    ETIMEDOUT = 110,
    ECONNREFUSED = 111,
    EHOSTUNREACH = 113,
    EALREADY = 114,
    EINPROGRESS = 115,
}

impl Errno {
    /// Alias kept for call sites that read better with the BSD name.
    pub const EWOULDBLOCK: Errno = Errno::EAGAIN;

    /// Numeric value as it would appear in `errno`.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether this is the transient "try again later" condition.
    pub fn is_would_block(self) -> bool {
        self == Errno::EAGAIN
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::EINTR => "Interrupted system call",
            Errno::EIO => "I/O error",
            Errno::EBADF => "Bad file descriptor",
            Errno::EAGAIN => "Resource temporarily unavailable",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::EINVAL => "Invalid argument",
            Errno::ENFILE => "Too many open files in system",
            Errno::EMFILE => "Too many open files",
            Errno::EPIPE => "Broken pipe",
            Errno::ENOSYS => "Function not implemented",
            Errno::EPROTO => "Protocol error",
            Errno::ENOTSOCK => "Socket operation on non-socket",
            Errno::EDESTADDRREQ => "Destination address required",
            Errno::EMSGSIZE => "Message too long",
            Errno::EPROTOTYPE => "Protocol wrong type for socket",
            Errno::ENOPROTOOPT => "Protocol not available",
            Errno::EPROTONOSUPPORT => "Protocol not supported",
            Errno::EOPNOTSUPP => "Operation not supported",
            Errno::EAFNOSUPPORT => "Address family not supported by protocol",
            Errno::EADDRINUSE => "Address already in use",
            Errno::EADDRNOTAVAIL => "Cannot assign requested address",
            Errno::ENETUNREACH => "Network is unreachable",
            Errno::ECONNABORTED => "Software caused connection abort",
            Errno::ECONNRESET => "Connection reset by peer",
            Errno::ENOBUFS => "No buffer space available",
            Errno::EISCONN => "Transport endpoint is already connected",
            Errno::ENOTCONN => "Transport endpoint is not connected",
            Errno::ETIMEDOUT => "Connection timed out",
            Errno::ECONNREFUSED => "Connection refused",
            Errno::EHOSTUNREACH => "No route to host",
            Errno::EALREADY => "Operation already in progress",
            Errno::EINPROGRESS => "Operation now in progress",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.as_str(), self.code())
    }
}

impl std::error::Error for Errno {}

impl embedded_io::Error for Errno {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind;
        match self {
            Errno::ENOENT => ErrorKind::NotFound,
            Errno::EPERM | Errno::EACCES => ErrorKind::PermissionDenied,
            Errno::ECONNREFUSED => ErrorKind::ConnectionRefused,
            Errno::ECONNRESET => ErrorKind::ConnectionReset,
            Errno::ECONNABORTED => ErrorKind::ConnectionAborted,
            Errno::ENOTCONN => ErrorKind::NotConnected,
            Errno::EADDRINUSE => ErrorKind::AddrInUse,
            Errno::EADDRNOTAVAIL => ErrorKind::AddrNotAvailable,
            Errno::EPIPE => ErrorKind::BrokenPipe,
            Errno::EEXIST => ErrorKind::AlreadyExists,
            Errno::EINVAL => ErrorKind::InvalidInput,
            Errno::EPROTO => ErrorKind::InvalidData,
            Errno::ETIMEDOUT => ErrorKind::TimedOut,
            Errno::EINTR => ErrorKind::Interrupted,
            Errno::EOPNOTSUPP | Errno::ENOSYS => ErrorKind::Unsupported,
            Errno::ENOMEM | Errno::ENOBUFS => ErrorKind::OutOfMemory,
            _ => ErrorKind::Other,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

/// Native result codes of the network engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// Out of memory.
    Mem,
    /// Buffer error.
    Buf,
    /// Timeout.
    Timeout,
    /// Routing problem.
    Rte,
    /// Operation in progress.
    InProgress,
    /// Illegal value.
    Val,
    /// Operation would block.
    WouldBlock,
    /// Address in use.
    Use,
    /// Already connecting.
    Already,
    /// Connection already established.
    IsConn,
    /// Not connected.
    Conn,
    /// Low-level netif error.
    If,
    /// Connection aborted.
    Abrt,
    /// Connection reset.
    Rst,
    /// Connection closed.
    Clsd,
    /// Illegal argument.
    Arg,
    /// Remote end refused the connection.
    Refused,
    /// Resolver has no server configured.
    NoResolver,
}

impl StackError {
    /// Map an engine code onto POSIX errno.
    pub fn to_errno(self) -> Errno {
        match self {
            StackError::Mem => Errno::ENOMEM,
            StackError::Buf => Errno::ENOBUFS,
            StackError::Timeout => Errno::ETIMEDOUT,
            StackError::Rte => Errno::EHOSTUNREACH,
            StackError::InProgress => Errno::EINPROGRESS,
            StackError::Val => Errno::EINVAL,
            StackError::WouldBlock => Errno::EAGAIN,
            StackError::Use => Errno::EADDRINUSE,
            StackError::Already => Errno::EALREADY,
            StackError::IsConn => Errno::EISCONN,
            StackError::Conn => Errno::ENOTCONN,
            StackError::If => Errno::EIO,
            StackError::Abrt => Errno::ECONNABORTED,
            StackError::Rst => Errno::ECONNRESET,
            StackError::Clsd => Errno::ENOTCONN,
            StackError::Arg => Errno::EIO,
            StackError::Refused => Errno::ECONNREFUSED,
            StackError::NoResolver => Errno::EHOSTUNREACH,
        }
    }
}

impl From<StackError> for Errno {
    fn from(err: StackError) -> Errno {
        err.to_errno()
    }
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StackError::Mem => "out of memory",
            StackError::Buf => "buffer error",
            StackError::Timeout => "timeout",
            StackError::Rte => "routing problem",
            StackError::InProgress => "operation in progress",
            StackError::Val => "illegal value",
            StackError::WouldBlock => "operation would block",
            StackError::Use => "address in use",
            StackError::Already => "already connecting",
            StackError::IsConn => "already connected",
            StackError::Conn => "not connected",
            StackError::If => "low-level netif error",
            StackError::Abrt => "connection aborted",
            StackError::Rst => "connection reset",
            StackError::Clsd => "connection closed",
            StackError::Arg => "illegal argument",
            StackError::Refused => "connection refused",
            StackError::NoResolver => "no resolver configured",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for StackError {}

// ═══════════════════════════════════════════════════════════════════════════════
// NAME RESOLUTION ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// `getaddrinfo` failures (the `EAI_*` family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrInfoError {
    /// Name or service not known.
    NoName,
    /// Temporary failure in name resolution.
    Again,
    /// Non-recoverable failure in name resolution.
    Fail,
    /// Address family not supported.
    Family,
    /// Service not supported for socket type.
    Service,
    /// Memory allocation failure.
    Memory,
    /// System error; the errno says which.
    System(Errno),
}

impl fmt::Display for AddrInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AddrInfoError::NoName => write!(f, "Name or service not known"),
            AddrInfoError::Again => write!(f, "Temporary failure in name resolution"),
            AddrInfoError::Fail => write!(f, "Non-recoverable failure in name resolution"),
            AddrInfoError::Family => write!(f, "Address family not supported"),
            AddrInfoError::Service => write!(f, "Service not supported for socket type"),
            AddrInfoError::Memory => write!(f, "Memory allocation failure"),
            AddrInfoError::System(err) => write!(f, "System error: {err}"),
        }
    }
}

impl std::error::Error for AddrInfoError {}

impl From<Errno> for AddrInfoError {
    fn from(err: Errno) -> AddrInfoError {
        match err {
            Errno::ETIMEDOUT | Errno::EAGAIN => AddrInfoError::Again,
            Errno::ENOMEM => AddrInfoError::Memory,
            Errno::EAFNOSUPPORT => AddrInfoError::Family,
            other => AddrInfoError::System(other),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_errors_map_to_posix() {
        assert_eq!(StackError::Rst.to_errno(), Errno::ECONNRESET);
        assert_eq!(StackError::Abrt.to_errno(), Errno::ECONNABORTED);
        assert_eq!(StackError::Clsd.to_errno(), Errno::ENOTCONN);
        assert_eq!(StackError::WouldBlock.to_errno(), Errno::EWOULDBLOCK);
        assert_eq!(StackError::Mem.to_errno(), Errno::ENOMEM);
        assert_eq!(Errno::from(StackError::Refused), Errno::ECONNREFUSED);
    }

    #[test]
    fn test_errno_codes() {
        assert_eq!(Errno::EAGAIN.code(), 11);
        assert_eq!(Errno::EINPROGRESS.code(), 115);
        assert!(Errno::EWOULDBLOCK.is_would_block());
        assert!(!Errno::ETIMEDOUT.is_would_block());
    }

    #[test]
    fn test_errno_io_kind() {
        use embedded_io::{Error, ErrorKind};
        assert_eq!(Errno::ECONNRESET.kind(), ErrorKind::ConnectionReset);
        assert_eq!(Errno::ETIMEDOUT.kind(), ErrorKind::TimedOut);
        assert_eq!(Errno::EBADF.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_addrinfo_from_errno() {
        assert_eq!(AddrInfoError::from(Errno::ETIMEDOUT), AddrInfoError::Again);
        assert_eq!(
            AddrInfoError::from(Errno::EBADF),
            AddrInfoError::System(Errno::EBADF)
        );
    }
}
