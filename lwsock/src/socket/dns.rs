//! Name-resolution pseudo-socket.
//!
//! A lookup is "sent" as a [`LookupRequest`] and its answer "received" as a
//! record, so a blocking lookup is just the ordinary blocking receive. A
//! resolver that answers synchronously has its answer queued on the spot;
//! an asynchronous answer arrives as a `Resolved` event for the query handle.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use smoltcp::wire::IpAddress;

use super::{Inbox, Kind, SocketInner, SocketState};
use crate::addr::AddressFamily;
use crate::buffer::RecordQueue;
use crate::config::DNS_TIMEOUT;
use crate::engine::{Lookup, StackEvent};
use crate::error::{Errno, Result, StackError};
use crate::event::{Events, MsgFlags};
use crate::stack::{Handler, Stack, StackCore};

/// Longest host name accepted
const MAX_NAME_LEN: usize = 255;

/// A host name to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub name: String,
    /// `Unspec` takes whichever family the resolver finds first
    pub family: AddressFamily,
}

impl LookupRequest {
    pub fn new(name: &str, family: AddressFamily) -> Self {
        Self {
            name: String::from(name),
            family,
        }
    }
}

/// Answer to one lookup; `None` when the name does not exist.
#[derive(Debug)]
pub(crate) struct LookupRecord {
    addr: Option<IpAddress>,
}

pub(crate) fn new(stack: &Arc<Stack>) -> Arc<SocketInner> {
    let mut state = SocketState::new(None, Inbox::Lookup(RecordQueue::new()));
    state.recv_timeout = Some(DNS_TIMEOUT);
    let sock = SocketInner::new(stack, AddressFamily::Unspec, Kind::Resolver, state);
    trace!("socket {}: resolver", sock.id);
    sock
}

/// Submit `request`. At most one lookup may be outstanding.
pub(crate) fn send(sock: &Arc<SocketInner>, request: &LookupRequest) -> Result<()> {
    if request.name.is_empty() || request.name.len() > MAX_NAME_LEN {
        return Err(Errno::EINVAL);
    }
    let mut core = sock.stack.lock();
    let wakeup = {
        let mut st = sock.lock();
        st.check_open()?;
        if st.handle.is_some() {
            return Err(Errno::EALREADY);
        }
        let answer = match core.engine.resolve(&request.name, request.family) {
            Ok(Lookup::Done(addr)) => addr,
            Ok(Lookup::Pending(query)) => {
                st.handle = Some(query);
                core.register(query, Handler::Socket(sock.clone()));
                debug!("socket {}: looking up {:?} as {}", sock.id, request.name, query);
                return Ok(());
            }
            // No servers configured degrades to "not found"
            Err(StackError::NoResolver) => {
                debug!("socket {}: no resolver for {:?}", sock.id, request.name);
                None
            }
            Err(err) => return Err(err.into()),
        };
        if let Inbox::Lookup(queue) = &mut st.inbox {
            if queue.push(LookupRecord { addr: answer }).is_err() {
                return Err(Errno::ENOMEM);
            }
        }
        trace!("socket {}: {:?} -> {:?}", sock.id, request.name, answer);
        sock.signal(&mut st, Events::IN)
    };
    drop(core);
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
    Ok(())
}

/// Wait for the answer.
pub(crate) fn recv(sock: &Arc<SocketInner>) -> Result<Option<IpAddress>> {
    let timeout = sock.recv_timeout();
    sock.block_on(timeout, MsgFlags::empty(), || {
        let mut st = sock.lock();
        st.check_open()?;
        let Inbox::Lookup(queue) = &mut st.inbox else {
            return Err(Errno::EBADF);
        };
        let record = queue.pop();
        let drained = queue.is_empty();
        if drained {
            st.events.remove(Events::IN);
        }
        match record {
            Some(record) => Ok(record.addr),
            None if st.handle.is_none() => Err(Errno::ENOENT),
            None => Err(Errno::EAGAIN),
        }
    })
}

pub(crate) fn close(sock: &Arc<SocketInner>) -> Result<()> {
    let mut core = sock.stack.lock();
    let (handle, _) = sock.mark_closed()?;
    if let Some(query) = handle {
        debug!("socket {}: abandoning lookup {}", sock.id, query);
        core.unregister(query);
    }
    Ok(())
}

pub(crate) fn on_event(core: &mut StackCore, sock: &Arc<SocketInner>, event: StackEvent) {
    let StackEvent::Resolved { query, addr } = event else {
        trace!("socket {}: ignoring {:?}", sock.id, event);
        return;
    };
    core.unregister(query);
    let wakeup = {
        let mut st = sock.lock();
        if st.handle != Some(query) {
            trace!("socket {}: stale answer for {}", sock.id, query);
            return;
        }
        st.handle = None;
        if let Inbox::Lookup(queue) = &mut st.inbox {
            if queue.push(LookupRecord { addr }).is_err() {
                st.latch(Errno::ENOMEM);
            }
        }
        debug!("socket {}: {} answered {:?}", sock.id, query, addr);
        sock.signal(&mut st, Events::IN)
    };
    if let Some(wakeup) = wakeup {
        wakeup.fire();
    }
}

/// Resolve `name` through a temporary resolver socket.
pub fn resolve(
    stack: &Arc<Stack>,
    name: &str,
    family: AddressFamily,
    timeout: Option<Duration>,
) -> Result<Option<IpAddress>> {
    let sock = new(stack);
    sock.lock().recv_timeout = timeout;
    let answer = send(&sock, &LookupRequest::new(name, family)).and_then(|()| recv(&sock));
    close(&sock)?;
    answer
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoopbackConfig, LOOPBACK};
    use crate::socket::Socket;
    use crate::testing::{loopback, loopback_with, manual};

    fn hosts(entries: &[(&str, &str)]) -> LoopbackConfig {
        LoopbackConfig {
            hosts: Some(
                entries
                    .iter()
                    .map(|(n, a)| (String::from(*n), crate::addr::parse_numeric(a).unwrap()))
                    .collect(),
            ),
            ..LoopbackConfig::default()
        }
    }

    #[test]
    fn test_synchronous_answers() {
        let (stack, _) = loopback();
        let lo = Some(IpAddress::Ipv4(LOOPBACK));
        assert_eq!(resolve(&stack, "127.0.0.1", AddressFamily::Inet, None), Ok(lo));
        assert_eq!(resolve(&stack, "localhost", AddressFamily::Unspec, None), Ok(lo));
        // Literal of the wrong family does not match
        assert_eq!(resolve(&stack, "::1", AddressFamily::Inet, None), Ok(None));
    }

    #[test]
    fn test_asynchronous_answer() {
        let (stack, _) = loopback_with(hosts(&[("db.internal", "10.0.0.7")]));
        let sock = Socket::resolver(&stack).unwrap();
        sock.send_query(&LookupRequest::new("db.internal", AddressFamily::Inet))
            .unwrap();
        assert_eq!(
            sock.recv_answer(),
            Ok(crate::addr::parse_numeric("10.0.0.7"))
        );
        // Next query on the same socket
        sock.send_query(&LookupRequest::new("nowhere", AddressFamily::Inet))
            .unwrap();
        assert_eq!(sock.recv_answer(), Ok(None));
        sock.close().unwrap();
        assert_eq!(stack.registered(), 0);
    }

    #[test]
    fn test_no_resolver_means_not_found() {
        let (stack, _) = loopback_with(LoopbackConfig {
            hosts: None,
            ..LoopbackConfig::default()
        });
        assert_eq!(resolve(&stack, "example.org", AddressFamily::Unspec, None), Ok(None));
    }

    #[test]
    fn test_bad_requests() {
        let (stack, _) = manual();
        let sock = Socket::resolver(&stack).unwrap();
        assert_eq!(
            sock.send_query(&LookupRequest::new("", AddressFamily::Inet)),
            Err(Errno::EINVAL)
        );
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            sock.send_query(&LookupRequest::new(&long, AddressFamily::Inet)),
            Err(Errno::EINVAL)
        );
        // Nothing submitted, nothing to wait for
        assert_eq!(sock.recv_answer(), Err(Errno::ENOENT));
    }

    #[test]
    fn test_one_query_at_a_time_and_timeout() {
        let (stack, _) = manual();
        let sock = Socket::resolver(&stack).unwrap();
        sock.set_option(crate::socket::SockOpt::RecvTimeout(Some(Duration::from_millis(20))))
            .unwrap();
        let req = LookupRequest::new("pending.example", AddressFamily::Inet);
        sock.send_query(&req).unwrap();
        assert_eq!(sock.send_query(&req), Err(Errno::EALREADY));
        // Nobody drives the manual stack
        assert_eq!(sock.recv_answer(), Err(Errno::ETIMEDOUT));

        stack.run_once();
        assert_eq!(sock.recv_answer(), Ok(None));
        sock.close().unwrap();
    }
}
