//! Stack processing context.
//!
//! `Stack` owns the engine behind the stack lock together with the registry
//! mapping engine handles to the sockets (or not-yet-accepted connections)
//! that receive their callbacks. A dedicated `tcpip` thread wakes on a kick
//! or on its tick, polls the engine and dispatches every queued event with
//! the stack lock held.
//!
//! Connections that must be torn down from a context that cannot take the
//! stack lock (dropping an unclaimed accept record while holding a socket
//! lock, for instance) are queued on the reaper and aborted the next time
//! the stack lock is released.

use core::ops::{Deref, DerefMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::config::StackConfig;
use crate::engine::{Engine, Handle, StackEvent};
use crate::error::{Errno, Result};
use crate::lock::{StackLock, StackLockGuard};
use crate::socket::tcp::{self, PendingConn};
use crate::socket::{self, SocketInner};

/// Receiver of the events for one engine handle.
#[derive(Clone)]
pub(crate) enum Handler {
    Socket(Arc<SocketInner>),
    /// Accepted by the engine, not yet claimed by `accept()`
    Pending(Arc<PendingConn>),
}

/// Everything the stack lock protects.
pub(crate) struct StackCore {
    pub engine: Box<dyn Engine>,
    handlers: HashMap<Handle, Handler>,
}

impl StackCore {
    pub fn register(&mut self, handle: Handle, handler: Handler) {
        if self.handlers.insert(handle, handler).is_some() {
            trace!("handler for {} replaced", handle);
        }
    }

    pub fn unregister(&mut self, handle: Handle) -> Option<Handler> {
        self.handlers.remove(&handle)
    }

    pub fn handlers(&self) -> usize {
        self.handlers.len()
    }

    fn dispatch(&mut self, event: StackEvent) {
        let target = event.target();
        let Some(handler) = self.handlers.get(&target).cloned() else {
            self.orphan(event);
            return;
        };
        match handler {
            Handler::Socket(sock) => socket::on_event(self, &sock, event),
            Handler::Pending(pending) => tcp::on_pending_event(self, &pending, event),
        }
    }

    /// Event for a handle nobody owns any more.
    fn orphan(&mut self, event: StackEvent) {
        match event {
            StackEvent::Accepted { listener, conn, .. } => {
                warn!("listener {} has no owner, aborting {}", listener, conn);
                self.engine.tcp_abort(conn);
            }
            other => trace!("dropping {:?} for unowned {}", other, other.target()),
        }
    }
}

/// A running (or manually driven) network stack.
pub struct Stack {
    core: StackLock<StackCore>,
    /// Connections to abort once the stack lock is next released
    reaper: Mutex<Vec<Handle>>,
    kick: Option<SyncSender<()>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Stack {
    fn build(engine: Box<dyn Engine>, kick: Option<SyncSender<()>>) -> Self {
        Self {
            core: StackLock::new(StackCore {
                engine,
                handlers: HashMap::new(),
            }),
            reaper: Mutex::new(Vec::new()),
            kick,
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start the stack thread around `engine`.
    pub fn start(engine: Box<dyn Engine>, config: StackConfig) -> Result<Arc<Stack>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let stack = Arc::new(Stack::build(engine, Some(tx)));
        stack.running.store(true, Ordering::Release);

        let weak = Arc::downgrade(&stack);
        let tick = config.tick;
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || tcpip_thread(weak, rx, tick))
            .map_err(|e| {
                error!("failed to spawn {}: {}", config.thread_name, e);
                Errno::EAGAIN
            })?;
        *stack.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("stack started ({}, tick {:?})", config.thread_name, tick);
        Ok(stack)
    }

    /// A stack without a processing thread; callers drive it with
    /// [`Stack::run_once`]. Blocking socket calls only make progress while
    /// another thread keeps running it.
    pub fn manual(engine: Box<dyn Engine>) -> Arc<Stack> {
        Arc::new(Stack::build(engine, None))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Take the stack lock.
    pub(crate) fn lock(&self) -> StackGuard<'_> {
        StackGuard {
            stack: self,
            core: self.core.lock(),
        }
    }

    /// Poll the engine and dispatch until it has nothing queued.
    ///
    /// Returns the number of events dispatched.
    pub fn run_once(&self) -> usize {
        let mut core = self.lock();
        let mut handled = 0;
        loop {
            let events = core.engine.poll_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                core.dispatch(event);
                handled += 1;
            }
            self.reap(&mut core);
        }
        handled
    }

    /// Wake the stack thread.
    pub fn kick(&self) {
        if let Some(tx) = &self.kick {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => trace!("kick after stack thread exit"),
            }
        }
    }

    /// Queue `conn` for abort outside the current lock scope.
    pub(crate) fn defer_abort(&self, conn: Handle) {
        self.reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
        self.kick();
    }

    fn reap(&self, core: &mut StackCore) {
        loop {
            let doomed = std::mem::take(&mut *self.reaper.lock().unwrap_or_else(PoisonError::into_inner));
            if doomed.is_empty() {
                return;
            }
            for conn in doomed {
                // Gone already if the engine reported an error for it
                if core.unregister(conn).is_some() {
                    debug!("aborting unclaimed connection {}", conn);
                    core.engine.tcp_abort(conn);
                }
            }
        }
    }

    pub(crate) fn next_socket_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of handles with a registered receiver.
    pub fn registered(&self) -> usize {
        self.lock().handlers()
    }

    /// Stop the stack thread and wait for it to exit.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.kick();
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("stack thread panicked");
            }
        }
        info!("stack stopped");
    }
}

/// Scope of the stack lock.
///
/// Releasing it aborts deferred connections and kicks the stack thread when
/// the engine queued callbacks in the meantime. There is intentionally no
/// way to wait on a socket through this type.
pub(crate) struct StackGuard<'a> {
    stack: &'a Stack,
    core: StackLockGuard<'a, StackCore>,
}

impl Deref for StackGuard<'_> {
    type Target = StackCore;

    fn deref(&self) -> &StackCore {
        &self.core
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.stack.reap(&mut self.core);
        if self.core.engine.has_events() {
            self.stack.kick();
        }
    }
}

fn tcpip_thread(stack: Weak<Stack>, kicks: Receiver<()>, tick: Duration) {
    debug!("tcpip thread up");
    loop {
        if let Err(RecvTimeoutError::Disconnected) = kicks.recv_timeout(tick) {
            break;
        }
        let Some(stack) = stack.upgrade() else {
            break;
        };
        if !stack.is_running() {
            break;
        }
        stack.run_once();
    }
    debug!("tcpip thread exiting");
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
