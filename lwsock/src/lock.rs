//! Lock tiers for the socket layer.
//!
//! Two independent scopes exist:
//! - `StackLock` - one per stack, serializes every call into the engine and
//!   every engine-originated callback. Held for short critical sections only;
//!   its guard has no way to wait.
//! - `SocketLock` - one per socket, protects buffers and flags, and owns the
//!   readiness condition that consumer threads block on.
//!
//! ## Lock Ordering Protocol
//!
//! 1. STACK
//! 2. SOCKET (any number, e.g. a listener then its new connection)
//!
//! A socket lock may be taken while the stack lock is held, never the other
//! way around, and no thread waits on a socket while it holds the stack lock.
//! Debug builds check both rules per thread.

use core::ops::{Deref, DerefMut};
use std::cell::Cell;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

// ============================================================================
// Lock IDs for Lock Ordering Validation (Debug Mode)
// ============================================================================

/// Lock hierarchy levels - lower numbers must be acquired before higher numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockId {
    Stack = 1,
    Socket = 2,
}

thread_local! {
    static STACK_HELD: Cell<bool> = const { Cell::new(false) };
    static SOCKETS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Whether the current thread holds a stack lock.
pub fn stack_held() -> bool {
    STACK_HELD.with(Cell::get)
}

/// Number of socket locks the current thread holds.
pub fn sockets_held() -> usize {
    SOCKETS_HELD.with(Cell::get)
}

/// Marks one held lock of a tier for the lifetime of the value.
struct TierToken(LockId);

impl TierToken {
    fn acquire(id: LockId) -> Self {
        match id {
            LockId::Stack => {
                debug_assert!(!stack_held(), "stack lock is not recursive");
                debug_assert_eq!(
                    sockets_held(),
                    0,
                    "stack lock taken while holding a socket lock"
                );
                STACK_HELD.with(|held| held.set(true));
            }
            LockId::Socket => SOCKETS_HELD.with(|held| held.set(held.get() + 1)),
        }
        TierToken(id)
    }
}

impl Drop for TierToken {
    fn drop(&mut self) {
        match self.0 {
            LockId::Stack => STACK_HELD.with(|held| held.set(false)),
            LockId::Socket => SOCKETS_HELD.with(|held| held.set(held.get().saturating_sub(1))),
        }
    }
}

// ============================================================================
// STACK LOCK
// ============================================================================

/// The global lock around the engine.
pub struct StackLock<T> {
    data: Mutex<T>,
}

impl<T> StackLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Acquire the lock, blocking until available.
    ///
    /// A panic on another thread while holding the lock does not poison it;
    /// engine state is owned by the engine, not by the critical section.
    pub fn lock(&self) -> StackLockGuard<'_, T> {
        let token = TierToken::acquire(LockId::Stack);
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        StackLockGuard {
            guard,
            _token: token,
        }
    }
}

/// RAII guard for the stack lock. Deliberately offers no wait primitive.
pub struct StackLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _token: TierToken,
}

impl<T> Deref for StackLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for StackLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ============================================================================
// SOCKET LOCK
// ============================================================================

/// Per-object mutex paired with a readiness condition.
pub struct SocketLock<T> {
    data: Mutex<T>,
    ready: Condvar,
}

impl<T> SocketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: Mutex::new(data),
            ready: Condvar::new(),
        }
    }

    pub fn lock(&self) -> SocketGuard<'_, T> {
        let token = TierToken::acquire(LockId::Socket);
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        SocketGuard {
            guard,
            token,
        }
    }

    /// Wake every thread blocked in `wait_until`.
    ///
    /// Call with the guard held so the state change and the wakeup are
    /// observed together.
    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    /// Release the guard and sleep until notified or `deadline` passes.
    ///
    /// Returns the reacquired guard and whether the deadline expired. Wakeups
    /// may be spurious; callers re-check their condition.
    pub fn wait_until<'a>(
        &'a self,
        guard: SocketGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> (SocketGuard<'a, T>, bool) {
        debug_assert!(!stack_held(), "waiting on a socket while holding the stack lock");

        let SocketGuard { guard, token } = guard;
        match deadline {
            None => {
                let guard = self.ready.wait(guard).unwrap_or_else(PoisonError::into_inner);
                (SocketGuard { guard, token }, false)
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (SocketGuard { guard, token }, true);
                }
                let (guard, result) = self
                    .ready
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (SocketGuard { guard, token }, result.timed_out())
            }
        }
    }
}

/// RAII guard for a socket lock.
pub struct SocketGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    token: TierToken,
}

impl<T> Deref for SocketGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SocketGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ============================================================================
// TESTS
// ============================================================================
