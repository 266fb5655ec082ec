//! Sleep/wake primitive for PCBs blocked on I/O.
//!
//! The kernel build parks a task on a [`WaitQueue`] that is integrated with
//! its own scheduler (`block_current_task`/`unblock_task`).  A userspace
//! daemon has no scheduler to integrate with — the OS thread itself is the
//! unit of blocking — so `SchedCtx` is built directly on
//! `std::sync::Condvar`.  What is kept from the original design is the
//! shape: a fixed amount of state (a waiter count and an interrupted flag)
//! guarded by the *same lock the caller already holds*, so that `sleep`
//! always observes a consistent view of the resource it's waiting on.
//!
//! `sleep` takes the caller's own `MutexGuard` and gives it back on return,
//! exactly like `Condvar::wait` — a PCB table's lock is never a second,
//! separate lock from the one `SchedCtx` uses internally.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Why a call to [`SchedCtx::sleep`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepOutcome {
    /// Another thread called [`SchedCtx::wakeup`] or [`SchedCtx::interrupt`].
    Woken,
    /// The deadline passed before anyone woke this waiter.
    TimedOut,
    /// [`SchedCtx::interrupt`] was called (process-wide cancellation, e.g. a
    /// hangup signal). Callers must treat this as "abort the blocking call",
    /// not "try again".
    Interrupted,
}

/// A sleep/wake rendezvous point owned by a single resource (a UDP or TCP
/// PCB). One `SchedCtx` per PCB, not one per waiter — multiple threads may
/// wait on the same PCB (e.g. concurrent `recvfrom` calls), and `wakeup`
/// broadcasts to all of them.
#[derive(Default)]
pub struct SchedCtx {
    condvar: Condvar,
    waiters: AtomicUsize,
    interrupted: AtomicBool,
}

impl SchedCtx {
    pub const fn new() -> Self {
        Self {
            condvar: Condvar::new(),
            waiters: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Block the calling thread on this context, releasing `guard` for the
    /// duration and reacquiring it before returning.
    ///
    /// Must be called with the resource's own lock held — `guard` proves
    /// that at the call site. If `deadline` is `Some`, the wait is bounded;
    /// `None` waits indefinitely until woken or interrupted.
    ///
    /// If the context is already interrupted when `sleep` is called, it
    /// returns immediately with [`SleepOutcome::Interrupted`] without ever
    /// blocking — this is what lets a PCB table drain all blocked callers
    /// with one `interrupt()` even if some of them haven't started waiting
    /// yet.
    pub fn sleep<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, T>, SleepOutcome) {
        if self.interrupted.load(Ordering::Acquire) {
            return (guard, SleepOutcome::Interrupted);
        }

        self.waiters.fetch_add(1, Ordering::AcqRel);
        let (guard, timed_out) = match deadline {
            Some(when) => {
                let remaining = when.saturating_duration_since(Instant::now());
                let (guard, timeout_result) = self
                    .condvar
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                (guard, timeout_result.timed_out())
            }
            None => {
                let guard = self
                    .condvar
                    .wait(guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                (guard, false)
            }
        };
        let remaining_waiters = self.waiters.fetch_sub(1, Ordering::AcqRel) - 1;

        let interrupted = self.interrupted.load(Ordering::Acquire);
        if interrupted && remaining_waiters == 0 {
            // Last waiter out clears the flag: interrupted is a one-shot
            // broadcast, not a sticky state.
            self.interrupted.store(false, Ordering::Release);
        }

        let outcome = if interrupted {
            SleepOutcome::Interrupted
        } else if timed_out {
            SleepOutcome::TimedOut
        } else {
            SleepOutcome::Woken
        };
        (guard, outcome)
    }

    /// Wake every thread currently blocked in [`sleep`](Self::sleep) on this
    /// context. Used when new data or state becomes available (e.g. a
    /// datagram was enqueued, a PCB transitioned state).
    pub fn wakeup(&self) {
        self.condvar.notify_all();
    }

    /// Set the interrupted flag and wake every waiter. Used for process-wide
    /// cancellation (the "event" signal) — e.g. shutting the daemon down
    /// while `recvfrom` calls are blocked.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// `true` if any thread is currently blocked in [`sleep`](Self::sleep).
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }
}

/// Convenience: compute an `Instant` deadline `timeout` from now, or `None`
/// if `timeout` is `None` (wait indefinitely).
pub fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|d| Instant::now() + d)
}
