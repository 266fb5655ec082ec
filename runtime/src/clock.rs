//! Monotonic clock.
//!
//! Replaces the HPET-backed `monotonic_ns`/`uptime_ms` pair from the kernel
//! build with `std::time::Instant`, which is itself backed by a monotonic
//! clock source (`CLOCK_MONOTONIC` on Linux) on every platform this daemon
//! targets.

use std::time::Instant;

/// Returns system uptime in milliseconds, measured from an arbitrary but
/// fixed epoch established the first time this function is called.
#[inline]
pub fn uptime_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Returns the `Instant` this process's monotonic epoch was established at.
#[inline]
pub fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
