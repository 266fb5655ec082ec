//! Ambient services shared by the protocol engine and the daemon binary.
//!
//! Mirrors the role the kernel's `lib` crate plays for the rest of the
//! original stack: one place for the sleep/wake primitive, the monotonic
//! clock, and logging setup, so that neither `net` nor `daemon` has to
//! reinvent them.

pub mod clock;
pub mod logging;
pub mod sched;

pub use sched::{SchedCtx, SleepOutcome};
