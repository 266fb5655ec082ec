//! Logging initialization.
//!
//! The kernel build funnels every diagnostic through `klog`: a small set of
//! leveled macros backed by a registered output function, with an early-boot
//! COM1 fallback before any real backend is registered.  In this userspace
//! daemon there is only ever one process and one output stream, so the
//! equivalent is a single `env_logger` backend installed once at startup;
//! every call site still goes through the ordinary `log::{error,warn,info,
//! debug,trace}!` macros.

use log::LevelFilter;

/// Mirrors the kernel's `KlogLevel` ordering so callers converting a CLI
/// flag or config value don't have to think about `log`'s own type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// Install the process-wide logging backend.
///
/// `RUST_LOG` overrides `level` if set, matching `env_logger`'s usual
/// precedence. Idempotent: a second call is a harmless no-op, mirroring
/// `klog_init`'s one-shot registration semantics.
pub fn init(level: LogLevel) {
    let _ = env_logger::Builder::new()
        .filter_level(level.to_filter())
        .parse_env("RUST_LOG")
        .is_test(false)
        .try_init();
}
