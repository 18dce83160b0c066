//! Logging configuration for syncqueue.
//!
//! The queue reports everything it swallows (persistence failures, corrupt
//! stored state, dropped writes) through `tracing`, so the subscriber set up
//! here is the only place those failures become visible. Dropped writes are
//! logged at `warn`, which is why even quiet mode keeps warnings.
//!
//! Log lines go to stderr so `syncq status --json` output stays parseable.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target every queue event is recorded under.
const LOG_TARGET: &str = "syncqueue";

/// How much of the queue's activity to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Only warnings and errors: dropped writes, storage failures.
    Quiet,
    /// Lifecycle events such as scheduled retries and cleared queues.
    #[default]
    Normal,
    /// Every enqueue and dispatch.
    Verbose,
    /// Everything, including no-op drain triggers.
    Trace,
}

impl Verbosity {
    /// Derive verbosity from a `-v` count and a `-q` flag. Quiet wins.
    #[must_use]
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// The most detailed level reported for queue events.
    #[must_use]
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::WARN,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Filter directive used when `RUST_LOG` is unset.
    #[must_use]
    pub fn directive(self) -> String {
        format!("{LOG_TARGET}={}", self.level())
    }
}

/// Pick the filter: `rust_log` if it parses, otherwise `verbosity`.
fn build_filter(verbosity: Verbosity, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(verbosity.directive()))
}

/// Install the global subscriber.
///
/// Call once at startup; later calls are ignored. `RUST_LOG` takes
/// precedence over `verbosity`.
///
/// # Examples
///
/// ```no_run
/// use syncqueue::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(verbosity, rust_log.as_deref());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

/// Route logs to the test harness. Warnings only unless `RUST_LOG` is set.
#[cfg(test)]
pub fn init_test_logging() {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(Verbosity::Quiet, rust_log.as_deref()))
        .with_test_writer()
        .try_init();
}
