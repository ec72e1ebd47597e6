//! Profiler lifecycle errors.
//!
//! Codec and file-level failures stay plain [`std::io::Error`]; this enum
//! covers the monitoring state machine, where callers can meaningfully
//! distinguish causes.

use std::io;
use thiserror::Error;

/// Errors reported by the monitoring lifecycle.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The sampling clock thread could not be spawned.
    #[error("unable to start sampling clock thread: {0}")]
    ClockStart(#[source] io::Error),

    /// `enter_monitoring` was called while this context is already the
    /// active outer monitor.
    #[error("excess call to enter_monitoring")]
    ExcessEnter,

    /// `leave_monitoring` was called without a matching `enter_monitoring`.
    #[error("excess call to leave_monitoring")]
    ExcessLeave,

    /// The context was closed while still the active outer monitor.
    #[error("closing the context of a running monitor")]
    ActiveTeardown,

    /// The forked child could not restart its sampling clock.
    #[error("unable to restart sampling clock after fork: {0}")]
    ForkClock(#[source] io::Error),

    /// Trace file I/O failed.
    #[error("trace file error: {0}")]
    Trace(#[from] io::Error),
}
