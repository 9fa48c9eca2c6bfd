//! Crate-wide error type.
//!
//! Grounded on how the pack's richer crates centralise fallible outcomes behind a single
//! `thiserror`-derived enum (e.g. `qmonnet-dataplane`'s `nat` member, `dataplane-nat`) rather
//! than ad hoc `String`/`Box<dyn Error>` returns.

use std::fmt;
use std::sync::Arc;

/// Errors surfaced by the reactive flow installation engine (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum MapleError {
    /// A Decision reached action compilation while still tagged `Undefined`.
    #[error("packet could not be classified by any handler")]
    UnhandledPacket,

    /// The trace tree could not allocate a priority within the band available at a node, even
    /// after a global `update()`.
    #[error("priority band exceeded while augmenting the trace tree")]
    PriorityExceeded,

    /// A packet-miss handler raised an error; annotated with the offending handler's name.
    #[error("handler \"{handler}\" failed: {source}")]
    HandlerFailure {
        handler: String,
        #[source]
        source: HandlerError,
    },

    /// An install or remove targeted a switch with no live connection.
    #[error("no connection to switch {dpid:016x}")]
    UnknownSwitch { dpid: u64 },

    /// A handler was registered after the pipeline started.
    #[error("handler \"{name}\" registered after startup, ignored")]
    Reregistration { name: String },
}

pub type Result<T> = std::result::Result<T, MapleError>;

/// Opaque, cloneable wrapper around a handler-raised error, so [`MapleError::HandlerFailure`]
/// can derive `Clone` without constraining what handlers may return.
#[derive(Clone)]
pub struct HandlerError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl HandlerError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HandlerError(Arc::new(err))
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
