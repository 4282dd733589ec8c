//! Error definitions shared across the crate.
//!
//! The taxonomy separates configuration mistakes (raised synchronously at
//! setup time), transport failures (recoverable ones are retried inside the
//! receive loop, fatal ones tear it down), and faults surfaced through the
//! frame pipe to suspended consumers. `CanError` is `Clone` so a single
//! background fault can be delivered to every waiting consumer.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanError {
    /// Arbitration ID does not fit the selected ID width.
    #[error("CAN id does not fit the selected id width")]
    IdTooLong,

    /// Payload exceeds the maximum for the frame kind (8 / 64 bytes).
    #[error("payload is too long for the frame kind")]
    DataTooLong,

    /// A filter rule or option set was rejected at configuration time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The requested feature is not available on this bus or transport.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Transient transport failure; the receive loop retries these.
    #[error("transport interrupted: {0}")]
    Interrupted(String),

    /// Unrecoverable transport failure; terminates the receive loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bus has been closed; no further I/O is possible.
    #[error("bus is closed")]
    BusClosed,

    /// Operation on a periodic transmission job that was already stopped.
    #[error("periodic transmission already stopped")]
    PeriodicStopped,

    /// The receive loop died and poisoned the frame pipe; carries the
    /// message of the originating failure.
    #[error("background receive fault: {0}")]
    BackgroundFault(String),
}

impl CanError {
    /// Whether the receive loop may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CanError::Interrupted(_))
    }

    /// Wrap a fatal error into the form consumers observe through the pipe.
    pub(crate) fn into_background_fault(self) -> CanError {
        match self {
            CanError::BackgroundFault(_) => self,
            other => CanError::BackgroundFault(other.to_string()),
        }
    }
}
