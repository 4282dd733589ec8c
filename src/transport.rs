//! Minimal contract a native transport (raw socket, vendor SDK, mock)
//! must provide for a [`CanBus`](crate::bus::CanBus) to run on top of it.
//!
//! The bus never touches transport mechanics beyond this trait: readiness
//! waiting with an out-of-band wake, non-blocking batch draining, frame
//! writes, and optional hardware periodic-transmission slots.

use std::time::Duration;

use crate::error::CanError;
use crate::frame::{CanFrame, CanReceiveData};

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Frames are available to drain.
    Ready,
    /// The timeout elapsed, or the wait was interrupted via [`CanTransport::wake`].
    TimedOut,
}

/// A hardware periodic-transmission slot granted by the transport. The
/// hardware clocks the retransmissions; the owner only updates the payload
/// or stops the slot.
pub trait PeriodicSlot: Send {
    /// Swap the transmitted frame without restarting the cycle.
    fn update(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        let _ = frame;
        Err(CanError::NotSupported("periodic slot payload update"))
    }

    /// Stop the cycle and free the slot. Must be idempotent.
    fn stop(&mut self) -> Result<(), CanError>;
}

pub trait CanTransport: Send + Sync {
    /// Wait until frames are available or `timeout` elapses. Implementations
    /// must return promptly when [`wake`](Self::wake) is called from another
    /// thread, reporting `TimedOut`.
    fn wait_readable(&self, timeout: Duration) -> Result<WaitStatus, CanError>;

    /// Interrupt a blocked [`wait_readable`](Self::wait_readable). Callable
    /// from any thread; a no-op when nothing is waiting.
    fn wake(&self);

    /// Drain up to `max` already-received frames without blocking. Returning
    /// fewer than `max` means the transport has no more data right now.
    fn drain_batch(&self, max: usize) -> Result<Vec<CanReceiveData>, CanError>;

    fn write_frame(&self, frame: &CanFrame) -> Result<(), CanError>;

    /// Write a batch, returning how many frames went out. The default stops
    /// at the first failure and reports the count written so far, or the
    /// error itself when nothing was written.
    fn write_frames(&self, frames: &[CanFrame]) -> Result<usize, CanError> {
        let mut written = 0;
        for frame in frames {
            match self.write_frame(frame) {
                Ok(()) => written += 1,
                Err(err) if written == 0 => return Err(err),
                Err(_) => break,
            }
        }
        Ok(written)
    }

    /// Size of the transport's hardware periodic-slot pool (0 when the
    /// mechanism does not exist).
    fn periodic_slot_capacity(&self) -> usize {
        0
    }

    /// Try to offload a periodic transmission to the hardware. `None` means
    /// the pool is exhausted or the feature is absent; the caller decides
    /// whether to fall back to software scheduling.
    fn try_alloc_periodic_slot(
        &self,
        frame: &CanFrame,
        period: Duration,
        repeat: Option<u64>,
    ) -> Result<Option<Box<dyn PeriodicSlot>>, CanError> {
        let _ = (frame, period, repeat);
        Ok(None)
    }
}
