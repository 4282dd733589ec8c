//! Periodic ("cyclic") frame transmission.
//!
//! A job first tries to offload to a hardware periodic slot; when the
//! bounded per-bus slot pool is exhausted it falls back (if the bus allows
//! it) to a software scheduler: a thread ticking at the configured period
//! through the same transport write path used for one-shot sends.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CanError;
use crate::frame::CanFrame;
use crate::transport::{CanTransport, PeriodicSlot};

/// How many transmissions a periodic job performs before stopping itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatCount {
    Infinite,
    Finite(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicTxOptions {
    pub period: Duration,
    pub repeat: RepeatCount,
    /// Fire once immediately instead of waiting out the first interval.
    pub immediate_first_send: bool,
}

impl PeriodicTxOptions {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            repeat: RepeatCount::Infinite,
            immediate_first_send: false,
        }
    }

    pub fn repeat(mut self, repeat: RepeatCount) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn immediate_first_send(mut self, immediate: bool) -> Self {
        self.immediate_first_send = immediate;
        self
    }
}

/// Bookkeeping for the bounded hardware-slot pool of one bus. The lock is
/// held only for the reserve/release decision, never across transport calls.
pub(crate) struct SlotPool {
    available: Mutex<usize>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
        }
    }

    pub fn try_reserve(&self) -> bool {
        let mut available = self.available.lock().unwrap();
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        *self.available.lock().unwrap() += 1;
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        *self.available.lock().unwrap()
    }
}

enum Mechanism {
    Hardware(Box<dyn PeriodicSlot>),
    Software(SoftwareJob),
    Stopped,
}

/// Handle for one running periodic transmission. The handle is the sole
/// owner of its slot or timer thread; `stop` (or drop) releases it.
pub struct PeriodicTx {
    inner: Mutex<Mechanism>,
    pool: Arc<SlotPool>,
}

impl PeriodicTx {
    pub(crate) fn start(
        transport: Arc<dyn CanTransport>,
        pool: Arc<SlotPool>,
        frame: CanFrame,
        options: PeriodicTxOptions,
        allow_software_fallback: bool,
    ) -> Result<Self, CanError> {
        if options.period.is_zero() {
            return Err(CanError::Config("periodic period must be non-zero".into()));
        }
        if options.repeat == RepeatCount::Finite(0) {
            return Err(CanError::Config("periodic repeat count must be non-zero".into()));
        }

        if pool.try_reserve() {
            let repeat = match options.repeat {
                RepeatCount::Infinite => None,
                RepeatCount::Finite(n) => Some(n),
            };
            match transport.try_alloc_periodic_slot(&frame, options.period, repeat) {
                Ok(Some(slot)) => {
                    return Ok(Self {
                        inner: Mutex::new(Mechanism::Hardware(slot)),
                        pool,
                    });
                }
                Ok(None) => pool.release(),
                Err(err) => {
                    pool.release();
                    return Err(err);
                }
            }
        }

        if !allow_software_fallback {
            return Err(CanError::NotSupported(
                "no hardware periodic slot available and software fallback is disabled",
            ));
        }
        let job = SoftwareJob::spawn(transport, frame, options)?;
        Ok(Self {
            inner: Mutex::new(Mechanism::Software(job)),
            pool,
        })
    }

    /// Swap the transmitted payload without restarting the cycle. Only
    /// available while the underlying mechanism supports it; otherwise
    /// callers stop and start a fresh job.
    pub fn update(&self, frame: CanFrame) -> Result<(), CanError> {
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner);
        match &mut *inner {
            Mechanism::Hardware(slot) => slot.update(&frame),
            Mechanism::Software(job) => {
                *job.frame.lock().unwrap() = frame;
                Ok(())
            }
            Mechanism::Stopped => Err(CanError::PeriodicStopped),
        }
    }

    /// A software job that ran out of repeats (or lost the bus) exits on
    /// its own; fold that exit into the handle state so callers observe
    /// the same `Stopped` they would after an explicit stop.
    fn reap(inner: &mut Mechanism) {
        if matches!(&*inner, Mechanism::Software(job) if job.is_finished()) {
            if let Mechanism::Software(mut job) = std::mem::replace(inner, Mechanism::Stopped) {
                job.stop();
            }
        }
    }

    /// Idempotent: releases the hardware slot or cancels the software
    /// timer. Safe to call from a drop path even after a partial start.
    pub fn stop(&self) {
        let mechanism = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut *inner, Mechanism::Stopped)
        };
        match mechanism {
            Mechanism::Hardware(mut slot) => {
                if let Err(err) = slot.stop() {
                    log::warn!("failed to release hardware periodic slot: {err}");
                }
                self.pool.release();
            }
            Mechanism::Software(mut job) => job.stop(),
            Mechanism::Stopped => {}
        }
    }

    pub fn is_stopped(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner);
        matches!(*inner, Mechanism::Stopped)
    }
}

impl fmt::Debug for PeriodicTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mechanism = match &*self.inner.lock().unwrap() {
            Mechanism::Hardware(_) => "hardware",
            Mechanism::Software(_) => "software",
            Mechanism::Stopped => "stopped",
        };
        f.debug_struct("PeriodicTx")
            .field("mechanism", &mechanism)
            .finish()
    }
}

impl Drop for PeriodicTx {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SoftwareJob {
    stop_tx: flume::Sender<()>,
    frame: Arc<Mutex<CanFrame>>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SoftwareJob {
    fn spawn(
        transport: Arc<dyn CanTransport>,
        frame: CanFrame,
        options: PeriodicTxOptions,
    ) -> Result<Self, CanError> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let frame = Arc::new(Mutex::new(frame));
        let finished = Arc::new(AtomicBool::new(false));
        let tick_frame = Arc::clone(&frame);
        let finished_flag = Arc::clone(&finished);
        let handle = thread::Builder::new()
            .name("canlink-periodic".into())
            .spawn(move || {
                run_cycle(transport.as_ref(), &tick_frame, &options, &stop_rx);
                finished_flag.store(true, Ordering::SeqCst);
            })
            .map_err(|e| CanError::Transport(format!("failed to spawn periodic thread: {e}")))?;
        Ok(Self {
            stop_tx,
            frame,
            finished,
            handle: Some(handle),
        })
    }

    /// Whether the timer thread exited on its own.
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_cycle(
    transport: &dyn CanTransport,
    frame: &Mutex<CanFrame>,
    options: &PeriodicTxOptions,
    stop_rx: &flume::Receiver<()>,
) {
    let mut remaining = match options.repeat {
        RepeatCount::Infinite => None,
        RepeatCount::Finite(n) => Some(n),
    };
    let mut failures = 0u64;
    if options.immediate_first_send {
        if !tick(transport, frame, &mut remaining, &mut failures) {
            return;
        }
        if remaining == Some(0) {
            return;
        }
    }
    loop {
        match stop_rx.recv_timeout(options.period) {
            Err(flume::RecvTimeoutError::Timeout) => {
                if !tick(transport, frame, &mut remaining, &mut failures) {
                    return;
                }
                if remaining == Some(0) {
                    return;
                }
            }
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// One scheduled transmission. A failing send is logged and counted but
/// does not stop the job; an invalid handle (bus closed) does.
fn tick(
    transport: &dyn CanTransport,
    frame: &Mutex<CanFrame>,
    remaining: &mut Option<u64>,
    failures: &mut u64,
) -> bool {
    let frame = frame.lock().unwrap().clone();
    match transport.write_frame(&frame) {
        Ok(()) => {}
        Err(CanError::BusClosed) => {
            log::warn!("periodic transmission stopping: bus closed");
            return false;
        }
        Err(err) => {
            *failures += 1;
            log::warn!("periodic transmission failed ({failures} so far): {err}");
        }
    }
    if let Some(n) = remaining {
        *n -= 1;
    }
    true
}
