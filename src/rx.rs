//! Background receive loop: one dedicated thread per bus that waits on the
//! transport, drains everything available, classifies error vs. data
//! frames, applies the software filter fallback, and fans out to callback
//! subscribers and the frame pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::Sender;

use crate::error::CanError;
use crate::error_frame::CanErrorInfo;
use crate::filter::SoftwareFilter;
use crate::frame::CanReceiveData;
use crate::pipe::FramePipe;
use crate::subscribers::Subscribers;
use crate::transport::{CanTransport, WaitStatus};

/// Upper bound per drain request; a full batch triggers an immediate
/// follow-up drain in the same wake-up.
pub(crate) const BATCH_SIZE: usize = 64;

/// Everything the loop shares with the owning bus.
pub(crate) struct RxShared {
    pub filter: RwLock<SoftwareFilter>,
    pub data_subs: Subscribers<CanReceiveData>,
    pub error_subs: Subscribers<CanErrorInfo>,
    pub pipe: Arc<FramePipe>,
    pub fault_tx: Sender<CanError>,
}

pub(crate) struct ReceiveLoop {
    stop: Arc<AtomicBool>,
    done_rx: flume::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveLoop {
    /// Spawn the loop thread. It runs until [`stop`](Self::stop) or a fatal
    /// transport error.
    pub fn start(
        transport: Arc<dyn CanTransport>,
        shared: Arc<RxShared>,
        poll_timeout: Duration,
    ) -> Result<Self, CanError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = flume::bounded(1);
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("canlink-rx".into())
            .spawn(move || {
                run(transport, shared, stop_flag, poll_timeout);
                let _ = done_tx.send(());
            })
            .map_err(|e| CanError::Transport(format!("failed to spawn receive thread: {e}")))?;
        Ok(Self {
            stop,
            done_rx,
            handle: Some(handle),
        })
    }

    /// Cooperative stop: raise the flag, wake the blocked wait, then give
    /// the thread a bounded grace period. If it does not exit in time the
    /// caller proceeds anyway (best-effort join, never a hard join).
    pub fn stop(&mut self, transport: &dyn CanTransport, grace: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        transport.wake();
        match self.done_rx.recv_timeout(grace) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                log::warn!("receive loop did not exit within {grace:?}; detaching");
                self.handle.take();
            }
        }
    }
}

fn run(
    transport: Arc<dyn CanTransport>,
    shared: Arc<RxShared>,
    stop: Arc<AtomicBool>,
    poll_timeout: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        match transport.wait_readable(poll_timeout) {
            Ok(WaitStatus::TimedOut) => continue,
            Ok(WaitStatus::Ready) => {
                if let Err(err) = drain_ready(transport.as_ref(), &shared) {
                    if err.is_recoverable() {
                        log::debug!("transient receive error, retrying: {err}");
                        continue;
                    }
                    fatal(&shared, err);
                    return;
                }
            }
            Err(err) if err.is_recoverable() => {
                log::debug!("transient wait error, retrying: {err}");
            }
            Err(err) => {
                fatal(&shared, err);
                return;
            }
        }
    }
    log::debug!("receive loop stopped");
}

/// Drain every currently-available frame: a full batch is immediately
/// followed by another request until the transport reports a short batch.
fn drain_ready(transport: &dyn CanTransport, shared: &RxShared) -> Result<(), CanError> {
    loop {
        let batch = transport.drain_batch(BATCH_SIZE)?;
        let chained = batch.len() == BATCH_SIZE;
        for received in batch {
            dispatch_frame(shared, received);
        }
        if !chained {
            return Ok(());
        }
    }
}

/// Error frames go only to the error-subscriber set; data frames pass the
/// software filter and then reach subscribers first, the pipe second.
fn dispatch_frame(shared: &RxShared, received: CanReceiveData) {
    if received.frame.is_error() {
        let info = CanErrorInfo::decode(&received);
        shared.error_subs.dispatch(&info);
        return;
    }
    if !shared.filter.read().unwrap().accepts(&received.frame) {
        return;
    }
    shared.data_subs.dispatch(&received);
    shared.pipe.publish(received);
}

/// A fatal error is never swallowed: log it, surface it on the
/// background-fault channel, and poison the pipe so every pending and
/// future consumer observes it.
fn fatal(shared: &RxShared, err: CanError) {
    log::error!("receive loop terminating: {err}");
    let fault = err.into_background_fault();
    let _ = shared.fault_tx.send(fault.clone());
    shared.pipe.fault(fault);
}
