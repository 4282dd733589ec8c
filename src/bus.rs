//! The bus facade: opens a transport, runs the receive machinery, and
//! exposes the synchronous, asynchronous, callback, and periodic surfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::stream::Stream;

use crate::error::CanError;
use crate::error_frame::CanErrorInfo;
use crate::filter::{FilterRule, SoftwareFilter};
use crate::frame::{CanFrame, CanReceiveData};
use crate::periodic::{PeriodicTx, PeriodicTxOptions, SlotPool};
use crate::pipe::FramePipe;
use crate::rx::{ReceiveLoop, RxShared};
use crate::subscribers::{Subscribers, SubscriptionId};
use crate::transport::CanTransport;

/// Open-time configuration of a bus.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Buffered-frame bound of the receive pipe; `None` means bounded only
    /// by memory. When full, the oldest frame is dropped.
    pub pipe_capacity: Option<usize>,
    /// How long the receive loop blocks per readiness wait.
    pub poll_timeout: Duration,
    /// Grace period granted to the receive loop when closing.
    pub stop_grace: Duration,
    /// Explicit opt-in for error-frame subscription.
    pub receive_error_frames: bool,
    /// Permit the software scheduler when hardware periodic slots are
    /// exhausted; when false such requests fail instead.
    pub allow_software_periodic: bool,
    /// Rules the hardware could not accept, enforced in software.
    pub software_filters: Vec<FilterRule>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            pipe_capacity: None,
            poll_timeout: Duration::from_millis(100),
            stop_grace: Duration::from_secs(1),
            receive_error_frames: false,
            allow_software_periodic: true,
            software_filters: Vec::new(),
        }
    }
}

/// A vendor-neutral CAN bus running on top of a [`CanTransport`].
///
/// Opening starts the background receive loop; closing (or dropping)
/// stops it cooperatively and poisons the receive pipe so no consumer
/// hangs on a dead bus.
pub struct CanBus {
    transport: Arc<dyn CanTransport>,
    shared: Arc<RxShared>,
    rx: Mutex<Option<ReceiveLoop>>,
    slot_pool: Arc<SlotPool>,
    fault_rx: flume::Receiver<CanError>,
    options: BusOptions,
    closed: AtomicBool,
}

impl CanBus {
    pub fn open(transport: Arc<dyn CanTransport>, options: BusOptions) -> Result<Self, CanError> {
        let filter = SoftwareFilter::compile(options.software_filters.clone())?;
        let pipe = Arc::new(FramePipe::with_capacity(options.pipe_capacity));
        let (fault_tx, fault_rx) = flume::unbounded();
        let shared = Arc::new(RxShared {
            filter: RwLock::new(filter),
            data_subs: Subscribers::new(),
            error_subs: Subscribers::new(),
            pipe,
            fault_tx,
        });
        let rx = ReceiveLoop::start(
            Arc::clone(&transport),
            Arc::clone(&shared),
            options.poll_timeout,
        )?;
        let slot_pool = Arc::new(SlotPool::new(transport.periodic_slot_capacity()));
        Ok(Self {
            transport,
            shared,
            rx: Mutex::new(Some(rx)),
            slot_pool,
            fault_rx,
            options,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), CanError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CanError::BusClosed)
        } else {
            Ok(())
        }
    }

    /// Write a single frame immediately.
    pub fn transmit_one(&self, frame: &CanFrame) -> Result<(), CanError> {
        self.ensure_open()?;
        self.transport.write_frame(frame)
    }

    /// Write a batch, retrying until everything went out or `timeout`
    /// elapsed. Returns how many frames were sent.
    pub fn transmit(&self, frames: &[CanFrame], timeout: Duration) -> Result<usize, CanError> {
        self.ensure_open()?;
        transmit_with_deadline(self.transport.as_ref(), frames, timeout)
    }

    /// Asynchronous [`transmit`](Self::transmit); the write runs on the
    /// blocking pool so a slow transport cannot stall the async executor.
    pub async fn transmit_async(
        &self,
        frames: Vec<CanFrame>,
        timeout: Duration,
    ) -> Result<usize, CanError> {
        self.ensure_open()?;
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || {
            transmit_with_deadline(transport.as_ref(), &frames, timeout)
        })
        .await
        .map_err(|e| CanError::Transport(format!("transmit task failed: {e}")))?
    }

    /// Block until `count` frames arrived or `timeout` elapsed; returns
    /// whatever accumulated. Meant for simple call sites; prefer
    /// [`receive_async`](Self::receive_async) elsewhere.
    pub fn receive(&self, count: usize, timeout: Duration) -> Result<Vec<CanReceiveData>, CanError> {
        self.ensure_open()?;
        self.shared.pipe.receive(count, timeout)
    }

    /// Suspending batch receive with the same partial-result contract as
    /// [`receive`](Self::receive).
    pub async fn receive_async(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<CanReceiveData>, CanError> {
        self.ensure_open()?;
        self.shared.pipe.receive_async(count, timeout).await
    }

    /// Stream of all frames passing the filter, in arrival order. Ends only
    /// when the bus faults or closes (yielding the fault as a final `Err`).
    pub fn frames(&self) -> impl Stream<Item = Result<CanReceiveData, CanError>> + Send {
        self.shared.pipe.stream()
    }

    /// Register a data-frame callback. Handlers run on the receive thread
    /// and should return quickly.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CanReceiveData) + Send + Sync + 'static,
    {
        self.shared.data_subs.add(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.data_subs.remove(id)
    }

    /// Register an error-frame callback. Requires the
    /// [`receive_error_frames`](BusOptions::receive_error_frames) opt-in.
    pub fn subscribe_errors<F>(&self, handler: F) -> Result<SubscriptionId, CanError>
    where
        F: Fn(&CanErrorInfo) + Send + Sync + 'static,
    {
        if !self.options.receive_error_frames {
            return Err(CanError::NotSupported(
                "error-frame reception was not enabled on this bus",
            ));
        }
        Ok(self.shared.error_subs.add(Arc::new(handler)))
    }

    pub fn unsubscribe_errors(&self, id: SubscriptionId) -> bool {
        self.shared.error_subs.remove(id)
    }

    /// Channel carrying faults from the background receive loop. Callback
    /// subscribers observe failures only here; their handler signature
    /// carries successful deliveries only.
    pub fn faults(&self) -> flume::Receiver<CanError> {
        self.fault_rx.clone()
    }

    /// Start a periodic transmission: hardware slot when available, else
    /// the software scheduler (if allowed), else `NotSupported`.
    pub fn transmit_periodic(
        &self,
        frame: CanFrame,
        options: PeriodicTxOptions,
    ) -> Result<PeriodicTx, CanError> {
        self.ensure_open()?;
        PeriodicTx::start(
            Arc::clone(&self.transport),
            Arc::clone(&self.slot_pool),
            frame,
            options,
            self.options.allow_software_periodic,
        )
    }

    /// Replace the software-fallback filter rules. Validation happens here,
    /// synchronously; the compiled predicate is swapped in atomically and
    /// applies to frames dispatched from then on.
    pub fn set_software_filters(&self, rules: Vec<FilterRule>) -> Result<(), CanError> {
        let filter = SoftwareFilter::compile(rules)?;
        *self.shared.filter.write().unwrap() = filter;
        Ok(())
    }

    /// Frames dropped by the pipe's drop-oldest policy so far.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.pipe.dropped()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. Stops the receive loop cooperatively (bounded grace),
    /// discards buffered frames, and fails pending and future receives
    /// with [`CanError::BusClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut rx) = self.rx.lock().unwrap().take() {
            rx.stop(self.transport.as_ref(), self.options.stop_grace);
        }
        self.shared.pipe.clear();
        self.shared.pipe.fault(CanError::BusClosed);
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        self.close();
    }
}

fn transmit_with_deadline(
    transport: &dyn CanTransport,
    frames: &[CanFrame],
    timeout: Duration,
) -> Result<usize, CanError> {
    let deadline = Instant::now() + timeout;
    let mut written = transport.write_frames(frames)?;
    while written < frames.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
        match transport.write_frames(&frames[written..]) {
            Ok(n) => written += n,
            // Partial success still reports the frames that went out.
            Err(_) if written > 0 => break,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}
