//! Scriptable in-memory transport for exercising the bus machinery
//! without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canlink::{CanError, CanFrame, CanReceiveData, CanTransport, PeriodicSlot, WaitStatus};

#[derive(Default)]
pub struct SlotBook {
    pub active: AtomicUsize,
    pub freed: AtomicUsize,
}

/// One granted hardware periodic slot, visible to assertions.
pub struct HardwareJob {
    pub frame: Arc<Mutex<CanFrame>>,
    pub period: Duration,
    pub repeat: Option<u64>,
}

pub struct MockTransport {
    inbox: Mutex<VecDeque<CanReceiveData>>,
    written: Mutex<Vec<CanFrame>>,
    wake_flag: AtomicBool,
    fail_writes: AtomicBool,
    fatal_wait: Mutex<Option<CanError>>,
    slot_capacity: usize,
    pub slots: Arc<SlotBook>,
    pub hardware_jobs: Mutex<Vec<HardwareJob>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_slots(0)
    }

    pub fn with_slots(slot_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inbox: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            wake_flag: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fatal_wait: Mutex::new(None),
            slot_capacity,
            slots: Arc::new(SlotBook::default()),
            hardware_jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn inject(&self, frame: CanFrame) {
        self.inbox
            .lock()
            .unwrap()
            .push_back(CanReceiveData::new(frame));
    }

    pub fn inject_error_frame(&self, raw_id: u32, data: &[u8]) {
        self.inject(CanFrame::new_error(raw_id, data).unwrap());
    }

    /// Make the next readiness wait fail fatally.
    pub fn fail_wait_with(&self, err: CanError) {
        *self.fatal_wait.lock().unwrap() = Some(err);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<CanFrame> {
        self.written.lock().unwrap().clone()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn active_slots(&self) -> usize {
        self.slots.active.load(Ordering::SeqCst)
    }

    pub fn freed_slots(&self) -> usize {
        self.slots.freed.load(Ordering::SeqCst)
    }
}

impl CanTransport for MockTransport {
    fn wait_readable(&self, timeout: Duration) -> Result<WaitStatus, CanError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(err) = self.fatal_wait.lock().unwrap().take() {
                return Err(err);
            }
            if self.wake_flag.swap(false, Ordering::SeqCst) {
                return Ok(WaitStatus::TimedOut);
            }
            if !self.inbox.lock().unwrap().is_empty() {
                return Ok(WaitStatus::Ready);
            }
            if Instant::now() >= deadline {
                return Ok(WaitStatus::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn wake(&self) {
        self.wake_flag.store(true, Ordering::SeqCst);
    }

    fn drain_batch(&self, max: usize) -> Result<Vec<CanReceiveData>, CanError> {
        let mut inbox = self.inbox.lock().unwrap();
        let take = max.min(inbox.len());
        Ok(inbox.drain(..take).collect())
    }

    fn write_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CanError::Transport("mock write failure".into()));
        }
        self.written.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn periodic_slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    fn try_alloc_periodic_slot(
        &self,
        frame: &CanFrame,
        period: Duration,
        repeat: Option<u64>,
    ) -> Result<Option<Box<dyn PeriodicSlot>>, CanError> {
        if self.slots.active.load(Ordering::SeqCst) >= self.slot_capacity {
            return Ok(None);
        }
        self.slots.active.fetch_add(1, Ordering::SeqCst);
        let shared_frame = Arc::new(Mutex::new(frame.clone()));
        self.hardware_jobs.lock().unwrap().push(HardwareJob {
            frame: Arc::clone(&shared_frame),
            period,
            repeat,
        });
        Ok(Some(Box::new(MockSlot {
            frame: shared_frame,
            book: Arc::clone(&self.slots),
            stopped: false,
        })))
    }
}

pub struct MockSlot {
    frame: Arc<Mutex<CanFrame>>,
    book: Arc<SlotBook>,
    stopped: bool,
}

impl PeriodicSlot for MockSlot {
    fn update(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        *self.frame.lock().unwrap() = frame.clone();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CanError> {
        if !self.stopped {
            self.stopped = true;
            self.book.active.fetch_sub(1, Ordering::SeqCst);
            self.book.freed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Convenience: a classic standard-id data frame.
pub fn frame(id: u32) -> CanFrame {
    CanFrame::new(id, false, &[0xDE, 0xAD]).unwrap()
}
