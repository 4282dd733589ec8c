//! Backpressure-aware hand-off between the receive loop and all consumer
//! styles: blocking batch receive, suspending batch receive, and a
//! suspending stream.
//!
//! Exactly one producer (the receive loop) publishes; any number of
//! consumers take. Ordering is global FIFO through one internal queue plus
//! an ordered queue of pending requests, so no request overtakes an
//! earlier one. When a capacity is configured and the queue is full the
//! oldest item is dropped (the producer never blocks, since stalling it
//! would stall the native readiness loop). A terminal fault wakes every
//! pending request and poisons all future calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use futures_util::stream::{self, Stream};

use crate::error::CanError;
use crate::frame::CanReceiveData;

/// One buffered frame plus the sequence number that pins its arrival order.
#[derive(Debug)]
struct PipeItem {
    seq: u64,
    data: CanReceiveData,
}

type BatchMsg = Result<Vec<PipeItem>, CanError>;

/// A pending batch request. Requests are served strictly in registration
/// order; only the front request ever accumulates items.
struct Waiter {
    id: u64,
    want: usize,
    got: Vec<PipeItem>,
    done: Sender<BatchMsg>,
}

#[derive(Default)]
struct PipeState {
    queue: VecDeque<PipeItem>,
    waiters: VecDeque<Waiter>,
    next_seq: u64,
    next_waiter: u64,
    dropped: u64,
    fault: Option<CanError>,
}

/// Single-producer, multi-consumer frame queue with wait coordination.
/// Holds no transport reference; testable with synthetic publishes.
pub struct FramePipe {
    capacity: Option<usize>,
    state: Mutex<PipeState>,
}

enum Begin {
    Ready(Vec<CanReceiveData>),
    Wait { id: u64, rx: Receiver<BatchMsg> },
}

impl FramePipe {
    /// Pipe bounded to `capacity` buffered items.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            state: Mutex::new(PipeState::default()),
        }
    }

    /// Pipe bounded only by memory.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            state: Mutex::new(PipeState::default()),
        }
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(cap) => Self::bounded(cap),
            None => Self::unbounded(),
        }
    }

    /// Number of items currently buffered (excluding items already handed
    /// to a pending request).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded so far by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    pub fn is_faulted(&self) -> bool {
        self.state.lock().unwrap().fault.is_some()
    }

    fn fault_snapshot(&self) -> Option<CanError> {
        self.state.lock().unwrap().fault.clone()
    }

    /// Producer-side entry: enqueue one item and serve pending requests.
    /// Never blocks; silently ignored after a fault.
    pub fn publish(&self, data: CanReceiveData) {
        let mut st = self.state.lock().unwrap();
        if st.fault.is_some() {
            return;
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.queue.push_back(PipeItem { seq, data });
        Self::dispatch(&mut st);
        if let Some(cap) = self.capacity {
            while st.queue.len() > cap {
                st.queue.pop_front();
                st.dropped += 1;
            }
        }
    }

    /// Inject a terminal fault: wakes every pending request with the fault
    /// and makes all future calls fail the same way. Buffered items are
    /// discarded; there is no consumer left that may legally observe them.
    pub fn fault(&self, err: CanError) {
        let mut st = self.state.lock().unwrap();
        if st.fault.is_some() {
            return;
        }
        st.fault = Some(err.clone());
        st.queue.clear();
        for waiter in st.waiters.drain(..) {
            let _ = waiter.done.send(Err(err.clone()));
        }
    }

    /// Drop all buffered items. Pending requests stay registered; used when
    /// the receive loop stops so stale frames cannot leak into a restart.
    pub fn clear(&self) {
        self.state.lock().unwrap().queue.clear();
    }

    /// Block the calling thread until `count` items arrived or `timeout`
    /// elapsed; returns whatever accumulated (possibly empty).
    pub fn receive(&self, count: usize, timeout: Duration) -> Result<Vec<CanReceiveData>, CanError> {
        match self.begin_receive(count, !timeout.is_zero())? {
            Begin::Ready(items) => Ok(items),
            Begin::Wait { id, rx } => {
                let deadline = Instant::now() + timeout;
                match rx.recv_deadline(deadline) {
                    Ok(Ok(items)) => Ok(Self::unwrap_items(items)),
                    Ok(Err(fault)) => Err(fault),
                    Err(RecvTimeoutError::Timeout) => self.take_partial(id, &rx),
                    Err(RecvTimeoutError::Disconnected) => {
                        Err(self.fault_snapshot().unwrap_or(CanError::BusClosed))
                    }
                }
            }
        }
    }

    /// Suspending variant of [`receive`](Self::receive): same partial-result
    /// contract, without occupying a thread while waiting. Dropping the
    /// returned future cancels the request without disturbing the queue.
    pub async fn receive_async(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<CanReceiveData>, CanError> {
        match self.begin_receive(count, !timeout.is_zero())? {
            Begin::Ready(items) => Ok(items),
            Begin::Wait { id, rx } => {
                match tokio::time::timeout(timeout, rx.recv_async()).await {
                    Ok(Ok(Ok(items))) => Ok(Self::unwrap_items(items)),
                    Ok(Ok(Err(fault))) => Err(fault),
                    Ok(Err(_disconnected)) => {
                        Err(self.fault_snapshot().unwrap_or(CanError::BusClosed))
                    }
                    Err(_elapsed) => self.take_partial(id, &rx),
                }
            }
        }
    }

    /// Wait for the next single item, indefinitely.
    pub async fn next_item(&self) -> Result<CanReceiveData, CanError> {
        loop {
            let wait = match self.begin_receive(1, true)? {
                Begin::Ready(items) => match items.into_iter().next() {
                    Some(item) => return Ok(item),
                    None => continue,
                },
                Begin::Wait { rx, .. } => rx,
            };
            match wait.recv_async().await {
                Ok(Ok(items)) => {
                    if let Some(item) = items.into_iter().next() {
                        return Ok(item.data);
                    }
                }
                Ok(Err(fault)) => return Err(fault),
                Err(_disconnected) => {
                    return Err(self.fault_snapshot().unwrap_or(CanError::BusClosed))
                }
            }
        }
    }

    /// Lazy, logically-infinite stream of items in publish order. Ends only
    /// when a fault terminates the pipe (the fault is yielded as the final
    /// `Err` element) or the consumer drops the stream.
    pub fn stream(self: &Arc<Self>) -> impl Stream<Item = Result<CanReceiveData, CanError>> + Send {
        let pipe = Arc::clone(self);
        stream::unfold((pipe, false), |(pipe, done)| async move {
            if done {
                return None;
            }
            match pipe.next_item().await {
                Ok(item) => Some((Ok(item), (pipe, false))),
                Err(fault) => Some((Err(fault), (pipe, true))),
            }
        })
    }

    /// Take whatever the queue can satisfy right now, or register a waiter.
    fn begin_receive(&self, count: usize, wait: bool) -> Result<Begin, CanError> {
        let mut st = self.state.lock().unwrap();
        if let Some(fault) = &st.fault {
            return Err(fault.clone());
        }
        if count == 0 {
            return Ok(Begin::Ready(Vec::new()));
        }
        Self::purge_cancelled(&mut st);
        let mut got = Vec::new();
        if st.waiters.is_empty() {
            while got.len() < count {
                match st.queue.pop_front() {
                    Some(item) => got.push(item),
                    None => break,
                }
            }
            if got.len() == count || !wait {
                return Ok(Begin::Ready(Self::unwrap_items(got)));
            }
        } else if !wait {
            // Earlier requests are ahead of us and we may not overtake them.
            return Ok(Begin::Ready(Vec::new()));
        }
        let (done, rx) = flume::bounded(1);
        let id = st.next_waiter;
        st.next_waiter += 1;
        st.waiters.push_back(Waiter { id, want: count, got, done });
        Ok(Begin::Wait { id, rx })
    }

    /// Serve queued items to pending requests, strictly in request order.
    fn dispatch(st: &mut PipeState) {
        loop {
            Self::purge_cancelled(st);
            let Some(front) = st.waiters.front_mut() else { break };
            let Some(item) = st.queue.pop_front() else { break };
            front.got.push(item);
            if front.got.len() >= front.want {
                let waiter = st.waiters.pop_front().unwrap();
                if let Err(flume::SendError(Ok(items))) = waiter.done.send(Ok(waiter.got)) {
                    // Completed against a request cancelled in the same
                    // instant; its items go back to the head of the line.
                    Self::requeue(&mut st.queue, items);
                }
            }
        }
    }

    /// Drop cancelled requests off the front and return their items to the
    /// queue head so the next request in line observes them.
    fn purge_cancelled(st: &mut PipeState) {
        while let Some(front) = st.waiters.front() {
            if !front.done.is_disconnected() {
                break;
            }
            let dead = st.waiters.pop_front().unwrap();
            Self::requeue(&mut st.queue, dead.got);
        }
    }

    fn requeue(queue: &mut VecDeque<PipeItem>, items: Vec<PipeItem>) {
        if let (Some(last), Some(head)) = (items.last(), queue.front()) {
            debug_assert!(last.seq < head.seq, "requeued items must predate the queue");
        }
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    /// Timeout path: withdraw our request and return whatever it gathered.
    fn take_partial(&self, id: u64, rx: &Receiver<BatchMsg>) -> Result<Vec<CanReceiveData>, CanError> {
        let withdrawn = {
            let mut st = self.state.lock().unwrap();
            let pos = st.waiters.iter().position(|w| w.id == id);
            pos.and_then(|pos| st.waiters.remove(pos))
        };
        if let Some(waiter) = withdrawn {
            return Ok(Self::unwrap_items(waiter.got));
        }
        // The request completed (or faulted) in the race window between the
        // timeout firing and us taking the lock.
        match rx.try_recv() {
            Ok(Ok(items)) => Ok(Self::unwrap_items(items)),
            Ok(Err(fault)) => Err(fault),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn unwrap_items(items: Vec<PipeItem>) -> Vec<CanReceiveData> {
        items.into_iter().map(|item| item.data).collect()
    }
}
