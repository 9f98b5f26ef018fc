//! Per-process ray-list queue and the manager thread that feeds it to
//! trace tasks.
//!
//! Primary lists are served before secondary lists, FIFO within each
//! class. The termination detector pauses the queue while it takes a
//! consistent snapshot of the per-set counters; `pause` only stops new
//! dequeues, it does not disturb lists already being traced.

use std::collections::VecDeque;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::rays::{RayList, RayListKind};
use crate::registry::Key;

#[derive(Default)]
struct QueueState {
    primary: VecDeque<RayList>,
    secondary: VecDeque<RayList>,
    paused: bool,
    shutdown: bool,
}

/// Priority queue of ray lists awaiting trace on this rank.
pub struct RayQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl Default for RayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RayQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }

    /// Add a list. Ordering is (primary before secondary, then FIFO).
    pub fn enqueue(&self, list: RayList) {
        let mut state = self.state.lock();
        match list.kind() {
            RayListKind::Primary => state.primary.push_back(list),
            RayListKind::Secondary => state.secondary.push_back(list),
        }
        drop(state);
        self.cv.notify_one();
    }

    /// Take the next list, blocking while the queue is empty or paused.
    /// Returns `None` once the queue is shut down and drained.
    pub fn dequeue(&self) -> Option<RayList> {
        let mut state = self.state.lock();
        loop {
            if !state.paused {
                if let Some(list) = state.primary.pop_front() {
                    return Some(list);
                }
                if let Some(list) = state.secondary.pop_front() {
                    return Some(list);
                }
                if state.shutdown {
                    return None;
                }
            } else if state.shutdown {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Stop dequeues until [`Self::resume`]. Used by the synchronous
    /// termination check to freeze queue state.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.cv.notify_all();
    }

    /// Drop every queued list belonging to the given rendering set.
    /// Returns how many lists were discarded.
    pub fn discard_set(&self, set_key: Key) -> usize {
        let mut state = self.state.lock();
        let before = state.primary.len() + state.secondary.len();
        state.primary.retain(|l| l.set_key() != set_key);
        state.secondary.retain(|l| l.set_key() != set_key);
        before - (state.primary.len() + state.secondary.len())
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        let state = self.state.lock();
        state.primary.len() + state.secondary.len()
    }

    /// Wake the manager thread and make it exit once the queue drains.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }
}

/// The dedicated thread that pulls lists off the queue and hands each to
/// the trace pipeline.
pub struct RayQueueManager {
    handle: Option<JoinHandle<()>>,
}

impl RayQueueManager {
    /// Spawn the manager thread. `process` is invoked once per dequeued
    /// list; it is expected to submit a trace task and return quickly.
    pub fn start<F>(queue: std::sync::Arc<RayQueue>, process: F) -> Self
    where
        F: Fn(RayList) + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("rayq-manager".into())
            .spawn(move || {
                while let Some(list) = queue.dequeue() {
                    process(list);
                }
            })
            .expect("spawn rayq manager");
        Self {
            handle: Some(handle),
        }
    }

    /// Block until the manager thread exits. The queue must have been
    /// shut down first.
    pub fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
