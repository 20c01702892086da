//! Single-slot "latest wins" hand-off between the capture and encode threads
//!
//! The queue holds at most one pending frame. A push that finds a frame still
//! unconsumed replaces it, so the encoder always sees the newest desktop
//! image and a slow encoder never causes capture to block or memory to grow.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Frame;

/// Outcome of [`FrameQueue::wait`]
#[derive(Debug)]
pub enum QueueWait {
    /// The newest pending frame
    Frame(Frame),
    /// Timed out with nothing pending
    NoData,
    /// The queue was stopped
    Stopped,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Frames accepted by `push`
    pub pushed: u64,
    /// Frames overwritten before a consumer took them
    pub dropped: u64,
    /// Frames handed to a consumer
    pub delivered: u64,
}

#[derive(Default)]
struct Slot {
    pending: Option<Frame>,
    recycled: Option<Frame>,
    stopped: bool,
    stats: QueueStats,
}

/// Bounded (depth 1) frame queue
#[derive(Default)]
pub struct FrameQueue {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl FrameQueue {
    /// Create an empty, running queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a frame without blocking
    ///
    /// Returns the frame that did not end up queued: the displaced pending
    /// frame, or `frame` itself if the queue is stopped.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let mut slot = self.slot.lock();
        if slot.stopped {
            return Some(frame);
        }

        let displaced = slot.pending.replace(frame);
        slot.stats.pushed += 1;
        if displaced.is_some() {
            slot.stats.dropped += 1;
        }
        drop(slot);

        self.ready.notify_one();
        displaced
    }

    /// Wait up to `timeout` for a frame
    pub fn wait(&self, timeout: Duration) -> QueueWait {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.slot.lock();

        loop {
            if slot.stopped {
                return QueueWait::Stopped;
            }
            if let Some(frame) = slot.pending.take() {
                slot.stats.delivered += 1;
                return QueueWait::Frame(frame);
            }

            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        if slot.stopped {
                            return QueueWait::Stopped;
                        }
                        return match slot.pending.take() {
                            Some(frame) => {
                                slot.stats.delivered += 1;
                                QueueWait::Frame(frame)
                            }
                            None => QueueWait::NoData,
                        };
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
    }

    /// Discard any pending frame
    ///
    /// Used on resolution change. Waiters are not woken.
    pub fn reset(&self) {
        let mut slot = self.slot.lock();
        if let Some(frame) = slot.pending.take() {
            if slot.recycled.is_none() {
                slot.recycled = Some(frame);
            }
        }
    }

    /// Stop the queue and wake every waiter with [`QueueWait::Stopped`]
    ///
    /// Terminal: later pushes are rejected.
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.stopped = true;
        slot.pending = None;
        slot.recycled = None;
        drop(slot);
        self.ready.notify_all();
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.slot.lock().stopped
    }

    /// Hand a consumed frame back so the producer can reuse its allocation
    pub fn recycle(&self, frame: Frame) {
        let mut slot = self.slot.lock();
        if !slot.stopped && slot.recycled.is_none() {
            slot.recycled = Some(frame);
        }
    }

    /// Take a recycled frame, if any
    pub fn take_recycled(&self) -> Option<Frame> {
        self.slot.lock().recycled.take()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> QueueStats {
        self.slot.lock().stats
    }
}
