//! Priority-ordered admission queues for the pipeline stages, plus the
//! leaky-bucket limiter that smooths download submission.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use priority_queue::PriorityQueue;

use crate::request::Priority;

/// The pipeline stages that own a work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Stage {
    DataLoad,
    Decode,
    Process,
    Decompress,
    Encode,
    DataCache,
}

/// Handle to one queued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WorkId(pub u64);

/// Queue ordering: descending priority, FIFO within a priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WorkPriority {
    priority: Priority,
    order: Reverse<u64>,
}

/// Result of an admission sweep.
pub(crate) struct Admission<W> {
    /// Items now executing; the caller runs their payloads.
    pub started: Vec<(WorkId, W)>,
    /// When congestion control fired: delay before the next sweep.
    pub cooldown: Option<Duration>,
}

/// A bounded, priority-ordered admission queue for one stage.
///
/// At most `max_concurrent` items execute at a time. Pending items are
/// admitted by descending priority, FIFO within a band, and can be
/// reprioritised or cancelled while they wait. Cancelling an executing item
/// is a no-op here: its completion still calls `finish` to free the slot.
pub(crate) struct WorkQueue<W> {
    max_concurrent: usize,
    pending: PriorityQueue<WorkId, WorkPriority>,
    payloads: HashMap<WorkId, W>,
    executing: HashSet<WorkId>,
    cooling_down: bool,
}

impl<W> WorkQueue<W> {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            pending: PriorityQueue::new(),
            payloads: HashMap::new(),
            executing: HashSet::new(),
            cooling_down: false,
        }
    }

    pub(crate) fn enqueue(&mut self, id: WorkId, priority: Priority, order: u64, payload: W) {
        self.payloads.insert(id, payload);
        self.pending.push(
            id,
            WorkPriority {
                priority,
                order: Reverse(order),
            },
        );
    }

    /// Update a pending item's priority; enqueue order within the band is
    /// preserved. Executing items are unaffected.
    pub(crate) fn reprioritize(&mut self, id: WorkId, priority: Priority) {
        let Some(current) = self.pending.get_priority(&id).copied() else {
            return;
        };
        self.pending.change_priority(
            &id,
            WorkPriority {
                priority,
                order: current.order,
            },
        );
    }

    /// Drop a pending item. Executing items keep their slot until `finish`.
    pub(crate) fn cancel(&mut self, id: WorkId) {
        if self.pending.remove(&id).is_some() {
            self.payloads.remove(&id);
        }
    }

    /// Release the slot of a completed (or abandoned) execution.
    pub(crate) fn finish(&mut self, id: WorkId) {
        self.executing.remove(&id);
    }

    /// Admit as many pending items as capacity allows. With `congestion`
    /// set, at most one item is admitted per sweep and the caller must wait
    /// out the returned cooldown before sweeping again.
    pub(crate) fn admit(&mut self, congestion: bool) -> Admission<W> {
        let mut started = Vec::new();
        let mut cooldown = None;
        while !self.cooling_down && self.executing.len() < self.max_concurrent {
            let Some((id, _)) = self.pending.pop() else {
                break;
            };
            let Some(payload) = self.payloads.remove(&id) else {
                continue;
            };
            self.executing.insert(id);
            started.push((id, payload));
            if congestion {
                self.cooling_down = true;
                let executing = self.executing.len() as u64;
                cooldown = Some(Duration::from_millis((8 + executing).min(30)));
                break;
            }
        }
        Admission { started, cooldown }
    }

    pub(crate) fn end_cooldown(&mut self) {
        self.cooling_down = false;
    }

    /// Drop every pending item (pipeline invalidation).
    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
        self.payloads.clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<W> fmt::Debug for WorkQueue<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("max_concurrent", &self.max_concurrent)
            .field("pending", &self.pending.len())
            .field("executing", &self.executing.len())
            .field("cooling_down", &self.cooling_down)
            .finish()
    }
}

/// Leaky-bucket limiter applied to data-load submissions.
///
/// A full bucket lets bursts start instantly; once drained, submissions
/// trickle in at `rate` per second and callers reschedule after
/// `retry_delay`.
#[derive(Debug)]
pub(crate) struct DataLoadRateLimiter {
    rate: f64,
    burst: f64,
    available: f64,
    last_refill: Instant,
}

impl DataLoadRateLimiter {
    pub(crate) fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst: burst.max(1.0),
            available: burst.max(1.0),
            last_refill: Instant::now(),
        }
    }

    pub(crate) fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.available = (self.available + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token becomes available at the sustained rate.
    pub(crate) fn retry_delay(&self) -> Duration {
        let missing = (1.0 - self.available).max(0.0);
        Duration::from_secs_f64(missing / self.rate)
    }
}
