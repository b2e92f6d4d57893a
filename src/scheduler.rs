//! Cancellable future callbacks keyed by time.
//!
//! A [`Scheduler`] holds payloads waiting for a point on some timeline (the
//! transport position for notes, elapsed time for engine timers). Pending
//! entries live in a slot map so that a [`ScheduleHandle`] is the only thing
//! needed to cancel one; a min-heap orders the firing times. Cancelling
//! removes the slot immediately, and heap entries whose slot is gone are
//! skipped when they reach the top, so a cancelled payload can never fire.

use slotmap::{new_key_type, SlotMap};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

new_key_type! {
    /// Capability to cancel one scheduled payload.
    pub struct ScheduleHandle;
}

#[derive(Debug, Clone)]
struct Entry<T> {
    time: f64,
    payload: T,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    time: f64,
    seq: u64,
    handle: ScheduleHandle,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so the BinaryHeap pops the earliest time, then the earliest insert.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A time-ordered set of cancellable payloads.
#[derive(Debug, Clone)]
pub struct Scheduler<T> {
    entries: SlotMap<ScheduleHandle, Entry<T>>,
    heap: BinaryHeap<Pending>,
    seq: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Register `payload` to fire at `time`.
    pub fn schedule(&mut self, time: f64, payload: T) -> ScheduleHandle {
        self.schedule_with(time, |_| payload)
    }

    /// Like [`schedule`](Self::schedule), but the payload is built with its own handle.
    pub fn schedule_with<F>(&mut self, time: f64, build: F) -> ScheduleHandle
    where
        F: FnOnce(ScheduleHandle) -> T,
    {
        let handle = self.entries.insert_with_key(|handle| Entry {
            time,
            payload: build(handle),
        });
        self.seq += 1;
        self.heap.push(Pending {
            time,
            seq: self.seq,
            handle,
        });
        handle
    }

    /// Remove a pending payload. Returns `None` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: ScheduleHandle) -> Option<T> {
        let entry = self.entries.remove(handle)?;
        self.discard_stale();
        Some(entry.payload)
    }

    pub fn contains(&self, handle: ScheduleHandle) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn get(&self, handle: ScheduleHandle) -> Option<&T> {
        self.entries.get(handle).map(|e| &e.payload)
    }

    /// Time of the earliest live entry.
    pub fn next_time(&mut self) -> Option<f64> {
        self.discard_stale();
        self.heap.peek().map(|p| p.time)
    }

    /// Pop the earliest entry if it is due at or before `now`.
    pub fn pop_due(&mut self, now: f64) -> Option<(ScheduleHandle, f64, T)> {
        self.discard_stale();
        let top = *self.heap.peek()?;
        if top.time > now {
            return None;
        }
        self.heap.pop();
        let entry = self.entries.remove(top.handle)?;
        Some((top.handle, entry.time, entry.payload))
    }

    /// Live entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (ScheduleHandle, f64, &T)> {
        self.entries.iter().map(|(h, e)| (h, e.time, &e.payload))
    }

    /// Cancel everything, returning the payloads in firing order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut pending: Vec<Pending> = self.heap.drain().collect();
        pending.sort_by(|a, b| b.cmp(a));
        let drained = pending
            .into_iter()
            .filter_map(|p| self.entries.remove(p.handle))
            .map(|e| e.payload)
            .collect();
        self.entries.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.entries.contains_key(top.handle) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
