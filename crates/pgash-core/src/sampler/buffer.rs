//! Bounded ring buffer of session samples.
//!
//! Fixed arena with a head index and a length. Samples are evicted when the
//! arena is full (oldest first) or when they fall out of the retention window,
//! whichever bound triggers first.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::MutexGuard;

use crate::model::SessionSample;

#[derive(Debug)]
pub struct SampleBuffer {
    slots: Vec<Option<SessionSample>>,
    /// Index of the oldest sample.
    head: usize,
    len: usize,
    retention: ChronoDuration,
    evicted: u64,
}

impl SampleBuffer {
    /// Creates an empty buffer. A zero capacity is raised to one slot.
    pub fn new(capacity: usize, retention: std::time::Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            retention: ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX),
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total samples evicted by either bound since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    fn pop_oldest(&mut self) {
        if self.len == 0 {
            return;
        }
        self.slots[self.head] = None;
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        self.evicted += 1;
    }

    /// Timestamp of the oldest buffered sample.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref().map(|s| s.timestamp)
    }

    /// Drops samples older than `now - retention`. Returns how many were removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return 0;
        };
        let mut removed = 0;
        while self.oldest().is_some_and(|ts| ts < cutoff) {
            self.pop_oldest();
            removed += 1;
        }
        removed
    }

    /// Appends a sample, evicting by age first and then by capacity.
    pub fn push(&mut self, sample: SessionSample) {
        self.evict_expired(sample.timestamp);
        if self.len == self.slots.len() {
            self.pop_oldest();
        }
        let idx = self.slot(self.len);
        self.slots[idx] = Some(sample);
        self.len += 1;
    }

    /// Borrowing iterator over samples newer than `since`, oldest first.
    pub fn iter_since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &SessionSample> {
        (0..self.len)
            .filter_map(move |offset| self.slots[self.slot(offset)].as_ref())
            .filter(move |s| s.timestamp > since)
    }
}

/// Lazy sequence of samples newer than a point in time, oldest first.
///
/// Holds the buffer lock while alive, so the sampler thread waits on a push
/// until it is dropped. Calling `samples(since)` again restarts the sequence.
pub struct SamplesSince<'a> {
    guard: MutexGuard<'a, SampleBuffer>,
    since: DateTime<Utc>,
    offset: usize,
}

impl<'a> SamplesSince<'a> {
    pub(crate) fn new(guard: MutexGuard<'a, SampleBuffer>, since: DateTime<Utc>) -> Self {
        Self {
            guard,
            since,
            offset: 0,
        }
    }
}

impl Iterator for SamplesSince<'_> {
    type Item = SessionSample;

    fn next(&mut self) -> Option<SessionSample> {
        while self.offset < self.guard.len {
            let idx = self.guard.slot(self.offset);
            self.offset += 1;
            if let Some(sample) = self.guard.slots[idx].as_ref()
                && sample.timestamp > self.since
            {
                return Some(sample.clone());
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.guard.len.saturating_sub(self.offset)))
    }
}
