//! Rolling-window call log for the provider's rate limit.
//!
//! The tracker is a local, best-effort estimate. It keeps one [`CallRecord`]
//! per attempted provider call and answers how many calls the current window
//! can still absorb. Records are purged lazily on every read.
//!
//! Concurrent attempts go through [`QuotaTracker::reserve`], which checks and
//! holds capacity in one critical section so two attempts cannot both spend
//! the last slots of a window.

use std::sync::{Mutex, MutexGuard, PoisonError};

use atelier_contracts::quota::{CallRecord, QuotaWindow};

#[derive(Debug)]
pub struct QuotaTracker {
    window: QuotaWindow,
    log: Mutex<QuotaLog>,
}

#[derive(Debug, Default)]
struct QuotaLog {
    records: Vec<CallRecord>,
    in_flight: usize,
}

impl QuotaLog {
    fn purge(&mut self, now_ms: u64, window_ms: u64) {
        self.records
            .retain(|record| record.is_live(now_ms, window_ms));
    }

    fn live_count(&mut self, now_ms: u64, window_ms: u64) -> usize {
        self.purge(now_ms, window_ms);
        self.records.len()
    }

    fn release(&mut self, slots: usize) {
        self.in_flight = self.in_flight.saturating_sub(slots);
    }
}

impl QuotaTracker {
    pub fn new(window: QuotaWindow) -> Self {
        Self {
            window,
            log: Mutex::new(QuotaLog::default()),
        }
    }

    pub fn window(&self) -> QuotaWindow {
        self.window
    }

    pub fn record(&self, timestamp_ms: u64) {
        self.lock().records.push(CallRecord::at(timestamp_ms));
    }

    pub fn record_many(&self, timestamp_ms: u64, count: usize) {
        let mut log = self.lock();
        log.records
            .extend(std::iter::repeat(CallRecord::at(timestamp_ms)).take(count));
    }

    /// `max(0, limit - live records)`; purges expired records first.
    pub fn remaining(&self, now_ms: u64) -> usize {
        let live = self.lock().live_count(now_ms, self.window.window_ms());
        self.window.limit().saturating_sub(live)
    }

    /// Remaining capacity minus slots held by in-flight reservations.
    pub fn available(&self, now_ms: u64) -> usize {
        let mut log = self.lock();
        let live = log.live_count(now_ms, self.window.window_ms());
        self.window
            .limit()
            .saturating_sub(live)
            .saturating_sub(log.in_flight)
    }

    pub fn has_capacity(&self, now_ms: u64, needed: usize) -> bool {
        self.available(now_ms) >= needed
    }

    /// Holds `needed` slots if the window can absorb them. Slots are released
    /// as calls are recorded through the reservation, or when it drops.
    pub fn reserve(&self, now_ms: u64, needed: usize) -> Option<QuotaReservation<'_>> {
        let mut log = self.lock();
        let live = log.live_count(now_ms, self.window.window_ms());
        let available = self
            .window
            .limit()
            .saturating_sub(live)
            .saturating_sub(log.in_flight);
        if available < needed {
            return None;
        }
        log.in_flight += needed;
        Some(QuotaReservation {
            tracker: self,
            held: needed,
            recorded: 0,
        })
    }

    /// Raw number of records, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, QuotaLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct QuotaReservation<'a> {
    tracker: &'a QuotaTracker,
    held: usize,
    recorded: usize,
}

impl QuotaReservation<'_> {
    pub fn record(&mut self, timestamp_ms: u64) {
        self.record_many(timestamp_ms, 1);
    }

    pub fn record_many(&mut self, timestamp_ms: u64, count: usize) {
        let mut log = self.tracker.lock();
        log.records
            .extend(std::iter::repeat(CallRecord::at(timestamp_ms)).take(count));
        let released = count.min(self.held);
        log.release(released);
        self.held -= released;
        self.recorded += count;
    }

    pub fn held(&self) -> usize {
        self.held
    }

    /// Records appended through this reservation so far.
    pub fn recorded(&self) -> usize {
        self.recorded
    }
}

impl Drop for QuotaReservation<'_> {
    fn drop(&mut self) {
        if self.held > 0 {
            self.tracker.lock().release(self.held);
        }
    }
}
