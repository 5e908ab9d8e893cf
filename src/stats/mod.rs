// Controller statistics module

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Thread-safe controller counters using atomic operations.
pub struct ControllerStats {
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    duplicates_suppressed: AtomicU64,
    transaction_timeouts: AtomicU64,
    signals_started: AtomicU64,
    signals_completed: AtomicU64,
    signals_failed: AtomicU64,
    signals_canceled: AtomicU64,
    response_codes: DashMap<u16, AtomicU64>,
    start_time: Instant,
}

/// A point-in-time snapshot of controller counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub timestamp: Instant,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub duplicates_suppressed: u64,
    pub transaction_timeouts: u64,
    pub signals_started: u64,
    pub signals_completed: u64,
    pub signals_failed: u64,
    pub signals_canceled: u64,
    pub response_codes: HashMap<u16, u64>,
}

impl ControllerStats {
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            responses_sent: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            transaction_timeouts: AtomicU64::new(0),
            signals_started: AtomicU64::new(0),
            signals_completed: AtomicU64::new(0),
            signals_failed: AtomicU64::new(0),
            signals_canceled: AtomicU64::new(0),
            response_codes: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outgoing response and bump the per-code counter.
    pub fn record_response(&self, code: u16) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.response_codes
            .entry(code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_timeout(&self) {
        self.transaction_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_started(&self) {
        self.signals_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_completed(&self) {
        self.signals_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_failed(&self) {
        self.signals_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_canceled(&self) {
        self.signals_canceled.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut codes = HashMap::new();
        for entry in self.response_codes.iter() {
            codes.insert(*entry.key(), entry.value().load(Ordering::Relaxed));
        }

        StatsSnapshot {
            timestamp: Instant::now(),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            transaction_timeouts: self.transaction_timeouts.load(Ordering::Relaxed),
            signals_started: self.signals_started.load(Ordering::Relaxed),
            signals_completed: self.signals_completed.load(Ordering::Relaxed),
            signals_failed: self.signals_failed.load(Ordering::Relaxed),
            signals_canceled: self.signals_canceled.load(Ordering::Relaxed),
            response_codes: codes,
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for ControllerStats {
    fn default() -> Self {
        Self::new()
    }
}
