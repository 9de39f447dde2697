use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use serde::Serialize;

/// Monotonic counter shared between the engine, its pools and their instances.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters. Cloning shares the underlying atomics, so readers may
/// lag writers by at most one update.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    /// Shots handed to a gun.
    pub request: Counter,
    /// Shots the gun returned from.
    pub response: Counter,
    pub instance_start: Counter,
    pub instance_finish: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        // Finish before start and response before request, so that the
        // snapshot never shows more finished work than started work.
        let instances_finished = self.instance_finish.get();
        let instances_started = self.instance_start.get();
        let responses = self.response.get();
        let requests = self.request.get();
        MetricsSnapshot {
            requests,
            responses,
            instances_started,
            instances_finished,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: i64,
    pub responses: i64,
    pub instances_started: i64,
    pub instances_finished: i64,
}

impl MetricsSnapshot {
    pub fn active_instances(&self) -> i64 {
        self.instances_started - self.instances_finished
    }

    pub fn active_requests(&self) -> i64 {
        self.requests - self.responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new();
        let other = metrics.clone();
        other.request.add(3);
        other.response.add(2);
        other.instance_start.add(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.active_requests(), 1);
        assert_eq!(snapshot.active_instances(), 1);
    }
}
