// synckairos: Metrics collection, grouped per component (SPEC_FULL.md §B.4).

// Mutex poisoning here means a prior panic while holding a counter lock;
// unrecoverable, so propagating via unwrap is appropriate.
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Request metrics, shared shape for the hot path (switch) and the REST
/// surface as a whole.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestMetrics {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyMetrics {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self {
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreMetrics {
    pub requests: RequestMetrics,
    pub latency: LatencyMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub switch_requests: RequestMetrics,
    pub switch_latency: LatencyMetrics,
    pub concurrent_modification_conflicts: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HubMetrics {
    pub active_sockets: u64,
    pub messages_delivered: u64,
    pub connections_rejected: u64,
}

/// Complete metrics snapshot, one group per component, served at `/metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub store: StoreMetrics,
    pub engine: EngineMetrics,
    pub hub: HubMetrics,
    pub audit: crate::audit::AuditMetrics,
}

struct LatencySamples {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencySamples {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    fn record(&mut self, latency_ms: u64) {
        self.samples.push_back(latency_ms);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    fn percentiles(&self) -> LatencyMetrics {
        if self.samples.is_empty() {
            return LatencyMetrics::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |q: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * q) as usize;
            sorted.get(idx).copied().unwrap_or(0)
        };
        LatencyMetrics {
            p50_ms: pick(0.50),
            p95_ms: pick(0.95),
            p99_ms: pick(0.99),
        }
    }
}

/// Collects counters for every component. A single instance is shared
/// across store/engine/hub via `Arc` and wired up in `main`.
pub struct MetricsCollector {
    store_requests: Mutex<RequestMetrics>,
    store_latency: Mutex<LatencySamples>,
    switch_requests: Mutex<RequestMetrics>,
    switch_latency: Mutex<LatencySamples>,
    concurrent_modification_conflicts: std::sync::atomic::AtomicU64,
    active_sockets: std::sync::atomic::AtomicU64,
    messages_delivered: std::sync::atomic::AtomicU64,
    connections_rejected: std::sync::atomic::AtomicU64,
}

impl MetricsCollector {
    pub fn new(max_latency_samples: usize) -> Self {
        Self {
            store_requests: Mutex::new(RequestMetrics::default()),
            store_latency: Mutex::new(LatencySamples::new(max_latency_samples)),
            switch_requests: Mutex::new(RequestMetrics::default()),
            switch_latency: Mutex::new(LatencySamples::new(max_latency_samples)),
            concurrent_modification_conflicts: std::sync::atomic::AtomicU64::new(0),
            active_sockets: std::sync::atomic::AtomicU64::new(0),
            messages_delivered: std::sync::atomic::AtomicU64::new(0),
            connections_rejected: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn record_store_request(&self, success: bool, latency_ms: u64) {
        let mut metrics = self.store_requests.lock().unwrap();
        metrics.total += 1;
        if success { metrics.success += 1 } else { metrics.failure += 1 }
        drop(metrics);
        self.store_latency.lock().unwrap().record(latency_ms);
    }

    pub fn record_switch(&self, success: bool, latency_ms: u64, was_conflict: bool) {
        let mut metrics = self.switch_requests.lock().unwrap();
        metrics.total += 1;
        if success { metrics.success += 1 } else { metrics.failure += 1 }
        drop(metrics);
        self.switch_latency.lock().unwrap().record(latency_ms);
        if was_conflict {
            self.concurrent_modification_conflicts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn set_active_sockets(&self, count: u64) {
        self.active_sockets.store(count, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_ws_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn snapshot(&self, audit: crate::audit::AuditMetrics) -> MetricsSnapshot {
        MetricsSnapshot {
            store: StoreMetrics {
                requests: self.store_requests.lock().unwrap().clone(),
                latency: self.store_latency.lock().unwrap().percentiles(),
            },
            engine: EngineMetrics {
                switch_requests: self.switch_requests.lock().unwrap().clone(),
                switch_latency: self.switch_latency.lock().unwrap().percentiles(),
                concurrent_modification_conflicts: self
                    .concurrent_modification_conflicts
                    .load(std::sync::atomic::Ordering::Relaxed),
            },
            hub: HubMetrics {
                active_sockets: self.active_sockets.load(std::sync::atomic::Ordering::Relaxed),
                messages_delivered: self.messages_delivered.load(std::sync::atomic::Ordering::Relaxed),
                connections_rejected: self.connections_rejected.load(std::sync::atomic::Ordering::Relaxed),
            },
            audit,
        }
    }
}

/// Latency timer, used to bracket a switch-cycle call or a store round-trip.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.finish_duration().as_millis() as u64
    }

    fn finish_duration(&self) -> Duration {
        self.start.elapsed()
    }
}

pub type SharedMetrics = Arc<MetricsCollector>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_are_empty_with_no_samples() {
        let samples = LatencySamples::new(10);
        let p = samples.percentiles();
        assert_eq!(p.p50_ms, 0);
    }

    #[test]
    fn percentiles_reflect_recorded_latencies() {
        let mut samples = LatencySamples::new(10);
        for ms in [10, 20, 30, 40, 50] {
            samples.record(ms);
        }
        let p = samples.percentiles();
        assert!(p.p50_ms >= 20 && p.p50_ms <= 40);
        assert_eq!(p.p99_ms, 50);
    }

    #[test]
    fn snapshot_reflects_recorded_switch_metrics() {
        let collector = MetricsCollector::new(100);
        collector.record_switch(true, 12, false);
        collector.record_switch(false, 5, true);
        let snapshot = collector.snapshot(crate::audit::AuditMetrics::default());
        assert_eq!(snapshot.engine.switch_requests.total, 2);
        assert_eq!(snapshot.engine.concurrent_modification_conflicts, 1);
    }
}
