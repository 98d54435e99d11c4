use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chirp_protocol::metrics::{MetricId, GAUGE_UNSET, METRIC_COUNT};
use serde::Serialize;

use crate::region::SharedRegion;

/// The metrics table in shared memory: every producer adds into the same
/// cells, so one read gives the whole plane's totals.
#[derive(Clone)]
pub struct SharedMetrics {
    region: Arc<SharedRegion>,
    base: usize,
}

impl SharedMetrics {
    pub fn new(region: Arc<SharedRegion>, base: usize) -> SharedMetrics {
        SharedMetrics { region, base }
    }

    /// Zero counters and reset gauges to unset. Init/reload only.
    pub fn reset(&self) {
        for id in MetricId::ALL {
            let initial = if id.is_gauge() { GAUGE_UNSET } else { 0 };
            self.cell(id).store(initial, Ordering::Release);
        }
    }

    fn cell(&self, id: MetricId) -> &AtomicU32 {
        self.region.atomic_u32(self.base + id.offset())
    }

    pub fn add(&self, id: MetricId, n: u32) {
        self.cell(id).fetch_add(n, Ordering::Relaxed);
    }

    /// Lower a minimum gauge. Lost races only ever leave a lower value in
    /// place, which is still a correct minimum.
    pub fn observe_min(&self, id: MetricId, value: u32) {
        let cell = self.cell(id);
        let mut current = cell.load(Ordering::Relaxed);

        while current == GAUGE_UNSET || value < current {
            match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn load(&self, id: MetricId) -> u32 {
        self.cell(id).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut values = [0u32; METRIC_COUNT];
        for (slot, id) in values.iter_mut().zip(MetricId::ALL) {
            *slot = self.load(id);
        }
        MetricsSnapshot { values }
    }
}

/// Thread-local-ish counters for the port variant: each producer
/// aggregates its own table and reports on demand.
#[derive(Debug, Default)]
pub struct LocalMetrics {
    cells: [AtomicU32; METRIC_COUNT],
}

impl LocalMetrics {
    pub fn new() -> Arc<LocalMetrics> {
        let metrics = LocalMetrics::default();
        for id in MetricId::ALL {
            if id.is_gauge() {
                metrics.cells[id.offset() / 4].store(GAUGE_UNSET, Ordering::Relaxed);
            }
        }
        Arc::new(metrics)
    }

    pub fn add(&self, id: MetricId, n: u32) {
        self.cells[id.offset() / 4].fetch_add(n, Ordering::Relaxed);
    }

    pub fn observe_min(&self, id: MetricId, value: u32) {
        let cell = &self.cells[id.offset() / 4];
        let mut current = cell.load(Ordering::Relaxed);

        while current == GAUGE_UNSET || value < current {
            match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn load(&self, id: MetricId) -> u32 {
        self.cells[id.offset() / 4].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut values = [0u32; METRIC_COUNT];
        for (slot, id) in values.iter_mut().zip(MetricId::ALL) {
            *slot = self.load(id);
        }
        MetricsSnapshot { values }
    }
}

/// Where a producer records its metrics, by transport mode.
#[derive(Clone)]
pub enum MetricsSink {
    Shared(SharedMetrics),
    Local(Arc<LocalMetrics>),
}

impl MetricsSink {
    pub fn add(&self, id: MetricId, n: u32) {
        match self {
            MetricsSink::Shared(shared) => shared.add(id, n),
            MetricsSink::Local(local) => local.add(id, n),
        }
    }

    pub fn observe_min(&self, id: MetricId, value: u32) {
        match self {
            MetricsSink::Shared(shared) => shared.observe_min(id, value),
            MetricsSink::Local(local) => local.observe_min(id, value),
        }
    }

    pub fn load(&self, id: MetricId) -> u32 {
        match self {
            MetricsSink::Shared(shared) => shared.load(id),
            MetricsSink::Local(local) => local.load(id),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        match self {
            MetricsSink::Shared(shared) => shared.snapshot(),
            MetricsSink::Local(local) => local.snapshot(),
        }
    }
}

/// Point-in-time copy of the whole table, with ordinals resolved back to
/// names for readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    values: [u32; METRIC_COUNT],
}

impl MetricsSnapshot {
    pub fn get(&self, id: MetricId) -> Option<u32> {
        let raw = self.values[id.offset() / 4];
        if id.is_gauge() && raw == GAUGE_UNSET {
            None
        } else {
            Some(raw)
        }
    }

    pub fn merge_adding(&mut self, other: &MetricsSnapshot) {
        for id in MetricId::ALL {
            let slot = id.offset() / 4;
            if id.is_gauge() {
                let theirs = other.values[slot];
                if theirs != GAUGE_UNSET && theirs < self.values[slot] {
                    self.values[slot] = theirs;
                }
            } else {
                self.values[slot] = self.values[slot].wrapping_add(other.values[slot]);
            }
        }
    }

    pub fn named(&self) -> Vec<NamedMetric> {
        MetricId::ALL
            .iter()
            .map(|id| NamedMetric {
                name: id.name(),
                gauge: id.is_gauge(),
                value: self.get(*id),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedMetric {
    pub name: &'static str,
    pub gauge: bool,
    pub value: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_cells_accumulate() {
        let region = Arc::new(SharedRegion::allocate(chirp_protocol::metrics::METRICS_REGION_SIZE));
        let metrics = SharedMetrics::new(region, 0);
        metrics.reset();

        metrics.add(MetricId::MessagesSent, 1);
        metrics.add(MetricId::MessagesSent, 2);
        assert_eq!(metrics.load(MetricId::MessagesSent), 3);
    }

    #[test]
    fn min_gauge_sentinel() {
        let metrics = LocalMetrics::new();

        assert_eq!(metrics.snapshot().get(MetricId::MinHeadroomMs), None);

        metrics.observe_min(MetricId::MinHeadroomMs, 180);
        metrics.observe_min(MetricId::MinHeadroomMs, 195);
        assert_eq!(metrics.snapshot().get(MetricId::MinHeadroomMs), Some(180));

        metrics.observe_min(MetricId::MinHeadroomMs, 12);
        assert_eq!(metrics.snapshot().get(MetricId::MinHeadroomMs), Some(12));
    }

    #[test]
    fn merge_adds_counters_and_keeps_min_gauges() {
        let a = LocalMetrics::new();
        let b = LocalMetrics::new();

        a.add(MetricId::BytesSent, 100);
        b.add(MetricId::BytesSent, 20);
        a.observe_min(MetricId::MinHeadroomMs, 50);
        b.observe_min(MetricId::MinHeadroomMs, 40);

        let mut merged = a.snapshot();
        merged.merge_adding(&b.snapshot());

        assert_eq!(merged.get(MetricId::BytesSent), Some(120));
        assert_eq!(merged.get(MetricId::MinHeadroomMs), Some(40));
    }
}
