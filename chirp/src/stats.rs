use std::fmt::Write as _;

use chirp_core::buffers::BufferStats;
use chirp_core::metrics::{MetricsSnapshot, NamedMetric};
use chirp_core::prescheduler::SchedulerStats;
use serde::Serialize;

use crate::transport::RingUsage;

/// Everything a reader can know about the dispatch plane at one instant.
#[derive(Clone, Serialize)]
pub struct StatsReport {
    pub metrics: Vec<NamedMetric>,
    pub scheduler: Option<SchedulerStats>,
    pub buffers: Option<BufferStats>,
    pub rings: Option<RingUsage>,
    pub drift_ms: Option<i64>,
}

impl StatsReport {
    pub fn new(
        snapshot: MetricsSnapshot,
        scheduler: Option<SchedulerStats>,
        buffers: Option<BufferStats>,
        rings: Option<RingUsage>,
        drift_ms: Option<i64>,
    ) -> StatsReport {
        StatsReport {
            metrics: snapshot.named(),
            scheduler,
            buffers,
            rings,
            drift_ms,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Text rendering, one `# TYPE` stanza per value.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for metric in &self.metrics {
            let kind = if metric.gauge { "gauge" } else { "counter" };
            if let Some(value) = metric.value {
                let _ = write!(out, "# TYPE {} {}\n{} {}\n\n", metric.name, kind, metric.name, value);
            }
        }

        if let Some(scheduler) = &self.scheduler {
            let _ = write!(
                out,
                "# TYPE chirp_presched_pending gauge\nchirp_presched_pending {}\n\n",
                scheduler.pending,
            );
            let _ = write!(
                out,
                "# TYPE chirp_presched_retry_peak gauge\nchirp_presched_retry_peak {}\n\n",
                scheduler.retry_peak,
            );
            if let Some(headroom) = scheduler.min_headroom_ms {
                let _ = write!(
                    out,
                    "# TYPE chirp_presched_min_headroom_ms gauge\nchirp_presched_min_headroom_ms {headroom}\n\n",
                );
            }
        }

        if let Some(drift) = self.drift_ms {
            let _ = write!(out, "# TYPE chirp_ntp_drift_ms gauge\nchirp_ntp_drift_ms {drift}\n\n");
        }

        out
    }
}
