/// Schema of the shared metrics table.
///
/// Each metric is one u32 cell at a fixed ordinal offset; the ordinals are
/// the wire contract between producers and readers and must never be
/// reordered. Counters only ever grow; gauges may move both ways and use
/// [`GAUGE_UNSET`] until first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MetricId {
    MessagesSent = 0,
    BytesSent = 1,
    NonBundle = 2,
    Immediate = 3,
    NearFuture = 4,
    Late = 5,
    Bypassed = 6,
    OscInDropped = 7,
    DebugDropped = 8,
    SendFailures = 9,
    EngineQuanta = 10,
    MinHeadroomMs = 11,
}

pub const METRIC_COUNT: usize = 12;
pub const METRICS_REGION_SIZE: usize = METRIC_COUNT * 4;

/// All bits set marks a gauge that has not been observed yet.
pub const GAUGE_UNSET: u32 = u32::MAX;

impl MetricId {
    pub const ALL: [MetricId; METRIC_COUNT] = [
        MetricId::MessagesSent,
        MetricId::BytesSent,
        MetricId::NonBundle,
        MetricId::Immediate,
        MetricId::NearFuture,
        MetricId::Late,
        MetricId::Bypassed,
        MetricId::OscInDropped,
        MetricId::DebugDropped,
        MetricId::SendFailures,
        MetricId::EngineQuanta,
        MetricId::MinHeadroomMs,
    ];

    pub const fn offset(self) -> usize {
        self as usize * 4
    }

    pub const fn is_gauge(self) -> bool {
        matches!(self, MetricId::MinHeadroomMs)
    }

    pub const fn name(self) -> &'static str {
        match self {
            MetricId::MessagesSent => "chirp_osc_messages_sent",
            MetricId::BytesSent => "chirp_osc_bytes_sent",
            MetricId::NonBundle => "chirp_osc_non_bundle",
            MetricId::Immediate => "chirp_osc_immediate",
            MetricId::NearFuture => "chirp_osc_near_future",
            MetricId::Late => "chirp_osc_late",
            MetricId::Bypassed => "chirp_osc_bypassed",
            MetricId::OscInDropped => "chirp_osc_in_messages_dropped",
            MetricId::DebugDropped => "chirp_debug_messages_dropped",
            MetricId::SendFailures => "chirp_osc_send_failures",
            MetricId::EngineQuanta => "chirp_engine_quanta",
            MetricId::MinHeadroomMs => "chirp_min_headroom_ms",
        }
    }
}
