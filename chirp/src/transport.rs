use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chirp_core::channel::{Bypass, ChannelHandle, OscChannel, PortFrame, SendError};
use chirp_core::metrics::{LocalMetrics, MetricsSink, MetricsSnapshot, SharedMetrics};
use chirp_core::prescheduler::{Prescheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
use chirp_core::region::SharedRegion;
use chirp_core::ring::{Ring, RingKind};
use chirp_core::timing::NtpClock;
use chirp_protocol::layout::SharedLayout;
use chirp_protocol::time::NtpDuration;
use chirp_protocol::types::{SessionId, SourceId};
use crossbeam_channel::Sender;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::events::EventBus;
use crate::worklet::PortRegistrar;
use crate::workers::{self, InboundReply, LogRecord};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("worklet did not acknowledge port registration")]
    Registration,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOpts {
    pub session: SessionId,
    /// CAS retries on the IN ring lock. Worker threads may spin briefly;
    /// a channel used from the main thread should set 0.
    pub max_spins: u32,
}

impl Default for ChannelOpts {
    fn default() -> Self {
        ChannelOpts { session: SessionId(0), max_spins: 64 }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RingUsage {
    pub in_used: usize,
    pub out_used: usize,
    pub debug_used: usize,
}

/// The transport façade: one contract, two carriers. The shared-memory
/// variant runs the prescheduler plus the three poller workers over the
/// shared region; the port variant runs only the prescheduler and speaks
/// to the worklet over channels.
pub struct Transport {
    inner: Inner,
}

enum Inner {
    Shared {
        region: Arc<SharedRegion>,
        layout: SharedLayout,
        clock: NtpClock,
        metrics: SharedMetrics,
        scheduler: SchedulerHandle,
        scheduler_worker: Option<JoinHandle<()>>,
        pollers: Vec<JoinHandle<()>>,
        stop: Arc<AtomicBool>,
        log_records: Sender<LogRecord>,
        next_source: AtomicU32,
        default_channel: OscChannel,
        lookahead: NtpDuration,
    },
    Ports {
        clock: NtpClock,
        scheduler: SchedulerHandle,
        scheduler_worker: Option<JoinHandle<()>>,
        registrar: PortRegistrar,
        next_source: AtomicU32,
        default_channel: OscChannel,
        channel_metrics: Mutex<Vec<Arc<LocalMetrics>>>,
        lookahead: NtpDuration,
    },
}

impl Transport {
    pub fn shared(
        region: Arc<SharedRegion>,
        layout: &SharedLayout,
        clock: NtpClock,
        config: &Config,
        events: EventBus,
        replies: Sender<InboundReply>,
    ) -> Transport {
        let metrics = SharedMetrics::new(region.clone(), layout.metrics.offset);
        let in_ring = Ring::from_layout(region.clone(), layout, RingKind::In);

        let mut scheduler_config = SchedulerConfig::new(
            Bypass::Ring(in_ring.clone()),
            clock.clone(),
            MetricsSink::Shared(metrics.clone()),
        );
        scheduler_config.lookahead = config.lookahead();
        scheduler_config.capacity = config.prescheduler_capacity;
        scheduler_config.max_spins = config.worker_max_spins;
        scheduler_config.max_retries = config.max_retries;
        scheduler_config.retry_base_delay = config.retry_base_delay();

        let (scheduler, scheduler_worker) = Prescheduler::spawn(scheduler_config);

        let stop = Arc::new(AtomicBool::new(false));
        let (log_tx, log_rx) = crossbeam_channel::unbounded();

        let pollers = vec![
            workers::start_osc_in_poller(
                Ring::from_layout(region.clone(), layout, RingKind::Out),
                metrics.clone(),
                replies,
                stop.clone(),
            ),
            workers::start_debug_poller(
                Ring::from_layout(region.clone(), layout, RingKind::Debug),
                metrics.clone(),
                events,
                stop.clone(),
            ),
            workers::start_log_poller(log_rx, stop.clone()),
        ];

        let default_channel = ChannelHandle {
            source: SourceId::MAIN,
            session: SessionId(0),
            lookahead: config.lookahead(),
            max_spins: 0,
            clock: clock.clone(),
            bypass: Bypass::Ring(in_ring),
            scheduler: scheduler.clone(),
            metrics: MetricsSink::Shared(metrics.clone()),
        }
        .connect();

        Transport {
            inner: Inner::Shared {
                region,
                layout: *layout,
                clock,
                metrics,
                scheduler,
                scheduler_worker: Some(scheduler_worker),
                pollers,
                stop,
                log_records: log_tx,
                next_source: AtomicU32::new(0),
                default_channel,
                lookahead: config.lookahead(),
            },
        }
    }

    pub fn ports(
        clock: NtpClock,
        config: &Config,
        worklet_in: Sender<PortFrame>,
        registrar: PortRegistrar,
    ) -> Transport {
        // the scheduler's table must join the merged snapshot, or the
        // min-headroom gauge is invisible in port mode
        let scheduler_metrics = LocalMetrics::new();
        let mut scheduler_config = SchedulerConfig::new(
            Bypass::Port(worklet_in.clone()),
            clock.clone(),
            MetricsSink::Local(scheduler_metrics.clone()),
        );
        scheduler_config.lookahead = config.lookahead();
        scheduler_config.capacity = config.prescheduler_capacity;

        let (scheduler, scheduler_worker) = Prescheduler::spawn(scheduler_config);

        let default_metrics = LocalMetrics::new();
        let default_channel = ChannelHandle {
            source: SourceId::MAIN,
            session: SessionId(0),
            lookahead: config.lookahead(),
            max_spins: 0,
            clock: clock.clone(),
            bypass: Bypass::Port(worklet_in.clone()),
            scheduler: scheduler.clone(),
            metrics: MetricsSink::Local(default_metrics.clone()),
        }
        .connect();

        Transport {
            inner: Inner::Ports {
                clock,
                scheduler,
                scheduler_worker: Some(scheduler_worker),
                registrar,
                next_source: AtomicU32::new(0),
                default_channel,
                channel_metrics: Mutex::new(vec![default_metrics, scheduler_metrics]),
                lookahead: config.lookahead(),
            },
        }
    }

    fn default_channel(&self) -> &OscChannel {
        match &self.inner {
            Inner::Shared { default_channel, .. } => default_channel,
            Inner::Ports { default_channel, .. } => default_channel,
        }
    }

    fn scheduler(&self) -> &SchedulerHandle {
        match &self.inner {
            Inner::Shared { scheduler, .. } => scheduler,
            Inner::Ports { scheduler, .. } => scheduler,
        }
    }

    pub fn send(&self, packet: &[u8]) -> Result<(), SendError> {
        self.default_channel().send(packet)
    }

    /// Direct path regardless of classification.
    pub fn send_immediate(&self, packet: &[u8]) -> Result<(), SendError> {
        self.default_channel().send_direct(packet)
    }

    pub fn send_with_options(
        &self,
        packet: &[u8],
        session: SessionId,
        tag: Option<&str>,
    ) -> Result<(), SendError> {
        self.default_channel().send_scheduled(packet, session, tag)
    }

    pub fn cancel_tag(&self, tag: &str) {
        self.scheduler().cancel_tag(tag);
    }

    pub fn cancel_session(&self, session: SessionId) {
        self.scheduler().cancel_session(session);
    }

    pub fn cancel_session_tag(&self, session: SessionId, tag: &str) {
        self.scheduler().cancel_session_tag(session, tag);
    }

    pub fn cancel_all(&self) {
        self.scheduler().cancel_all();
    }

    pub fn purge(&self) {
        self.scheduler().purge();
    }

    pub fn wake_scheduler(&self) {
        self.scheduler().wake();
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.scheduler().stats()
    }

    /// Manufacture a channel for another producer thread, with a fresh
    /// source id.
    pub fn create_osc_channel(&self, opts: ChannelOpts) -> Result<OscChannel, ChannelError> {
        match &self.inner {
            Inner::Shared {
                region,
                layout,
                clock,
                metrics,
                scheduler,
                next_source,
                lookahead,
                ..
            } => {
                let source = SourceId(1 + next_source.fetch_add(1, Ordering::Relaxed));

                Ok(ChannelHandle {
                    source,
                    session: opts.session,
                    lookahead: *lookahead,
                    max_spins: opts.max_spins,
                    clock: clock.clone(),
                    bypass: Bypass::Ring(Ring::from_layout(region.clone(), layout, RingKind::In)),
                    scheduler: scheduler.clone(),
                    metrics: MetricsSink::Shared(metrics.clone()),
                }
                .connect())
            }
            Inner::Ports {
                clock,
                scheduler,
                registrar,
                next_source,
                channel_metrics,
                lookahead,
                ..
            } => {
                let source = SourceId(1 + next_source.fetch_add(1, Ordering::Relaxed));

                let (port_tx, port_rx) = crossbeam_channel::unbounded();
                if !registrar.register(port_rx) {
                    return Err(ChannelError::Registration);
                }

                let metrics = LocalMetrics::new();
                channel_metrics.lock().unwrap().push(metrics.clone());

                Ok(ChannelHandle {
                    source,
                    session: opts.session,
                    lookahead: *lookahead,
                    max_spins: 0,
                    clock: clock.clone(),
                    bypass: Bypass::Port(port_tx),
                    scheduler: scheduler.clone(),
                    metrics: MetricsSink::Local(metrics),
                }
                .connect())
            }
        }
    }

    /// Producer-side metrics: the shared table, or every local table
    /// merged.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        match &self.inner {
            Inner::Shared { metrics, .. } => metrics.snapshot(),
            Inner::Ports { channel_metrics, .. } => {
                let tables = channel_metrics.lock().unwrap();
                let mut merged = LocalMetrics::new().snapshot();
                for table in tables.iter() {
                    merged.merge_adding(&table.snapshot());
                }
                merged
            }
        }
    }

    pub fn ring_usage(&self) -> Option<RingUsage> {
        match &self.inner {
            Inner::Shared { region, layout, .. } => Some(RingUsage {
                in_used: Ring::from_layout(region.clone(), layout, RingKind::In).used(),
                out_used: Ring::from_layout(region.clone(), layout, RingKind::Out).used(),
                debug_used: Ring::from_layout(region.clone(), layout, RingKind::Debug).used(),
            }),
            Inner::Ports { .. } => None,
        }
    }

    /// Sender for off-thread log records (shared-memory mode only).
    pub fn log_sender(&self) -> Option<Sender<LogRecord>> {
        match &self.inner {
            Inner::Shared { log_records, .. } => Some(log_records.clone()),
            Inner::Ports { .. } => None,
        }
    }

    /// Zero ring control words and the metrics table. Only callable while
    /// the engine side is down, i.e. during reload.
    pub fn reset_rings(&self) {
        if let Inner::Shared { region, layout, metrics, .. } = &self.inner {
            for kind in [RingKind::In, RingKind::Out, RingKind::Debug] {
                Ring::from_layout(region.clone(), layout, kind).reset();
            }
            metrics.reset();
        }
    }

    pub fn shutdown(mut self) {
        match &mut self.inner {
            Inner::Shared { scheduler, scheduler_worker, pollers, stop, .. } => {
                scheduler.shutdown();
                stop.store(true, Ordering::Relaxed);

                if let Some(worker) = scheduler_worker.take() {
                    let _ = worker.join();
                }
                for poller in pollers.drain(..) {
                    let _ = poller.join();
                }
            }
            Inner::Ports { scheduler, scheduler_worker, .. } => {
                scheduler.shutdown();
                if let Some(worker) = scheduler_worker.take() {
                    let _ = worker.join();
                }
            }
        }
    }
}
