use chirp_protocol::classify::{bundle_time, classify, PacketClass};
use chirp_protocol::metrics::MetricId;
use chirp_protocol::time::{NtpDuration, NtpTime};
use chirp_protocol::types::{SessionId, SourceId};
use crossbeam_channel::Sender;
use thiserror::Error;

use crate::metrics::MetricsSink;
use crate::prescheduler::SchedulerHandle;
use crate::ring::{Ring, WriteError};
use crate::timing::NtpClock;

/// One engine-bound packet on a worklet port, the message-port stand-in
/// for a ring frame.
#[derive(Debug, Clone)]
pub struct PortFrame {
    pub source: SourceId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("engine ring full")]
    RingFull,
    #[error("payload too large: {len} bytes, max {max}")]
    TooLarge { len: usize, max: usize },
    #[error("worklet port closed")]
    PortClosed,
    #[error("prescheduler at capacity")]
    SchedulerFull,
    #[error("prescheduler worker gone")]
    SchedulerGone,
    #[error("channel closed")]
    Closed,
}

/// The direct path to the engine: a frame on the IN ring in shared-memory
/// mode, a port message in port mode.
#[derive(Clone, derive_more::From)]
pub enum Bypass {
    Ring(Ring),
    Port(Sender<PortFrame>),
}

impl Bypass {
    pub fn send(&self, source: SourceId, payload: &[u8], max_spins: u32) -> Result<(), SendError> {
        match self {
            Bypass::Ring(ring) => {
                ring.write(source, payload, max_spins).map(drop).map_err(|e| match e {
                    WriteError::Full => SendError::RingFull,
                    WriteError::TooLarge { len, max } => SendError::TooLarge { len, max },
                })
            }
            Bypass::Port(port) => {
                let frame = PortFrame { source, payload: payload.to_vec() };
                port.send(frame).map_err(|_| SendError::PortClosed)
            }
        }
    }
}

/// Per-producer handle that classifies a packet and routes it: anything
/// inside the lookahead window goes straight to the engine, far-future
/// bundles go to the prescheduler.
pub struct OscChannel {
    source: SourceId,
    session: SessionId,
    lookahead: NtpDuration,
    max_spins: u32,
    clock: NtpClock,
    bypass: Bypass,
    scheduler: SchedulerHandle,
    metrics: MetricsSink,
    closed: bool,
}

impl OscChannel {
    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Classify and route. Metrics are recorded on success only, so the
    /// counters agree with what the consumer can actually observe.
    pub fn send(&self, packet: &[u8]) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }

        let class = classify(packet, self.clock.try_now(), self.lookahead);

        if class.bypasses_prescheduler() {
            self.dispatch_direct(packet, class)
        } else {
            self.schedule(packet, self.session, None)
        }
    }

    /// Force the direct path regardless of classification.
    pub fn send_direct(&self, packet: &[u8]) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }

        let class = classify(packet, self.clock.try_now(), self.lookahead);
        self.dispatch_direct(packet, class)
    }

    /// Hand a bundle to the prescheduler under an explicit session and
    /// run tag for later cancellation.
    pub fn send_scheduled(
        &self,
        packet: &[u8],
        session: SessionId,
        tag: Option<&str>,
    ) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }

        let class = classify(packet, self.clock.try_now(), self.lookahead);

        if class.bypasses_prescheduler() {
            self.dispatch_direct(packet, class)
        } else {
            self.schedule(packet, session, tag)
        }
    }

    fn dispatch_direct(&self, packet: &[u8], class: PacketClass) -> Result<(), SendError> {
        match self.bypass.send(self.source, packet, self.max_spins) {
            Ok(()) => {
                self.record_success(packet.len(), Some(class));
                self.metrics.add(MetricId::Bypassed, 1);
                Ok(())
            }
            Err(e) => {
                self.metrics.add(MetricId::SendFailures, 1);
                Err(e)
            }
        }
    }

    fn schedule(&self, packet: &[u8], session: SessionId, tag: Option<&str>) -> Result<(), SendError> {
        // send() only takes this path for well-formed far-future bundles;
        // a direct caller without a timetag gets next-tick dispatch
        let due = bundle_time(packet).unwrap_or(NtpTime::from_parts(0, 0));

        self.scheduler.schedule(self.source, packet.to_vec(), due, session, tag)?;
        self.record_success(packet.len(), None);
        Ok(())
    }

    fn record_success(&self, len: usize, class: Option<PacketClass>) {
        self.metrics.add(MetricId::MessagesSent, 1);
        self.metrics.add(MetricId::BytesSent, len as u32);

        let category = match class {
            Some(PacketClass::NonBundle) => Some(MetricId::NonBundle),
            Some(PacketClass::Immediate) => Some(MetricId::Immediate),
            Some(PacketClass::NearFuture) => Some(MetricId::NearFuture),
            Some(PacketClass::Late) => Some(MetricId::Late),
            Some(PacketClass::FarFuture) | None => None,
        };

        if let Some(category) = category {
            self.metrics.add(category, 1);
        }
    }

    /// Further sends fail with [`SendError::Closed`]. Scheduled bundles
    /// already handed to the prescheduler are unaffected.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Plain-data projection for handing the channel to another executor.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            source: self.source,
            session: self.session,
            lookahead: self.lookahead,
            max_spins: self.max_spins,
            clock: self.clock.clone(),
            bypass: self.bypass.clone(),
            scheduler: self.scheduler.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Everything needed to reconstruct a working channel on the receiving
/// side of a hand-off, with the source id preserved.
#[derive(Clone)]
pub struct ChannelHandle {
    pub source: SourceId,
    pub session: SessionId,
    pub lookahead: NtpDuration,
    pub max_spins: u32,
    pub clock: NtpClock,
    pub bypass: Bypass,
    pub scheduler: SchedulerHandle,
    pub metrics: MetricsSink,
}

impl ChannelHandle {
    pub fn connect(self) -> OscChannel {
        OscChannel {
            source: self.source,
            session: self.session,
            lookahead: self.lookahead,
            max_spins: self.max_spins,
            clock: self.clock,
            bypass: self.bypass,
            scheduler: self.scheduler,
            metrics: self.metrics,
            closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chirp_protocol::classify::BUNDLE_MAGIC;
    use chirp_protocol::DEFAULT_LOOKAHEAD;

    use super::*;
    use crate::prescheduler::{Prescheduler, SchedulerConfig};
    use crate::metrics::LocalMetrics;
    use crate::region::SharedRegion;

    fn bundle_at(due: NtpTime) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(BUNDLE_MAGIC);
        packet.extend_from_slice(&due.seconds().to_be_bytes());
        packet.extend_from_slice(&due.fraction().to_be_bytes());
        packet
    }

    fn test_channel() -> (OscChannel, Ring, NtpClock) {
        let region = Arc::new(SharedRegion::allocate(256 + 64 * 1024));
        let ring = Ring::new(region, 0, 256, 64 * 1024, 1024, true);

        let clock = NtpClock::new();
        clock.resync();

        let (scheduler, _worker) = Prescheduler::spawn(SchedulerConfig::new(
            Bypass::Ring(ring.clone()),
            clock.clone(),
            MetricsSink::Local(LocalMetrics::new()),
        ));

        let channel = ChannelHandle {
            source: SourceId(1),
            session: SessionId(0),
            lookahead: DEFAULT_LOOKAHEAD,
            max_spins: 16,
            clock: clock.clone(),
            bypass: Bypass::Ring(ring.clone()),
            scheduler,
            metrics: MetricsSink::Local(LocalMetrics::new()),
        }
        .connect();

        (channel, ring, clock)
    }

    #[test]
    fn non_bundle_takes_the_direct_path() {
        let (channel, ring, _clock) = test_channel();

        channel.send(b"/n_set\0\0").unwrap();

        let frame = ring.read().unwrap();
        assert_eq!(frame.source, SourceId(1));
        assert_eq!(frame.payload, b"/n_set\0\0");

        let metrics = channel.metrics();
        assert_eq!(metrics.load(MetricId::MessagesSent), 1);
        assert_eq!(metrics.load(MetricId::BytesSent), 8);
        assert_eq!(metrics.load(MetricId::NonBundle), 1);
        assert_eq!(metrics.load(MetricId::Bypassed), 1);
    }

    #[test]
    fn near_future_bundle_bypasses() {
        let (channel, ring, clock) = test_channel();

        let due = clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(50));
        channel.send(&bundle_at(due)).unwrap();

        assert!(ring.read().is_some());
        assert_eq!(channel.metrics().load(MetricId::NearFuture), 1);
    }

    #[test]
    fn far_future_bundle_goes_to_the_scheduler() {
        let (channel, ring, clock) = test_channel();

        let due = clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(5_000));
        channel.send(&bundle_at(due)).unwrap();

        // nothing on the ring yet; the scheduler holds it
        assert!(ring.read().is_none());
        assert_eq!(channel.metrics().load(MetricId::MessagesSent), 1);
        assert_eq!(channel.metrics().load(MetricId::Bypassed), 0);
    }

    #[test]
    fn failed_sends_record_no_traffic_metrics() {
        let (mut channel, ring, _clock) = test_channel();

        // jam the ring's write lock so the direct path reports full
        ring.lock_for_test().store(1, std::sync::atomic::Ordering::Release);
        channel.max_spins = 0;

        assert_eq!(channel.send(b"/status\0"), Err(SendError::RingFull));
        assert_eq!(channel.metrics().load(MetricId::MessagesSent), 0);
        assert_eq!(channel.metrics().load(MetricId::SendFailures), 1);
    }

    #[test]
    fn closed_channel_rejects() {
        let (mut channel, _ring, _clock) = test_channel();
        channel.close();
        assert_eq!(channel.send(b"/status\0"), Err(SendError::Closed));
    }

    #[test]
    fn handle_reconstructs_with_same_source() {
        let (channel, ring, _clock) = test_channel();

        let moved = channel.handle().connect();
        moved.send(b"/g_new\0\0").unwrap();

        assert_eq!(ring.read().unwrap().source, SourceId(1));
    }
}
