use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chirp_core::metrics::SharedMetrics;
use chirp_core::ring::{Ring, SeqTracker};
use chirp_protocol::metrics::MetricId;
use chirp_protocol::types::SourceId;
use crossbeam_channel::{Receiver, Sender};

use crate::events::{Event, EventBus};

/// How long a poller sleeps when its ring is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A decoded engine reply on its way to the supervisor's router.
pub struct InboundReply {
    pub source: SourceId,
    pub packet: rosc::OscPacket,
}

/// A log record produced off the hot path, formatted and emitted by the
/// outbound-log worker so real-time threads never block on a logger.
pub struct LogRecord {
    pub level: log::Level,
    pub message: String,
}

/// Drain the OUT ring: count sequence gaps, decode, forward.
pub fn start_osc_in_poller(
    ring: Ring,
    metrics: SharedMetrics,
    replies: Sender<InboundReply>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/osc-in", move || {
        let mut tracker = SeqTracker::new();

        while !stop.load(Ordering::Relaxed) {
            let Some(frame) = ring.read() else {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            };

            let dropped = tracker.observe(frame.sequence);
            if dropped > 0 {
                metrics.add(MetricId::OscInDropped, dropped);
            }

            match rosc::decoder::decode_udp(&frame.payload) {
                Ok((_, packet)) => {
                    if replies.send(InboundReply { source: frame.source, packet }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("undecodable packet on the reply ring: {e:?}");
                }
            }
        }
    })
}

/// Drain the DEBUG ring into `Debug` events.
pub fn start_debug_poller(
    ring: Ring,
    metrics: SharedMetrics,
    events: EventBus,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/debug", move || {
        let mut tracker = SeqTracker::new();

        while !stop.load(Ordering::Relaxed) {
            let Some(frame) = ring.read() else {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            };

            let dropped = tracker.observe(frame.sequence);
            if dropped > 0 {
                metrics.add(MetricId::DebugDropped, dropped);
            }

            events.emit(Event::Debug {
                source: frame.source,
                line: String::from_utf8_lossy(&frame.payload).into_owned(),
            });
        }
    })
}

/// Drain worker-produced log records into the logger.
pub fn start_log_poller(records: Receiver<LogRecord>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/log", move || {
        while !stop.load(Ordering::Relaxed) {
            match records.recv_timeout(Duration::from_millis(50)) {
                Ok(record) => log::log!(record.level, "{}", record.message),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chirp_core::region::SharedRegion;

    use super::*;

    fn reply_ring() -> (Ring, SharedMetrics) {
        let region = Arc::new(SharedRegion::allocate(1024 + 64 * 1024));
        let metrics = SharedMetrics::new(region.clone(), 256);
        metrics.reset();
        (Ring::new(region, 0, 1024, 64 * 1024, 8 * 1024, false), metrics)
    }

    #[test]
    fn forwards_decoded_replies_and_counts_gaps() {
        let (ring, metrics) = reply_ring();
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let poller = start_osc_in_poller(ring.clone(), metrics.clone(), tx, stop.clone());

        let packet = rosc::encoder::encode(&rosc::OscPacket::Message(rosc::OscMessage {
            addr: "/synced".to_owned(),
            args: vec![rosc::OscType::Int(7)],
        }))
        .unwrap();

        ring.write(SourceId::ENGINE, &packet, 0).unwrap();
        // simulate one dropped frame, then another delivery
        ring.skip_sequence();
        ring.write(SourceId::ENGINE, &packet, 0).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        match (&first.packet, &second.packet) {
            (rosc::OscPacket::Message(a), rosc::OscPacket::Message(b)) => {
                assert_eq!(a.addr, "/synced");
                assert_eq!(b.addr, "/synced");
            }
            other => panic!("expected messages, got {other:?}"),
        }

        assert_eq!(metrics.load(MetricId::OscInDropped), 1);

        stop.store(true, Ordering::Relaxed);
        poller.join().unwrap();
    }

    #[test]
    fn debug_lines_become_events() {
        let (ring, metrics) = reply_ring();
        let events = EventBus::new();
        let stop = Arc::new(AtomicBool::new(false));

        let (tx, rx) = crossbeam_channel::unbounded();
        events.subscribe(move |event| {
            if let Event::Debug { line, .. } = event {
                let _ = tx.send(line.clone());
            }
        });

        let poller = start_debug_poller(ring.clone(), metrics, events, stop.clone());
        ring.write(SourceId::ENGINE, b"late /s_new", 0).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "late /s_new");

        stop.store(true, Ordering::Relaxed);
        poller.join().unwrap();
    }
}
