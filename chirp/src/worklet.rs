use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chirp_core::channel::PortFrame;
use chirp_core::metrics::{LocalMetrics, MetricsSink, MetricsSnapshot, SharedMetrics};
use chirp_core::region::SharedRegion;
use chirp_core::ring::{Ring, RingKind};
use chirp_protocol::layout::SharedLayout;
use chirp_protocol::metrics::MetricId;
use chirp_protocol::types::SourceId;
use chirp_protocol::DEBUG_MAX_PAYLOAD;
use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::engine::{Engine, EngineContext};
use crate::events::HostState;
use crate::workers::LogRecord;

/// Inbound frames the worklet accepts per quantum before it must get
/// back to rendering.
const DRAIN_BUDGET: usize = 256;

enum Control {
    Suspend,
    Resume,
    RegisterPort { port: Receiver<PortFrame>, ack: Sender<()> },
    Shutdown,
}

/// One slice of a packed reply batch in port mode.
#[derive(Debug, Clone, Copy)]
pub struct BatchEntry {
    pub offset: usize,
    pub length: usize,
    pub sequence: u32,
    pub source: SourceId,
}

/// Replies or debug lines for one quantum, packed into a single buffer
/// to amortize the port-crossing cost.
#[derive(Debug, Clone, Default)]
pub struct ReplyBatch {
    pub buffer: Vec<u8>,
    pub entries: Vec<BatchEntry>,
}

impl ReplyBatch {
    fn push(&mut self, sequence: u32, source: SourceId, payload: &[u8]) {
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(payload);
        self.entries.push(BatchEntry { offset, length: payload.len(), sequence, source });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], u32, SourceId)> {
        self.entries.iter().map(|entry| {
            (
                &self.buffer[entry.offset..entry.offset + entry.length],
                entry.sequence,
                entry.source,
            )
        })
    }
}

/// Engine-originated traffic leaving the worklet in port mode.
pub enum WorkletOut {
    Replies(ReplyBatch),
    Debug(ReplyBatch),
    Metrics(MetricsSnapshot),
}

/// Clonable handle that can register new producer ports with the worklet.
#[derive(Clone)]
pub struct PortRegistrar(Sender<Control>);

impl PortRegistrar {
    pub fn register(&self, port: Receiver<PortFrame>) -> bool {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);

        if self.0.send(Control::RegisterPort { port, ack: ack_tx }).is_err() {
            return false;
        }

        ack_rx.recv_timeout(Duration::from_secs(1)).is_ok()
    }
}

/// Owns the worklet thread: the real-time consumer that drains the IN
/// path, clocks the engine, and emits replies and debug text.
pub struct WorkletHost {
    control: Sender<Control>,
    metrics: MetricsSink,
    worker: Option<JoinHandle<()>>,
}

impl WorkletHost {
    pub fn spawn_shared(
        engine: Box<dyn Engine>,
        region: Arc<SharedRegion>,
        layout: &SharedLayout,
        metrics: SharedMetrics,
        quantum: Duration,
        log: Sender<LogRecord>,
    ) -> WorkletHost {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let consumer = SharedConsumer {
            engine,
            in_ring: Ring::from_layout(region.clone(), layout, RingKind::In),
            out_ring: Ring::from_layout(region.clone(), layout, RingKind::Out),
            debug_ring: Ring::from_layout(region, layout, RingKind::Debug),
            metrics: metrics.clone(),
            quantum,
            log,
        };

        let worker = chirp_util::thread::start("chirp/worklet", move || {
            chirp_util::thread::set_realtime_priority();
            consumer.run(control_rx);
        });

        WorkletHost {
            control: control_tx,
            metrics: MetricsSink::Shared(metrics),
            worker: Some(worker),
        }
    }

    pub fn spawn_ports(
        engine: Box<dyn Engine>,
        main_port: Receiver<PortFrame>,
        out: Sender<WorkletOut>,
        metrics: Arc<LocalMetrics>,
        quantum: Duration,
        snapshot_interval: Duration,
    ) -> WorkletHost {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let consumer = PortConsumer {
            engine,
            ports: vec![main_port],
            out,
            metrics: metrics.clone(),
            quantum,
            snapshot_interval,
            reply_seq: 0,
            debug_seq: 0,
        };

        let worker = chirp_util::thread::start("chirp/worklet", move || {
            chirp_util::thread::set_realtime_priority();
            consumer.run(control_rx);
        });

        WorkletHost {
            control: control_tx,
            metrics: MetricsSink::Local(metrics),
            worker: Some(worker),
        }
    }

    pub fn suspend(&self) {
        let _ = self.control.send(Control::Suspend);
    }

    pub fn resume(&self) {
        let _ = self.control.send(Control::Resume);
    }

    /// Register an additional producer port (port mode). Blocks until the
    /// worklet acknowledges, so a send on the new channel cannot race the
    /// registration.
    pub fn register_port(&self, port: Receiver<PortFrame>) -> bool {
        self.registrar().register(port)
    }

    /// Detached registration handle for the transport layer.
    pub fn registrar(&self) -> PortRegistrar {
        PortRegistrar(self.control.clone())
    }

    /// The engine's process counter. Sampling it twice across a short
    /// interval tells a caller whether the engine is actually running.
    pub fn process_count(&self) -> u32 {
        self.metrics.load(MetricId::EngineQuanta)
    }

    pub fn shutdown(mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkletHost {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct SharedConsumer {
    engine: Box<dyn Engine>,
    in_ring: Ring,
    out_ring: Ring,
    debug_ring: Ring,
    metrics: SharedMetrics,
    quantum: Duration,
    // this thread must never hit the logger itself; drops are reported
    // through the outbound-log worker instead
    log: Sender<LogRecord>,
}

impl SharedConsumer {
    fn run(mut self, control: Receiver<Control>) {
        let mut state = HostState::Running;
        let mut ctx = EngineContext::default();

        loop {
            if state == HostState::Suspended {
                // a suspended host renders nothing and drains nothing;
                // backpressure on the IN ring is the intended result
                match control.recv() {
                    Ok(Control::Resume) => state = HostState::Running,
                    Ok(Control::Shutdown) | Err(_) => return,
                    // ports are a port-mode concern; ack so callers don't stall
                    Ok(Control::RegisterPort { ack, .. }) => drop(ack.send(())),
                    Ok(Control::Suspend) => {}
                }
                continue;
            }

            match control.try_recv() {
                Ok(Control::Suspend) => {
                    state = HostState::Suspended;
                    continue;
                }
                Ok(Control::Shutdown) | Err(TryRecvError::Disconnected) => return,
                Ok(Control::RegisterPort { ack, .. }) => drop(ack.send(())),
                Ok(Control::Resume) | Err(TryRecvError::Empty) => {}
            }

            let started = Instant::now();

            let mut budget = DRAIN_BUDGET;
            while budget > 0 {
                let Some(frame) = self.in_ring.read() else { break };
                self.engine.handle_osc(frame.source, &frame.payload, &mut ctx);
                budget -= 1;
            }

            self.engine.process(&mut ctx);
            self.metrics.add(MetricId::EngineQuanta, 1);

            let (replies, debug) = ctx.take();

            for reply in replies {
                if self.out_ring.write(SourceId::ENGINE, &reply, 0).is_err() {
                    // burn the sequence so the poller counts the loss
                    self.out_ring.skip_sequence();
                    let _ = self.log.send(LogRecord {
                        level: log::Level::Warn,
                        message: format!("reply ring full, dropped {} bytes", reply.len()),
                    });
                }
            }

            for line in debug {
                let bytes = line.as_bytes();
                let bytes = &bytes[..bytes.len().min(DEBUG_MAX_PAYLOAD)];
                if self.debug_ring.write(SourceId::ENGINE, bytes, 0).is_err() {
                    self.debug_ring.skip_sequence();
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.quantum {
                std::thread::sleep(self.quantum - elapsed);
            }
        }
    }
}

struct PortConsumer {
    engine: Box<dyn Engine>,
    ports: Vec<Receiver<PortFrame>>,
    out: Sender<WorkletOut>,
    metrics: Arc<LocalMetrics>,
    quantum: Duration,
    snapshot_interval: Duration,
    reply_seq: u32,
    debug_seq: u32,
}

impl PortConsumer {
    fn run(mut self, control: Receiver<Control>) {
        let mut state = HostState::Running;
        let mut ctx = EngineContext::default();
        let mut last_snapshot = Instant::now();

        loop {
            if state == HostState::Suspended {
                match control.recv() {
                    Ok(Control::Resume) => state = HostState::Running,
                    Ok(Control::RegisterPort { port, ack }) => {
                        self.ports.push(port);
                        let _ = ack.send(());
                    }
                    Ok(Control::Shutdown) | Err(_) => return,
                    Ok(Control::Suspend) => {}
                }
                continue;
            }

            loop {
                match control.try_recv() {
                    Ok(Control::Suspend) => {
                        state = HostState::Suspended;
                        break;
                    }
                    Ok(Control::RegisterPort { port, ack }) => {
                        self.ports.push(port);
                        let _ = ack.send(());
                    }
                    Ok(Control::Resume) => {}
                    Ok(Control::Shutdown) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => break,
                }
            }

            if state == HostState::Suspended {
                continue;
            }

            let started = Instant::now();

            let mut budget = DRAIN_BUDGET;
            for port in &self.ports {
                while budget > 0 {
                    match port.try_recv() {
                        Ok(frame) => {
                            self.engine.handle_osc(frame.source, &frame.payload, &mut ctx);
                            budget -= 1;
                        }
                        Err(_) => break,
                    }
                }
            }

            self.engine.process(&mut ctx);
            self.metrics.add(MetricId::EngineQuanta, 1);

            let (replies, debug) = ctx.take();

            if !replies.is_empty() {
                let mut batch = ReplyBatch::default();
                for reply in replies {
                    batch.push(self.reply_seq, SourceId::ENGINE, &reply);
                    self.reply_seq = self.reply_seq.wrapping_add(1);
                }
                if self.out.send(WorkletOut::Replies(batch)).is_err() {
                    return;
                }
            }

            if !debug.is_empty() {
                let mut batch = ReplyBatch::default();
                for line in debug {
                    let bytes = line.as_bytes();
                    batch.push(self.debug_seq, SourceId::ENGINE, &bytes[..bytes.len().min(DEBUG_MAX_PAYLOAD)]);
                    self.debug_seq = self.debug_seq.wrapping_add(1);
                }
                if self.out.send(WorkletOut::Debug(batch)).is_err() {
                    return;
                }
            }

            if last_snapshot.elapsed() >= self.snapshot_interval {
                last_snapshot = Instant::now();
                if self.out.send(WorkletOut::Metrics(self.metrics.snapshot())).is_err() {
                    return;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.quantum {
                std::thread::sleep(self.quantum - elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_pack_and_unpack() {
        let mut batch = ReplyBatch::default();
        batch.push(4, SourceId::ENGINE, b"/synced");
        batch.push(5, SourceId::ENGINE, b"/n_go\0\0\0");

        let unpacked: Vec<_> = batch.iter().collect();
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked[0], (b"/synced".as_slice(), 4, SourceId::ENGINE));
        assert_eq!(unpacked[1], (b"/n_go\0\0\0".as_slice(), 5, SourceId::ENGINE));
    }
}
