use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chirp_core::buffers::{BufferManager, SampleStore};
use chirp_core::buffers::decode::DecodeOpts;
use chirp_core::buffers::pool::Pool;
use chirp_core::channel::{PortFrame, SendError};
use chirp_core::metrics::{LocalMetrics, MetricsSnapshot, SharedMetrics};
use chirp_core::mirror::{MirrorReader, NodeTreeView};
use chirp_core::region::SharedRegion;
use chirp_core::ring::{Ring, RingKind};
use chirp_core::timing::{start_drift_watcher, NtpClock};
use chirp_protocol::layout::SharedLayout;
use chirp_protocol::time::{NtpDuration, NtpTime};
use chirp_protocol::types::SessionId;
use crossbeam_channel::{Receiver, Sender};
use futures::executor::block_on;
use rosc::{OscMessage, OscPacket, OscTime, OscType};
use thiserror::Error;

use crate::config::{Config, ConfigError, Mode};
use crate::engine::{EngineFactory, EngineLoadError, EngineSpec};
use crate::events::{Event, EventBus, HostState};
use crate::stats::StatsReport;
use crate::synthdef;
use crate::transport::{ChannelError, ChannelOpts, Transport};
use crate::worklet::{WorkletHost, WorkletOut};
use crate::workers::InboundReply;

/// Engine commands that are meaningless here: file-system io the engine
/// has no access to, and scheduling controls that would fight the
/// dispatch plane's own scheduler.
pub const OSC_DENYLIST: [&str; 9] = [
    "/d_load",
    "/d_loadDir",
    "/b_read",
    "/b_readChannel",
    "/b_write",
    "/b_close",
    "/clearSched",
    "/dumpOSC",
    "/error",
];

const ADDR_BUFFER_ALLOCATED: &str = "/supersonic/buffer/allocated";
const ADDR_BUFFER_FREED: &str = "/supersonic/buffer/freed";
const ADDR_SYNCED: &str = "/synced";

#[derive(Debug, Error)]
pub enum InitError {
    #[error("capability missing: {0}")]
    CapabilityMissing(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineLoadError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("supervisor is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("`{0}` is not available in this environment")]
    Denied(String),
    #[error("encoding osc packet: {0:?}")]
    Encode(rosc::OscError),
    #[error(transparent)]
    Transport(#[from] SendError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("supervisor is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("engine did not acknowledge /sync {0} in time")]
    Timeout(i32),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

struct Runtime {
    transport: Transport,
    worklet: WorkletHost,
    router: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    housekeeping: Option<JoinHandle<()>>,
    drift: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    /// Latest packed snapshot from the worklet (port mode).
    worklet_metrics: Arc<Mutex<Option<MetricsSnapshot>>>,
}

/// Ties the dispatch plane together: owns the shared region, the worklet
/// host, the transport façade, the buffer manager, and the lifecycle.
pub struct Supervisor {
    config: Config,
    factory: Box<dyn EngineFactory>,
    module: Arc<Vec<u8>>,
    clock: NtpClock,
    events: EventBus,
    region: Option<Arc<SharedRegion>>,
    layout: Option<SharedLayout>,
    buffers: Option<BufferManager>,
    synthdefs: Mutex<Vec<(String, Vec<u8>)>>,
    sync_waiters: Arc<Mutex<HashMap<i32, Sender<()>>>>,
    runtime: Option<Runtime>,
}

impl Supervisor {
    /// Sequenced init: validate, allocate, load the engine, wire the
    /// transport, establish timing, start workers. Any failure is fatal.
    pub fn init(
        config: Config,
        module: Vec<u8>,
        factory: Box<dyn EngineFactory>,
    ) -> Result<Supervisor, InitError> {
        if config.mode == Mode::SharedMemory && !cfg!(target_has_atomic = "32") {
            return Err(InitError::CapabilityMissing("shared-memory mode requires 32-bit atomics"));
        }

        let mut supervisor = Supervisor {
            clock: NtpClock::new(),
            events: EventBus::new(),
            region: None,
            layout: None,
            buffers: None,
            synthdefs: Mutex::new(Vec::new()),
            sync_waiters: Arc::new(Mutex::new(HashMap::new())),
            runtime: None,
            module: Arc::new(module),
            factory,
            config,
        };

        match supervisor.config.mode {
            Mode::SharedMemory => {
                let layout = supervisor.config.validated_layout()?;
                supervisor.region = Some(Arc::new(SharedRegion::allocate(layout.total_size)));
                supervisor.layout = Some(layout);
            }
            Mode::MessagePort => {
                if supervisor.config.bypass_lookahead_s <= 0.0 {
                    return Err(ConfigError::BadLookahead(supervisor.config.bypass_lookahead_s).into());
                }
            }
        }

        supervisor.start_runtime()?;
        supervisor.events.emit(Event::Ready);

        Ok(supervisor)
    }

    fn start_runtime(&mut self) -> Result<(), InitError> {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<InboundReply>();
        let stop = Arc::new(AtomicBool::new(false));
        let worklet_metrics = Arc::new(Mutex::new(None));
        let mut forwarder = None;

        let (transport, worklet) = match self.config.mode {
            Mode::SharedMemory => {
                let region = self.region.clone().expect("region exists in shared-memory mode");
                let layout = self.layout.expect("layout exists in shared-memory mode");

                // scrub ring and metrics state before anything reads it;
                // on reload the region still holds the old world's frames
                for kind in [RingKind::In, RingKind::Out, RingKind::Debug] {
                    Ring::from_layout(region.clone(), &layout, kind).reset();
                }
                SharedMetrics::new(region.clone(), layout.metrics.offset).reset();

                let transport = Transport::shared(
                    region.clone(),
                    &layout,
                    self.clock.clone(),
                    &self.config,
                    self.events.clone(),
                    reply_tx,
                );

                self.clock.attach_region(region.clone(), layout.ntp_anchor.offset);

                let engine = self.factory.load(&EngineSpec {
                    module: self.module.clone(),
                    world: self.config.world.clone(),
                    region: Some(region.clone()),
                    layout: Some(layout),
                })?;

                let metrics = SharedMetrics::new(region.clone(), layout.metrics.offset);
                let log = transport.log_sender().expect("shared transport has a log sender");
                let worklet = WorkletHost::spawn_shared(
                    engine,
                    region,
                    &layout,
                    metrics,
                    self.config.quantum(),
                    log,
                );

                (transport, worklet)
            }
            Mode::MessagePort => {
                let (port_tx, port_rx) = crossbeam_channel::unbounded::<PortFrame>();
                let (out_tx, out_rx) = crossbeam_channel::unbounded::<WorkletOut>();

                let engine = self.factory.load(&EngineSpec {
                    module: self.module.clone(),
                    world: self.config.world.clone(),
                    region: None,
                    layout: None,
                })?;

                let worklet = WorkletHost::spawn_ports(
                    engine,
                    port_rx,
                    out_tx,
                    LocalMetrics::new(),
                    self.config.quantum(),
                    self.config.snapshot_interval(),
                );

                let transport = Transport::ports(
                    self.clock.clone(),
                    &self.config,
                    port_tx,
                    worklet.registrar(),
                );

                forwarder = Some(start_worklet_forwarder(
                    out_rx,
                    reply_tx,
                    self.events.clone(),
                    worklet_metrics.clone(),
                ));

                (transport, worklet)
            }
        };

        // buffer manager: created once, re-pointed at the new transport
        // on reload so its records survive
        let buffer_channel = transport.create_osc_channel(ChannelOpts {
            session: SessionId(0),
            max_spins: 32,
        })?;

        match &self.buffers {
            Some(buffers) => buffers.set_channel(buffer_channel),
            None => {
                let store = match (&self.region, &self.layout) {
                    (Some(region), Some(layout)) => SampleStore::Pool {
                        region: region.clone(),
                        base: layout.buffer_pool.offset,
                        pool: Pool::new(layout.buffer_pool.size),
                    },
                    _ => SampleStore::Inline,
                };
                self.buffers = Some(BufferManager::new(
                    store,
                    buffer_channel,
                    self.config.world.num_buffers,
                ));
            }
        }

        self.clock.resync();

        let buffers = self.buffers.clone().expect("buffer manager just created");
        let router = start_router(
            reply_rx,
            buffers.clone(),
            self.events.clone(),
            self.sync_waiters.clone(),
        );

        let housekeeping = start_housekeeping(buffers, self.config.snapshot_interval(), stop.clone());
        let drift = start_drift_watcher(self.clock.clone(), stop.clone());

        self.runtime = Some(Runtime {
            transport,
            worklet,
            router: Some(router),
            forwarder,
            housekeeping: Some(housekeeping),
            drift: Some(drift),
            stop,
            worklet_metrics,
        });

        Ok(())
    }

    fn stop_runtime(&mut self) {
        let Some(mut runtime) = self.runtime.take() else { return };

        runtime.transport.purge();
        runtime.stop.store(true, Ordering::Relaxed);

        runtime.worklet.shutdown();
        runtime.transport.shutdown();

        for worker in [
            runtime.router.take(),
            runtime.forwarder.take(),
            runtime.housekeeping.take(),
            runtime.drift.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = worker.join();
        }
    }

    fn runtime(&self) -> Result<&Runtime, DispatchError> {
        self.runtime.as_ref().ok_or(DispatchError::NotRunning)
    }

    /// Encode and dispatch a packet, enforcing the denylist and rewriting
    /// relative pseudo-timetags against the live clock.
    pub fn send(&self, packet: &OscPacket) -> Result<(), DispatchError> {
        let bytes = self.outbound_bytes(packet)?;
        self.runtime()?.transport.send(&bytes)?;
        Ok(())
    }

    /// Dispatch with a session and run tag for later cancellation.
    pub fn send_with_options(
        &self,
        packet: &OscPacket,
        session: SessionId,
        tag: Option<&str>,
    ) -> Result<(), DispatchError> {
        let bytes = self.outbound_bytes(packet)?;
        self.runtime()?.transport.send_with_options(&bytes, session, tag)?;
        Ok(())
    }

    /// Force the direct path regardless of classification.
    pub fn send_immediate(&self, packet: &OscPacket) -> Result<(), DispatchError> {
        let bytes = self.outbound_bytes(packet)?;
        self.runtime()?.transport.send_immediate(&bytes)?;
        Ok(())
    }

    fn outbound_bytes(&self, packet: &OscPacket) -> Result<Vec<u8>, DispatchError> {
        if let Some(denied) = denied_address(packet) {
            return Err(DispatchError::Denied(denied.to_owned()));
        }

        let packet = match self.clock.try_now() {
            Some(now) => rewrite_pseudo_times(packet.clone(), now),
            None => packet.clone(),
        };

        self.capture_synthdefs(&packet);

        rosc::encoder::encode(&packet).map_err(DispatchError::Encode)
    }

    /// Send `/sync` and wait for the matching `/synced` or a deadline.
    pub fn sync(&self, sync_id: i32, timeout: Duration) -> Result<(), SyncError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.sync_waiters.lock().unwrap().insert(sync_id, tx);

        let message = OscPacket::Message(OscMessage {
            addr: "/sync".to_owned(),
            args: vec![OscType::Int(sync_id)],
        });

        if let Err(e) = self.send(&message) {
            self.sync_waiters.lock().unwrap().remove(&sync_id);
            return Err(e.into());
        }

        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.sync_waiters.lock().unwrap().remove(&sync_id);
                Err(SyncError::Timeout(sync_id))
            }
        }
    }

    pub fn cancel_tag(&self, tag: &str) -> Result<(), DispatchError> {
        self.runtime()?.transport.cancel_tag(tag);
        Ok(())
    }

    pub fn cancel_session(&self, session: SessionId) -> Result<(), DispatchError> {
        self.runtime()?.transport.cancel_session(session);
        Ok(())
    }

    pub fn cancel_session_tag(&self, session: SessionId, tag: &str) -> Result<(), DispatchError> {
        self.runtime()?.transport.cancel_session_tag(session, tag);
        Ok(())
    }

    pub fn cancel_all(&self) -> Result<(), DispatchError> {
        self.runtime()?.transport.cancel_all();
        Ok(())
    }

    pub fn create_osc_channel(
        &self,
        opts: ChannelOpts,
    ) -> Result<chirp_core::channel::OscChannel, DispatchError> {
        Ok(self.runtime()?.transport.create_osc_channel(opts)?)
    }

    /// A fresh session label for grouping cancellable work.
    pub fn new_session(&self) -> SessionId {
        SessionId(rand::random())
    }

    /// Suspend the audio host. The worklet stops draining; producers
    /// back-pressure naturally against the IN ring.
    pub fn suspend(&self) -> Result<(), DispatchError> {
        let runtime = self.runtime()?;
        runtime.worklet.suspend();
        log::debug!("audio host {}", HostState::Suspended);
        self.events.emit(Event::AudioContext(HostState::Suspended));
        Ok(())
    }

    /// Resume the audio host. Samples the engine's process counter; if it
    /// advances the resume is complete after an NTP resync, otherwise the
    /// whole runtime is rebuilt.
    pub fn resume(&mut self) -> Result<(), InitError> {
        let advanced = {
            let runtime = self.runtime.as_ref().ok_or(InitError::NotRunning)?;
            runtime.worklet.resume();
            self.events.emit(Event::AudioContext(HostState::Running));

            let before = runtime.worklet.process_count();
            std::thread::sleep(self.config.quantum() * 4 + Duration::from_millis(2));
            runtime.worklet.process_count() > before
        };

        if advanced {
            self.clock.resync();
            if let Some(runtime) = &self.runtime {
                runtime.transport.wake_scheduler();
            }
            self.events.emit(Event::Resumed);
            Ok(())
        } else {
            log::warn!("engine process counter stalled across resume, rebuilding runtime");
            self.reload()
        }
    }

    /// Tear the runtime down and rebuild it against the cached engine
    /// module, then re-send synthdefs and re-materialize buffers.
    pub fn reload(&mut self) -> Result<(), InitError> {
        let captured_defs = self.synthdefs.lock().unwrap().clone();
        let captured_buffers = match (self.config.mode, &self.buffers) {
            (Mode::MessagePort, Some(buffers)) => buffers.allocated_buffers(),
            _ => Vec::new(),
        };

        self.stop_runtime();
        self.start_runtime()?;

        for (name, bytes) in captured_defs {
            let message = OscPacket::Message(OscMessage {
                addr: "/d_recv".to_owned(),
                args: vec![OscType::Blob(bytes)],
            });
            if let Err(e) = self.send_immediate(&message) {
                log::warn!("re-sending synthdef {name}: {e}");
            }
        }

        if let Some(buffers) = &self.buffers {
            match self.config.mode {
                Mode::SharedMemory => {
                    // sample data survived in the shared pool; replaying
                    // the prepare messages is enough
                    let announced = buffers.reannounce();
                    log::debug!("re-announced {announced} buffers after reload");
                }
                Mode::MessagePort => {
                    for info in captured_buffers {
                        let Some(path) = info.source else {
                            log::warn!("buffer {} has no source path, cannot re-materialize", info.bufnum);
                            continue;
                        };
                        if let Err(e) = block_on(buffers.prepare_from_path(
                            info.bufnum,
                            &path,
                            DecodeOpts::default(),
                        )) {
                            log::warn!("re-materializing buffer {}: {e}", info.bufnum);
                        }
                    }
                }
            }
        }

        self.events.emit(Event::Reloaded);
        Ok(())
    }

    /// Cancel everything, reject pending work, stop all executors, and
    /// drop subscribers.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = &self.runtime {
            runtime.transport.cancel_all();
        }
        if let Some(buffers) = &self.buffers {
            buffers.destroy();
        }

        self.stop_runtime();
        self.sync_waiters.lock().unwrap().clear();
        self.events.clear();
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn buffers(&self) -> Option<&BufferManager> {
        self.buffers.as_ref()
    }

    pub fn clock(&self) -> &NtpClock {
        &self.clock
    }

    /// Diagnostics handle; tests also use it to poke at ring internals.
    pub fn shared_region(&self) -> Option<&Arc<SharedRegion>> {
        self.region.as_ref()
    }

    pub fn layout(&self) -> Option<&SharedLayout> {
        self.layout.as_ref()
    }

    pub fn scheduler_stats(&self) -> Option<chirp_core::prescheduler::SchedulerStats> {
        self.runtime.as_ref().and_then(|runtime| runtime.transport.scheduler_stats())
    }

    /// Parse the engine-written node-tree mirror (shared-memory mode).
    pub fn node_tree(&self) -> Option<NodeTreeView> {
        let region = self.region.as_ref()?;
        let layout = self.layout.as_ref()?;

        MirrorReader::new(region.clone(), layout.mirror.offset, self.config.memory.mirror_nodes)
            .read()
    }

    pub fn stats(&self) -> Result<StatsReport, DispatchError> {
        let runtime = self.runtime()?;

        let mut snapshot = runtime.transport.metrics_snapshot();
        if let Some(worklet) = runtime.worklet_metrics.lock().unwrap().as_ref() {
            snapshot.merge_adding(worklet);
        }

        Ok(StatsReport::new(
            snapshot,
            runtime.transport.scheduler_stats(),
            self.buffers.as_ref().map(|buffers| buffers.stats()),
            runtime.transport.ring_usage(),
            self.clock.drift_ms(),
        ))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_runtime();
    }
}

fn start_router(
    replies: Receiver<InboundReply>,
    buffers: BufferManager,
    events: EventBus,
    waiters: Arc<Mutex<HashMap<i32, Sender<()>>>>,
) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/router", move || {
        while let Ok(reply) = replies.recv() {
            route(reply.packet, reply.source, &buffers, &events, &waiters);
        }
    })
}

fn route(
    packet: OscPacket,
    source: chirp_protocol::types::SourceId,
    buffers: &BufferManager,
    events: &EventBus,
    waiters: &Mutex<HashMap<i32, Sender<()>>>,
) {
    let message = match packet {
        OscPacket::Message(message) => message,
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                route(inner, source, buffers, events, waiters);
            }
            return;
        }
    };

    match message.addr.as_str() {
        ADDR_BUFFER_ALLOCATED => match (message.args.first(), message.args.get(1)) {
            (Some(OscType::String(uuid)), Some(OscType::Int(bufnum))) => {
                buffers.handle_buffer_allocated(uuid, *bufnum as u32);
            }
            _ => log::warn!("malformed {ADDR_BUFFER_ALLOCATED} from engine"),
        },
        ADDR_BUFFER_FREED => match (message.args.first(), message.args.get(1)) {
            (Some(OscType::Int(bufnum)), Some(ptr)) => {
                let ptr = match ptr {
                    OscType::Long(ptr) => *ptr as usize,
                    OscType::Int(ptr) => *ptr as usize,
                    _ => {
                        log::warn!("malformed {ADDR_BUFFER_FREED} from engine");
                        return;
                    }
                };
                buffers.handle_buffer_freed(*bufnum as u32, ptr);
            }
            _ => log::warn!("malformed {ADDR_BUFFER_FREED} from engine"),
        },
        ADDR_SYNCED => {
            if let Some(OscType::Int(sync_id)) = message.args.first() {
                if let Some(waiter) = waiters.lock().unwrap().remove(sync_id) {
                    let _ = waiter.send(());
                }
            }
            events.emit(Event::Message { source, packet: OscPacket::Message(message) });
        }
        _ => {
            events.emit(Event::Message { source, packet: OscPacket::Message(message) });
        }
    }
}

fn start_worklet_forwarder(
    out: Receiver<WorkletOut>,
    replies: Sender<InboundReply>,
    events: EventBus,
    worklet_metrics: Arc<Mutex<Option<MetricsSnapshot>>>,
) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/worklet-out", move || {
        while let Ok(batch) = out.recv() {
            match batch {
                WorkletOut::Replies(batch) => {
                    for (bytes, _sequence, source) in batch.iter() {
                        match rosc::decoder::decode_udp(bytes) {
                            Ok((_, packet)) => {
                                if replies.send(InboundReply { source, packet }).is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::warn!("undecodable reply in worklet batch: {e:?}"),
                        }
                    }
                }
                WorkletOut::Debug(batch) => {
                    for (bytes, _sequence, source) in batch.iter() {
                        events.emit(Event::Debug {
                            source,
                            line: String::from_utf8_lossy(bytes).into_owned(),
                        });
                    }
                }
                WorkletOut::Metrics(snapshot) => {
                    *worklet_metrics.lock().unwrap() = Some(snapshot);
                }
            }
        }
    })
}

fn start_housekeeping(
    buffers: BufferManager,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/housekeeping", move || {
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(interval);
            buffers.expire_pending(Instant::now());
        }
    })
}

fn denied_address(packet: &OscPacket) -> Option<&str> {
    match packet {
        OscPacket::Message(message) => {
            OSC_DENYLIST.iter().find(|denied| **denied == message.addr).copied()
        }
        OscPacket::Bundle(bundle) => bundle.content.iter().find_map(denied_address),
    }
}

/// Bundle timetags with seconds 0 and a fraction above the immediate
/// sentinels are relative offsets; pin them to the live timeline at the
/// send boundary.
fn rewrite_pseudo_times(packet: OscPacket, now: NtpTime) -> OscPacket {
    match packet {
        OscPacket::Bundle(mut bundle) => {
            if bundle.timetag.seconds == 0 && bundle.timetag.fractional > 1 {
                let due = now.saturating_add(NtpDuration::from_bits(bundle.timetag.fractional as u64));
                bundle.timetag = OscTime { seconds: due.seconds(), fractional: due.fraction() };
            }

            bundle.content = bundle
                .content
                .into_iter()
                .map(|inner| rewrite_pseudo_times(inner, now))
                .collect();

            OscPacket::Bundle(bundle)
        }
        message => message,
    }
}

impl Supervisor {
    fn capture_synthdefs(&self, packet: &OscPacket) {
        match packet {
            OscPacket::Bundle(bundle) => {
                for inner in &bundle.content {
                    self.capture_synthdefs(inner);
                }
            }
            OscPacket::Message(message) if message.addr == "/d_recv" => {
                let Some(OscType::Blob(bytes)) = message.args.first() else { return };
                let Some(name) = synthdef::synthdef_name(bytes) else {
                    log::warn!("/d_recv payload is not a synthdef container");
                    return;
                };

                let mut defs = self.synthdefs.lock().unwrap();
                match defs.iter_mut().find(|(existing, _)| *existing == name) {
                    Some((_, existing)) => *existing = bytes.clone(),
                    None => defs.push((name, bytes.clone())),
                }
            }
            OscPacket::Message(message) if message.addr == "/d_free" => {
                let mut defs = self.synthdefs.lock().unwrap();
                for arg in &message.args {
                    if let OscType::String(name) = arg {
                        defs.retain(|(existing, _)| existing != name);
                    }
                }
            }
            OscPacket::Message(_) => {}
        }
    }
}
