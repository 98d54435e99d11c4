#![allow(dead_code)]
//! Test harness: a loopback engine that answers the dispatch plane's
//! side-channel traffic, plus drive-and-wait helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chirp::engine::{Engine, EngineContext, EngineFactory, EngineLoadError, EngineSpec};
use chirp::events::Event;
use chirp::{Config, Mode, Supervisor, WorldOptions};
use chirp_protocol::time::NtpDuration;
use chirp_protocol::types::SourceId;
use crossbeam_channel::Receiver;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};

/// One packet as the engine saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub at: Instant,
    pub source: SourceId,
    pub packet: Option<OscPacket>,
    pub raw: Vec<u8>,
}

impl Received {
    /// Addresses of every message in the packet, bundles flattened.
    pub fn addrs(&self) -> Vec<String> {
        fn walk(packet: &OscPacket, out: &mut Vec<String>) {
            match packet {
                OscPacket::Message(message) => out.push(message.addr.clone()),
                OscPacket::Bundle(bundle) => {
                    for inner in &bundle.content {
                        walk(inner, out);
                    }
                }
            }
        }

        let mut out = Vec::new();
        if let Some(packet) = &self.packet {
            walk(packet, &mut out);
        }
        out
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self.packet, Some(OscPacket::Bundle(_)))
    }
}

#[derive(Clone, Default)]
pub struct EngineLog(Arc<Mutex<Vec<Received>>>);

impl EngineLog {
    pub fn all(&self) -> Vec<Received> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn count_addr(&self, addr: &str) -> usize {
        self.all()
            .iter()
            .flat_map(|received| received.addrs())
            .filter(|seen| seen == addr)
            .count()
    }

    pub fn bundles(&self) -> usize {
        self.all().iter().filter(|received| received.is_bundle()).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Behavior switches shared across engine instances (reload keeps them).
#[derive(Default)]
pub struct EngineFlags {
    pub ignore_sync: AtomicBool,
    pub ignore_buffers: AtomicBool,
}

pub struct LoopbackEngine {
    log: EngineLog,
    flags: Arc<EngineFlags>,
}

impl Engine for LoopbackEngine {
    fn handle_osc(&mut self, source: SourceId, packet: &[u8], ctx: &mut EngineContext) {
        let decoded = rosc::decoder::decode_udp(packet).ok().map(|(_, packet)| packet);

        self.log.0.lock().unwrap().push(Received {
            at: Instant::now(),
            source,
            packet: decoded.clone(),
            raw: packet.to_vec(),
        });

        if let Some(packet) = decoded {
            self.respond(&packet, ctx);
        }
    }

    fn process(&mut self, _ctx: &mut EngineContext) {}
}

impl LoopbackEngine {
    fn respond(&self, packet: &OscPacket, ctx: &mut EngineContext) {
        let OscPacket::Message(message) = packet else {
            // a real engine schedules bundle contents itself; recording
            // the arrival is all the tests need
            return;
        };

        match message.addr.as_str() {
            "/sync" => {
                if self.flags.ignore_sync.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(OscType::Int(sync_id)) = message.args.first() {
                    ctx.reply(encode(OscMessage {
                        addr: "/synced".to_owned(),
                        args: vec![OscType::Int(*sync_id)],
                    }));
                }
            }
            "/supersonic/buffer/prepare" => {
                if self.flags.ignore_buffers.load(Ordering::Relaxed) {
                    return;
                }
                if let (Some(OscType::String(uuid)), Some(OscType::Int(bufnum))) =
                    (message.args.first(), message.args.get(1))
                {
                    ctx.reply(encode(OscMessage {
                        addr: "/supersonic/buffer/allocated".to_owned(),
                        args: vec![OscType::String(uuid.clone()), OscType::Int(*bufnum)],
                    }));
                }
            }
            "/status" => {
                ctx.reply(encode(OscMessage {
                    addr: "/status.reply".to_owned(),
                    args: vec![OscType::Int(1), OscType::Float(0.1)],
                }));
            }
            "/say" => {
                if let Some(OscType::String(line)) = message.args.first() {
                    ctx.debug(line.clone());
                }
            }
            _ => {}
        }
    }
}

fn encode(message: OscMessage) -> Vec<u8> {
    rosc::encoder::encode(&OscPacket::Message(message)).unwrap()
}

pub fn loopback_factory(log: EngineLog, flags: Arc<EngineFlags>) -> Box<dyn EngineFactory> {
    Box::new(move |_spec: &EngineSpec| -> Result<Box<dyn Engine>, EngineLoadError> {
        Ok(Box::new(LoopbackEngine { log: log.clone(), flags: flags.clone() }))
    })
}

pub fn test_config(mode: Mode) -> Config {
    let mut config = Config::default();
    config.mode = mode;
    config.memory.total = 16 * 1024 * 1024;
    config.memory.buffer_pool = 2 * 1024 * 1024;
    config.memory.mirror_nodes = 128;
    config.memory.capture = 64 * 1024;
    config.snapshot_interval_ms = 20;
    config.world = WorldOptions {
        num_buffers: 64,
        max_nodes: 128,
        max_graph_defs: 16,
        block_size: 128,
        sample_rate: 48_000,
    };
    config
}

pub struct Fixture {
    pub supervisor: Supervisor,
    pub log: EngineLog,
    pub flags: Arc<EngineFlags>,
}

pub fn fixture(mode: Mode) -> Fixture {
    fixture_with(test_config(mode))
}

pub fn fixture_with(config: Config) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let log = EngineLog::default();
    let flags = Arc::new(EngineFlags::default());
    let supervisor = Supervisor::init(
        config,
        b"\0asm-test-module".to_vec(),
        loopback_factory(log.clone(), flags.clone()),
    )
    .expect("supervisor init");

    Fixture { supervisor, log, flags }
}

pub fn event_channel(supervisor: &Supervisor) -> Receiver<Event> {
    let (tx, rx) = crossbeam_channel::unbounded();
    supervisor.events().subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    check()
}

pub fn message(addr: &str) -> OscPacket {
    OscPacket::Message(OscMessage { addr: addr.to_owned(), args: vec![] })
}

/// A bundle due `millis` from the supervisor's current NTP time, padded
/// with a blob to reach roughly `pad` payload bytes.
pub fn bundle_due_in(supervisor: &Supervisor, millis: u64, pad: usize) -> OscPacket {
    let now = supervisor.clock().try_now().expect("clock established");
    let due = now.saturating_add(NtpDuration::from_millis(millis));

    let args = if pad > 0 { vec![OscType::Blob(vec![0u8; pad])] } else { vec![] };

    OscPacket::Bundle(OscBundle {
        timetag: OscTime { seconds: due.seconds(), fractional: due.fraction() },
        content: vec![OscPacket::Message(OscMessage { addr: "/s_new".to_owned(), args })],
    })
}
