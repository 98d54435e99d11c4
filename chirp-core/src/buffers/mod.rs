pub mod decode;
pub mod pool;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use rosc::{OscMessage, OscPacket, OscType};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::channel::{OscChannel, SendError};
use crate::region::SharedRegion;

use self::decode::{DecodeError, DecodeOpts, DecodedAudio, SampleInfo};
use self::pool::{Pool, PoolExhausted, PoolStats};

/// Guard frames padded around every interleaved buffer so cubic
/// interpolation can read past either edge safely. The reported frame
/// count excludes them; the allocated byte count includes them.
pub const GUARD_BEFORE: u32 = 3;
pub const GUARD_AFTER: u32 = 1;

pub const PREPARE_ADDR: &str = "/supersonic/buffer/prepare";

const DEADLINE_BLOB: Duration = Duration::from_secs(30);
const DEADLINE_FILE: Duration = Duration::from_secs(60);
const DEADLINE_EMPTY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer manager destroyed")]
    Destroyed,
    #[error("bufnum {bufnum} outside configured range of {max} buffers")]
    BadBufnum { bufnum: u32, max: u32 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Pool(#[from] PoolExhausted),
    #[error("engine did not confirm allocation {uuid} for buffer {bufnum} in time")]
    Timeout { uuid: Uuid, bufnum: u32 },
    #[error("sending buffer message: {0}")]
    Send(#[from] SendError),
}

/// Where sample data lands: the shared pool in shared-memory mode, or
/// inline in the prepare message in port mode.
pub enum SampleStore {
    Pool { region: Arc<SharedRegion>, base: usize, pool: Pool },
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AllocSpan {
    /// Pool-relative offset of the whole allocation, guards included.
    base: usize,
    size: usize,
    /// Region-absolute byte offset of the first audible frame.
    ptr: usize,
}

struct Snapshot {
    span: Option<AllocSpan>,
    frames: u32,
    channels: u32,
    sample_rate: f64,
    source: Option<PathBuf>,
    hash: Option<String>,
}

struct BufferRecord {
    span: Option<AllocSpan>,
    frames: u32,
    channels: u32,
    sample_rate: f64,
    source: Option<PathBuf>,
    hash: Option<String>,
    pending_token: Option<Uuid>,
    /// The allocation this preparation is replacing. Freed on success,
    /// restored on failure, so a failed re-allocation never leaves the
    /// slot dangling.
    previous: Option<Snapshot>,
}

impl BufferRecord {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            span: self.span,
            frames: self.frames,
            channels: self.channels,
            sample_rate: self.sample_rate,
            source: self.source.clone(),
            hash: self.hash.clone(),
        }
    }
}

struct PendingOp {
    bufnum: u32,
    resolve: oneshot::Sender<Result<BufferInfo, BufferError>>,
    deadline: Instant,
}

#[derive(Default)]
struct SlotChain {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferInfo {
    pub bufnum: u32,
    pub frames: u32,
    pub channels: u32,
    pub sample_rate: f64,
    /// Region-absolute data pointer; None in port mode.
    pub ptr: Option<usize>,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub allocated: usize,
    pub pending: usize,
    pub pool: Option<PoolStats>,
}

struct State {
    store: SampleStore,
    channel: OscChannel,
    records: HashMap<u32, BufferRecord>,
    pending: HashMap<Uuid, PendingOp>,
    locks: HashMap<u32, SlotChain>,
    max_buffers: u32,
    destroyed: bool,
}

/// Pooled sample-buffer lifecycle: per-slot serialization, engine-side
/// confirmation keyed by uuid, and pending-replacement semantics.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<Mutex<State>>,
}

impl BufferManager {
    pub fn new(store: SampleStore, channel: OscChannel, max_buffers: u32) -> BufferManager {
        BufferManager {
            inner: Arc::new(Mutex::new(State {
                store,
                channel,
                records: HashMap::new(),
                pending: HashMap::new(),
                locks: HashMap::new(),
                max_buffers,
                destroyed: false,
            })),
        }
    }

    pub async fn prepare_from_blob(
        &self,
        bufnum: u32,
        bytes: &[u8],
        opts: DecodeOpts,
    ) -> Result<BufferInfo, BufferError> {
        let audio = decode::decode_wav_bytes(bytes, &opts)?;
        let hash = decode::sample_info(bytes).ok().map(|info| info.hash);
        self.prepare(bufnum, audio, None, hash, DEADLINE_BLOB).await
    }

    pub async fn prepare_from_path(
        &self,
        bufnum: u32,
        path: &Path,
        opts: DecodeOpts,
    ) -> Result<BufferInfo, BufferError> {
        let audio = decode::decode_wav_file(path, &opts)?;
        self.prepare(bufnum, audio, Some(path.to_owned()), None, DEADLINE_FILE).await
    }

    pub async fn prepare_empty(
        &self,
        bufnum: u32,
        frames: u32,
        channels: u32,
        sample_rate: Option<f64>,
    ) -> Result<BufferInfo, BufferError> {
        let audio = DecodedAudio {
            samples: vec![0.0; frames as usize * channels.max(1) as usize],
            channels: channels.max(1),
            sample_rate: sample_rate.unwrap_or(48_000.0),
        };
        self.prepare(bufnum, audio, None, None, DEADLINE_EMPTY).await
    }

    /// Decode and hash a source without allocating anything.
    pub fn sample_info(&self, bytes: &[u8]) -> Result<SampleInfo, BufferError> {
        Ok(decode::sample_info(bytes)?)
    }

    /// Point buffer traffic at a new channel. Records survive; used when
    /// the transport is rebuilt across a reload.
    pub fn set_channel(&self, channel: OscChannel) {
        self.inner.lock().unwrap().channel = channel;
    }

    async fn prepare(
        &self,
        bufnum: u32,
        audio: DecodedAudio,
        source: Option<PathBuf>,
        hash: Option<String>,
        deadline: Duration,
    ) -> Result<BufferInfo, BufferError> {
        {
            let state = self.inner.lock().unwrap();
            if state.destroyed {
                return Err(BufferError::Destroyed);
            }
            if bufnum >= state.max_buffers {
                return Err(BufferError::BadBufnum { bufnum, max: state.max_buffers });
            }
        }

        self.acquire_slot(bufnum).await;

        let begun = self.begin(bufnum, &audio, source, hash, deadline);

        let (uuid, completion) = match begun {
            Ok(begun) => begun,
            Err(e) => {
                self.release_slot(bufnum);
                return Err(e);
            }
        };

        let result = match completion.await {
            Ok(result) => result,
            // resolver dropped without answering: destroy() raced us
            Err(oneshot::Canceled) => Err(BufferError::Destroyed),
        };

        self.release_slot(bufnum);

        log::debug!("buffer {bufnum} preparation {uuid} finished: ok={}", result.is_ok());
        result
    }

    /// Allocate, stage the samples, register the pending op, and tell the
    /// engine. Holds the state lock throughout; nothing here blocks.
    fn begin(
        &self,
        bufnum: u32,
        audio: &DecodedAudio,
        source: Option<PathBuf>,
        hash: Option<String>,
        deadline: Duration,
    ) -> Result<(Uuid, oneshot::Receiver<Result<BufferInfo, BufferError>>), BufferError> {
        let mut state = self.inner.lock().unwrap();

        if state.destroyed {
            return Err(BufferError::Destroyed);
        }

        let frames = audio.frames();
        let channels = audio.channels;
        let sample_bytes = 4 * channels as usize;

        let span = match &mut state.store {
            SampleStore::Pool { region, base, pool } => {
                let guarded_frames = (frames + GUARD_BEFORE + GUARD_AFTER) as usize;
                let size = guarded_frames * sample_bytes;
                let offset = pool.alloc(size)?;

                let absolute = *base + offset;
                let data_ptr = absolute + GUARD_BEFORE as usize * sample_bytes;

                region.fill(absolute, size, 0);
                region.write_from(data_ptr, bytemuck::cast_slice(&audio.samples));

                Some(AllocSpan { base: offset, size, ptr: data_ptr })
            }
            SampleStore::Inline => None,
        };

        let uuid = Uuid::new_v4();

        let record = state.records.entry(bufnum).or_insert_with(|| BufferRecord {
            span: None,
            frames: 0,
            channels: 0,
            sample_rate: 0.0,
            source: None,
            hash: None,
            pending_token: None,
            previous: None,
        });

        if record.span.is_some() || record.frames > 0 {
            record.previous = Some(record.snapshot());
        }

        record.span = span;
        record.frames = frames;
        record.channels = channels;
        record.sample_rate = audio.sample_rate;
        record.source = source;
        record.hash = hash;
        record.pending_token = Some(uuid);

        let (resolve, completion) = oneshot::channel();
        state.pending.insert(uuid, PendingOp {
            bufnum,
            resolve,
            deadline: Instant::now() + deadline,
        });

        let message = prepare_message(uuid, bufnum, frames, channels, audio.sample_rate, span, audio);

        if let Err(e) = state.channel.send(&message) {
            self.fail_locked(&mut state, uuid);
            return Err(e.into());
        }

        Ok((uuid, completion))
    }

    /// `/supersonic/buffer/allocated <uuid> <bufnum>` from the engine.
    pub fn handle_buffer_allocated(&self, uuid: &str, bufnum: u32) {
        let Ok(uuid) = Uuid::parse_str(uuid) else {
            log::warn!("unparseable allocation uuid from engine: {uuid}");
            return;
        };

        let mut state = self.inner.lock().unwrap();

        let Some(op) = state.pending.remove(&uuid) else {
            log::warn!("allocation reply {uuid} matches no pending op (timed out?)");
            return;
        };

        if op.bufnum != bufnum {
            log::warn!("allocation reply {uuid} names buffer {bufnum}, expected {}", op.bufnum);
        }

        // success: the replaced allocation can finally go
        let freed = state.records.get_mut(&op.bufnum).and_then(|record| {
            record.pending_token = None;
            record.previous.take().and_then(|previous| previous.span)
        });
        if let Some(span) = freed {
            if let SampleStore::Pool { pool, .. } = &mut state.store {
                pool.free(span.base, span.size);
            }
        }

        let info = state.records.get(&op.bufnum).map(|record| BufferInfo {
            bufnum: op.bufnum,
            frames: record.frames,
            channels: record.channels,
            sample_rate: record.sample_rate,
            ptr: record.span.map(|span| span.ptr),
            source: record.source.clone(),
        });

        if let Some(info) = info {
            let _ = op.resolve.send(Ok(info));
        }
    }

    /// `/supersonic/buffer/freed <bufnum> <ptr>` from the engine.
    pub fn handle_buffer_freed(&self, bufnum: u32, ptr: usize) {
        let mut state = self.inner.lock().unwrap();

        let Some(record) = state.records.remove(&bufnum) else {
            log::warn!("engine freed unknown buffer {bufnum}");
            return;
        };

        if let Some(span) = record.span {
            if span.ptr != ptr {
                log::warn!("engine freed buffer {bufnum} at {ptr}, allocation says {}", span.ptr);
            }
            if let SampleStore::Pool { pool, .. } = &mut state.store {
                pool.free(span.base, span.size);
            }
        }
    }

    /// Reject every pending op whose deadline has passed, running the
    /// failure path for each. Driven by the supervisor's housekeeping
    /// tick.
    pub fn expire_pending(&self, now: Instant) {
        let mut state = self.inner.lock().unwrap();

        let expired: Vec<Uuid> = state
            .pending
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(uuid, _)| *uuid)
            .collect();

        for uuid in expired {
            log::warn!("buffer preparation {uuid} timed out");
            self.fail_locked(&mut state, uuid);
        }
    }

    /// Failure path: free the staged allocation and put the previous one
    /// back (or drop the record if this was the first preparation).
    fn fail_locked(&self, state: &mut State, uuid: Uuid) {
        let Some(op) = state.pending.remove(&uuid) else { return };

        let freed = match state.records.get_mut(&op.bufnum) {
            Some(record) if record.pending_token == Some(uuid) => {
                record.pending_token = None;
                let current = record.span.take();

                match record.previous.take() {
                    Some(previous) => {
                        record.span = previous.span;
                        record.frames = previous.frames;
                        record.channels = previous.channels;
                        record.sample_rate = previous.sample_rate;
                        record.source = previous.source;
                        record.hash = previous.hash;
                    }
                    None => {
                        state.records.remove(&op.bufnum);
                    }
                }
                current
            }
            _ => None,
        };

        if let Some(span) = freed {
            if let SampleStore::Pool { pool, .. } = &mut state.store {
                pool.free(span.base, span.size);
            }
        }

        let _ = op.resolve.send(Err(BufferError::Timeout { uuid, bufnum: op.bufnum }));
    }

    /// Re-announce every allocated buffer to a freshly loaded engine.
    /// Sample data survives in the shared pool across reloads, so only
    /// the prepare messages need to be replayed.
    pub fn reannounce(&self) -> usize {
        let mut state = self.inner.lock().unwrap();
        let mut announced = 0;

        let records: Vec<(u32, u32, u32, f64, Option<AllocSpan>)> = state
            .records
            .iter()
            .filter(|(_, record)| record.pending_token.is_none())
            .map(|(bufnum, r)| (*bufnum, r.frames, r.channels, r.sample_rate, r.span))
            .collect();

        for (bufnum, frames, channels, sample_rate, span) in records {
            let uuid = Uuid::new_v4();
            let audio = DecodedAudio { samples: Vec::new(), channels, sample_rate };
            let message = prepare_message(uuid, bufnum, frames, channels, sample_rate, span, &audio);

            match state.channel.send(&message) {
                Ok(()) => {
                    // register so the engine's reply finds a home; the
                    // receiver is dropped, nobody awaits these
                    let (resolve, _completion) = oneshot::channel();
                    state.pending.insert(uuid, PendingOp {
                        bufnum,
                        resolve,
                        deadline: Instant::now() + DEADLINE_EMPTY,
                    });
                    announced += 1;
                }
                Err(e) => log::warn!("re-announcing buffer {bufnum}: {e}"),
            }
        }

        announced
    }

    pub fn allocated_buffers(&self) -> Vec<BufferInfo> {
        let state = self.inner.lock().unwrap();

        let mut buffers: Vec<BufferInfo> = state
            .records
            .iter()
            .map(|(bufnum, record)| BufferInfo {
                bufnum: *bufnum,
                frames: record.frames,
                channels: record.channels,
                sample_rate: record.sample_rate,
                ptr: record.span.map(|span| span.ptr),
                source: record.source.clone(),
            })
            .collect();

        buffers.sort_by_key(|info| info.bufnum);
        buffers
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.inner.lock().unwrap();

        BufferStats {
            allocated: state.records.len(),
            pending: state.pending.len(),
            pool: match &state.store {
                SampleStore::Pool { pool, .. } => Some(pool.stats()),
                SampleStore::Inline => None,
            },
        }
    }

    /// Reject all outstanding ops and refuse further work. Slot waiters
    /// are woken so their futures can observe the destruction.
    pub fn destroy(&self) {
        let mut state = self.inner.lock().unwrap();
        state.destroyed = true;

        let uuids: Vec<Uuid> = state.pending.keys().copied().collect();
        for uuid in uuids {
            if let Some(op) = state.pending.remove(&uuid) {
                let _ = op.resolve.send(Err(BufferError::Destroyed));
            }
        }

        for (_, chain) in state.locks.iter_mut() {
            while let Some(waiter) = chain.waiters.pop_front() {
                let _ = waiter.send(());
            }
            chain.busy = false;
        }

        state.records.clear();
    }

    async fn acquire_slot(&self, bufnum: u32) {
        let waiter = {
            let mut state = self.inner.lock().unwrap();
            let chain = state.locks.entry(bufnum).or_default();

            if chain.busy {
                let (tx, rx) = oneshot::channel();
                chain.waiters.push_back(tx);
                Some(rx)
            } else {
                chain.busy = true;
                None
            }
        };

        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }

    fn release_slot(&self, bufnum: u32) {
        let mut state = self.inner.lock().unwrap();

        // hand the slot to the next live waiter, if any
        loop {
            let Some(chain) = state.locks.get_mut(&bufnum) else { return };

            match chain.waiters.pop_front() {
                Some(next) => {
                    if next.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.locks.remove(&bufnum);
                    return;
                }
            }
        }
    }
}

fn prepare_message(
    uuid: Uuid,
    bufnum: u32,
    frames: u32,
    channels: u32,
    sample_rate: f64,
    span: Option<AllocSpan>,
    audio: &DecodedAudio,
) -> Vec<u8> {
    let mut args = vec![
        OscType::String(uuid.to_string()),
        OscType::Int(bufnum as i32),
        OscType::Int(frames as i32),
        OscType::Int(channels as i32),
        OscType::Double(sample_rate),
    ];

    match span {
        Some(span) => args.push(OscType::Long(span.ptr as i64)),
        None => args.push(OscType::Blob(bytemuck::cast_slice(&audio.samples).to_vec())),
    }

    let packet = OscPacket::Message(OscMessage { addr: PREPARE_ADDR.to_owned(), args });
    rosc::encoder::encode(&packet).expect("encoding buffer prepare message")
}
