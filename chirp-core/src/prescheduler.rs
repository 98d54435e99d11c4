use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chirp_protocol::metrics::MetricId;
use chirp_protocol::time::{NtpDuration, NtpTime};
use chirp_protocol::types::{SessionId, SourceId};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::channel::{Bypass, SendError};
use crate::metrics::MetricsSink;
use crate::timing::NtpClock;

pub const DEFAULT_CAPACITY: usize = 65_536;
pub const DEFAULT_MAX_RETRIES: u8 = 8;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_RETRY_CAPACITY: usize = 4_096;

/// Tunables and collaborators for one prescheduler worker.
pub struct SchedulerConfig {
    pub bypass: Bypass,
    pub clock: NtpClock,
    pub metrics: MetricsSink,
    pub lookahead: NtpDuration,
    pub capacity: usize,
    pub max_spins: u32,
    /// Retries only exist where a direct write can fail transiently,
    /// i.e. over the shared-memory ring.
    pub retry_enabled: bool,
    pub max_retries: u8,
    pub retry_base_delay: Duration,
    pub retry_capacity: usize,
}

impl SchedulerConfig {
    pub fn new(bypass: Bypass, clock: NtpClock, metrics: MetricsSink) -> SchedulerConfig {
        let retry_enabled = matches!(bypass, Bypass::Ring(_));

        SchedulerConfig {
            bypass,
            clock,
            metrics,
            lookahead: chirp_protocol::DEFAULT_LOOKAHEAD,
            capacity: DEFAULT_CAPACITY,
            max_spins: 64,
            retry_enabled,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_capacity: DEFAULT_RETRY_CAPACITY,
        }
    }
}

enum Command {
    Enqueue {
        source: SourceId,
        payload: Vec<u8>,
        due: NtpTime,
        session: SessionId,
        tag: Option<String>,
    },
    CancelTag(String),
    CancelSession(SessionId),
    CancelSessionTag(SessionId, String),
    CancelAll,
    Purge,
    Wake,
    Stats(Sender<SchedulerStats>),
    Shutdown,
}

/// Producer-side handle to the prescheduler worker. Clone freely; all
/// clones feed the same mailbox.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Command>,
    pending: Arc<AtomicUsize>,
    rejected: Arc<AtomicU64>,
    capacity: usize,
}

impl SchedulerHandle {
    /// Park a bundle until its dispatch deadline. The capacity check is a
    /// reservation, so the heap bound holds even with racing producers.
    pub fn schedule(
        &self,
        source: SourceId,
        payload: Vec<u8>,
        due: NtpTime,
        session: SessionId,
        tag: Option<&str>,
    ) -> Result<(), SendError> {
        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SendError::SchedulerFull);
        }

        let command = Command::Enqueue {
            source,
            payload,
            due,
            session,
            tag: tag.filter(|t| !t.is_empty()).map(str::to_owned),
        };

        self.tx.send(command).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            SendError::SchedulerGone
        })
    }

    pub fn cancel_tag(&self, tag: &str) {
        let _ = self.tx.send(Command::CancelTag(tag.to_owned()));
    }

    pub fn cancel_session(&self, session: SessionId) {
        let _ = self.tx.send(Command::CancelSession(session));
    }

    pub fn cancel_session_tag(&self, session: SessionId, tag: &str) {
        let _ = self.tx.send(Command::CancelSessionTag(session, tag.to_owned()));
    }

    pub fn cancel_all(&self) {
        let _ = self.tx.send(Command::CancelAll);
    }

    /// Drop everything scheduled, including the retry backlog. Used on
    /// resume and reload.
    pub fn purge(&self) {
        let _ = self.tx.send(Command::Purge);
    }

    /// Nudge the worker to run a dispatch pass now, e.g. after the host
    /// resumed and the ring has room again.
    pub fn wake(&self) {
        let _ = self.tx.send(Command::Wake);
    }

    pub fn pending_now(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Option<SchedulerStats> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx.send(Command::Stats(reply_tx)).ok()?;
        reply_rx.recv_timeout(Duration::from_secs(1)).ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Counters satisfying `scheduled == dispatched + cancelled +
/// retries_failed + pending + retry_depth` over any window without a
/// purge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub dispatched: u64,
    pub cancelled: u64,
    pub purged: u64,
    pub rejected: u64,
    pub retries_succeeded: u64,
    pub retries_failed: u64,
    pub pending: usize,
    pub retry_depth: usize,
    pub retry_peak: usize,
    pub min_headroom_ms: Option<i64>,
}

struct Entry {
    source: SourceId,
    payload: Vec<u8>,
    due: NtpTime,
    session: SessionId,
    tag: Option<String>,
}

struct RetryEntry {
    source: SourceId,
    payload: Vec<u8>,
    due: NtpTime,
    attempts: u8,
    first_try: Instant,
    next_try: Instant,
}

/// Min-heap of pending time-tagged bundles with cancel indexes and a
/// demand-driven wake deadline.
///
/// Runs on its own worker thread; every mutation is serialized by the
/// mailbox, so cancellation can never race a dispatch tick. The wake
/// deadline is recomputed after every command, which yields both
/// preemption (an earlier enqueue shortens the next timeout) and idle
/// collapse (an empty heap blocks indefinitely on the mailbox).
pub struct Prescheduler {
    config: SchedulerConfig,
    heap: BinaryHeap<Reverse<(NtpTime, u64)>>,
    entries: HashMap<u64, Entry>,
    by_tag: HashMap<String, HashSet<u64>>,
    by_session: HashMap<SessionId, HashSet<u64>>,
    by_session_tag: HashMap<(SessionId, String), HashSet<u64>>,
    retry: VecDeque<RetryEntry>,
    next_seq: u64,
    pending_shared: Arc<AtomicUsize>,
    rejected_shared: Arc<AtomicU64>,
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    scheduled: u64,
    dispatched: u64,
    cancelled: u64,
    purged: u64,
    retries_succeeded: u64,
    retries_failed: u64,
    retry_peak: usize,
    min_headroom_ms: Option<i64>,
}

impl Prescheduler {
    pub fn spawn(config: SchedulerConfig) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicU64::new(0));

        let handle = SchedulerHandle {
            tx,
            pending: pending.clone(),
            rejected: rejected.clone(),
            capacity: config.capacity,
        };

        let scheduler = Prescheduler {
            config,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            by_tag: HashMap::new(),
            by_session: HashMap::new(),
            by_session_tag: HashMap::new(),
            retry: VecDeque::new(),
            next_seq: 0,
            pending_shared: pending,
            rejected_shared: rejected,
            stats: Stats::default(),
        };

        let worker = chirp_util::thread::start("chirp/presched", move || scheduler.run(rx));

        (handle, worker)
    }

    fn run(mut self, rx: Receiver<Command>) {
        loop {
            let command = match self.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                // nothing scheduled: no timer armed, just wait for work
                None => match rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(Command::Shutdown) => break,
                Some(command) => self.handle(command),
                None => {}
            }

            self.tick();
        }

        log::debug!("prescheduler worker exiting, {} entries pending", self.entries.len());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { source, payload, due, session, tag } => {
                self.enqueue(source, payload, due, session, tag);
            }
            Command::CancelTag(tag) => {
                let seqs = self.by_tag.remove(&tag).unwrap_or_default();
                self.cancel_entries(seqs);
            }
            Command::CancelSession(session) => {
                let seqs = self.by_session.remove(&session).unwrap_or_default();
                self.cancel_entries(seqs);
            }
            Command::CancelSessionTag(session, tag) => {
                let seqs = self.by_session_tag.remove(&(session, tag)).unwrap_or_default();
                self.cancel_entries(seqs);
            }
            Command::CancelAll => {
                let seqs: HashSet<u64> = self.entries.keys().copied().collect();
                self.cancel_entries(seqs);
            }
            Command::Purge => self.purge(),
            Command::Wake => {}
            Command::Stats(reply) => {
                let _ = reply.send(self.snapshot_stats());
            }
            Command::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn enqueue(
        &mut self,
        source: SourceId,
        payload: Vec<u8>,
        due: NtpTime,
        session: SessionId,
        tag: Option<String>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stats.scheduled += 1;

        if let Some(tag) = &tag {
            self.by_tag.entry(tag.clone()).or_default().insert(seq);
            self.by_session_tag.entry((session, tag.clone())).or_default().insert(seq);
        }
        self.by_session.entry(session).or_default().insert(seq);

        self.heap.push(Reverse((due, seq)));
        self.entries.insert(seq, Entry { source, payload, due, session, tag });
    }

    fn unindex(&mut self, seq: u64, entry: &Entry) {
        if let Some(tag) = &entry.tag {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&seq);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
            let key = (entry.session, tag.clone());
            if let Some(set) = self.by_session_tag.get_mut(&key) {
                set.remove(&seq);
                if set.is_empty() {
                    self.by_session_tag.remove(&key);
                }
            }
        }
        if let Some(set) = self.by_session.get_mut(&entry.session) {
            set.remove(&seq);
            if set.is_empty() {
                self.by_session.remove(&entry.session);
            }
        }
    }

    fn cancel_entries(&mut self, seqs: HashSet<u64>) {
        for seq in seqs {
            let Some(entry) = self.entries.remove(&seq) else { continue };
            self.unindex(seq, &entry);
            self.stats.cancelled += 1;
            self.pending_shared.fetch_sub(1, Ordering::AcqRel);
        }

        // cancelled heap keys remain as tombstones; rebuild once they
        // dominate so the heap can't grow without bound
        if self.heap.len() > 2 * self.entries.len() + 64 {
            self.heap = self
                .entries
                .iter()
                .map(|(seq, entry)| Reverse((entry.due, *seq)))
                .collect();
        }
    }

    fn purge(&mut self) {
        let dropped = self.entries.len() + self.retry.len();

        for _ in 0..dropped {
            self.pending_shared.fetch_sub(1, Ordering::AcqRel);
        }

        self.stats.purged += dropped as u64;
        self.heap.clear();
        self.entries.clear();
        self.by_tag.clear();
        self.by_session.clear();
        self.by_session_tag.clear();
        self.retry.clear();
    }

    /// Earliest live heap entry, discarding cancelled tombstones.
    fn peek_live(&mut self) -> Option<(NtpTime, u64)> {
        while let Some(&Reverse((due, seq))) = self.heap.peek() {
            if self.entries.contains_key(&seq) {
                return Some((due, seq));
            }
            self.heap.pop();
        }
        None
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        let lookahead = self.config.lookahead;
        let heap_deadline = self.peek_live().map(|(due, _)| {
            self.config
                .clock
                .deadline_for(due.saturating_sub(lookahead))
                // no clock yet: run the dispatch pass immediately
                .unwrap_or_else(Instant::now)
        });

        let retry_deadline = self.retry.iter().map(|r| r.next_try).min();

        match (heap_deadline, retry_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Dispatch every entry inside the lookahead window, then retry the
    /// backlog that has reached its next attempt time.
    fn tick(&mut self) {
        let lookahead_bits = self.config.lookahead.to_bits() as i64;

        loop {
            let now = self.config.clock.try_now();
            let Some((due, seq)) = self.peek_live() else { break };

            let ready = match now {
                Some(now) => due.delta(now).to_bits() <= lookahead_bits,
                None => true,
            };
            if !ready {
                break;
            }

            self.heap.pop();
            let entry = self.entries.remove(&seq).expect("live heap entry has an entry");
            self.unindex(seq, &entry);
            self.dispatch(entry);
        }

        self.drain_retries();
    }

    fn dispatch(&mut self, entry: Entry) {
        match self.config.bypass.send(entry.source, &entry.payload, self.config.max_spins) {
            Ok(()) => self.record_dispatched(entry.due),
            Err(SendError::RingFull) if self.config.retry_enabled => {
                self.push_retry(entry);
            }
            Err(e) => {
                log::warn!("prescheduler dispatch failed, dropping bundle: {e}");
                self.stats.retries_failed += 1;
                self.pending_shared.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn record_dispatched(&mut self, due: NtpTime) {
        self.stats.dispatched += 1;
        self.pending_shared.fetch_sub(1, Ordering::AcqRel);

        // headroom: how far past the wake deadline (due - lookahead) the
        // dispatch landed; the minimum since boot is the health signal
        if let Some(now) = self.config.clock.try_now() {
            let deadline = due.saturating_sub(self.config.lookahead);
            let headroom_ms = now.delta(deadline).to_millis_lossy();

            let min = self.stats.min_headroom_ms.map_or(headroom_ms, |m| m.min(headroom_ms));
            self.stats.min_headroom_ms = Some(min);

            self.config
                .metrics
                .observe_min(MetricId::MinHeadroomMs, headroom_ms.clamp(0, (u32::MAX - 1) as i64) as u32);
        }
    }

    fn push_retry(&mut self, entry: Entry) {
        if self.retry.len() >= self.config.retry_capacity {
            log::warn!("retry queue full, dropping bundle due {:?}", entry.due);
            self.stats.retries_failed += 1;
            self.pending_shared.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let now = Instant::now();
        self.retry.push_back(RetryEntry {
            source: entry.source,
            payload: entry.payload,
            due: entry.due,
            attempts: 1,
            first_try: now,
            next_try: now + self.config.retry_base_delay,
        });
        self.stats.retry_peak = self.stats.retry_peak.max(self.retry.len());
    }

    fn drain_retries(&mut self) {
        if self.retry.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut kept = VecDeque::with_capacity(self.retry.len());

        while let Some(mut entry) = self.retry.pop_front() {
            if entry.next_try > now {
                kept.push_back(entry);
                continue;
            }

            match self.config.bypass.send(entry.source, &entry.payload, self.config.max_spins) {
                Ok(()) => {
                    self.stats.retries_succeeded += 1;
                    self.record_dispatched(entry.due);
                }
                Err(_) => {
                    entry.attempts += 1;
                    if entry.attempts > self.config.max_retries {
                        log::warn!(
                            "dropping bundle after {} attempts over {:?}",
                            entry.attempts,
                            entry.first_try.elapsed(),
                        );
                        self.stats.retries_failed += 1;
                        self.pending_shared.fetch_sub(1, Ordering::AcqRel);
                    } else {
                        // exponential backoff from the base delay
                        let backoff = self.config.retry_base_delay * (1u32 << (entry.attempts - 1).min(6));
                        entry.next_try = now + backoff;
                        kept.push_back(entry);
                    }
                }
            }
        }

        self.retry = kept;
    }

    fn snapshot_stats(&mut self) -> SchedulerStats {
        // drop tombstones so `pending` reflects live entries only
        self.peek_live();

        SchedulerStats {
            scheduled: self.stats.scheduled,
            dispatched: self.stats.dispatched,
            cancelled: self.stats.cancelled,
            purged: self.stats.purged,
            rejected: self.rejected_shared.load(Ordering::Relaxed),
            retries_succeeded: self.stats.retries_succeeded,
            retries_failed: self.stats.retries_failed,
            pending: self.entries.len(),
            retry_depth: self.retry.len(),
            retry_peak: self.stats.retry_peak,
            min_headroom_ms: self.stats.min_headroom_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chirp_protocol::classify::BUNDLE_MAGIC;

    use super::*;
    use crate::metrics::LocalMetrics;
    use crate::region::SharedRegion;
    use crate::ring::Ring;

    fn bundle_at(due: NtpTime) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(BUNDLE_MAGIC);
        packet.extend_from_slice(&due.seconds().to_be_bytes());
        packet.extend_from_slice(&due.fraction().to_be_bytes());
        packet
    }

    fn test_ring(size: usize) -> Ring {
        let region = Arc::new(SharedRegion::allocate(256 + size));
        Ring::new(region, 0, 256, size, 256, true)
    }

    struct Harness {
        handle: SchedulerHandle,
        ring: Ring,
        clock: NtpClock,
    }

    fn harness_with(configure: impl FnOnce(&mut SchedulerConfig)) -> Harness {
        let ring = test_ring(64 * 1024);
        let clock = NtpClock::new();
        clock.resync();

        let mut config = SchedulerConfig::new(
            Bypass::Ring(ring.clone()),
            clock.clone(),
            MetricsSink::Local(LocalMetrics::new()),
        );
        config.lookahead = NtpDuration::from_millis(100);
        configure(&mut config);

        let (handle, _worker) = Prescheduler::spawn(config);
        Harness { handle, ring, clock }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    impl Harness {
        fn schedule_in(&self, millis: u64, session: SessionId, tag: Option<&str>) {
            let due = self.clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(millis));
            self.handle
                .schedule(SourceId(1), bundle_at(due), due, session, tag)
                .unwrap();
        }

        fn drain_ring(&self) -> usize {
            let mut count = 0;
            while self.ring.read().is_some() {
                count += 1;
            }
            count
        }

        fn stats(&self) -> SchedulerStats {
            self.handle.stats().unwrap()
        }
    }

    fn sleep_ms(millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }

    #[test]
    fn dispatches_at_the_lookahead_deadline() {
        let h = harness();

        // due in 300ms with 100ms lookahead: dispatch lands around +200ms
        h.schedule_in(300, SessionId(0), None);

        sleep_ms(120);
        assert_eq!(h.drain_ring(), 0, "dispatched before the deadline");

        sleep_ms(160);
        assert_eq!(h.drain_ring(), 1);

        let stats = h.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.pending, 0);
        let headroom = stats.min_headroom_ms.unwrap();
        assert!((0..100).contains(&headroom), "headroom {headroom}ms");
    }

    #[test]
    fn due_exactly_at_lookahead_dispatches_on_first_tick() {
        let h = harness();

        // delta == lookahead classifies as far-future and must go out on
        // the first pass
        h.schedule_in(100, SessionId(0), None);
        sleep_ms(50);
        assert_eq!(h.drain_ring(), 1);
    }

    #[test]
    fn preemption_by_earlier_enqueue() {
        let h = harness();

        h.schedule_in(2_000, SessionId(0), Some("far"));
        sleep_ms(50);
        h.schedule_in(300, SessionId(0), Some("soon"));

        sleep_ms(350);
        assert_eq!(h.drain_ring(), 1, "only the preempting bundle is due");

        let stats = h.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.pending, 1);

        h.handle.cancel_tag("far");
        sleep_ms(30);
        assert_eq!(h.stats().pending, 0);
    }

    #[test]
    fn repeated_preemption() {
        let h = harness();

        h.schedule_in(2_000, SessionId(0), Some("t2s"));
        sleep_ms(20);
        h.schedule_in(1_000, SessionId(0), Some("t1s"));
        sleep_ms(20);
        h.schedule_in(500, SessionId(0), Some("t500"));

        sleep_ms(560);
        assert_eq!(h.stats().dispatched, 1, "only the 0.5s bundle by 600ms");

        sleep_ms(600);
        assert_eq!(h.stats().dispatched, 2, "the 1s bundle joins by 1.2s");

        h.handle.cancel_tag("t2s");
        sleep_ms(30);
        assert_eq!(h.stats().pending, 0);
        assert_eq!(h.drain_ring(), 2);
    }

    #[test]
    fn equal_due_times_dispatch_in_enqueue_order() {
        let h = harness();

        let due = h.clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(250));
        for index in 0..5u32 {
            let mut payload = bundle_at(due);
            payload.extend_from_slice(&index.to_ne_bytes());
            h.handle.schedule(SourceId(1), payload, due, SessionId(0), None).unwrap();
        }

        sleep_ms(250);

        for expected in 0..5u32 {
            let frame = h.ring.read().unwrap();
            assert_eq!(&frame.payload[16..], &expected.to_ne_bytes());
        }
    }

    #[test]
    fn duplicate_payloads_are_distinct_entries() {
        let h = harness();

        let due = h.clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(10_000));
        let payload = bundle_at(due);
        h.handle.schedule(SourceId(1), payload.clone(), due, SessionId(0), None).unwrap();
        h.handle.schedule(SourceId(1), payload, due, SessionId(0), None).unwrap();

        sleep_ms(30);
        assert_eq!(h.stats().pending, 2);
    }

    #[test]
    fn cancel_by_session_and_by_pair() {
        let h = harness();

        h.schedule_in(10_000, SessionId(1), Some("a"));
        h.schedule_in(10_000, SessionId(1), Some("b"));
        h.schedule_in(10_000, SessionId(2), Some("a"));
        h.schedule_in(10_000, SessionId(2), None);

        sleep_ms(30);

        h.handle.cancel_session_tag(SessionId(2), "a");
        sleep_ms(30);
        let stats = h.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 3);

        h.handle.cancel_session(SessionId(1));
        sleep_ms(30);
        let stats = h.stats();
        assert_eq!(stats.cancelled, 3);
        assert_eq!(stats.pending, 1);

        // the empty-tag bundle has no tag index entry; cancelling a tag
        // it never carried touches nothing
        h.handle.cancel_tag("");
        sleep_ms(30);
        assert_eq!(h.stats().pending, 1);
    }

    #[test]
    fn cancel_all_is_idempotent() {
        let h = harness();

        for _ in 0..10 {
            h.schedule_in(10_000, SessionId(0), Some("batch"));
        }
        sleep_ms(30);

        h.handle.cancel_all();
        sleep_ms(30);
        let stats = h.stats();
        assert_eq!(stats.cancelled, 10);
        assert_eq!(stats.pending, 0);

        h.handle.cancel_all();
        sleep_ms(30);
        assert_eq!(h.stats().cancelled, 10, "second cancel_all counts nothing");

        // cancel-to-idle-to-active: the worker arms again for new work
        h.schedule_in(200, SessionId(0), None);
        sleep_ms(300);
        let stats = h.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn capacity_is_a_hard_bound() {
        let h = harness_with(|config| config.capacity = 4);

        let due = h.clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(10_000));
        for _ in 0..4 {
            h.handle.schedule(SourceId(1), bundle_at(due), due, SessionId(0), None).unwrap();
        }

        let overflow = h.handle.schedule(SourceId(1), bundle_at(due), due, SessionId(0), None);
        assert_eq!(overflow, Err(SendError::SchedulerFull));

        sleep_ms(30);
        let stats = h.stats();
        assert_eq!(stats.scheduled, 4);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn ring_backpressure_flows_into_the_retry_queue() {
        // a ring this small only fits a few 200-byte frames
        let small = test_ring(1024);
        let clock = NtpClock::new();
        clock.resync();

        let mut config = SchedulerConfig::new(
            Bypass::Ring(small.clone()),
            clock.clone(),
            MetricsSink::Local(LocalMetrics::new()),
        );
        config.lookahead = NtpDuration::from_millis(100);
        config.retry_base_delay = Duration::from_millis(5);

        let (handle, _worker) = Prescheduler::spawn(config);

        let due = clock.try_now().unwrap().saturating_add(NtpDuration::from_millis(150));
        for _ in 0..6 {
            let mut payload = bundle_at(due);
            payload.resize(200, 0);
            handle.schedule(SourceId(1), payload, due, SessionId(0), None).unwrap();
        }

        sleep_ms(120);
        let stats = handle.stats().unwrap();
        assert!(stats.retry_depth > 0, "backpressure should queue retries");
        assert!(stats.retry_peak > 0);
        assert_eq!(stats.retries_failed, 0);
        assert_eq!(
            stats.scheduled,
            stats.dispatched + stats.pending as u64 + stats.retry_depth as u64,
        );

        // the consumer comes back; the backlog drains inside the backoff
        // window with no retry exhausted
        let mut drained = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while drained < 6 && Instant::now() < deadline {
            match small.read() {
                Some(_) => drained += 1,
                None => sleep_ms(5),
            }
        }
        assert_eq!(drained, 6);

        sleep_ms(50);
        let stats = handle.stats().unwrap();
        assert_eq!(stats.retry_depth, 0);
        assert_eq!(stats.retries_failed, 0);
        assert_eq!(stats.dispatched, 6);
        assert!(stats.retries_succeeded >= 1);
    }

    #[test]
    fn purge_clears_everything() {
        let h = harness();

        for _ in 0..5 {
            h.schedule_in(10_000, SessionId(0), Some("x"));
        }
        sleep_ms(30);

        h.handle.purge();
        sleep_ms(30);

        let stats = h.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.purged, 5);
        assert_eq!(stats.cancelled, 0, "purge is lifecycle, not cancellation");
        assert_eq!(h.handle.pending_now(), 0);
    }

    #[test]
    fn accounting_identity_holds() {
        let h = harness();

        for index in 0..20u64 {
            let tag = if index % 2 == 0 { Some("even") } else { None };
            h.schedule_in(if index < 10 { 250 } else { 10_000 }, SessionId(0), tag);
        }

        sleep_ms(400);
        h.handle.cancel_tag("even");
        sleep_ms(50);

        let stats = h.stats();
        assert_eq!(stats.scheduled, 20);
        assert_eq!(
            stats.scheduled,
            stats.dispatched
                + stats.cancelled
                + stats.retries_failed
                + stats.pending as u64
                + stats.retry_depth as u64,
        );
    }
}
