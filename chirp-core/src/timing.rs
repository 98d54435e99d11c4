use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chirp_protocol::time::{NtpDuration, NtpTime};
use heapless::HistoryBuffer;

use crate::region::SharedRegion;

const DRIFT_SAMPLE_HISTORY: usize = 16;
const DRIFT_INTERVAL: Duration = Duration::from_secs(1);

const DRIFT_NO_VALUE: i64 = i64::MIN;

#[derive(Clone, Copy)]
struct Anchor {
    ntp: NtpTime,
    mono: Instant,
}

struct ClockInner {
    anchor: Mutex<Option<Anchor>>,
    /// Where to publish the anchor words for the engine, when attached.
    publish: Mutex<Option<(Arc<SharedRegion>, usize)>>,
    drift_ms: AtomicI64,
}

/// Mapping from the host's monotonic clock to the NTP timeline shared
/// with the engine. Cheap to clone; all clones see the same anchor.
#[derive(Clone)]
pub struct NtpClock(Arc<ClockInner>);

impl Default for NtpClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NtpClock {
    pub fn new() -> NtpClock {
        NtpClock(Arc::new(ClockInner {
            anchor: Mutex::new(None),
            publish: Mutex::new(None),
            drift_ms: AtomicI64::new(DRIFT_NO_VALUE),
        }))
    }

    /// Point the clock at the shared anchor region. Takes effect on the
    /// next establish/resync.
    pub fn attach_region(&self, region: Arc<SharedRegion>, offset: usize) {
        *self.0.publish.lock().unwrap() = Some((region, offset));
    }

    /// Anchor the NTP timeline to the current wall clock. Called once at
    /// init and again on every host resume.
    pub fn resync(&self) -> NtpTime {
        let wall = chirp_util::time::now();
        let ntp = NtpTime::from_unix_micros(wall.0);
        let anchor = Anchor { ntp, mono: Instant::now() };

        *self.0.anchor.lock().unwrap() = Some(anchor);
        self.publish_anchor(ntp);

        log::debug!("ntp anchor set: {}.{:#010x}", ntp.seconds(), ntp.fraction());

        ntp
    }

    fn publish_anchor(&self, ntp: NtpTime) {
        let publish = self.0.publish.lock().unwrap();
        if let Some((region, offset)) = publish.as_ref() {
            region.atomic_u32(*offset).store(ntp.seconds(), Ordering::Release);
            region.atomic_u32(*offset + 4).store(ntp.fraction(), Ordering::Release);
        }
    }

    pub fn is_established(&self) -> bool {
        self.0.anchor.lock().unwrap().is_some()
    }

    /// Current NTP time, or None before the anchor is established.
    pub fn try_now(&self) -> Option<NtpTime> {
        let anchor = (*self.0.anchor.lock().unwrap())?;
        let elapsed = anchor.mono.elapsed();
        Some(anchor.ntp.saturating_add(NtpDuration::from_micros(elapsed.as_micros() as u64)))
    }

    /// Convert an NTP due time into a monotonic deadline. Times already
    /// passed clamp to now.
    pub fn deadline_for(&self, due: NtpTime) -> Option<Instant> {
        let now = self.try_now()?;
        let delta = due.delta(now);

        if delta.is_negative() {
            Some(Instant::now())
        } else {
            let micros = delta.abs_duration().to_micros_lossy();
            Some(Instant::now() + Duration::from_micros(micros))
        }
    }

    /// Anchor-relative drift against the wall clock, published by the
    /// drift watcher. None until the watcher has sampled.
    pub fn drift_ms(&self) -> Option<i64> {
        match self.0.drift_ms.load(Ordering::Relaxed) {
            DRIFT_NO_VALUE => None,
            value => Some(value),
        }
    }

    fn sample_drift(&self, history: &mut HistoryBuffer<i64, DRIFT_SAMPLE_HISTORY>) {
        let Some(expected) = self.try_now() else { return };
        let observed = NtpTime::from_unix_micros(chirp_util::time::now().0);

        history.write(observed.delta(expected).to_millis_lossy());

        let mut samples = heapless::Vec::<i64, DRIFT_SAMPLE_HISTORY>::new();
        samples.extend_from_slice(history).unwrap();
        samples.sort_unstable();

        if let Some(median) = samples.get(samples.len() / 2) {
            self.0.drift_ms.store(*median, Ordering::Relaxed);
        }
    }
}

/// Low-frequency watcher comparing the anchored clock against the wall
/// clock. A persistently growing magnitude means the anchor needs a
/// resync sooner than the next host resume.
pub fn start_drift_watcher(clock: NtpClock, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    chirp_util::thread::start("chirp/drift", move || {
        let mut history = HistoryBuffer::new();
        let slice = DRIFT_INTERVAL / 10;

        while !stop.load(Ordering::Relaxed) {
            clock.sample_drift(&mut history);

            // sleep in slices so shutdown doesn't wait out the interval
            for _ in 0..10 {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(slice);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unestablished_clock_has_no_time() {
        let clock = NtpClock::new();
        assert!(!clock.is_established());
        assert!(clock.try_now().is_none());
        assert!(clock.deadline_for(NtpTime::from_parts(100, 0)).is_none());
    }

    #[test]
    fn now_advances_from_anchor() {
        let clock = NtpClock::new();
        let anchored = clock.resync();

        std::thread::sleep(Duration::from_millis(5));

        let now = clock.try_now().unwrap();
        let advanced = now.delta(anchored);
        assert!(!advanced.is_negative());
        assert!(advanced.abs_duration().to_millis_lossy() >= 5);
        assert!(advanced.abs_duration().to_millis_lossy() < 1_000);
    }

    #[test]
    fn resync_publishes_anchor_words() {
        let region = Arc::new(SharedRegion::allocate(16));
        let clock = NtpClock::new();
        clock.attach_region(region.clone(), 8);

        let ntp = clock.resync();

        assert_eq!(region.atomic_u32(8).load(Ordering::Acquire), ntp.seconds());
        assert_eq!(region.atomic_u32(12).load(Ordering::Acquire), ntp.fraction());
    }

    #[test]
    fn past_deadlines_clamp_to_now() {
        let clock = NtpClock::new();
        let now_ntp = clock.resync();

        let past = now_ntp - NtpDuration::from_millis(500);
        let deadline = clock.deadline_for(past).unwrap();
        assert!(deadline.saturating_duration_since(Instant::now()) < Duration::from_millis(5));

        let future = now_ntp + NtpDuration::from_millis(500);
        let deadline = clock.deadline_for(future).unwrap();
        let wait = deadline.saturating_duration_since(Instant::now());
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(500));
    }
}
