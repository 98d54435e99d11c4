use nix::time::{clock_gettime, ClockId};

/// Microseconds since the unix epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallMicros(pub u64);

pub fn now() -> WallMicros {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME)
        .expect("clock_gettime(CLOCK_REALTIME)");

    WallMicros(ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000)
}
