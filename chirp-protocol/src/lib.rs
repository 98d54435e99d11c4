#![no_std]

#[cfg(test)]
extern crate std;

pub mod classify;
pub mod layout;
pub mod metrics;
pub mod mirror;
pub mod time;
pub mod types;

use time::NtpDuration;

pub const WASM_PAGE_SIZE: usize = 64 * 1024;

pub const IN_RING_SIZE: usize = 768 * 1024;
pub const OUT_RING_SIZE: usize = 128 * 1024;
pub const DEBUG_RING_SIZE: usize = 64 * 1024;

// largest payload a single frame may carry, per ring. the IN ring takes
// whole synthdefs and buffer side-channel messages; the reply and debug
// rings carry small packets and single text lines.
pub const IN_MAX_PAYLOAD: usize = 64 * 1024;
pub const OUT_MAX_PAYLOAD: usize = 8 * 1024;
pub const DEBUG_MAX_PAYLOAD: usize = 2 * 1024;

/// Bundles due within this window skip the prescheduler entirely; the
/// engine's own sample-accurate scheduler handles sub-window timing.
pub const DEFAULT_LOOKAHEAD: NtpDuration = NtpDuration::from_millis(200);
