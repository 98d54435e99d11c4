use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chirp_protocol::layout::{LayoutConfig, LayoutError, SharedLayout};
use chirp_protocol::time::NtpDuration;
use serde::Deserialize;
use thiserror::Error;

// rough per-object costs of the engine's own allocations, used to check
// that the configured world fits the engine heap before loading anything
const ENGINE_BASE_BYTES: usize = 4 * 1024 * 1024;
const NODE_BYTES: usize = 512;
const BUFFER_BYTES: usize = 256;
const GRAPHDEF_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Bundles due within this window skip the prescheduler.
    pub bypass_lookahead_s: f64,
    pub prescheduler_capacity: usize,
    pub snapshot_interval_ms: u64,
    pub max_retries: u8,
    pub retry_base_delay_ms: u64,
    /// CAS retries a worker-thread producer spends on the IN ring lock.
    /// The main thread never spins.
    pub worker_max_spins: u32,
    pub memory: MemoryConfig,
    pub world: WorldOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::SharedMemory,
            bypass_lookahead_s: 0.2,
            prescheduler_capacity: 65_536,
            snapshot_interval_ms: 50,
            max_retries: 8,
            retry_base_delay_ms: 10,
            worker_max_spins: 64,
            memory: MemoryConfig::default(),
            world: WorldOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    SharedMemory,
    MessagePort,
}

#[derive(Debug, Error)]
#[error("unknown mode")]
pub struct UnknownMode;

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared-memory" => Ok(Mode::SharedMemory),
            "message-port" => Ok(Mode::MessagePort),
            _ => Err(UnknownMode),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::SharedMemory => write!(f, "shared-memory"),
            Mode::MessagePort => write!(f, "message-port"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub total: usize,
    pub buffer_pool: usize,
    pub mirror_nodes: usize,
    pub capture: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let defaults = LayoutConfig::default();
        MemoryConfig {
            total: defaults.total_size,
            buffer_pool: defaults.buffer_pool_size,
            mirror_nodes: defaults.mirror_capacity,
            capture: defaults.capture_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorldOptions {
    pub num_buffers: u32,
    pub max_nodes: u32,
    pub max_graph_defs: u32,
    pub block_size: u32,
    pub sample_rate: u32,
}

impl Default for WorldOptions {
    fn default() -> Self {
        WorldOptions {
            num_buffers: 1024,
            max_nodes: 1024,
            max_graph_defs: 1024,
            block_size: 128,
            sample_rate: 48_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("shared memory layout: {0}")]
    Layout(LayoutError),
    #[error("engine world needs {required} bytes, heap has {available}")]
    EngineHeapOvercommitted { required: usize, available: usize },
    #[error("lookahead must be positive, got {0}")]
    BadLookahead(f64),
}

impl Config {
    pub fn lookahead(&self) -> NtpDuration {
        NtpDuration::from_secs_f64(self.bypass_lookahead_s)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// One render quantum of the configured world.
    pub fn quantum(&self) -> Duration {
        let micros = self.world.block_size as u64 * 1_000_000 / self.world.sample_rate.max(1) as u64;
        Duration::from_micros(micros.max(500))
    }

    pub fn layout_config(&self) -> LayoutConfig {
        LayoutConfig {
            total_size: self.memory.total,
            buffer_pool_size: self.memory.buffer_pool,
            mirror_capacity: self.memory.mirror_nodes,
            capture_size: self.memory.capture,
        }
    }

    fn engine_estimate(&self) -> usize {
        ENGINE_BASE_BYTES
            + self.world.max_nodes as usize * NODE_BYTES
            + self.world.num_buffers as usize * BUFFER_BYTES
            + self.world.max_graph_defs as usize * GRAPHDEF_BYTES
    }

    /// Compute and validate the shared layout against the configured
    /// world. Shared-memory mode only; port mode carries no region.
    pub fn validated_layout(&self) -> Result<SharedLayout, ConfigError> {
        if self.bypass_lookahead_s <= 0.0 {
            return Err(ConfigError::BadLookahead(self.bypass_lookahead_s));
        }

        let layout = SharedLayout::compute(&self.layout_config()).map_err(ConfigError::Layout)?;

        let required = self.engine_estimate();
        if required > layout.engine_heap.size {
            return Err(ConfigError::EngineHeapOvercommitted {
                required,
                available: layout.engine_heap.size,
            });
        }

        Ok(layout)
    }
}

fn load_file(path: &Path) -> Option<Config> {
    log::debug!("looking for config in {}", path.display());

    let contents = std::fs::read_to_string(path).ok()?;

    match toml::from_str(&contents) {
        Ok(config) => {
            log::info!("reading config from {}", path.display());
            Some(config)
        }
        Err(e) => {
            log::error!("error reading config: {e}");
            None
        }
    }
}

/// Optional `chirp.toml` in the working directory, merged over defaults
/// by serde.
pub fn read() -> Option<Config> {
    load_file(Path::new("chirp.toml"))
}
