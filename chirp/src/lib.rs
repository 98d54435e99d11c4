pub mod config;
pub mod engine;
pub mod events;
pub mod stats;
pub mod supervisor;
pub mod synthdef;
pub mod transport;
pub mod workers;
pub mod worklet;

pub use config::{Config, Mode, WorldOptions};
pub use engine::{Engine, EngineContext, EngineFactory, EngineLoadError, EngineSpec};
pub use events::{Event, EventBus, HostState};
pub use supervisor::{DispatchError, InitError, Supervisor, SyncError, OSC_DENYLIST};
pub use transport::{ChannelOpts, Transport};
