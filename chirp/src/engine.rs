use std::sync::Arc;

use chirp_core::region::SharedRegion;
use chirp_protocol::layout::SharedLayout;
use chirp_protocol::types::SourceId;
use thiserror::Error;

use crate::config::WorldOptions;

/// Output collected from the engine during one quantum: OSC replies and
/// debug text, which the worklet host forwards over the reply and debug
/// channels.
#[derive(Debug, Default)]
pub struct EngineContext {
    replies: Vec<Vec<u8>>,
    debug: Vec<String>,
}

impl EngineContext {
    pub fn reply(&mut self, packet: Vec<u8>) {
        self.replies.push(packet);
    }

    pub fn debug(&mut self, line: impl Into<String>) {
        self.debug.push(line.into());
    }

    pub(crate) fn take(&mut self) -> (Vec<Vec<u8>>, Vec<String>) {
        (std::mem::take(&mut self.replies), std::mem::take(&mut self.debug))
    }
}

/// Boundary contract of the synthesis engine hosted on the worklet
/// thread. The engine is an external collaborator; this crate only moves
/// bytes to and from it.
pub trait Engine: Send {
    /// One inbound OSC packet drained from the IN path.
    fn handle_osc(&mut self, source: SourceId, packet: &[u8], ctx: &mut EngineContext);

    /// Advance one render quantum.
    fn process(&mut self, ctx: &mut EngineContext);
}

/// What the loader needs to instantiate an engine.
pub struct EngineSpec {
    /// The compiled engine module, cached by the supervisor so reload
    /// does not refetch it.
    pub module: Arc<Vec<u8>>,
    pub world: WorldOptions,
    /// Present in shared-memory mode: the engine heap and transport
    /// regions it will run against.
    pub region: Option<Arc<SharedRegion>>,
    pub layout: Option<SharedLayout>,
}

#[derive(Debug, Error)]
pub enum EngineLoadError {
    #[error("invalid engine module: {0}")]
    InvalidModule(String),
    #[error("engine failed to initialize: {0}")]
    Init(String),
}

/// Instantiates engines. `load` is called once at init and again on every
/// reload, always with the cached module bytes.
pub trait EngineFactory: Send + Sync {
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn Engine>, EngineLoadError>;
}

impl<F> EngineFactory for F
    where F: Fn(&EngineSpec) -> Result<Box<dyn Engine>, EngineLoadError> + Send + Sync
{
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn Engine>, EngineLoadError> {
        self(spec)
    }
}
