use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chirp_protocol::types::SourceId;
use rosc::OscPacket;

/// Lifecycle state of the audio host driving the worklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum HostState {
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "suspended")]
    Suspended,
}

/// The public event surface.
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Resumed,
    Reloaded,
    /// An engine-originated OSC packet passed through to subscribers.
    Message { source: SourceId, packet: OscPacket },
    /// One line off the engine's debug stream.
    Debug { source: SourceId, line: String },
    Error { message: String },
    AudioContext(HostState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn Fn(&Event) + Send>;

#[derive(Default)]
struct Registry {
    handlers: Vec<(u64, Handler)>,
    next: u64,
}

/// Typed subscriber registry. Handlers run in registration order; a
/// panicking handler is caught and logged so it cannot take the others
/// down with it.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
        where F: Fn(&Event) + Send + 'static
    {
        let mut registry = self.inner.lock().unwrap();
        let id = registry.next;
        registry.next += 1;
        registry.handlers.push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.inner.lock().unwrap();
        registry.handlers.retain(|(handler_id, _)| *handler_id != id.0);
    }

    pub fn emit(&self, event: Event) {
        let registry = self.inner.lock().unwrap();

        for (id, handler) in &registry.handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                log::error!("event handler {id} panicked, continuing");
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().handlers.clear();
    }
}
