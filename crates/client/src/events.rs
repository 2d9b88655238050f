//! Event dispatch: routes named server-pushed events to subscribers.
//!
//! Registration is append-only and deduplicated by handler identity.
//! Dispatch isolates subscribers from each other and from the receive
//! loop: a failing handler is logged and the rest still run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use oc_protocol::EventFrame;

/// A subscriber for one or more named events.
///
/// One abstraction for all handlers; anything that needs to block
/// simply awaits inside `handle`.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventFrame) -> anyhow::Result<()>;
}

#[derive(Default)]
pub(crate) struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventDispatcher {
    /// Register a handler for an event name. Registering the same
    /// handler twice for the same name is a no-op.
    pub fn on_event(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(event_name.to_owned()).or_default();
        if list.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            tracing::warn!(event = %event_name, "duplicate handler registration ignored");
            return;
        }
        list.push(handler);
        tracing::debug!(
            event = %event_name,
            handlers = list.len(),
            "registered event handler"
        );
    }

    /// Invoke every handler registered for this event, in registration
    /// order.
    pub async fn dispatch(&self, event_name: &str, event: &EventFrame) {
        // Clone the list out so no lock is held across handler awaits.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(event_name)
            .cloned()
            .unwrap_or_default();

        tracing::debug!(
            event = %event_name,
            handlers = handlers.len(),
            "dispatching event"
        );
        for handler in handlers {
            if let Err(err) = handler.handle(event).await {
                tracing::error!(event = %event_name, error = %err, "event handler failed");
            }
        }
    }
}
