use cine_core::{Clock, LockStore, Store};
use cine_shared::BookingEvent;
use cine_store::app_config::BusinessRules;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Shared collaborators for the booking services
#[derive(Clone)]
pub struct BookingContext {
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn LockStore>,
    pub clock: Arc<dyn Clock>,
    pub rules: BusinessRules,
    events: broadcast::Sender<BookingEvent>,
}

impl BookingContext {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        rules: BusinessRules,
        events: broadcast::Sender<BookingEvent>,
    ) -> Self {
        Self { store, locks, clock, rules, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.events.subscribe()
    }

    /// Fire-and-forget; having no subscribers is normal.
    pub fn publish(&self, event: BookingEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!("No subscribers for {}", name);
        }
    }
}
