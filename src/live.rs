//! Live-query monitor registry.
//!
//! Each live subscription is identified by the server-assigned monitor id
//! carried in the subscribe acknowledgment. Pushed event batches are
//! dispatched to the registered listener in arrival order.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::DriverError;
use crate::protocol::push::LiveQueryEvent;

/// Callbacks for one live-query subscription.
pub trait LiveQueryListener: Send + Sync + 'static {
    fn on_event(&self, event: LiveQueryEvent);
    /// The subscription ended normally (server sent the completion marker
    /// or the client unsubscribed).
    fn on_end(&self);
    /// The subscription ended because the push channel failed.
    fn on_error(&self, error: DriverError);
}

#[derive(Default)]
pub struct LiveQueryRegistry {
    monitors: DashMap<i32, Arc<dyn LiveQueryListener>>,
}

impl LiveQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, monitor_id: i32, listener: Arc<dyn LiveQueryListener>) {
        self.monitors.insert(monitor_id, listener);
    }

    pub fn unregister(&self, monitor_id: i32) -> Option<Arc<dyn LiveQueryListener>> {
        self.monitors.remove(&monitor_id).map(|(_, listener)| listener)
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Deliver one pushed batch. Removes the monitor after its completion
    /// marker.
    pub fn dispatch(&self, monitor_id: i32, events: Vec<LiveQueryEvent>, complete: bool) {
        let Some(listener) = self.monitors.get(&monitor_id).map(|l| Arc::clone(&l)) else {
            debug!(monitor_id, "live events for an unknown monitor dropped");
            return;
        };
        for event in events {
            listener.on_event(event);
        }
        if complete {
            self.monitors.remove(&monitor_id);
            listener.on_end();
        }
    }

    /// Fail every registered monitor, clearing the registry. Used when the
    /// push channel is lost.
    pub fn fail_all<F: Fn() -> DriverError>(&self, error: F) {
        let ids: Vec<i32> = self.monitors.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, listener)) = self.monitors.remove(&id) {
                listener.on_error(error());
            }
        }
    }

    /// End every registered monitor without an error. Used on orderly
    /// shutdown.
    pub fn end_all(&self) {
        let ids: Vec<i32> = self.monitors.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, listener)) = self.monitors.remove(&id) {
                listener.on_end();
            }
        }
    }
}
