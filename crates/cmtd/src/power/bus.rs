//! Power-state publication
//!
//! Every state assignment in the state machine is published here, including
//! self-re-entries into `OnStarted`/`OnReset` that restart their sequence.

use super::types::{LinkState, PowerState};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;

/// Maximum number of event-stream subscribers
pub const MAX_EVENT_SUBSCRIBERS: usize = 100;

/// Upstream observer of the modem power lifecycle.
///
/// Callbacks run on the controller and supervisor tasks and must be cheap;
/// hand off to a channel for anything heavier.
pub trait PowerObserver: Send + Sync + 'static {
    /// Called on every power-state assignment
    fn on_power_state(&self, state: PowerState);

    /// Called when the debounced powered classification changes
    fn on_powered(&self, powered: bool);
}

/// Observer that just logs, used by the daemon binary
pub struct LogObserver;

impl PowerObserver for LogObserver {
    fn on_power_state(&self, state: PowerState) {
        info!("power state {}", state.name());
    }

    fn on_powered(&self, powered: bool) {
        info!("modem powered: {}", powered);
    }
}

/// Event broadcast to WebSocket subscribers
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Power state changed
    StateChanged {
        state: PowerState,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Tracked Phonet link state changed
    LinkChanged {
        link: LinkState,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Debounced powered classification changed
    PoweredChanged {
        powered: bool,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Fan-out for power-state assignments: the MTC supervisor queue, the
/// upstream observer, the current-state cell and the event stream.
pub struct PowerBus {
    observer: Arc<dyn PowerObserver>,
    supervisor_tx: mpsc::UnboundedSender<PowerState>,
    state_tx: watch::Sender<PowerState>,
    link_tx: watch::Sender<LinkState>,
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl PowerBus {
    pub fn new(
        observer: Arc<dyn PowerObserver>,
        supervisor_tx: mpsc::UnboundedSender<PowerState>,
        state_tx: watch::Sender<PowerState>,
        link_tx: watch::Sender<LinkState>,
        event_tx: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            observer,
            supervisor_tx,
            state_tx,
            link_tx,
            event_tx,
        }
    }

    /// Publish one state assignment to every consumer.
    pub fn publish(&self, state: PowerState) {
        // Send returns Err when the consumer is gone, which is fine
        let _ = self.supervisor_tx.send(state);
        let _ = self.state_tx.send(state);
        let _ = self.event_tx.send(ControllerEvent::StateChanged {
            state,
            timestamp: chrono::Utc::now(),
        });
        self.observer.on_power_state(state);
    }

    /// Publish a tracked-link edge to the event stream.
    pub fn publish_link(&self, link: LinkState) {
        let _ = self.link_tx.send(link);
        let _ = self.event_tx.send(ControllerEvent::LinkChanged {
            link,
            timestamp: chrono::Utc::now(),
        });
    }
}
