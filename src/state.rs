use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::session::SessionContext;

/// Application-wide state shared across handlers
///
/// The session context is the only owner of orchestration state; handlers
/// never reach the engine or the registry any other way.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Orchestration context (gateway, registry, routing)
    pub session: Arc<SessionContext>,
    /// Event bus for session notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: ConfigStore,
        session: Arc<SessionContext>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let events = session.events().clone();
        Arc::new(Self {
            config,
            session,
            events,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
