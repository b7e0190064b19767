//! Session registry.

use std::sync::Arc;

use dashmap::DashMap;
use rdao_core::{Link, SessionId};
use rdao_settings::ServerSettings;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dao::DaoFactory;
use crate::heartbeat::run_ping_receiver;
use crate::session::Session;

/// Accepts links and runs one [`Session`] per link.
pub struct ReactiveServer {
    factory: Arc<dyn DaoFactory>,
    settings: ServerSettings,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
}

impl ReactiveServer {
    /// Server with default settings.
    pub fn new(factory: impl DaoFactory) -> Self {
        Self::with_settings(factory, ServerSettings::default())
    }

    /// Server with explicit settings.
    pub fn with_settings(factory: impl DaoFactory, settings: ServerSettings) -> Self {
        Self {
            factory: Arc::new(factory),
            settings,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Settings the server was built with.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Start a session on `link`. Must be called inside a tokio runtime.
    pub fn handle_link(&self, link: Link) -> Arc<Session> {
        let Link { sender, receiver } = link;
        let session = Session::new(self.settings.clone(), sender);
        let id = *session.id();
        let _ = self.sessions.insert(id, session.clone());

        let monitor = CancellationToken::new();
        if let Some(window) = self.settings.ping_timeout() {
            drop(tokio::spawn(run_ping_receiver(session.clone(), window, monitor.clone())));
        }

        let sessions = Arc::clone(&self.sessions);
        let factory = Arc::clone(&self.factory);
        let running = session.clone();
        drop(tokio::spawn(async move {
            running.run(receiver, factory).await;
            monitor.cancel();
            let _ = sessions.remove(&id);
            debug!(session_id = %id, "session removed");
        }));
        session
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live session by ID.
    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Close every live session.
    pub fn close_all(&self) {
        for session in self.sessions() {
            session.close();
        }
    }
}
