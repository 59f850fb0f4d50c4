//! Session Command Surface
//!
//! The operations a front-end command layer needs: login, logout,
//! validation, subscription replacement and combined statistics.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::fanout::{FanoutEngine, FanoutStats};
use crate::application::ports::{NoopMetrics, RemovalReason, ServiceMetrics};
use crate::domain::cache::{CacheStats, SnapshotStore};
use crate::domain::session::{Session, SessionId, SessionRegistry, SessionStats};

/// A command was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// No session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session exists but is inactive or idle past the timeout.
    #[error("session expired: {0}")]
    SessionExpired(SessionId),

    /// The client holds no session.
    #[error("no session for client: {0}")]
    ClientNotFound(String),
}

/// Combined statistics of the whole engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    /// Snapshot cache.
    pub cache: CacheStats,
    /// Session registry.
    pub sessions: SessionStats,
    /// Fan-out engine.
    pub fanout: FanoutStats,
}

/// Command facade over the registry, cache and fan-out engine.
#[derive(Clone)]
pub struct MarketDataService {
    store: Arc<SnapshotStore>,
    registry: Arc<SessionRegistry>,
    engine: Arc<FanoutEngine>,
    metrics: Arc<dyn ServiceMetrics>,
}

impl MarketDataService {
    /// Create the facade.
    #[must_use]
    pub fn new(
        store: Arc<SnapshotStore>,
        registry: Arc<SessionRegistry>,
        engine: Arc<FanoutEngine>,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Report logins and removals to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn ServiceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Create a session for `client_id`, replacing any session it held.
    pub fn login(&self, username: &str, client_id: &str) -> Session {
        let opened = self.registry.open_session(username, client_id);
        self.metrics.session_created();
        if opened.superseded.is_some() {
            self.metrics.sessions_removed(RemovalReason::Superseded, 1);
        }
        opened.session
    }

    /// Log out one session.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::SessionNotFound`] when the session does not
    /// exist, including when it was already logged out.
    pub fn logout(&self, session_id: SessionId) -> Result<(), CommandError> {
        if !self.registry.logout(session_id) {
            return Err(CommandError::SessionNotFound(session_id));
        }
        self.metrics.sessions_removed(RemovalReason::Logout, 1);
        Ok(())
    }

    /// Log out whatever session `client_id` holds.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ClientNotFound`] when the client holds none.
    pub fn logout_client(&self, client_id: &str) -> Result<(), CommandError> {
        if !self.registry.logout_by_client_id(client_id) {
            return Err(CommandError::ClientNotFound(client_id.to_string()));
        }
        self.metrics.sessions_removed(RemovalReason::Logout, 1);
        Ok(())
    }

    /// Whether the session is active and not expired.
    #[must_use]
    pub fn validate(&self, session_id: SessionId) -> bool {
        self.registry.is_valid(session_id)
    }

    /// Session details; refreshes its activity.
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.registry.get_session(session_id)
    }

    /// Replace a session's subscriptions and push its full snapshot at once.
    ///
    /// Returns the number of entries pushed.
    ///
    /// # Errors
    ///
    /// Rejects unknown sessions with [`CommandError::SessionNotFound`] and
    /// inactive or expired ones with [`CommandError::SessionExpired`].
    pub async fn subscribe<E, I>(
        &self,
        session_id: SessionId,
        exchanges: E,
        instruments: I,
    ) -> Result<usize, CommandError>
    where
        E: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        if !self.registry.is_valid(session_id) {
            return Err(if self.registry.contains(session_id) {
                CommandError::SessionExpired(session_id)
            } else {
                CommandError::SessionNotFound(session_id)
            });
        }

        if !self
            .registry
            .update_subscription(session_id, exchanges, instruments)
        {
            return Err(CommandError::SessionNotFound(session_id));
        }

        Ok(self.engine.push_full_snapshot(session_id).await)
    }

    /// Combined statistics.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.store.stats(),
            sessions: self.registry.stats(),
            fanout: self.engine.stats(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
