//! Session Registry
//!
//! Owns every [`Session`] together with two identity indices:
//! username → session ids and client id → session id.
//!
//! Mutating paths lock in the order client entry → session entry →
//! user entry. Superseding a client's previous session happens entirely
//! under that client's index entry, so two logins for the same client can
//! never both survive.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use super::{Session, SessionId};
use crate::domain::clock::SharedClock;

/// Default idle timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Outcome of a login.
#[derive(Debug, Clone)]
pub struct SessionOpened {
    /// The new session.
    pub session: Session,
    /// Session removed because it belonged to the same client.
    pub superseded: Option<SessionId>,
}

/// Concurrent session store.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    user_index: DashMap<String, HashSet<SessionId>>,
    client_index: DashMap<String, SessionId>,
    clock: SharedClock,
    timeout: Duration,
}

impl SessionRegistry {
    /// Create a registry with the default idle timeout.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_timeout(clock, DEFAULT_SESSION_TIMEOUT)
    }

    /// Create a registry with a custom idle timeout.
    #[must_use]
    pub fn with_timeout(clock: SharedClock, timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            user_index: DashMap::new(),
            client_index: DashMap::new(),
            clock,
            timeout,
        }
    }

    /// Configured idle timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a session, superseding any live session of the same client.
    pub fn create_session(&self, username: &str, client_id: &str) -> Session {
        self.open_session(username, client_id).session
    }

    /// Like [`Self::create_session`], also reporting the superseded session.
    pub fn open_session(&self, username: &str, client_id: &str) -> SessionOpened {
        let session = Session::new(SessionId::new(), username, client_id, self.clock.now());
        let id = session.id;

        let superseded = match self.client_index.entry(client_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(id);
                self.detach(previous);
                self.attach(&session);
                Some(previous)
            }
            Entry::Vacant(entry) => {
                let _guard = entry.insert(id);
                self.attach(&session);
                None
            }
        };

        if let Some(previous) = superseded {
            tracing::info!(
                session_id = %previous,
                client_id,
                "Superseded previous session for client"
            );
        }
        tracing::info!(session_id = %id, username, client_id, "Session created");

        SessionOpened {
            session,
            superseded,
        }
    }

    /// Mark a session inactive and remove it.
    ///
    /// Returns `false` when the session does not exist, including on a
    /// second logout.
    pub fn logout(&self, id: SessionId) -> bool {
        let removed = self.remove_where(id, |_| true);
        if let Some(session) = &removed {
            tracing::info!(session_id = %id, username = %session.username, "Session logged out");
        }
        removed.is_some()
    }

    /// Log out whichever session the client currently holds.
    pub fn logout_by_client_id(&self, client_id: &str) -> bool {
        let Some(id) = self.client_index.get(client_id).map(|entry| *entry) else {
            return false;
        };
        self.logout(id)
    }

    /// Remove every session idle past the timeout.
    ///
    /// Expiry is re-checked under the session's own lock, so a session
    /// refreshed after the scan survives. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.timeout;

        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired_at(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        let removed = candidates
            .into_iter()
            .filter(|id| {
                self.remove_where(*id, |session| session.is_expired_at(now, timeout))
                    .is_some()
            })
            .count();

        if removed > 0 {
            tracing::info!(removed, "Removed expired sessions");
        }

        removed
    }

    fn remove_where(
        &self,
        id: SessionId,
        predicate: impl FnOnce(&Session) -> bool,
    ) -> Option<Session> {
        let client_id = self.sessions.get(&id)?.client_id.clone();

        let client_entry = self.client_index.entry(client_id);
        let (_, mut session) = self.sessions.remove_if(&id, |_, session| predicate(session))?;
        session.active = false;
        self.unindex_user(&session.username, id);

        if let Entry::Occupied(entry) = client_entry
            && *entry.get() == id
        {
            entry.remove();
        }

        tracing::debug!(session_id = %id, "Session removed");
        Some(session)
    }

    fn attach(&self, session: &Session) {
        self.sessions.insert(session.id, session.clone());
        self.user_index
            .entry(session.username.clone())
            .or_default()
            .insert(session.id);
    }

    fn detach(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            self.unindex_user(&session.username, id);
        }
    }

    fn unindex_user(&self, username: &str, id: SessionId) {
        if let Entry::Occupied(mut entry) = self.user_index.entry(username.to_string()) {
            entry.get_mut().remove(&id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Copy of a session; refreshes its last-activity time.
    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        let now = self.clock.now();
        self.sessions.get_mut(&id).map(|mut entry| {
            entry.touch(now);
            entry.clone()
        })
    }

    /// Session currently held by `client_id`; refreshes it.
    pub fn get_session_by_client_id(&self, client_id: &str) -> Option<Session> {
        let id = self.client_index.get(client_id).map(|entry| *entry)?;
        self.get_session(id)
    }

    /// All sessions of one user.
    #[must_use]
    pub fn get_user_sessions(&self, username: &str) -> Vec<Session> {
        let ids: Vec<SessionId> = self
            .user_index
            .get(username)
            .map(|entry| entry.iter().copied().collect())
            .unwrap_or_default();

        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|entry| entry.clone()))
            .collect()
    }

    /// Whether the session exists; does not refresh it.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Active and not idle past the timeout.
    #[must_use]
    pub fn is_valid(&self, id: SessionId) -> bool {
        let now = self.clock.now();
        self.sessions
            .get(&id)
            .is_some_and(|session| session.active && !session.is_expired_at(now, self.timeout))
    }

    /// Replace both subscription sets.
    ///
    /// Returns `false` when the session does not exist.
    pub fn update_subscription<E, I>(&self, id: SessionId, exchanges: E, instruments: I) -> bool
    where
        E: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        let now = self.clock.now();
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return false;
        };

        session.subscribed_exchanges = exchanges.into_iter().collect();
        session.subscribed_instruments = instruments.into_iter().collect();
        session.touch(now);

        tracing::info!(
            session_id = %id,
            exchanges = ?session.subscribed_exchanges,
            instruments = ?session.subscribed_instruments,
            "Subscription updated"
        );
        true
    }

    /// Copies of every active session.
    #[must_use]
    pub fn get_active_sessions(&self) -> Vec<Session> {
        self.collect_active(|_| true)
    }

    /// Active sessions subscribed to the whole of `exchange_id`.
    #[must_use]
    pub fn get_sessions_by_exchange(&self, exchange_id: &str) -> Vec<Session> {
        self.collect_active(|session| session.is_subscribed_to_exchange(exchange_id))
    }

    /// Active sessions subscribed to `instrument_id` individually.
    #[must_use]
    pub fn get_sessions_by_instrument(&self, instrument_id: &str) -> Vec<Session> {
        self.collect_active(|session| session.is_subscribed_to_instrument(instrument_id))
    }

    fn collect_active(&self, filter: impl Fn(&Session) -> bool) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.active && filter(entry.value()))
            .map(|entry| entry.clone())
            .collect()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let mut active_sessions = 0;
        let mut exchange_subscriptions: BTreeMap<String, usize> = BTreeMap::new();

        for entry in self.sessions.iter().filter(|entry| entry.active) {
            active_sessions += 1;
            for exchange in &entry.subscribed_exchanges {
                *exchange_subscriptions.entry(exchange.clone()).or_default() += 1;
            }
        }

        SessionStats {
            total_sessions: self.sessions.len(),
            active_sessions,
            unique_users: self.user_index.len(),
            connected_clients: self.client_index.len(),
            exchange_subscriptions,
        }
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Stored sessions.
    pub total_sessions: usize,
    /// Sessions with the active flag set.
    pub active_sessions: usize,
    /// Distinct usernames.
    pub unique_users: usize,
    /// Clients holding a session.
    pub connected_clients: usize,
    /// Active sessions per subscribed exchange.
    pub exchange_subscriptions: BTreeMap<String, usize>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::clock::ManualClock;

    fn registry() -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (SessionRegistry::new(clock.clone()), clock)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn create_session_indexes_everything() {
        let (registry, _) = registry();

        let session = registry.create_session("alice", "client-1");

        assert!(registry.is_valid(session.id));
        assert_eq!(registry.get_user_sessions("alice").len(), 1);
        assert_eq!(
            registry.get_session_by_client_id("client-1").unwrap().id,
            session.id
        );
    }

    #[test]
    fn same_client_supersedes() {
        let (registry, _) = registry();

        let first = registry.create_session("alice", "client-1");
        let opened = registry.open_session("alice", "client-1");

        assert_eq!(opened.superseded, Some(first.id));
        assert!(!registry.is_valid(first.id));
        assert!(registry.get_session(first.id).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_user_sessions("alice").len(), 1);
        assert_eq!(registry.stats().connected_clients, 1);
    }

    #[test]
    fn different_clients_coexist() {
        let (registry, _) = registry();

        registry.create_session("alice", "client-1");
        registry.create_session("alice", "client-2");

        let stats = registry.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.unique_users, 1);
        assert_eq!(stats.connected_clients, 2);
    }

    #[test]
    fn update_subscription_replaces() {
        let (registry, _) = registry();
        let session = registry.create_session("alice", "client-1");

        registry.update_subscription(session.id, strings(&["SHFE"]), strings(&["rb2405"]));
        registry.update_subscription(session.id, strings(&["DCE"]), Vec::new());

        let session = registry.get_session(session.id).unwrap();
        assert_eq!(session.subscribed_exchanges.len(), 1);
        assert!(session.is_subscribed_to_exchange("DCE"));
        assert!(session.subscribed_instruments.is_empty());
    }

    #[test]
    fn update_subscription_unknown_session() {
        let (registry, _) = registry();
        assert!(!registry.update_subscription(SessionId::new(), strings(&["SHFE"]), Vec::new()));
    }

    #[test]
    fn logout_twice_reports_not_found() {
        let (registry, _) = registry();
        let session = registry.create_session("alice", "client-1");

        assert!(registry.logout(session.id));
        assert!(!registry.logout(session.id));
        assert!(registry.is_empty());
        assert!(registry.get_user_sessions("alice").is_empty());
        assert_eq!(registry.stats().connected_clients, 0);
    }

    #[test]
    fn logout_by_client_id() {
        let (registry, _) = registry();
        let session = registry.create_session("alice", "client-1");

        assert!(registry.logout_by_client_id("client-1"));
        assert!(!registry.is_valid(session.id));
        assert!(!registry.logout_by_client_id("client-1"));
    }

    #[test]
    fn expiry_invalidates_then_sweep_removes() {
        let (registry, clock) = registry();
        let idle = registry.create_session("alice", "client-1");
        let busy = registry.create_session("bob", "client-2");

        clock.advance(Duration::from_secs(20 * 60));
        registry.get_session(busy.id);
        clock.advance(Duration::from_secs(11 * 60));

        assert!(!registry.is_valid(idle.id));
        assert!(registry.is_valid(busy.id));

        assert_eq!(registry.sweep(), 1);
        assert!(registry.get_session(idle.id).is_none());
        assert!(registry.get_session_by_client_id("client-1").is_none());
        assert!(registry.get_session(busy.id).is_some());
    }

    #[test]
    fn filtered_views() {
        let (registry, _) = registry();
        let a = registry.create_session("alice", "c1");
        let b = registry.create_session("bob", "c2");
        registry.create_session("carol", "c3");

        registry.update_subscription(a.id, strings(&["SHFE"]), Vec::new());
        registry.update_subscription(b.id, strings(&["SHFE", "DCE"]), strings(&["rb2405"]));

        assert_eq!(registry.get_active_sessions().len(), 3);
        assert_eq!(registry.get_sessions_by_exchange("SHFE").len(), 2);
        assert_eq!(registry.get_sessions_by_exchange("DCE").len(), 1);
        assert_eq!(registry.get_sessions_by_instrument("rb2405").len(), 1);

        let stats = registry.stats();
        assert_eq!(stats.exchange_subscriptions.get("SHFE"), Some(&2));
        assert_eq!(stats.exchange_subscriptions.get("DCE"), Some(&1));
    }

    #[test]
    fn concurrent_logins_for_one_client_leave_one_session() {
        use std::thread;

        let (registry, _) = registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        r.create_session(&format!("user{i}"), "shared-client");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
        let survivor = registry.get_session_by_client_id("shared-client").unwrap();
        assert!(registry.is_valid(survivor.id));
        assert_eq!(registry.stats().unique_users, 1);
    }
}
