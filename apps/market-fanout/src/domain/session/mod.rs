//! Client Sessions
//!
//! Session identity, permissions and per-session subscription sets,
//! plus the concurrent [`SessionRegistry`] that owns them.

mod registry;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub use registry::{DEFAULT_SESSION_TIMEOUT, SessionOpened, SessionRegistry, SessionStats};

use super::clock::age_exceeds;
use super::market::{ExchangeId, InstrumentId};

// =============================================================================
// Session Id
// =============================================================================

const SESSION_ID_PREFIX: &str = "SID-";

/// Unique, never reused session identifier.
///
/// Rendered as `SID-` followed by the simple (hyphenless) form of a v4 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SESSION_ID_PREFIX}{}", self.0.simple())
    }
}

/// A string that is not a rendered [`SessionId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id: {0}")]
pub struct InvalidSessionId(String);

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(SESSION_ID_PREFIX)
            .and_then(|raw| Uuid::try_parse(raw).ok())
            .map(Self)
            .ok_or_else(|| InvalidSessionId(s.to_string()))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Permissions
// =============================================================================

/// Capability granted to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Receive market data pushes.
    MarketData,
    /// Run read-only queries.
    BasicQuery,
    /// Place and cancel orders.
    Trading,
}

impl Permission {
    /// Permissions granted at login.
    pub const DEFAULTS: [Self; 2] = [Self::MarketData, Self::BasicQuery];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "MARKET_DATA",
            Self::BasicQuery => "BASIC_QUERY",
            Self::Trading => "TRADING",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Subscription Signature
// =============================================================================

/// Value-equality key of a session's subscriptions.
///
/// Sessions with equal signatures receive identical data and can share one
/// assembly pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubscriptionSignature {
    /// Subscribed exchanges.
    pub exchanges: BTreeSet<ExchangeId>,
    /// Individually subscribed instruments.
    pub instruments: BTreeSet<InstrumentId>,
}

impl SubscriptionSignature {
    /// True when neither half subscribes to anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.instruments.is_empty()
    }
}

// =============================================================================
// Session
// =============================================================================

/// One logged-in client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Owning user.
    pub username: String,
    /// Client connection id; at most one live session per client.
    pub client_id: String,
    /// Login time.
    pub created_at: DateTime<Utc>,
    /// Last read or command against this session.
    pub last_active: DateTime<Utc>,
    /// Cleared on logout.
    pub active: bool,
    /// Granted permissions.
    pub permissions: BTreeSet<Permission>,
    /// Whole-exchange subscriptions.
    pub subscribed_exchanges: BTreeSet<ExchangeId>,
    /// Individual instrument subscriptions.
    pub subscribed_instruments: BTreeSet<InstrumentId>,
}

impl Session {
    /// Create an active session with default permissions and no subscriptions.
    #[must_use]
    pub fn new(
        id: SessionId,
        username: impl Into<String>,
        client_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            client_id: client_id.into(),
            created_at: now,
            last_active: now,
            active: true,
            permissions: Permission::DEFAULTS.into_iter().collect(),
            subscribed_exchanges: BTreeSet::new(),
            subscribed_instruments: BTreeSet::new(),
        }
    }

    /// Whether `permission` was granted.
    #[must_use]
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Whether the session subscribes to the whole of `exchange_id`.
    #[must_use]
    pub fn is_subscribed_to_exchange(&self, exchange_id: &str) -> bool {
        self.subscribed_exchanges.contains(exchange_id)
    }

    /// Whether the session subscribes to `instrument_id` individually.
    #[must_use]
    pub fn is_subscribed_to_instrument(&self, instrument_id: &str) -> bool {
        self.subscribed_instruments.contains(instrument_id)
    }

    /// Grouping key for fan-out.
    #[must_use]
    pub fn signature(&self) -> SubscriptionSignature {
        SubscriptionSignature {
            exchanges: self.subscribed_exchanges.clone(),
            instruments: self.subscribed_instruments.clone(),
        }
    }

    /// Whether the session has been idle for longer than `timeout`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        age_exceeds(now, self.last_active, timeout)
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active {
            self.last_active = now;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_renders_with_prefix() {
        let id = SessionId::new();
        let rendered = id.to_string();

        assert!(rendered.starts_with("SID-"));
        assert_eq!(rendered.len(), 4 + 32);
        assert_eq!(rendered.matches('-').count(), 1);
    }

    #[test]
    fn session_id_parses_its_own_rendering() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn session_id_rejects_foreign_strings() {
        assert!("SID_1700000000_abc".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
    }

    #[test]
    fn session_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn session_id_serializes_as_string() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn new_session_has_default_permissions() {
        let session = Session::new(SessionId::new(), "alice", "client-1", Utc::now());

        assert!(session.active);
        assert!(session.has_permission(Permission::MarketData));
        assert!(session.has_permission(Permission::BasicQuery));
        assert!(!session.has_permission(Permission::Trading));
        assert!(session.signature().is_empty());
    }

    #[test]
    fn signature_compares_by_value() {
        let now = Utc::now();
        let mut a = Session::new(SessionId::new(), "alice", "c1", now);
        let mut b = Session::new(SessionId::new(), "bob", "c2", now);
        a.subscribed_exchanges.insert("SHFE".to_string());
        b.subscribed_exchanges.insert("SHFE".to_string());

        assert_eq!(a.signature(), b.signature());

        b.subscribed_instruments.insert("rb2405".to_string());
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn permission_wire_names() {
        assert_eq!(Permission::MarketData.to_string(), "MARKET_DATA");
        assert_eq!(
            serde_json::to_string(&Permission::BasicQuery).unwrap(),
            "\"BASIC_QUERY\""
        );
    }
}
