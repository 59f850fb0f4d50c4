//! Broadcast Channel Adapters
//!
//! Implements the [`Transport`] port with tokio broadcast channels, one per
//! topic, for fan-out to any number of listeners.
//!
//! # Architecture
//!
//! The `TopicHub` keeps a channel per topic:
//! - `/topic/market/user/<session>` for pushes addressed to one session
//! - `/topic/market` for broadcast pushes
//!
//! Channels are created when the first listener subscribes. Publishing to a
//! topic nobody listens to succeeds and reaches zero receivers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::application::ports::{DeliveryError, Destination, PushPayload, Transport};
use crate::infrastructure::config::BroadcastSettings;

// =============================================================================
// Configuration
// =============================================================================

/// Topic channel configuration.
#[derive(Debug, Clone, Copy)]
pub struct TopicHubConfig {
    /// Buffered payloads per topic.
    pub topic_capacity: usize,
}

impl Default for TopicHubConfig {
    fn default() -> Self {
        Self {
            topic_capacity: 256,
        }
    }
}

impl From<BroadcastSettings> for TopicHubConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            topic_capacity: settings.topic_capacity,
        }
    }
}

// =============================================================================
// Topic Hub
// =============================================================================

/// Topic-addressed broadcast channels.
///
/// # Example
///
/// ```rust
/// use market_fanout::application::ports::Destination;
/// use market_fanout::domain::session::SessionId;
/// use market_fanout::infrastructure::broadcast::TopicHub;
///
/// let hub = TopicHub::with_defaults();
/// let session = SessionId::new();
///
/// // Listen on the session's private topic
/// let _rx = hub.subscribe(Destination::Session(session));
/// assert_eq!(hub.receiver_count(Destination::Session(session)), 1);
/// ```
#[derive(Debug)]
pub struct TopicHub {
    topics: DashMap<String, broadcast::Sender<Arc<PushPayload>>>,
    capacity: usize,
    closed: AtomicBool,
    published: AtomicU64,
    unheard: AtomicU64,
}

/// Shared topic hub.
pub type SharedTopicHub = Arc<TopicHub>;

impl TopicHub {
    /// Create a hub with the given configuration.
    #[must_use]
    pub fn new(config: TopicHubConfig) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: config.topic_capacity.max(1),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            unheard: AtomicU64::new(0),
        }
    }

    /// Create a hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TopicHubConfig::default())
    }

    /// Listen on a destination's topic, creating it if needed.
    #[must_use]
    pub fn subscribe(&self, destination: Destination) -> broadcast::Receiver<Arc<PushPayload>> {
        self.topics
            .entry(destination.topic())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a payload; returns the number of listeners reached.
    pub fn publish(&self, destination: Destination, payload: Arc<PushPayload>) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let reached = self
            .topics
            .get(&destination.topic())
            .and_then(|sender| sender.send(payload).ok())
            .unwrap_or(0);

        if reached == 0 {
            self.unheard.fetch_add(1, Ordering::Relaxed);
        }
        reached
    }

    /// Listeners on a destination's topic.
    #[must_use]
    pub fn receiver_count(&self, destination: Destination) -> usize {
        self.topics
            .get(&destination.topic())
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop topics nobody listens to. Returns the number dropped.
    pub fn prune_idle(&self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, sender| sender.receiver_count() > 0);
        let pruned = before.saturating_sub(self.topics.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idle topics");
        }
        pruned
    }

    /// Refuse further deliveries and disconnect every listener.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.topics.clear();
        tracing::info!("Topic hub closed");
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> TopicHubStats {
        TopicHubStats {
            topics: self.topics.len(),
            receivers: self
                .topics
                .iter()
                .map(|entry| entry.value().receiver_count())
                .sum(),
            published: self.published.load(Ordering::Relaxed),
            unheard: self.unheard.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Transport for TopicHub {
    async fn deliver(
        &self,
        destination: Destination,
        payload: Arc<PushPayload>,
    ) -> Result<usize, DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Unavailable("topic hub closed".to_string()));
        }
        Ok(self.publish(destination, payload))
    }
}

/// Topic hub statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicHubStats {
    /// Live topics.
    pub topics: usize,
    /// Listeners across all topics.
    pub receivers: usize,
    /// Payloads published.
    pub published: u64,
    /// Payloads that reached no listener.
    pub unheard: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::session::SessionId;

    fn payload() -> Arc<PushPayload> {
        Arc::new(PushPayload::new(Utc::now(), &[]))
    }

    #[test]
    fn receiver_count_tracks_subscribers() {
        let hub = TopicHub::with_defaults();
        let dest = Destination::Session(SessionId::new());

        let _rx1 = hub.subscribe(dest);
        let rx2 = hub.subscribe(dest);
        assert_eq!(hub.receiver_count(dest), 2);

        drop(rx2);
        assert_eq!(hub.receiver_count(dest), 1);
    }

    #[tokio::test]
    async fn session_topics_are_private() {
        let hub = TopicHub::with_defaults();
        let alice = Destination::Session(SessionId::new());
        let bob = Destination::Session(SessionId::new());
        let mut alice_rx = hub.subscribe(alice);
        let mut bob_rx = hub.subscribe(bob);

        assert_eq!(hub.deliver(alice, payload()).await, Ok(1));

        assert!(alice_rx.recv().await.is_ok());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_listener() {
        let hub = TopicHub::with_defaults();
        let mut rx1 = hub.subscribe(Destination::Broadcast);
        let mut rx2 = hub.subscribe(Destination::Broadcast);

        let sent = payload();
        assert_eq!(hub.deliver(Destination::Broadcast, Arc::clone(&sent)).await, Ok(2));

        assert!(Arc::ptr_eq(&rx1.recv().await.unwrap(), &sent));
        assert!(Arc::ptr_eq(&rx2.recv().await.unwrap(), &sent));
    }

    #[tokio::test]
    async fn no_listener_is_not_an_error() {
        let hub = TopicHub::with_defaults();

        let result = hub
            .deliver(Destination::Session(SessionId::new()), payload())
            .await;

        assert_eq!(result, Ok(0));
        assert_eq!(hub.stats().unheard, 1);
    }

    #[test]
    fn prune_idle_drops_abandoned_topics() {
        let hub = TopicHub::with_defaults();
        let kept = Destination::Session(SessionId::new());
        let _rx = hub.subscribe(kept);
        drop(hub.subscribe(Destination::Session(SessionId::new())));

        assert_eq!(hub.prune_idle(), 1);
        assert_eq!(hub.stats().topics, 1);
        assert_eq!(hub.receiver_count(kept), 1);
    }

    #[tokio::test]
    async fn closed_hub_refuses_delivery() {
        let hub = TopicHub::with_defaults();
        let mut rx = hub.subscribe(Destination::Broadcast);

        hub.close();

        assert!(matches!(
            hub.deliver(Destination::Broadcast, payload()).await,
            Err(DeliveryError::Unavailable(_))
        ));
        assert!(rx.recv().await.is_err());
    }
}
