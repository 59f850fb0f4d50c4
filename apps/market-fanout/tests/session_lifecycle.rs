//! Session Lifecycle Integration Tests
//!
//! Login, supersession, expiry and logout through the command surface.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use market_fanout::{
    CommandError, FanoutConfig, FanoutEngine, ManualClock, MarketDataService, SessionRegistry,
    SharedClock, SnapshotStore, TopicHub, Transport,
};

fn setup(timeout: Duration) -> (MarketDataService, Arc<SessionRegistry>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let shared: SharedClock = clock.clone();
    let store = Arc::new(SnapshotStore::new(Arc::clone(&shared)));
    let registry = Arc::new(SessionRegistry::with_timeout(Arc::clone(&shared), timeout));
    let hub: Arc<dyn Transport> = Arc::new(TopicHub::with_defaults());
    let engine = Arc::new(FanoutEngine::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        hub,
        shared,
        FanoutConfig::default(),
    ));
    let service = MarketDataService::new(store, Arc::clone(&registry), engine);
    (service, registry, clock)
}

#[test]
fn relogin_from_same_client_replaces_session() {
    let (service, registry, _) = setup(Duration::from_secs(1800));

    let first = service.login("alice", "terminal-1");
    let second = service.login("alice", "terminal-1");

    assert_ne!(first.id, second.id);
    assert!(!service.validate(first.id));
    assert!(service.validate(second.id));
    assert_eq!(registry.get_user_sessions("alice").len(), 1);
    assert_eq!(
        registry.get_session_by_client_id("terminal-1").map(|s| s.id),
        Some(second.id)
    );
}

#[test]
fn one_user_may_hold_sessions_on_several_clients() {
    let (service, _, _) = setup(Duration::from_secs(1800));

    service.login("alice", "terminal-1");
    service.login("alice", "terminal-2");
    service.login("bob", "terminal-3");

    let stats = service.stats().sessions;
    assert_eq!(stats.total_sessions, 3);
    assert_eq!(stats.unique_users, 2);
    assert_eq!(stats.connected_clients, 3);
}

#[tokio::test]
async fn idle_session_expires_then_disappears_on_sweep() {
    let (service, registry, clock) = setup(Duration::from_secs(60));
    let session = service.login("alice", "terminal-1");

    clock.advance(Duration::from_secs(61));

    assert!(!service.validate(session.id));
    assert_eq!(
        service.subscribe(session.id, ["SHFE".to_string()], Vec::<String>::new()).await,
        Err(CommandError::SessionExpired(session.id))
    );

    assert_eq!(registry.sweep(), 1);
    assert_eq!(
        service.subscribe(session.id, ["SHFE".to_string()], Vec::<String>::new()).await,
        Err(CommandError::SessionNotFound(session.id))
    );
    assert!(registry.get_session_by_client_id("terminal-1").is_none());
}

#[tokio::test]
async fn activity_keeps_a_session_alive() {
    let (service, registry, clock) = setup(Duration::from_secs(60));
    let session = service.login("alice", "terminal-1");

    for _ in 0..4 {
        clock.advance(Duration::from_secs(40));
        assert!(service.session(session.id).is_some());
    }

    assert_eq!(registry.sweep(), 0);
    assert!(service.validate(session.id));
}

#[tokio::test]
async fn logout_clears_every_index() {
    let (service, registry, _) = setup(Duration::from_secs(1800));
    let session = service.login("alice", "terminal-1");
    service
        .subscribe(session.id, ["SHFE".to_string()], ["rb2405".to_string()])
        .await
        .unwrap();

    service.logout(session.id).unwrap();

    assert_eq!(
        service.logout(session.id),
        Err(CommandError::SessionNotFound(session.id))
    );
    assert!(registry.get_sessions_by_exchange("SHFE").is_empty());
    assert!(registry.get_sessions_by_instrument("rb2405").is_empty());
    assert!(registry.get_user_sessions("alice").is_empty());
    assert_eq!(
        service.logout_client("terminal-1"),
        Err(CommandError::ClientNotFound("terminal-1".to_string()))
    );
}

#[tokio::test]
async fn resubscribe_replaces_previous_selection() {
    let (service, registry, _) = setup(Duration::from_secs(1800));
    let session = service.login("alice", "terminal-1");

    service
        .subscribe(session.id, ["SHFE".to_string(), "DCE".to_string()], Vec::<String>::new())
        .await
        .unwrap();
    service
        .subscribe(session.id, ["CFFEX".to_string()], Vec::<String>::new())
        .await
        .unwrap();

    assert!(registry.get_sessions_by_exchange("SHFE").is_empty());
    assert_eq!(registry.get_sessions_by_exchange("CFFEX").len(), 1);
    assert_eq!(
        service.stats().sessions.exchange_subscriptions.get("CFFEX"),
        Some(&1)
    );
}
