//! Connection liveness monitor.
//!
//! Runs on its own timer, decoupled from the notification flow: a slow
//! consumer can never stall the liveness check. One missed deadline is
//! enough to reap, since the client's reconnect controller re-establishes
//! a fresh connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::presence::PresenceMap;
use super::registry::ConnectionRegistry;
use super::router::NotificationRouter;

/// Spawn the monitor loop. Each tick pings every live connection and reaps
/// those past the pong deadline; a user losing their last connection goes
/// offline within the same tick.
pub fn spawn(
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceMap>,
    router: Arc<NotificationRouter>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            run_tick(&registry, &presence, &router, timeout);
        }
    })
}

/// One monitor pass, separated out for tests.
fn run_tick(
    registry: &ConnectionRegistry,
    presence: &PresenceMap,
    router: &NotificationRouter,
    timeout: Duration,
) {
    let mut dropped = registry.reap_stale(timeout);
    dropped.extend(registry.ping_all());

    for (connection_id, user_id) in dropped {
        tracing::debug!(%connection_id, %user_id, "connection reaped by liveness monitor");
        if !registry.has_connections(&user_id) {
            if let Some(change) = presence.disconnect_offline(&user_id, Utc::now()) {
                router.presence_changed(&change.user_id, change.status, change.message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::{MemoryDirectory, MemoryPreferences};
    use crate::gateway::presence::PresenceStatus;
    use tokio::sync::mpsc;

    fn fixture() -> (
        Arc<ConnectionRegistry>,
        Arc<PresenceMap>,
        Arc<NotificationRouter>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new(100));
        let presence = Arc::new(PresenceMap::new());
        let router = Arc::new(NotificationRouter::new(
            registry.clone(),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryPreferences::new()),
            Duration::from_secs(300),
        ));
        (registry, presence, router)
    }

    #[tokio::test]
    async fn reaps_silent_connection_and_takes_user_offline() {
        let (registry, presence, router) = fixture();
        let (tx, mut rx) = mpsc::channel(16);
        let connection_id = registry.register("usr_1", tx).unwrap();
        presence.connect("usr_1", Utc::now());

        // Zero timeout: any connection that has not ponged this instant is
        // past its deadline.
        run_tick(&registry, &presence, &router, Duration::ZERO);

        assert!(registry.connections_for("usr_1").is_empty());
        assert_eq!(presence.status_of("usr_1"), Some(PresenceStatus::Offline));
        let _ = (connection_id, rx.try_recv());
    }

    #[tokio::test]
    async fn responsive_connection_receives_ping_and_survives() {
        let (registry, presence, router) = fixture();
        let (tx, mut rx) = mpsc::channel(16);
        let connection_id = registry.register("usr_1", tx).unwrap();
        presence.connect("usr_1", Utc::now());

        run_tick(&registry, &presence, &router, Duration::from_secs(60));

        assert_eq!(registry.connections_for("usr_1"), vec![connection_id]);
        assert_eq!(presence.status_of("usr_1"), Some(PresenceStatus::Active));
        // The monitor pinged the connection.
        match rx.try_recv().unwrap() {
            crate::gateway::registry::Outbound::Frame(
                crate::gateway::events::ServerFrame::Ping,
            ) => {}
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_with_remaining_connection_stays_online() {
        let (registry, presence, router) = fixture();
        let (tx_live, _rx_live) = mpsc::channel(16);
        let (tx_dead, rx_dead) = mpsc::channel(16);
        drop(rx_dead);

        registry.register("usr_1", tx_live).unwrap();
        registry.register("usr_1", tx_dead).unwrap();
        presence.connect("usr_1", Utc::now());

        // The dead channel fails its ping and is reaped; the live one remains.
        run_tick(&registry, &presence, &router, Duration::from_secs(60));

        assert_eq!(registry.connections_for("usr_1").len(), 1);
        assert_eq!(presence.status_of("usr_1"), Some(PresenceStatus::Active));
    }
}
