//! Live connection registry: per-user buckets, each connection owning a
//! bounded outbound channel drained by its writer task.
//!
//! Uses `DashMap` keyed by user id so unrelated users never contend on the
//! same shard, with a secondary connection-id index for reverse lookups.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use collabhub_common::id::{prefix, prefixed_ulid};

use crate::error::GatewayError;

use super::events::{ServerFrame, CLOSE_HEARTBEAT_TIMEOUT};

/// Outbound frames queued per connection before the writer task drains
/// them. A connection that falls this far behind is presumed dead.
pub const OUTBOUND_BUFFER: usize = 256;

/// One message on a connection's outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Terminal close; the writer emits the close frame and exits.
    Close { code: u16, reason: &'static str },
}

/// Sender half of a connection's outbound channel.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// One live transport session.
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub created_at: Instant,
    last_pong: Mutex<Instant>,
    sender: OutboundSender,
}

/// Sharded registry of live connections, bucketed by user id.
pub struct ConnectionRegistry {
    buckets: DashMap<String, Vec<Arc<Connection>>>,
    index: DashMap<String, String>,
    count: AtomicUsize,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            index: DashMap::new(),
            count: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Add a connection under the user. Fails only when the global cap is
    /// reached, in which case the handshake should be rejected with a
    /// retryable status.
    pub fn register(
        &self,
        user_id: &str,
        sender: OutboundSender,
    ) -> Result<String, GatewayError> {
        let reserved = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.max_connections).then_some(count + 1)
            });
        if reserved.is_err() {
            return Err(GatewayError::ResourceExhausted(self.max_connections));
        }

        let id = prefixed_ulid(prefix::CONNECTION);
        let connection = Arc::new(Connection {
            id: id.clone(),
            user_id: user_id.to_string(),
            created_at: Instant::now(),
            last_pong: Mutex::new(Instant::now()),
            sender,
        });
        self.buckets
            .entry(user_id.to_string())
            .or_default()
            .push(connection);
        self.index.insert(id.clone(), user_id.to_string());
        Ok(id)
    }

    /// Idempotent removal; no-op if the connection is already gone.
    pub fn unregister(&self, connection_id: &str) {
        let Some((_, user_id)) = self.index.remove(connection_id) else {
            return;
        };
        if let Some(mut bucket) = self.buckets.get_mut(&user_id) {
            let before = bucket.len();
            bucket.retain(|c| c.id != connection_id);
            let removed = before - bucket.len();
            drop(bucket);
            if removed > 0 {
                self.count.fetch_sub(removed, Ordering::SeqCst);
            }
            self.buckets.remove_if(&user_id, |_, bucket| bucket.is_empty());
        }
    }

    /// Point-in-time snapshot of the user's live connection ids.
    pub fn connections_for(&self, user_id: &str) -> Vec<String> {
        self.buckets
            .get(user_id)
            .map(|bucket| bucket.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_connections(&self, user_id: &str) -> bool {
        self.buckets
            .get(user_id)
            .map(|bucket| !bucket.is_empty())
            .unwrap_or(false)
    }

    /// Refresh the connection's last-pong timestamp. Unknown connections
    /// (already reaped) are logged and ignored.
    pub fn touch(&self, connection_id: &str) {
        match self.find(connection_id) {
            Some(connection) => *connection.last_pong.lock() = Instant::now(),
            None => {
                tracing::debug!(%connection_id, "touch on unknown connection (already reaped)");
            }
        }
    }

    /// Best-effort, non-blocking send to one connection. A full or closed
    /// outbound channel means the consumer is dead or hopelessly behind;
    /// the caller should unregister the connection.
    pub fn send(&self, connection_id: &str, frame: ServerFrame) -> Result<(), GatewayError> {
        let connection = self
            .find(connection_id)
            .ok_or_else(|| GatewayError::DeliveryFailed(connection_id.to_string()))?;
        connection
            .sender
            .try_send(Outbound::Frame(frame))
            .map_err(|_| GatewayError::DeliveryFailed(connection_id.to_string()))
    }

    /// Remove every connection whose last pong is older than `timeout`.
    /// Returns the `(connection_id, user_id)` pairs that were reaped.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for entry in self.buckets.iter() {
            for connection in entry.value() {
                if now.duration_since(*connection.last_pong.lock()) > timeout {
                    // Tell the writer to close the socket; the read loop then
                    // finishes its own teardown.
                    let _ = connection.sender.try_send(Outbound::Close {
                        code: CLOSE_HEARTBEAT_TIMEOUT,
                        reason: "Heartbeat timeout",
                    });
                    stale.push((connection.id.clone(), connection.user_id.clone()));
                }
            }
        }
        for (connection_id, _) in &stale {
            self.unregister(connection_id);
        }
        stale
    }

    /// Send a liveness ping to every connection. Connections whose channel
    /// rejects the ping are unregistered and returned.
    pub fn ping_all(&self) -> Vec<(String, String)> {
        let mut dead = Vec::new();
        for entry in self.buckets.iter() {
            for connection in entry.value() {
                if connection
                    .sender
                    .try_send(Outbound::Frame(ServerFrame::Ping))
                    .is_err()
                {
                    dead.push((connection.id.clone(), connection.user_id.clone()));
                }
            }
        }
        for (connection_id, _) in &dead {
            self.unregister(connection_id);
        }
        dead
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_connections
    }

    fn find(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let user_id = self.index.get(connection_id)?;
        let bucket = self.buckets.get(user_id.value())?;
        bucket.iter().find(|c| c.id == connection_id).cloned()
    }
}
