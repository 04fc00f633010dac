//! Notification fan-out: audience resolution, preference filtering, and
//! best-effort delivery to live connections.
//!
//! Delivery is at-most-once per live connection per event. A failed write
//! unregisters that one connection; it never blocks or fails delivery to
//! anyone else. Recently delivered events are buffered per user for a short
//! window so a reconnecting client can catch up (at-least-once, deduplicated
//! client-side by event id).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::collab::{AudienceDescriptor, AudienceResolver, PreferenceStore};
use crate::error::GatewayError;

use super::events::{NotificationEvent, ServerFrame};
use super::presence::PresenceStatus;
use super::registry::ConnectionRegistry;

/// Maximum buffered events per user awaiting possible replay.
const MAX_REPLAY_BUFFER: usize = 100;

pub struct NotificationRouter {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<dyn AudienceResolver>,
    preferences: Arc<dyn PreferenceStore>,
    replay: DashMap<String, Mutex<VecDeque<NotificationEvent>>>,
    replay_retention: Duration,
}

impl NotificationRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        membership: Arc<dyn AudienceResolver>,
        preferences: Arc<dyn PreferenceStore>,
        replay_retention: Duration,
    ) -> Self {
        Self {
            registry,
            membership,
            preferences,
            replay: DashMap::new(),
            replay_retention,
        }
    }

    /// Fan an event out to its audience through the notification channel.
    ///
    /// Recipients are dropped (never errored) when: the event is their own,
    /// their preferences suppress it, their preference lookup fails, or they
    /// have no live connections. An unresolvable audience drops the whole
    /// event with a log line and affects nothing else in flight.
    pub async fn publish(&self, event: NotificationEvent, audience: &AudienceDescriptor) {
        let users = match self.membership.resolve(audience).await {
            Ok(users) => users,
            Err(err) => {
                let err = GatewayError::AudienceResolutionFailed(err.to_string());
                tracing::warn!(event_id = %event.id, %err, "dropping event");
                return;
            }
        };

        let now = chrono::Local::now().naive_local();
        for user_id in users {
            if event.origin_user_id.as_deref() == Some(user_id.as_str()) {
                // Self-notifications are never pushed; the author's own chat
                // content still arrives via the content channel.
                continue;
            }
            let prefs = match self.preferences.preferences(&user_id).await {
                Ok(prefs) => prefs,
                Err(err) => {
                    tracing::warn!(%user_id, %err, "preference lookup failed; skipping recipient");
                    continue;
                }
            };
            if !prefs.should_notify(&event, now) {
                tracing::debug!(
                    %user_id,
                    event_id = %event.id,
                    "notification suppressed by preferences"
                );
                continue;
            }
            self.buffer(&user_id, event.clone());
            self.deliver(
                &user_id,
                ServerFrame::Notification {
                    event: event.clone(),
                },
            );
        }
    }

    /// Content-channel delivery: membership-scoped but unfiltered. Chat text
    /// reaches every member's screen, the author's included.
    pub async fn publish_content(&self, frame: ServerFrame, audience: &AudienceDescriptor) {
        let users = match self.membership.resolve(audience).await {
            Ok(users) => users,
            Err(err) => {
                let err = GatewayError::AudienceResolutionFailed(err.to_string());
                tracing::warn!(%err, "dropping content frame");
                return;
            }
        };
        for user_id in users {
            self.deliver(&user_id, frame.clone());
        }
    }

    /// Push a presence change to the user's own connections, so every tab
    /// reflects the shared per-user state.
    pub fn presence_changed(
        &self,
        user_id: &str,
        status: PresenceStatus,
        message: Option<String>,
    ) {
        self.deliver(
            user_id,
            ServerFrame::PresenceUpdate {
                user_id: user_id.to_string(),
                status,
                message,
            },
        );
    }

    /// Events buffered for the user that were published after the one the
    /// client last saw. An unknown (evicted) id yields the whole buffer;
    /// redelivery is idempotent by event id.
    pub fn replay_since(
        &self,
        user_id: &str,
        last_event_id: Option<&str>,
    ) -> Vec<NotificationEvent> {
        let Some(last_event_id) = last_event_id else {
            return Vec::new();
        };
        let Some(entry) = self.replay.get(user_id) else {
            return Vec::new();
        };
        let mut buffer = entry.lock();
        Self::prune_one(&mut buffer, self.replay_retention);

        match buffer.iter().position(|event| event.id == last_event_id) {
            Some(position) => buffer.iter().skip(position + 1).cloned().collect(),
            None => buffer.iter().cloned().collect(),
        }
    }

    /// Drop expired events and empty per-user buffers. Called by the
    /// presence sweeper.
    pub fn prune_replay_buffers(&self) {
        self.replay.retain(|_, buffer| {
            let mut buffer = buffer.lock();
            Self::prune_one(&mut buffer, self.replay_retention);
            !buffer.is_empty()
        });
    }

    fn deliver(&self, user_id: &str, frame: ServerFrame) {
        for connection_id in self.registry.connections_for(user_id) {
            if let Err(err) = self.registry.send(&connection_id, frame.clone()) {
                tracing::warn!(
                    %connection_id,
                    %err,
                    "outbound send failed; dropping connection"
                );
                self.registry.unregister(&connection_id);
            }
        }
    }

    fn buffer(&self, user_id: &str, event: NotificationEvent) {
        let entry = self
            .replay
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut buffer = entry.lock();
        buffer.push_back(event);
        while buffer.len() > MAX_REPLAY_BUFFER {
            buffer.pop_front();
        }
    }

    fn prune_one(buffer: &mut VecDeque<NotificationEvent>, retention: Duration) {
        let now = Utc::now();
        while buffer.front().is_some_and(|event| {
            (now - event.created_at).to_std().unwrap_or(Duration::ZERO) > retention
        }) {
            buffer.pop_front();
        }
    }
}
