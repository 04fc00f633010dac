//! Boundaries to the external collaborators: membership resolution,
//! preference lookup, identity, and chat persistence.
//!
//! The gateway core only ever sees these narrow interfaces. Collaborator
//! failures degrade to "skip this recipient" or "drop this event", never to
//! a failed publish for everyone else.

pub mod memory;
pub mod preferences;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use preferences::{NotificationMode, Preferences};

/// Who an event is for. Resolved to concrete user ids at delivery time;
/// never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceDescriptor {
    /// A single user.
    User(String),
    /// An explicit set of users.
    Users(HashSet<String>),
    /// Everyone collaborating on the given work item.
    WorkItem(String),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct AudienceError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PreferenceError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ChatError(pub String);

/// Authenticated identity resolved from an opaque session token.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// A chat message accepted by the persistence collaborator.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub work_item_id: String,
    pub user_id: String,
    pub username: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Membership resolution ("all collaborators on work item X").
#[async_trait]
pub trait AudienceResolver: Send + Sync {
    async fn resolve(
        &self,
        descriptor: &AudienceDescriptor,
    ) -> Result<HashSet<String>, AudienceError>;
}

/// Persisted per-user notification preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn preferences(&self, user_id: &str) -> Result<Preferences, PreferenceError>;
}

/// Session-token validation. Authentication itself lives elsewhere; the
/// gateway only checks an opaque token at IDENTIFY time.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Chat persistence. Fan-out happens only after a store succeeds, so a
/// failed send is never presented as delivered.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn store_message(
        &self,
        author: &Identity,
        work_item_id: &str,
        body: &str,
    ) -> Result<StoredMessage, ChatError>;
}
