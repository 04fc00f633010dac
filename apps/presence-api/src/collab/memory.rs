//! In-memory collaborator implementations.
//!
//! Stand-ins for the workspace service that owns users, memberships, and
//! preferences. Swap for networked implementations without touching the
//! gateway core.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use collabhub_common::id::{prefix, prefixed_ulid};

use super::{
    AudienceDescriptor, AudienceError, AudienceResolver, ChatError, ChatStore, Identity,
    IdentityProvider, PreferenceError, PreferenceStore, Preferences, StoredMessage,
};

/// Users, session tokens, and work-item memberships.
pub struct MemoryDirectory {
    tokens: DashMap<String, Identity>,
    work_items: DashMap<String, HashSet<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            work_items: DashMap::new(),
        }
    }

    /// Register a user and mint a session token for them.
    pub fn register_user(&self, user_id: &str, username: &str) -> String {
        let token = prefixed_ulid(prefix::TOKEN);
        self.tokens.insert(
            token.clone(),
            Identity {
                user_id: user_id.to_string(),
                username: username.to_string(),
            },
        );
        token
    }

    pub fn add_member(&self, work_item_id: &str, user_id: &str) {
        self.work_items
            .entry(work_item_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl IdentityProvider for MemoryDirectory {
    async fn authenticate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).map(|identity| identity.clone())
    }
}

#[async_trait]
impl AudienceResolver for MemoryDirectory {
    async fn resolve(
        &self,
        descriptor: &AudienceDescriptor,
    ) -> Result<HashSet<String>, AudienceError> {
        match descriptor {
            AudienceDescriptor::User(user_id) => Ok(HashSet::from([user_id.clone()])),
            AudienceDescriptor::Users(user_ids) => Ok(user_ids.clone()),
            AudienceDescriptor::WorkItem(work_item_id) => self
                .work_items
                .get(work_item_id)
                .map(|members| members.clone())
                .ok_or_else(|| AudienceError(format!("unknown work item {work_item_id}"))),
        }
    }
}

/// Per-user preference records; unknown users get the defaults.
pub struct MemoryPreferences {
    inner: DashMap<String, Preferences>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn set(&self, user_id: &str, preferences: Preferences) {
        self.inner.insert(user_id.to_string(), preferences);
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferences {
    async fn preferences(&self, user_id: &str) -> Result<Preferences, PreferenceError> {
        Ok(self
            .inner
            .get(user_id)
            .map(|prefs| prefs.clone())
            .unwrap_or_default())
    }
}

/// Appends accepted messages to a list, which is all the gateway needs to
/// exercise the persist-then-publish contract.
pub struct MemoryChatStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn stored(&self) -> Vec<StoredMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn store_message(
        &self,
        author: &Identity,
        work_item_id: &str,
        body: &str,
    ) -> Result<StoredMessage, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError("empty message body".to_string()));
        }
        let message = StoredMessage {
            id: prefixed_ulid(prefix::MESSAGE),
            work_item_id: work_item_id.to_string(),
            user_id: author.user_id.clone(),
            username: author.username.clone(),
            body: body.to_string(),
            sent_at: Utc::now(),
        };
        self.messages.lock().push(message.clone());
        Ok(message)
    }
}
