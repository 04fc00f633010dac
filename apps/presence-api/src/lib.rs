pub mod collab;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use collab::{ChatStore, IdentityProvider, PreferenceStore};
use config::Config;
use gateway::presence::PresenceMap;
use gateway::registry::ConnectionRegistry;
use gateway::router::NotificationRouter;

/// Shared application state available to all route handlers and the
/// background monitor/sweeper tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceMap>,
    pub router: Arc<NotificationRouter>,
    pub identity: Arc<dyn IdentityProvider>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub chat: Arc<dyn ChatStore>,
}
