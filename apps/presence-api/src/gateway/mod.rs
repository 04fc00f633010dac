pub mod events;
pub mod heartbeat;
pub mod presence;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod server;
