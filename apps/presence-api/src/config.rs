/// Presence gateway configuration, loaded from environment variables.
///
/// Heartbeat cadence, presence timers, and the reconnect schedule are
/// configuration, not protocol; clients receive the values they need in
/// the READY payload.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Interval between server-initiated liveness pings (ms).
    pub heartbeat_interval_ms: u64,
    /// A connection with no pong for longer than this is reaped (ms).
    pub heartbeat_timeout_ms: u64,
    /// Inactivity window before `active` decays to `away` (ms).
    pub away_timeout_ms: u64,
    /// Inactivity window before auto-AFK kicks in, for users who enabled it (ms).
    pub afk_timeout_ms: u64,
    /// Base delay of the client reconnect schedule (ms).
    pub reconnect_base_ms: u64,
    /// Upper bound on any single reconnect delay (ms).
    pub reconnect_cap_ms: u64,
    /// Reconnect attempts before the client gives up.
    pub reconnect_max_attempts: u32,
    /// Hard cap on concurrently registered connections.
    pub max_connections: usize,
    /// How often the presence sweeper runs (ms).
    pub presence_sweep_interval_ms: u64,
    /// How long offline presence entries are retained before cleanup (ms).
    pub presence_retention_ms: u64,
    /// How long delivered events stay replayable for reconnecting clients (ms).
    pub replay_retention_ms: u64,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// default for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            port: env_or("PORT", 4003),
            heartbeat_interval_ms: env_or("HEARTBEAT_INTERVAL_MS", 30_000),
            heartbeat_timeout_ms: env_or("HEARTBEAT_TIMEOUT_MS", 45_000),
            away_timeout_ms: env_or("AWAY_TIMEOUT_MS", 5 * 60 * 1000),
            afk_timeout_ms: env_or("AFK_TIMEOUT_MS", 30 * 60 * 1000),
            reconnect_base_ms: env_or("RECONNECT_BASE_MS", 1_000),
            reconnect_cap_ms: env_or("RECONNECT_CAP_MS", 30_000),
            reconnect_max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", 10),
            max_connections: env_or("MAX_CONNECTIONS", 1_000),
            presence_sweep_interval_ms: env_or("PRESENCE_SWEEP_INTERVAL_MS", 15_000),
            presence_retention_ms: env_or("PRESENCE_RETENTION_MS", 5 * 60 * 1000),
            replay_retention_ms: env_or("REPLAY_RETENTION_MS", 5 * 60 * 1000),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
