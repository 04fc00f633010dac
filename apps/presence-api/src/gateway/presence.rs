//! Per-user presence state machine.
//!
//! Presence is per-**user**, not per-connection: two tabs of the same user
//! share one state, and mutations are serialized through a per-user lock.
//! Signal-driven mutations carry the triggering timestamp; a mutation older
//! than the one that produced the current state is stale and discarded.
//! Lifecycle transitions (connect, last-connection-closed) and sweeper
//! timers are server-authoritative and bypass the staleness check.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::collab::{PreferenceStore, Preferences};

use super::router::NotificationRouter;

/// A user's base presence status. `outside_hours` is an overlay computed at
/// read time (see [`effective_status`]) and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Away,
    Afk,
    Break,
    OutsideHours,
    Offline,
}

/// Per-user presence state.
struct UserPresence {
    status: PresenceStatus,
    /// Set only when AFK was entered via an explicit toggle. Explicit AFK is
    /// sticky: activity alone never clears it. Auto-AFK is not.
    afk_explicit: bool,
    status_message: Option<String>,
    last_activity: DateTime<Utc>,
    /// Timestamp of the mutation that produced the current state.
    updated_at: DateTime<Utc>,
    break_until: Option<DateTime<Utc>>,
}

impl UserPresence {
    fn new(ts: DateTime<Utc>) -> Self {
        Self {
            status: PresenceStatus::Active,
            afk_explicit: false,
            status_message: None,
            last_activity: ts,
            updated_at: ts,
            break_until: None,
        }
    }

    fn enter(&mut self, status: PresenceStatus, ts: DateTime<Utc>) {
        self.status = status;
        self.updated_at = ts;
        if status != PresenceStatus::Afk {
            self.afk_explicit = false;
        }
        if status != PresenceStatus::Afk && status != PresenceStatus::Break {
            self.status_message = None;
        }
        if status != PresenceStatus::Break {
            self.break_until = None;
        }
    }
}

/// A state change to fan out to the user's connections.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub user_id: String,
    pub status: PresenceStatus,
    pub message: Option<String>,
}

/// Thread-safe presence table: one locked entry per user.
pub struct PresenceMap {
    inner: DashMap<String, Mutex<UserPresence>>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// A new connection registered for the user. First connection (or a
    /// reconnect after `offline`) enters `active`.
    pub fn connect(&self, user_id: &str, now: DateTime<Utc>) -> Option<StateChange> {
        let entry = self
            .inner
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(UserPresence::new(now)));
        let mut presence = entry.lock();

        presence.last_activity = now;
        if presence.status == PresenceStatus::Offline {
            presence.enter(PresenceStatus::Active, now);
            return Some(StateChange {
                user_id: user_id.to_string(),
                status: PresenceStatus::Active,
                message: None,
            });
        }
        // Additional tabs join the existing state (afk/break survive).
        None
    }

    /// The user's last connection closed.
    pub fn disconnect_offline(&self, user_id: &str, now: DateTime<Utc>) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        if presence.status == PresenceStatus::Offline {
            return None;
        }
        presence.enter(PresenceStatus::Offline, now);
        Some(StateChange {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            message: None,
        })
    }

    /// An activity signal (keypress, click, page-visible). Clears automatic
    /// away and automatic AFK; explicit AFK and breaks are untouched.
    pub fn activity(&self, user_id: &str, ts: DateTime<Utc>) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        if self.is_stale(user_id, &presence, ts) {
            return None;
        }
        presence.last_activity = ts;

        match presence.status {
            PresenceStatus::Away => {
                presence.enter(PresenceStatus::Active, ts);
                Some(StateChange {
                    user_id: user_id.to_string(),
                    status: PresenceStatus::Active,
                    message: None,
                })
            }
            PresenceStatus::Afk if !presence.afk_explicit => {
                presence.enter(PresenceStatus::Active, ts);
                Some(StateChange {
                    user_id: user_id.to_string(),
                    status: PresenceStatus::Active,
                    message: None,
                })
            }
            // Explicit AFK is sticky; breaks run their course; active stays active.
            _ => {
                presence.updated_at = ts;
                None
            }
        }
    }

    /// Page-hidden signal: an active user drops to `away` immediately.
    pub fn page_hidden(&self, user_id: &str, ts: DateTime<Utc>) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        if self.is_stale(user_id, &presence, ts) {
            return None;
        }
        if presence.status != PresenceStatus::Active {
            return None;
        }
        presence.enter(PresenceStatus::Away, ts);
        Some(StateChange {
            user_id: user_id.to_string(),
            status: PresenceStatus::Away,
            message: None,
        })
    }

    /// Explicit AFK toggle, with an optional away-message.
    pub fn set_afk(
        &self,
        user_id: &str,
        message: Option<String>,
        ts: DateTime<Utc>,
    ) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        if self.is_stale(user_id, &presence, ts) {
            return None;
        }
        if !matches!(
            presence.status,
            PresenceStatus::Active | PresenceStatus::Away
        ) {
            return None;
        }
        presence.enter(PresenceStatus::Afk, ts);
        presence.afk_explicit = true;
        presence.status_message = message.clone();
        Some(StateChange {
            user_id: user_id.to_string(),
            status: PresenceStatus::Afk,
            message,
        })
    }

    /// Explicit "back to active": clears AFK (the only way out of a sticky
    /// AFK) and ends a break early.
    pub fn set_active(&self, user_id: &str, ts: DateTime<Utc>) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        if self.is_stale(user_id, &presence, ts) {
            return None;
        }
        presence.last_activity = ts;
        if matches!(
            presence.status,
            PresenceStatus::Active | PresenceStatus::Offline
        ) {
            presence.updated_at = ts;
            return None;
        }
        presence.enter(PresenceStatus::Active, ts);
        Some(StateChange {
            user_id: user_id.to_string(),
            status: PresenceStatus::Active,
            message: None,
        })
    }

    /// Explicit "start break" with a countdown duration.
    pub fn start_break(
        &self,
        user_id: &str,
        duration: Duration,
        ts: DateTime<Utc>,
    ) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        if self.is_stale(user_id, &presence, ts) {
            return None;
        }
        if !matches!(
            presence.status,
            PresenceStatus::Active | PresenceStatus::Away
        ) {
            return None;
        }
        presence.enter(PresenceStatus::Break, ts);
        presence.break_until =
            Some(ts + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero()));
        Some(StateChange {
            user_id: user_id.to_string(),
            status: PresenceStatus::Break,
            message: None,
        })
    }

    /// Current base status, if the user is tracked.
    pub fn status_of(&self, user_id: &str) -> Option<PresenceStatus> {
        self.inner.get(user_id).map(|entry| entry.lock().status)
    }

    /// All tracked user ids (for the sweeper).
    pub fn user_ids(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// One sweeper pass over a single user: break expiry, away decay, and
    /// auto-AFK per that user's preferences. Server-timer driven, so no
    /// staleness check applies.
    pub fn sweep_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        away_timeout: Duration,
        afk_timeout: Duration,
        prefs: &Preferences,
    ) -> Option<StateChange> {
        let entry = self.inner.get(user_id)?;
        let mut presence = entry.lock();
        let idle = (now - presence.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);

        match presence.status {
            PresenceStatus::Break => {
                if presence.break_until.is_some_and(|until| until <= now) {
                    presence.enter(PresenceStatus::Active, now);
                    presence.last_activity = now;
                    return Some(StateChange {
                        user_id: user_id.to_string(),
                        status: PresenceStatus::Active,
                        message: None,
                    });
                }
            }
            PresenceStatus::Active | PresenceStatus::Away => {
                if prefs.afk_enabled && idle > afk_timeout {
                    presence.enter(PresenceStatus::Afk, now);
                    presence.status_message = prefs.away_message.clone();
                    return Some(StateChange {
                        user_id: user_id.to_string(),
                        status: PresenceStatus::Afk,
                        message: presence.status_message.clone(),
                    });
                }
                if presence.status == PresenceStatus::Active && idle > away_timeout {
                    presence.enter(PresenceStatus::Away, now);
                    return Some(StateChange {
                        user_id: user_id.to_string(),
                        status: PresenceStatus::Away,
                        message: None,
                    });
                }
            }
            _ => {}
        }
        None
    }

    /// Drop entries that have been offline longer than the retention window.
    /// Returns the number removed.
    pub fn gc(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, entry| {
            let presence = entry.lock();
            presence.status != PresenceStatus::Offline
                || (now - presence.updated_at).to_std().unwrap_or(Duration::ZERO) <= retention
        });
        before - self.inner.len()
    }

    fn is_stale(&self, user_id: &str, presence: &UserPresence, ts: DateTime<Utc>) -> bool {
        if ts < presence.updated_at {
            tracing::debug!(
                %user_id,
                signal_ts = %ts,
                state_ts = %presence.updated_at,
                "stale presence update discarded"
            );
            true
        } else {
            false
        }
    }
}

/// Working-hours overlay: `active`/`away` display as `outside_hours` when
/// the wall clock falls outside the user's configured window. `afk`,
/// `break`, and `offline` always win.
pub fn effective_status(
    base: PresenceStatus,
    prefs: &Preferences,
    now_local: NaiveDateTime,
) -> PresenceStatus {
    match base {
        PresenceStatus::Active | PresenceStatus::Away if !prefs.in_working_hours(now_local) => {
            PresenceStatus::OutsideHours
        }
        other => other,
    }
}

/// Spawn the presence sweeper: timer-driven transitions (away decay,
/// auto-AFK, break expiry), offline GC, and replay-buffer pruning.
pub fn spawn_sweeper(
    presence: Arc<PresenceMap>,
    router: Arc<NotificationRouter>,
    preferences: Arc<dyn PreferenceStore>,
    sweep_interval: Duration,
    away_timeout: Duration,
    afk_timeout: Duration,
    retention: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for user_id in presence.user_ids() {
                let prefs = match preferences.preferences(&user_id).await {
                    Ok(prefs) => prefs,
                    Err(err) => {
                        tracing::warn!(%user_id, %err, "preference lookup failed during sweep");
                        Preferences::default()
                    }
                };
                if let Some(change) =
                    presence.sweep_user(&user_id, now, away_timeout, afk_timeout, &prefs)
                {
                    let status = effective_status(
                        change.status,
                        &prefs,
                        chrono::Local::now().naive_local(),
                    );
                    router.presence_changed(&change.user_id, status, change.message);
                }
            }
            let removed = presence.gc(now, retention);
            if removed > 0 {
                tracing::debug!(removed, "presence entries garbage-collected");
            }
            router.prune_replay_buffers();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn connected_map(user_id: &str) -> PresenceMap {
        let map = PresenceMap::new();
        map.connect(user_id, ts(0));
        map
    }

    #[test]
    fn first_connection_enters_active() {
        let map = PresenceMap::new();
        map.connect("usr_1", ts(0));
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Active));
    }

    #[test]
    fn second_tab_joins_existing_state() {
        let map = connected_map("usr_1");
        map.set_afk("usr_1", None, ts(10));

        // Another tab connects; AFK survives.
        let change = map.connect("usr_1", ts(20));
        assert!(change.is_none());
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Afk));
    }

    #[test]
    fn last_disconnect_goes_offline_and_reconnect_reenters_active() {
        let map = connected_map("usr_1");

        let change = map.disconnect_offline("usr_1", ts(10)).unwrap();
        assert_eq!(change.status, PresenceStatus::Offline);

        let change = map.connect("usr_1", ts(20)).unwrap();
        assert_eq!(change.status, PresenceStatus::Active);
    }

    #[test]
    fn disconnect_when_already_offline_is_a_noop() {
        let map = connected_map("usr_1");
        map.disconnect_offline("usr_1", ts(10));
        assert!(map.disconnect_offline("usr_1", ts(20)).is_none());
    }

    #[test]
    fn activity_clears_automatic_away() {
        let map = connected_map("usr_1");
        map.page_hidden("usr_1", ts(10));
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Away));

        let change = map.activity("usr_1", ts(20)).unwrap();
        assert_eq!(change.status, PresenceStatus::Active);
    }

    #[test]
    fn explicit_afk_is_sticky_against_activity() {
        let map = connected_map("usr_1");
        map.set_afk("usr_1", Some("back at 3".to_string()), ts(10));

        // Activity alone must not clear explicit AFK.
        assert!(map.activity("usr_1", ts(20)).is_none());
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Afk));

        // The explicit toggle does.
        let change = map.set_active("usr_1", ts(30)).unwrap();
        assert_eq!(change.status, PresenceStatus::Active);
    }

    #[test]
    fn auto_afk_clears_on_activity() {
        let map = connected_map("usr_1");
        let prefs = Preferences {
            afk_enabled: true,
            ..Preferences::default()
        };

        // No activity for over the AFK timeout; sweeper escalates.
        let change = map
            .sweep_user(
                "usr_1",
                ts(60 * 31),
                Duration::from_secs(300),
                Duration::from_secs(60 * 30),
                &prefs,
            )
            .unwrap();
        assert_eq!(change.status, PresenceStatus::Afk);

        // Auto-AFK is not sticky: activity recovers.
        let change = map.activity("usr_1", ts(60 * 32)).unwrap();
        assert_eq!(change.status, PresenceStatus::Active);
    }

    #[test]
    fn sweep_decays_idle_active_to_away() {
        let map = connected_map("usr_1");
        let prefs = Preferences::default();

        let change = map
            .sweep_user(
                "usr_1",
                ts(60 * 6),
                Duration::from_secs(300),
                Duration::from_secs(60 * 30),
                &prefs,
            )
            .unwrap();
        assert_eq!(change.status, PresenceStatus::Away);
    }

    #[test]
    fn sweep_leaves_recently_active_users_alone() {
        let map = connected_map("usr_1");
        map.activity("usr_1", ts(60));
        let prefs = Preferences::default();

        let change = map.sweep_user(
            "usr_1",
            ts(120),
            Duration::from_secs(300),
            Duration::from_secs(60 * 30),
            &prefs,
        );
        assert!(change.is_none());
    }

    #[test]
    fn sweep_without_afk_mode_stops_at_away() {
        let map = connected_map("usr_1");
        let prefs = Preferences::default(); // afk_enabled: false

        let change = map
            .sweep_user(
                "usr_1",
                ts(60 * 60),
                Duration::from_secs(300),
                Duration::from_secs(60 * 30),
                &prefs,
            )
            .unwrap();
        assert_eq!(change.status, PresenceStatus::Away);
    }

    #[test]
    fn auto_afk_carries_default_away_message() {
        let map = connected_map("usr_1");
        let prefs = Preferences {
            afk_enabled: true,
            away_message: Some("out of office".to_string()),
            ..Preferences::default()
        };

        let change = map
            .sweep_user(
                "usr_1",
                ts(60 * 31),
                Duration::from_secs(300),
                Duration::from_secs(60 * 30),
                &prefs,
            )
            .unwrap();
        assert_eq!(change.status, PresenceStatus::Afk);
        assert_eq!(change.message.as_deref(), Some("out of office"));
    }

    #[test]
    fn break_runs_until_expiry() {
        let map = connected_map("usr_1");
        map.start_break("usr_1", Duration::from_secs(600), ts(10));
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Break));

        // Activity during a break changes nothing.
        assert!(map.activity("usr_1", ts(20)).is_none());
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Break));

        let prefs = Preferences::default();
        // Not expired yet.
        assert!(map
            .sweep_user(
                "usr_1",
                ts(300),
                Duration::from_secs(300),
                Duration::from_secs(1800),
                &prefs
            )
            .is_none());

        // Countdown expired.
        let change = map
            .sweep_user(
                "usr_1",
                ts(611),
                Duration::from_secs(300),
                Duration::from_secs(1800),
                &prefs,
            )
            .unwrap();
        assert_eq!(change.status, PresenceStatus::Active);
    }

    #[test]
    fn break_can_end_early() {
        let map = connected_map("usr_1");
        map.start_break("usr_1", Duration::from_secs(600), ts(10));

        let change = map.set_active("usr_1", ts(20)).unwrap();
        assert_eq!(change.status, PresenceStatus::Active);
    }

    #[test]
    fn stale_update_is_discarded() {
        let map = connected_map("usr_1");
        map.set_afk("usr_1", None, ts(100));

        // An out-of-order activity signal from before the AFK toggle.
        assert!(map.activity("usr_1", ts(50)).is_none());
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Afk));

        // Same for a stale manual toggle.
        assert!(map.set_active("usr_1", ts(60)).is_none());
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Afk));
    }

    #[test]
    fn stale_then_fresh_behaves_as_if_only_fresh_applied() {
        let map = connected_map("usr_1");

        map.page_hidden("usr_1", ts(100));
        let first = map.activity("usr_1", ts(200));
        assert_eq!(first.unwrap().status, PresenceStatus::Active);

        // A duplicate of the earlier away signal arrives late.
        assert!(map.page_hidden("usr_1", ts(100)).is_none());
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Active));
    }

    #[test]
    fn gc_removes_stale_offline_entries() {
        let map = connected_map("usr_1");
        map.connect("usr_2", ts(0));
        map.disconnect_offline("usr_1", ts(10));

        let removed = map.gc(ts(10 + 400), Duration::from_secs(300));
        assert_eq!(removed, 1);
        assert!(map.status_of("usr_1").is_none());
        assert_eq!(map.status_of("usr_2"), Some(PresenceStatus::Active));
    }

    #[test]
    fn gc_keeps_recent_offline_entries() {
        let map = connected_map("usr_1");
        map.disconnect_offline("usr_1", ts(10));

        let removed = map.gc(ts(20), Duration::from_secs(300));
        assert_eq!(removed, 0);
        assert_eq!(map.status_of("usr_1"), Some(PresenceStatus::Offline));
    }

    #[test]
    fn effective_status_overlays_outside_hours() {
        let prefs = Preferences::default(); // Mon-Fri 09:00-17:00
        let evening = chrono::NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap();
        let midday = chrono::NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();

        assert_eq!(
            effective_status(PresenceStatus::Active, &prefs, evening),
            PresenceStatus::OutsideHours
        );
        assert_eq!(
            effective_status(PresenceStatus::Away, &prefs, evening),
            PresenceStatus::OutsideHours
        );
        assert_eq!(
            effective_status(PresenceStatus::Active, &prefs, midday),
            PresenceStatus::Active
        );
        // AFK and break are never overridden.
        assert_eq!(
            effective_status(PresenceStatus::Afk, &prefs, evening),
            PresenceStatus::Afk
        );
        assert_eq!(
            effective_status(PresenceStatus::Break, &prefs, evening),
            PresenceStatus::Break
        );
    }
}
