//! Per-user notification preferences and the suppression rules derived
//! from them.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::gateway::events::NotificationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    All,
    /// Treated the same as `All` at the fan-out layer; mention detection
    /// is a client concern.
    Mentions,
    None,
}

/// A user's stored notification and work-life preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    pub dnd_enabled: bool,
    pub dnd_start: Option<NaiveTime>,
    pub dnd_end: Option<NaiveTime>,
    /// Working days, Monday=1 through Sunday=7, e.g. "12345".
    pub work_days: String,
    pub work_start: NaiveTime,
    pub work_end: NaiveTime,
    pub muted_work_items: HashSet<String>,
    pub notification_mode: NotificationMode,
    /// Whether inactivity may escalate to AFK automatically.
    pub afk_enabled: bool,
    /// Minutes of inactivity before auto-AFK, when enabled.
    pub auto_away_after_mins: u32,
    /// Default away-message applied when auto-AFK fires.
    pub away_message: Option<String>,
    /// Suggested minutes between breaks; surfaced to clients, not enforced.
    pub break_frequency_mins: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            dnd_enabled: false,
            dnd_start: None,
            dnd_end: None,
            work_days: "12345".to_string(),
            work_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            work_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            muted_work_items: HashSet::new(),
            notification_mode: NotificationMode::All,
            afk_enabled: false,
            auto_away_after_mins: 30,
            away_message: None,
            break_frequency_mins: 60,
        }
    }
}

impl Preferences {
    /// Whether `now` falls inside the configured DND window. Windows may
    /// span midnight (22:00–07:00).
    pub fn in_dnd_window(&self, now: NaiveTime) -> bool {
        if !self.dnd_enabled {
            return false;
        }
        let (Some(start), Some(end)) = (self.dnd_start, self.dnd_end) else {
            return false;
        };
        if start > end {
            now >= start || now <= end
        } else {
            start <= now && now <= end
        }
    }

    /// Whether `now` falls on a working day, inside working hours.
    pub fn in_working_hours(&self, now: NaiveDateTime) -> bool {
        let weekday = now.weekday().number_from_monday(); // 1 is Monday
        let day = char::from_digit(weekday, 10).unwrap();
        self.work_days.contains(day)
            && self.work_start <= now.time()
            && now.time() <= self.work_end
    }

    /// The full suppression decision for one recipient.
    ///
    /// Urgent events ride through the DND and working-hours filters; nothing
    /// rides through an explicit mute or mode `none`. Events not tied to a
    /// work item are exempt from the working-hours filter.
    pub fn should_notify(&self, event: &NotificationEvent, now: NaiveDateTime) -> bool {
        if self.in_dnd_window(now.time()) && !event.urgent {
            return false;
        }

        if let Some(work_item_id) = &event.work_item_id {
            if !self.in_working_hours(now) && !event.urgent {
                return false;
            }
            if self.muted_work_items.contains(work_item_id) {
                return false;
            }
        }

        if self.notification_mode == NotificationMode::None {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::EventType;
    use chrono::NaiveDate;

    fn event() -> NotificationEvent {
        NotificationEvent::new(EventType::Message, "New message from alice")
    }

    fn work_item_event(work_item_id: &str) -> NotificationEvent {
        NotificationEvent {
            work_item_id: Some(work_item_id.to_string()),
            ..event()
        }
    }

    fn at(hour: u32, min: u32) -> NaiveDateTime {
        // 2024-06-03 is a Monday.
        NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn time(hour: u32, min: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, min, 0).unwrap()
    }

    #[test]
    fn dnd_disabled_never_matches() {
        let prefs = Preferences::default();
        assert!(!prefs.in_dnd_window(time(23, 0)));
    }

    #[test]
    fn dnd_window_same_day() {
        let prefs = Preferences {
            dnd_enabled: true,
            dnd_start: Some(time(12, 0)),
            dnd_end: Some(time(14, 0)),
            ..Preferences::default()
        };
        assert!(prefs.in_dnd_window(time(13, 0)));
        assert!(!prefs.in_dnd_window(time(15, 0)));
    }

    #[test]
    fn dnd_window_spanning_midnight() {
        let prefs = Preferences {
            dnd_enabled: true,
            dnd_start: Some(time(22, 0)),
            dnd_end: Some(time(7, 0)),
            ..Preferences::default()
        };
        assert!(prefs.in_dnd_window(time(23, 0)));
        assert!(prefs.in_dnd_window(time(2, 0)));
        assert!(!prefs.in_dnd_window(time(12, 0)));
    }

    #[test]
    fn dnd_suppresses_non_urgent_events() {
        let prefs = Preferences {
            dnd_enabled: true,
            dnd_start: Some(time(22, 0)),
            dnd_end: Some(time(7, 0)),
            ..Preferences::default()
        };
        assert!(!prefs.should_notify(&event(), at(23, 0)));
    }

    #[test]
    fn urgent_events_bypass_dnd() {
        let prefs = Preferences {
            dnd_enabled: true,
            dnd_start: Some(time(22, 0)),
            dnd_end: Some(time(7, 0)),
            ..Preferences::default()
        };
        let urgent = NotificationEvent {
            urgent: true,
            ..event()
        };
        assert!(prefs.should_notify(&urgent, at(23, 0)));
    }

    #[test]
    fn working_hours_respect_work_days() {
        let prefs = Preferences::default(); // Mon-Fri 09:00-17:00
        assert!(prefs.in_working_hours(at(10, 0)));
        // 2024-06-08 is a Saturday.
        let saturday = NaiveDate::from_ymd_opt(2024, 6, 8)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert!(!prefs.in_working_hours(saturday));
    }

    #[test]
    fn outside_working_hours_suppresses_work_item_events() {
        let prefs = Preferences::default();
        assert!(!prefs.should_notify(&work_item_event("wi_1"), at(20, 0)));
        assert!(prefs.should_notify(&work_item_event("wi_1"), at(10, 0)));
    }

    #[test]
    fn outside_working_hours_passes_events_without_work_item() {
        let prefs = Preferences::default();
        assert!(prefs.should_notify(&event(), at(20, 0)));
    }

    #[test]
    fn urgent_work_item_event_bypasses_working_hours() {
        let prefs = Preferences::default();
        let urgent = NotificationEvent {
            urgent: true,
            ..work_item_event("wi_1")
        };
        assert!(prefs.should_notify(&urgent, at(20, 0)));
    }

    #[test]
    fn muted_work_item_suppresses_even_urgent() {
        let mut prefs = Preferences::default();
        prefs.muted_work_items.insert("wi_1".to_string());
        let urgent = NotificationEvent {
            urgent: true,
            ..work_item_event("wi_1")
        };
        assert!(!prefs.should_notify(&urgent, at(10, 0)));
    }

    #[test]
    fn mode_none_suppresses_everything() {
        let prefs = Preferences {
            notification_mode: NotificationMode::None,
            ..Preferences::default()
        };
        assert!(!prefs.should_notify(&event(), at(10, 0)));
    }

    #[test]
    fn mode_mentions_behaves_like_all() {
        let prefs = Preferences {
            notification_mode: NotificationMode::Mentions,
            ..Preferences::default()
        };
        assert!(prefs.should_notify(&event(), at(10, 0)));
    }
}
