//! Gateway wire format: closed tagged frame types for both directions.
//!
//! Frames are JSON objects discriminated by `type`. An unrecognized `type`
//! fails deserialization and the connection is closed with
//! [`CLOSE_UNKNOWN_TYPE`] rather than being silently ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use collabhub_common::id::{prefix, prefixed_ulid};

use super::presence::PresenceStatus;

// ---------------------------------------------------------------------------
// Close codes (4000-range for application-level).
// ---------------------------------------------------------------------------

pub const CLOSE_INVALID_FRAME: u16 = 4000;
pub const CLOSE_UNKNOWN_TYPE: u16 = 4001;
pub const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
pub const CLOSE_AUTH_FAILED: u16 = 4004;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;
pub const CLOSE_CAPACITY: u16 = 4013;

/// WebSocket normal-closure code. A client that sees it must not reconnect.
pub const CLOSE_NORMAL: u16 = 1000;

// ---------------------------------------------------------------------------
// Client → Server frames
// ---------------------------------------------------------------------------

/// A frame received from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection. Authenticates, and optionally asks
    /// for replay of notifications missed since `last_event_id`.
    Identify {
        token: String,
        #[serde(default)]
        last_event_id: Option<String>,
    },
    /// Liveness probe response (or client-initiated heartbeat).
    Heartbeat,
    /// User input observed by the client (keypress, click, scroll).
    Activity { ts_ms: i64 },
    /// Page visibility change; `hidden: true` is treated as an away signal,
    /// `hidden: false` as an activity signal.
    Visibility { hidden: bool, ts_ms: i64 },
    /// Manual presence toggle.
    SetStatus {
        status: RequestedStatus,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        duration_secs: Option<u64>,
        ts_ms: i64,
    },
    /// Chat content for a work item. Persisted via the chat collaborator
    /// before any fan-out happens.
    Message { work_item_id: String, body: String },
}

/// Statuses a client may request directly. Timer-driven states (`away`,
/// `outside_hours`, `offline`) are never client-requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedStatus {
    Active,
    Afk,
    Break,
}

// ---------------------------------------------------------------------------
// Server → Client frames
// ---------------------------------------------------------------------------

/// A frame sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        connection_id: String,
        user_id: String,
        username: String,
        heartbeat_interval_ms: u64,
        /// How many missed notifications were replayed before this frame.
        replayed: usize,
    },
    HeartbeatResponse,
    /// Server-initiated liveness probe; clients answer with a heartbeat.
    Ping,
    Notification { event: NotificationEvent },
    ChatMessage {
        work_item_id: String,
        message_id: String,
        user_id: String,
        username: String,
        body: String,
        sent_at: DateTime<Utc>,
    },
    PresenceUpdate {
        user_id: String,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Notification events
// ---------------------------------------------------------------------------

/// An immutable notification fact, constructed at the publish boundary.
///
/// The `id` makes redelivery idempotent: a client that sees the same id
/// twice drops the duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    pub event_type: EventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<String>,
    #[serde(default)]
    pub urgent: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: prefixed_ulid(prefix::EVENT),
            event_type,
            message: message.into(),
            work_item_id: None,
            origin_user_id: None,
            urgent: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Update,
    FileUpload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_frame_parses() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"identify","token":"tok_abc"}"#).unwrap();
        match frame {
            ClientFrame::Identify {
                token,
                last_event_id,
            } => {
                assert_eq!(token, "tok_abc");
                assert!(last_event_id.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Heartbeat));
    }

    #[test]
    fn set_status_frame_parses_break_with_duration() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"set_status","status":"break","duration_secs":600,"ts_ms":1700000000000}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::SetStatus {
                status,
                duration_secs,
                ..
            } => {
                assert_eq!(status, RequestedStatus::Break);
                assert_eq!(duration_secs, Some(600));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"telemetry","data":42}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_frames_carry_snake_case_tags() {
        let json = serde_json::to_value(&ServerFrame::HeartbeatResponse).unwrap();
        assert_eq!(json["type"], "heartbeat_response");

        let json = serde_json::to_value(&ServerFrame::PresenceUpdate {
            user_id: "usr_1".to_string(),
            status: PresenceStatus::Away,
            message: None,
        })
        .unwrap();
        assert_eq!(json["type"], "presence_update");
        assert_eq!(json["status"], "away");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn notification_event_ids_are_unique() {
        let a = NotificationEvent::new(EventType::Message, "m");
        let b = NotificationEvent::new(EventType::Message, "m");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("evt_"));
    }
}
