/// Data models for the event service.
///
/// This module defines:
/// - EventStatus: the event lifecycle enumeration with transition rules
/// - Event / Admin: database entities
/// - Request/response DTOs for the HTTP API
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ========================================
// Event lifecycle
// ========================================

/// Event lifecycle status.
///
/// Transitions only move forward, and any state may jump straight to
/// `Closed`. Closing an already closed event re-runs the (idempotent)
/// teardown rather than failing, so retried close requests are safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventStatus {
    NotStarted,
    Preshow,
    Live,
    Closed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "notStarted",
            Self::Preshow => "preshow",
            Self::Live => "live",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notStarted" => Some(Self::NotStarted),
            "preshow" => Some(Self::Preshow),
            "live" => Some(Self::Live),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Preshow => 1,
            Self::Live => 2,
            Self::Closed => 3,
        }
    }

    pub fn can_transition(self, next: EventStatus) -> bool {
        next == Self::Closed || next.rank() > self.rank()
    }
}

// ========================================
// Database entities
// ========================================

/// Event database entity
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub admin_id: Uuid,
    pub name: String,
    pub fan_url: String,
    pub celebrity_url: String,
    pub host_url: String,
    pub archive_event: bool,
    pub uncomposed: bool,
    pub session_id: String,
    pub stage_session_id: String,
    pub status: String,
    pub archive_id: Option<String>,
    pub archive_url: Option<String>,
    pub rtmp_url: Option<String>,
    pub redirect_url: Option<String>,
    pub start_image: Option<String>,
    pub end_image: Option<String>,
    pub date_time_start: Option<DateTime<Utc>>,
    pub date_time_end: Option<DateTime<Utc>>,
    pub show_started_at: Option<DateTime<Utc>>,
    pub show_ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn status(&self) -> Option<EventStatus> {
        EventStatus::parse(&self.status)
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Some(EventStatus::Closed)
    }
}

/// Admin database entity. Owns the video-platform credentials.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Admin {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub api_key: String,
    pub api_secret_sealed: String,
    pub hls_enabled: bool,
    pub http_support: bool,
    pub superadmin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========================================
// Request DTOs
// ========================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub admin_id: Uuid,
    pub name: String,
    pub fan_url: String,
    pub celebrity_url: String,
    pub host_url: String,
    #[serde(default)]
    pub archive_event: bool,
    #[serde(default)]
    pub uncomposed: bool,
    pub rtmp_url: Option<String>,
    pub redirect_url: Option<String>,
    pub start_image: Option<String>,
    pub end_image: Option<String>,
    pub date_time_start: Option<DateTime<Utc>>,
    pub date_time_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventRequest {
    pub name: Option<String>,
    pub rtmp_url: Option<String>,
    pub redirect_url: Option<String>,
    pub start_image: Option<String>,
    pub end_image: Option<String>,
    pub date_time_start: Option<DateTime<Utc>>,
    pub date_time_end: Option<DateTime<Utc>>,
}

/// Status transition input. Unknown status strings fail deserialization
/// before any side effect occurs.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: EventStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAdminRequest {
    pub display_name: String,
    pub email: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub hls_enabled: bool,
    #[serde(default)]
    pub http_support: bool,
    #[serde(default)]
    pub superadmin: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAdminRequest {
    pub display_name: Option<String>,
    pub hls_enabled: Option<bool>,
    pub http_support: Option<bool>,
}

// ========================================
// Response DTOs
// ========================================

/// Admin response DTO. Never exposes the sealed secret.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminResponse {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub api_key: String,
    pub hls_enabled: bool,
    pub http_support: bool,
    pub superadmin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Admin> for AdminResponse {
    fn from(admin: Admin) -> Self {
        Self {
            id: admin.id,
            display_name: admin.display_name,
            email: admin.email,
            api_key: admin.api_key,
            hls_enabled: admin.hls_enabled,
            http_support: admin.http_support,
            superadmin: admin.superadmin,
            created_at: admin.created_at,
            updated_at: admin.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            EventStatus::NotStarted,
            EventStatus::Preshow,
            EventStatus::Live,
            EventStatus::Closed,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("paused"), None);
    }

    #[test]
    fn transitions_only_move_forward() {
        use EventStatus::*;
        assert!(NotStarted.can_transition(Preshow));
        assert!(NotStarted.can_transition(Live));
        assert!(Preshow.can_transition(Live));
        assert!(!Preshow.can_transition(NotStarted));
        assert!(!Live.can_transition(Preshow));
        assert!(!Live.can_transition(Live));
        assert!(!Closed.can_transition(Live));
    }

    #[test]
    fn any_state_may_close() {
        use EventStatus::*;
        for status in [NotStarted, Preshow, Live, Closed] {
            assert!(status.can_transition(Closed));
        }
    }

    #[test]
    fn unknown_status_rejected_at_the_boundary() {
        let err = serde_json::from_str::<ChangeStatusRequest>(r#"{"status":"archived"}"#);
        assert!(err.is_err());

        let ok: ChangeStatusRequest = serde_json::from_str(r#"{"status":"preshow"}"#).unwrap();
        assert_eq!(ok.status, EventStatus::Preshow);
    }
}
