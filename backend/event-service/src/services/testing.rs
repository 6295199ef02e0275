/// Shared fakes for service-layer tests.
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::models::{Admin, Event, EventStatus};
use crate::services::opentok::{
    ArchiveMode, BroadcastStarted, ParticipantRole, PlatformCredentials, PlatformError,
    VideoPlatform,
};

pub fn test_sealer() -> crypto_core::Sealer {
    crypto_core::Sealer::new([9u8; 32])
}

pub fn test_admin(hls_enabled: bool) -> Admin {
    let id = Uuid::new_v4();
    Admin {
        id,
        display_name: "Producer One".to_string(),
        email: format!("producer+{id}@example.com"),
        api_key: "46112222".to_string(),
        api_secret_sealed: test_sealer().seal(id, "sekrit").unwrap(),
        hls_enabled,
        http_support: false,
        superadmin: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn test_event(admin: &Admin, status: EventStatus) -> Event {
    Event {
        id: Uuid::new_v4(),
        admin_id: admin.id,
        name: "Spring Show".to_string(),
        fan_url: "spring-show".to_string(),
        celebrity_url: "spring-show-celebrity".to_string(),
        host_url: "spring-show-host".to_string(),
        archive_event: false,
        uncomposed: false,
        session_id: "1_backstage".to_string(),
        stage_session_id: "2_stage".to_string(),
        status: status.as_str().to_string(),
        archive_id: None,
        archive_url: None,
        rtmp_url: None,
        redirect_url: None,
        start_image: None,
        end_image: None,
        date_time_start: None,
        date_time_end: None,
        show_started_at: None,
        show_ended_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Scriptable in-process stand-in for the vendor API.
#[derive(Default)]
pub struct MockPlatform {
    /// Every start attempt, including failed ones.
    pub start_calls: AtomicUsize,
    /// Successful starts; the first one wins, later ones conflict.
    pub started: AtomicUsize,
    /// Fail the next start attempt with a transport error.
    pub fail_next_start: AtomicBool,
    /// Fail the next archive start with a transport error.
    pub fail_next_archive_start: AtomicBool,
    pub stop_calls: Mutex<Vec<String>>,
    /// (session id, output mode) per archive start.
    pub archive_starts: Mutex<Vec<(String, String)>>,
    pub archive_stops: Mutex<Vec<String>>,
    pub sessions_created: AtomicUsize,
    /// When set, start attempts rendezvous here first so two callers both
    /// observe an unstarted record.
    pub start_barrier: Option<Arc<Barrier>>,
}

#[async_trait]
impl VideoPlatform for MockPlatform {
    async fn create_session(&self, _creds: &PlatformCredentials) -> Result<String, PlatformError> {
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{n}_session"))
    }

    fn create_token(
        &self,
        _creds: &PlatformCredentials,
        session_id: &str,
        role: ParticipantRole,
        _data: Option<serde_json::Value>,
    ) -> Result<String, PlatformError> {
        Ok(format!("token:{session_id}:{role:?}"))
    }

    async fn start_broadcast(
        &self,
        _creds: &PlatformCredentials,
        _session_id: &str,
        _hls: bool,
        _rtmp_url: Option<&str>,
    ) -> Result<BroadcastStarted, PlatformError> {
        if let Some(barrier) = &self.start_barrier {
            barrier.wait().await;
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(PlatformError::Request("platform unreachable".to_string()));
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 1 {
            // The vendor refuses a second broadcast for a running session.
            return Err(PlatformError::AlreadyStarted);
        }
        Ok(BroadcastStarted {
            id: format!("bcast-{n}"),
            hls_url: Some("https://cdn.example.com/live/playlist.m3u8".to_string()),
            created_at: Utc::now(),
        })
    }

    async fn stop_broadcast(
        &self,
        _creds: &PlatformCredentials,
        broadcast_id: &str,
    ) -> Result<(), PlatformError> {
        self.stop_calls
            .lock()
            .unwrap()
            .push(broadcast_id.to_string());
        Ok(())
    }

    async fn start_archive(
        &self,
        _creds: &PlatformCredentials,
        session_id: &str,
        _name: &str,
        mode: ArchiveMode,
    ) -> Result<String, PlatformError> {
        if self.fail_next_archive_start.swap(false, Ordering::SeqCst) {
            return Err(PlatformError::Request("platform unreachable".to_string()));
        }
        self.archive_starts
            .lock()
            .unwrap()
            .push((session_id.to_string(), mode.as_str().to_string()));
        Ok("archive-1".to_string())
    }

    async fn stop_archive(
        &self,
        _creds: &PlatformCredentials,
        archive_id: &str,
    ) -> Result<(), PlatformError> {
        self.archive_stops
            .lock()
            .unwrap()
            .push(archive_id.to_string());
        Ok(())
    }
}
