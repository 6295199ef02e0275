/// Event lifecycle state machine.
///
/// Drives admin-triggered status transitions and keeps the CDN broadcast and
/// the archive in lock-step with them. The persisted status update is the
/// authoritative action: vendor failures during archive start/stop are
/// logged and swallowed so the transition still commits.
use chrono::Utc;
use crypto_core::Sealer;
use std::sync::Arc;

use crate::cache;
use crate::db::{AdminStore, EventStore, StatusChange};
use crate::error::{AppError, AppResult};
use crate::models::{Admin, Event, EventStatus};
use crate::services::broadcast::BroadcastOrchestrator;
use crate::services::opentok::{ArchiveMode, PlatformCredentials, VideoPlatform};

pub struct EventLifecycle {
    events: Arc<dyn EventStore>,
    admins: Arc<dyn AdminStore>,
    orchestrator: Arc<BroadcastOrchestrator>,
    platform: Arc<dyn VideoPlatform>,
    sealer: Sealer,
    bucket_url: String,
}

impl EventLifecycle {
    pub fn new(
        events: Arc<dyn EventStore>,
        admins: Arc<dyn AdminStore>,
        orchestrator: Arc<BroadcastOrchestrator>,
        platform: Arc<dyn VideoPlatform>,
        sealer: Sealer,
        bucket_url: String,
    ) -> Self {
        Self {
            events,
            admins,
            orchestrator,
            platform,
            sealer,
            bucket_url,
        }
    }

    pub fn credentials(&self, admin: &Admin) -> AppResult<PlatformCredentials> {
        Ok(PlatformCredentials {
            api_key: admin.api_key.clone(),
            api_secret: self.sealer.unseal(admin.id, &admin.api_secret_sealed)?,
        })
    }

    /// Apply one status transition with its side effects, then persist the
    /// accumulated updates in a single store update.
    pub async fn change_status(&self, event_id: uuid::Uuid, next: EventStatus) -> AppResult<Event> {
        let event = self
            .events
            .find(event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event {event_id} not found")))?;
        let current = event.status().ok_or_else(|| {
            AppError::Internal(format!("event {} carries unknown status {}", event.id, event.status))
        })?;
        if !current.can_transition(next) {
            return Err(AppError::BadRequest(format!(
                "cannot change status from {} to {}",
                current.as_str(),
                next.as_str()
            )));
        }

        let admin = self
            .admins
            .find(event.admin_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("admin {} not found", event.admin_id)))?;
        let creds = self.credentials(&admin)?;
        let event_key = cache::event_key(event.admin_id, &event.fan_url);

        let mut change = StatusChange::to(next);
        match next {
            EventStatus::Preshow => {
                self.orchestrator.ensure_record(&event, &admin).await?;
            }
            EventStatus::Live => {
                change.show_started_at = Some(Utc::now());
                if event.archive_event {
                    let mode = ArchiveMode::for_event(event.uncomposed);
                    match self
                        .platform
                        .start_archive(&creds, &event.stage_session_id, &event.name, mode)
                        .await
                    {
                        Ok(archive_id) => change.archive_id = Some(archive_id),
                        Err(err) => {
                            tracing::error!(event_id = %event.id, error = %err,
                                "archive start failed, event goes live without recording");
                        }
                    }
                }
                self.orchestrator.ensure_record(&event, &admin).await?;
                self.orchestrator.mark_live(&event_key, &creds).await?;
            }
            EventStatus::Closed => {
                if let Some(record) = self.orchestrator.broadcast_data(&event_key).await? {
                    if let Some(broadcast_id) = record.broadcast_id {
                        self.orchestrator.stop(broadcast_id, &event_key, &creds).await;
                    }
                }
                self.orchestrator.delete_record(&event_key).await?;

                if let Some(archive_id) = event.archive_id.as_deref() {
                    if let Err(err) = self.platform.stop_archive(&creds, archive_id).await {
                        tracing::warn!(event_id = %event.id, error = %err, "archive stop failed");
                    }
                    change.archive_url = Some(archive_url(
                        &self.bucket_url,
                        &admin.api_key,
                        archive_id,
                        event.uncomposed,
                    ));
                }
                change.show_ended_at = Some(Utc::now());
            }
            EventStatus::NotStarted => {}
        }

        let updated = self.events.apply_status_change(event.id, change).await?;
        tracing::info!(event_id = %updated.id, status = %updated.status, "event status changed");
        Ok(updated)
    }
}

/// Where the vendor drops a finished archive: one mp4 for composed
/// recordings, a zip of per-participant files for uncomposed ones.
pub fn archive_url(bucket_url: &str, api_key: &str, archive_id: &str, uncomposed: bool) -> String {
    let extension = if uncomposed { "zip" } else { "mp4" };
    format!(
        "{}/{}/{}/archive.{}",
        bucket_url.trim_end_matches('/'),
        api_key,
        archive_id,
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BroadcastStore, MemoryBroadcastStore};
    use crate::services::broadcast::OrchestratorTiming;
    use crate::services::testing::{test_admin, test_event, test_sealer, MockPlatform};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct FakeEventStore {
        events: Mutex<HashMap<Uuid, Event>>,
    }

    impl FakeEventStore {
        fn with(event: Event) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(HashMap::from([(event.id, event)])),
            })
        }

        fn get(&self, id: Uuid) -> Event {
            self.events.lock().unwrap().get(&id).cloned().unwrap()
        }
    }

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn find(&self, id: Uuid) -> AppResult<Option<Event>> {
            Ok(self.events.lock().unwrap().get(&id).cloned())
        }

        async fn find_by_fan_url(&self, admin_id: Uuid, fan_url: &str) -> AppResult<Option<Event>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .values()
                .find(|e| e.admin_id == admin_id && e.fan_url == fan_url)
                .cloned())
        }

        async fn apply_status_change(&self, id: Uuid, change: StatusChange) -> AppResult<Event> {
            let mut events = self.events.lock().unwrap();
            let event = events
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound("event not found".to_string()))?;
            event.status = change.status.as_str().to_string();
            event.show_started_at = event.show_started_at.or(change.show_started_at);
            event.show_ended_at = event.show_ended_at.or(change.show_ended_at);
            event.archive_id = event.archive_id.take().or(change.archive_id);
            event.archive_url = event.archive_url.take().or(change.archive_url);
            event.updated_at = Utc::now();
            Ok(event.clone())
        }
    }

    struct FakeAdminStore {
        admin: Admin,
    }

    #[async_trait]
    impl AdminStore for FakeAdminStore {
        async fn find(&self, id: Uuid) -> AppResult<Option<Admin>> {
            Ok((self.admin.id == id).then(|| self.admin.clone()))
        }
    }

    struct Fixture {
        lifecycle: EventLifecycle,
        platform: Arc<MockPlatform>,
        events: Arc<FakeEventStore>,
        records: Arc<MemoryBroadcastStore>,
        event_id: Uuid,
        event_key: String,
    }

    fn fixture(event: Event, admin: Admin) -> Fixture {
        let platform = Arc::new(MockPlatform::default());
        let records = Arc::new(MemoryBroadcastStore::new());
        let orchestrator = Arc::new(BroadcastOrchestrator::new(
            records.clone(),
            platform.clone(),
            OrchestratorTiming::default(),
        ));
        let events = FakeEventStore::with(event.clone());
        let lifecycle = EventLifecycle::new(
            events.clone(),
            Arc::new(FakeAdminStore { admin }),
            orchestrator,
            platform.clone(),
            test_sealer(),
            "https://s3.amazonaws.com/show-archives".to_string(),
        );
        Fixture {
            lifecycle,
            platform,
            events,
            records,
            event_id: event.id,
            event_key: cache::event_key(event.admin_id, &event.fan_url),
        }
    }

    #[test]
    fn archive_url_extension_follows_composition() {
        assert_eq!(
            archive_url("https://bucket", "46112222", "archive-1", false),
            "https://bucket/46112222/archive-1/archive.mp4"
        );
        assert_eq!(
            archive_url("https://bucket/", "46112222", "archive-1", true),
            "https://bucket/46112222/archive-1/archive.zip"
        );
    }

    #[tokio::test]
    async fn preshow_creates_record_without_archiving() {
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::NotStarted);
        let fx = fixture(event, admin);

        let updated = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Preshow)
            .await
            .unwrap();

        assert_eq!(updated.status, "preshow");
        let record = fx.records.get(&fx.event_key).await.unwrap().unwrap();
        assert!(!record.event_live);
        assert!(record.broadcast_url.is_none());
        assert!(fx.platform.archive_starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn going_live_starts_composed_archive_and_persists_id() {
        let admin = test_admin(true);
        let mut event = test_event(&admin, EventStatus::NotStarted);
        event.archive_event = true;
        let fx = fixture(event, admin);

        let updated = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Live)
            .await
            .unwrap();

        assert_eq!(updated.status, "live");
        assert_eq!(updated.archive_id, Some("archive-1".to_string()));
        assert!(updated.show_started_at.is_some());
        assert_eq!(
            fx.platform.archive_starts.lock().unwrap().as_slice(),
            [("2_stage".to_string(), "composed".to_string())]
        );

        let record = fx.records.get(&fx.event_key).await.unwrap().unwrap();
        assert!(record.event_live);
        assert_eq!(record.broadcast_id, Some("bcast-1".to_string()));
    }

    #[tokio::test]
    async fn archive_failure_does_not_abort_the_transition() {
        let admin = test_admin(true);
        let mut event = test_event(&admin, EventStatus::Preshow);
        event.archive_event = true;
        let fx = fixture(event, admin);
        fx.platform
            .fail_next_archive_start
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let updated = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Live)
            .await
            .unwrap();

        assert_eq!(updated.status, "live");
        assert_eq!(updated.archive_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_stops_archive_and_computes_mp4_url() {
        let admin = test_admin(true);
        let api_key = admin.api_key.clone();
        let mut event = test_event(&admin, EventStatus::NotStarted);
        event.archive_event = true;
        let fx = fixture(event, admin);

        fx.lifecycle
            .change_status(fx.event_id, EventStatus::Live)
            .await
            .unwrap();
        let updated = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Closed)
            .await
            .unwrap();

        assert_eq!(updated.status, "closed");
        assert!(updated.show_ended_at.is_some());
        assert_eq!(
            fx.platform.archive_stops.lock().unwrap().as_slice(),
            ["archive-1".to_string()]
        );
        assert_eq!(
            updated.archive_url,
            Some(format!(
                "https://s3.amazonaws.com/show-archives/{api_key}/archive-1/archive.mp4"
            ))
        );
        assert!(fx.records.get(&fx.event_key).await.unwrap().is_none());

        // The CDN stop call fires after the propagation delay.
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(
            fx.platform.stop_calls.lock().unwrap().as_slice(),
            ["bcast-1".to_string()]
        );
    }

    #[tokio::test]
    async fn uncomposed_event_archives_to_zip() {
        let admin = test_admin(false);
        let api_key = admin.api_key.clone();
        let mut event = test_event(&admin, EventStatus::Live);
        event.archive_event = true;
        event.uncomposed = true;
        event.archive_id = Some("archive-9".to_string());
        let fx = fixture(event, admin);

        let updated = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Closed)
            .await
            .unwrap();

        assert_eq!(
            updated.archive_url,
            Some(format!(
                "https://s3.amazonaws.com/show-archives/{api_key}/archive-9/archive.zip"
            ))
        );
    }

    #[tokio::test]
    async fn closing_without_broadcast_still_deletes_record() {
        let admin = test_admin(false);
        let event = test_event(&admin, EventStatus::NotStarted);
        let fx = fixture(event, admin);

        fx.lifecycle
            .change_status(fx.event_id, EventStatus::Preshow)
            .await
            .unwrap();
        assert!(fx.records.get(&fx.event_key).await.unwrap().is_some());

        fx.lifecycle
            .change_status(fx.event_id, EventStatus::Closed)
            .await
            .unwrap();
        assert!(fx.records.get(&fx.event_key).await.unwrap().is_none());
        assert!(fx.platform.stop_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_twice_is_idempotent() {
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::NotStarted);
        let fx = fixture(event, admin);

        fx.lifecycle
            .change_status(fx.event_id, EventStatus::Live)
            .await
            .unwrap();
        let first = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Closed)
            .await
            .unwrap();
        let second = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Closed)
            .await
            .unwrap();

        assert_eq!(second.status, "closed");
        assert_eq!(second.show_ended_at, first.show_ended_at);
        assert!(fx.records.get(&fx.event_key).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(fx.platform.stop_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backward_transitions_are_rejected() {
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);
        let fx = fixture(event, admin);

        let err = fx
            .lifecycle
            .change_status(fx.event_id, EventStatus::Preshow)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(fx.events.get(fx.event_id).status, "live");
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);
        let fx = fixture(event, admin);

        let err = fx
            .lifecycle
            .change_status(Uuid::new_v4(), EventStatus::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
