/// Broadcast orchestrator.
///
/// Bridges the event lifecycle to the vendor's CDN broadcast lifecycle:
/// start-once semantics for the lazy broadcast start, a deferred stop so CDN
/// viewers are not cut off early, and a hard record expiry as the safety net
/// against state leaked by crashed clients.
///
/// The orchestrator exclusively owns the broadcast records and the registry
/// of their timers. Registry entries are removed on both graceful stop and
/// expiry, and removing an entry cancels its timer.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::cache::{BroadcastRecord, BroadcastStore};
use crate::error::AppResult;
use crate::models::{Admin, Event};
use crate::services::opentok::{PlatformCredentials, PlatformError, VideoPlatform};

/// The CDN feed trails the interactive session by roughly a minute of
/// encoding and upload lag. The same window delays the stop call, so viewers
/// watching the delayed feed see the broadcast to its end.
pub const CDN_PROPAGATION_DELAY: Duration = Duration::from_secs(60);

/// Hard lifetime of a broadcast record, measured from creation.
pub const BROADCAST_RECORD_TTL: Duration = Duration::from_secs(120 * 60);

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorTiming {
    pub stop_delay: Duration,
    pub record_ttl: Duration,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        Self {
            stop_delay: CDN_PROPAGATION_DELAY,
            record_ttl: BROADCAST_RECORD_TTL,
        }
    }
}

/// A scheduled background task that dies with its guard.
struct TaskGuard {
    shutdown: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        self.handle.abort();
    }
}

struct ActiveBroadcast {
    _expiry: TaskGuard,
}

pub struct BroadcastOrchestrator {
    store: Arc<dyn BroadcastStore>,
    platform: Arc<dyn VideoPlatform>,
    active: Arc<RwLock<HashMap<String, ActiveBroadcast>>>,
    pending_stops: Arc<Mutex<HashMap<String, TaskGuard>>>,
    timing: OrchestratorTiming,
}

impl BroadcastOrchestrator {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        platform: Arc<dyn VideoPlatform>,
        timing: OrchestratorTiming,
    ) -> Self {
        Self {
            store,
            platform,
            active: Arc::new(RwLock::new(HashMap::new())),
            pending_stops: Arc::new(Mutex::new(HashMap::new())),
            timing,
        }
    }

    /// Idempotently create the broadcast record for an event and arm its
    /// expiry timer. Later calls for the same event are no-ops.
    pub async fn ensure_record(&self, event: &Event, admin: &Admin) -> AppResult<()> {
        let record = BroadcastRecord::for_event(event, admin);
        let created = self
            .store
            .put_if_absent(&record, self.timing.record_ttl)
            .await?;
        if created {
            let key = record.event_key();
            let guard = self.spawn_expiry(key.clone());
            self.active
                .write()
                .await
                .insert(key.clone(), ActiveBroadcast { _expiry: guard });
            tracing::info!(event_key = %key, "broadcast record created");
        }
        Ok(())
    }

    /// React to a record change: when the event is live, a CDN output is
    /// configured and no broadcast exists yet, start one and persist the
    /// result. Safe under concurrent invocation; a vendor 409 means someone
    /// else already started it and is treated as success.
    pub async fn notify_record_changed(
        &self,
        event_key: &str,
        creds: &PlatformCredentials,
    ) -> AppResult<Option<BroadcastRecord>> {
        let Some(current) = self.store.get(event_key).await? else {
            return Ok(None);
        };
        if !current.should_start_cdn() {
            return Ok(Some(current));
        }

        match self
            .platform
            .start_broadcast(
                creds,
                &current.stage_session_id,
                current.hls_enabled,
                current.rtmp_url.as_deref(),
            )
            .await
        {
            Ok(started) => {
                let available_at = started.created_at
                    + chrono::Duration::seconds(CDN_PROPAGATION_DELAY.as_secs() as i64);
                let updated = self
                    .update_record(event_key, |record| {
                        if record.broadcast_id.is_none() {
                            record.broadcast_id = Some(started.id.clone());
                            record.broadcast_url = started.hls_url.clone();
                            record.available_at = Some(available_at);
                        }
                    })
                    .await?;
                tracing::info!(%event_key, broadcast_id = %started.id, "CDN broadcast started");
                Ok(updated)
            }
            Err(PlatformError::AlreadyStarted) => {
                tracing::debug!(%event_key, "broadcast already running, keeping existing record");
                self.store.get(event_key).await
            }
            Err(err) => {
                tracing::error!(%event_key, error = %err, "broadcast start failed, will retry on next record change");
                Ok(Some(current))
            }
        }
    }

    /// Flag the record live and give the lazy CDN start a chance to run.
    pub async fn mark_live(
        &self,
        event_key: &str,
        creds: &PlatformCredentials,
    ) -> AppResult<Option<BroadcastRecord>> {
        let updated = self
            .update_record(event_key, |record| record.event_live = true)
            .await?;
        if updated.is_none() {
            return Ok(None);
        }
        self.notify_record_changed(event_key, creds).await
    }

    /// Schedule the vendor stop call after the propagation delay. The call
    /// survives record deletion; scheduling twice for one event is a no-op.
    pub async fn stop(&self, broadcast_id: String, event_key: &str, creds: &PlatformCredentials) {
        let mut stops = self.pending_stops.lock().await;
        if stops.contains_key(event_key) {
            tracing::debug!(%event_key, "broadcast stop already scheduled");
            return;
        }

        let (tx, mut rx) = watch::channel(());
        let platform = self.platform.clone();
        let store = self.store.clone();
        let pending = self.pending_stops.clone();
        let delay = self.timing.stop_delay;
        let key = event_key.to_string();
        let creds = creds.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = rx.changed() => return,
                _ = sleep(delay) => {}
            }
            if let Err(err) = platform.stop_broadcast(&creds, &broadcast_id).await {
                tracing::error!(%broadcast_id, error = %err, "failed to stop CDN broadcast");
            } else {
                tracing::info!(%broadcast_id, "CDN broadcast stopped");
            }
            if let Err(err) = mark_ended(store.as_ref(), &key).await {
                tracing::warn!(event_key = %key, error = %err, "failed to mark broadcast record ended");
            }
            pending.lock().await.remove(&key);
        });

        stops.insert(
            event_key.to_string(),
            TaskGuard {
                shutdown: tx,
                handle,
            },
        );
        tracing::info!(%event_key, delay_secs = delay.as_secs(), "broadcast stop scheduled");
    }

    /// Drop the record and cancel its expiry timer. Idempotent.
    pub async fn delete_record(&self, event_key: &str) -> AppResult<()> {
        if let Some(record) = self.store.get(event_key).await? {
            self.store.delete(&record).await?;
        }
        self.active.write().await.remove(event_key);
        Ok(())
    }

    pub async fn broadcast_data(&self, event_key: &str) -> AppResult<Option<BroadcastRecord>> {
        self.store.get(event_key).await
    }

    pub async fn broadcast_data_by_session(
        &self,
        session_id: &str,
    ) -> AppResult<Option<BroadcastRecord>> {
        self.store.get_by_session(session_id).await
    }

    /// Re-read/modify/conditional-write loop over one record. Returns the
    /// stored record after the mutation, or `None` when no record exists.
    async fn update_record<F>(&self, event_key: &str, mutate: F) -> AppResult<Option<BroadcastRecord>>
    where
        F: Fn(&mut BroadcastRecord),
    {
        loop {
            let Some(current) = self.store.get(event_key).await? else {
                return Ok(None);
            };
            let mut next = current.clone();
            mutate(&mut next);
            if next == current {
                return Ok(Some(current));
            }
            if self.store.compare_and_swap(&current, &next).await? {
                return Ok(Some(next));
            }
        }
    }

    fn spawn_expiry(&self, event_key: String) -> TaskGuard {
        let store = self.store.clone();
        let active = self.active.clone();
        let ttl = self.timing.record_ttl;
        let (tx, mut rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = rx.changed() => {}
                _ = sleep(ttl) => {
                    tracing::warn!(event_key = %event_key, "broadcast record expired without a graceful stop");
                    if let Ok(Some(record)) = store.get(&event_key).await {
                        let _ = store.delete(&record).await;
                    }
                    active.write().await.remove(&event_key);
                }
            }
        });

        TaskGuard {
            shutdown: tx,
            handle,
        }
    }
}

async fn mark_ended(store: &dyn BroadcastStore, event_key: &str) -> AppResult<()> {
    loop {
        let Some(current) = store.get(event_key).await? else {
            return Ok(());
        };
        if current.ended {
            return Ok(());
        }
        let mut next = current.clone();
        next.ended = true;
        if store.compare_and_swap(&current, &next).await? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBroadcastStore;
    use crate::models::EventStatus;
    use crate::services::testing::{test_admin, test_event, MockPlatform};
    use std::sync::atomic::Ordering;
    use tokio::sync::Barrier;

    fn orchestrator(
        platform: Arc<MockPlatform>,
        timing: OrchestratorTiming,
    ) -> (BroadcastOrchestrator, Arc<MemoryBroadcastStore>) {
        let store = Arc::new(MemoryBroadcastStore::new());
        let orch = BroadcastOrchestrator::new(store.clone(), platform, timing);
        (orch, store)
    }

    fn creds() -> PlatformCredentials {
        PlatformCredentials {
            api_key: "46112222".to_string(),
            api_secret: "sekrit".to_string(),
        }
    }

    #[tokio::test]
    async fn ensure_record_is_create_once() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, store) = orchestrator(platform, OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Preshow);

        orch.ensure_record(&event, &admin).await.unwrap();
        orch.ensure_record(&event, &admin).await.unwrap();

        let key = crate::cache::event_key(event.admin_id, &event.fan_url);
        let record = store.get(&key).await.unwrap().unwrap();
        assert!(!record.event_live);
        assert!(record.broadcast_id.is_none());
        assert_eq!(orch.active.read().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_retain_exactly_one_broadcast() {
        let barrier = Arc::new(Barrier::new(2));
        let platform = Arc::new(MockPlatform {
            start_barrier: Some(barrier),
            ..MockPlatform::default()
        });
        let (orch, store) = orchestrator(platform.clone(), OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);

        // Both attempts observe "not yet started" before either calls out.
        let creds = creds();
        let (a, b) = tokio::join!(
            orch.notify_record_changed(&key, &creds),
            orch.notify_record_changed(&key, &creds),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(platform.start_calls.load(Ordering::SeqCst), 2);
        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.broadcast_id, Some("bcast-1".to_string()));
        assert!(record.broadcast_url.is_some());
        assert!(record.available_at.is_some());
    }

    #[tokio::test]
    async fn failed_start_leaves_record_clean_for_retry() {
        let platform = Arc::new(MockPlatform::default());
        platform.fail_next_start.store(true, Ordering::SeqCst);
        let (orch, store) = orchestrator(platform.clone(), OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);

        orch.notify_record_changed(&key, &creds()).await.unwrap();
        assert!(store.get(&key).await.unwrap().unwrap().broadcast_id.is_none());

        orch.notify_record_changed(&key, &creds()).await.unwrap();
        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.broadcast_id, Some("bcast-1".to_string()));
        assert_eq!(platform.start_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn notify_without_cdn_output_never_starts() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, _store) = orchestrator(platform.clone(), OrchestratorTiming::default());
        let admin = test_admin(false);
        let event = test_event(&admin, EventStatus::Live);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);
        orch.notify_record_changed(&key, &creds()).await.unwrap();

        assert_eq!(platform.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mark_live_triggers_lazy_start() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, store) = orchestrator(platform.clone(), OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Preshow);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);

        let record = orch.mark_live(&key, &creds()).await.unwrap().unwrap();
        assert!(record.event_live);
        assert_eq!(record.broadcast_id, Some("bcast-1".to_string()));
        assert_eq!(platform.start_calls.load(Ordering::SeqCst), 1);
        assert!(store.get(&key).await.unwrap().unwrap().event_live);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_deferred_and_deduplicated() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, store) = orchestrator(platform.clone(), OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);
        orch.notify_record_changed(&key, &creds()).await.unwrap();

        orch.stop("bcast-1".to_string(), &key, &creds()).await;
        orch.stop("bcast-1".to_string(), &key, &creds()).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        tokio::task::yield_now().await;
        assert!(platform.stop_calls.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(
            platform.stop_calls.lock().unwrap().as_slice(),
            ["bcast-1".to_string()]
        );
        assert!(store.get(&key).await.unwrap().unwrap().ended);
    }

    #[tokio::test(start_paused = true)]
    async fn record_expires_after_hard_ttl() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, store) = orchestrator(platform, OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Preshow);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);

        tokio::time::advance(BROADCAST_RECORD_TTL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(orch.active.read().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_record_cancels_expiry() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, store) = orchestrator(platform, OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Preshow);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);
        orch.delete_record(&key).await.unwrap();
        orch.delete_record(&key).await.unwrap();

        assert!(orch.active.read().await.is_empty());
        tokio::time::advance(BROADCAST_RECORD_TTL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_survives_record_deletion() {
        let platform = Arc::new(MockPlatform::default());
        let (orch, _store) = orchestrator(platform.clone(), OrchestratorTiming::default());
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        orch.ensure_record(&event, &admin).await.unwrap();
        let key = crate::cache::event_key(event.admin_id, &event.fan_url);
        orch.notify_record_changed(&key, &creds()).await.unwrap();

        orch.stop("bcast-1".to_string(), &key, &creds()).await;
        orch.delete_record(&key).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(
            platform.stop_calls.lock().unwrap().as_slice(),
            ["bcast-1".to_string()]
        );
    }
}
