/// Broadcast record cache.
///
/// One ephemeral record per live event, keyed both by the composite event
/// key (admin id + fan URL) and by the stage session id. Records expire 120
/// minutes after creation no matter what; the expiry is the safety net for
/// state leaked by crashed clients.
///
/// The store deliberately exposes compare-and-swap instead of blind writes:
/// concurrent start attempts re-read before conditionally writing, so the
/// tolerated duplicate-start race can never corrupt a record.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Admin, Event, EventStatus};

pub fn event_key(admin_id: Uuid, fan_url: &str) -> String {
    format!("broadcast:event:{admin_id}:{fan_url}")
}

pub fn session_key(session_id: &str) -> String {
    format!("broadcast:session:{session_id}")
}

/// Ephemeral broadcast state for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub admin_id: Uuid,
    pub fan_url: String,
    pub stage_session_id: String,
    pub hls_enabled: bool,
    pub rtmp_url: Option<String>,
    pub broadcast_id: Option<String>,
    pub broadcast_url: Option<String>,
    /// Time after which the CDN URL is actually watchable.
    pub available_at: Option<DateTime<Utc>>,
    pub event_live: bool,
    pub ended: bool,
}

impl BroadcastRecord {
    pub fn for_event(event: &Event, admin: &Admin) -> Self {
        Self {
            admin_id: event.admin_id,
            fan_url: event.fan_url.clone(),
            stage_session_id: event.stage_session_id.clone(),
            hls_enabled: admin.hls_enabled,
            rtmp_url: event.rtmp_url.clone(),
            broadcast_id: None,
            broadcast_url: None,
            available_at: None,
            event_live: event.status() == Some(EventStatus::Live),
            ended: false,
        }
    }

    pub fn event_key(&self) -> String {
        event_key(self.admin_id, &self.fan_url)
    }

    pub fn wants_cdn(&self) -> bool {
        self.hls_enabled || self.rtmp_url.is_some()
    }

    pub fn started(&self) -> bool {
        self.broadcast_id.is_some()
    }

    /// A record is ready for a lazy CDN start once the event is live, a CDN
    /// output is configured, and no broadcast has been started yet.
    pub fn should_start_cdn(&self) -> bool {
        self.wants_cdn() && !self.started() && self.event_live && !self.ended
    }
}

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Create the record unless one already exists. Returns whether the
    /// record was created by this call.
    async fn put_if_absent(&self, record: &BroadcastRecord, ttl: Duration) -> AppResult<bool>;

    async fn get(&self, event_key: &str) -> AppResult<Option<BroadcastRecord>>;

    async fn get_by_session(&self, session_id: &str) -> AppResult<Option<BroadcastRecord>>;

    /// Replace `current` with `next` only if the stored value still equals
    /// `current`. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        current: &BroadcastRecord,
        next: &BroadcastRecord,
    ) -> AppResult<bool>;

    /// Remove the record under both of its keys. Absent records are fine.
    async fn delete(&self, record: &BroadcastRecord) -> AppResult<()>;
}

// ========================================
// Redis implementation
// ========================================

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
  return 1
else
  return 0
end
"#;

/// Redis-backed broadcast record store.
pub struct RedisBroadcastStore {
    conn: Arc<Mutex<ConnectionManager>>,
    cas: Script,
}

impl RedisBroadcastStore {
    pub async fn new(client: redis::Client) -> AppResult<Self> {
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Cache(format!("failed to connect to Redis: {e}")))?;
        Ok(Self::with_manager(Arc::new(Mutex::new(manager))))
    }

    pub fn with_manager(manager: Arc<Mutex<ConnectionManager>>) -> Self {
        Self {
            conn: manager,
            cas: Script::new(CAS_SCRIPT),
        }
    }

    fn encode(record: &BroadcastRecord) -> AppResult<String> {
        serde_json::to_string(record)
            .map_err(|e| AppError::Cache(format!("failed to serialize broadcast record: {e}")))
    }
}

#[async_trait]
impl BroadcastStore for RedisBroadcastStore {
    async fn put_if_absent(&self, record: &BroadcastRecord, ttl: Duration) -> AppResult<bool> {
        let payload = Self::encode(record)?;
        let key = record.event_key();
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.conn.lock().await;
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("EX")
            .arg(ttl_secs)
            .arg("NX")
            .query_async(&mut *conn)
            .await?;

        if created.is_some() {
            // Session alias points at the event key and shares its lifetime.
            redis::cmd("SET")
                .arg(session_key(&record.stage_session_id))
                .arg(&key)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut *conn)
                .await?;
        }
        Ok(created.is_some())
    }

    async fn get(&self, event_key: &str) -> AppResult<Option<BroadcastRecord>> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = redis::cmd("GET")
            .arg(event_key)
            .query_async(&mut *conn)
            .await?;
        match raw {
            Some(raw) => {
                let record = serde_json::from_str(&raw).map_err(|e| {
                    AppError::Cache(format!("failed to deserialize broadcast record: {e}"))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn get_by_session(&self, session_id: &str) -> AppResult<Option<BroadcastRecord>> {
        let alias = {
            let mut conn = self.conn.lock().await;
            redis::cmd("GET")
                .arg(session_key(session_id))
                .query_async::<_, Option<String>>(&mut *conn)
                .await?
        };
        match alias {
            Some(event_key) => self.get(&event_key).await,
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        current: &BroadcastRecord,
        next: &BroadcastRecord,
    ) -> AppResult<bool> {
        let expected = Self::encode(current)?;
        let replacement = Self::encode(next)?;

        let mut conn = self.conn.lock().await;
        let swapped: i32 = self
            .cas
            .key(current.event_key())
            .arg(expected)
            .arg(replacement)
            .invoke_async(&mut *conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, record: &BroadcastRecord) -> AppResult<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL")
            .arg(record.event_key())
            .arg(session_key(&record.stage_session_id))
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }
}

// ========================================
// In-memory implementation
// ========================================

/// In-process broadcast record store for tests and single-node development.
/// Mirrors the Redis semantics, including TTL-based expiry.
#[derive(Default)]
pub struct MemoryBroadcastStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, StoredRecord>,
    sessions: HashMap<String, String>,
}

struct StoredRecord {
    payload: String,
    expires_at: tokio::time::Instant,
}

impl MemoryBroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_payload(inner: &MemoryInner, key: &str) -> Option<String> {
        inner
            .records
            .get(key)
            .filter(|stored| stored.expires_at > tokio::time::Instant::now())
            .map(|stored| stored.payload.clone())
    }
}

#[async_trait]
impl BroadcastStore for MemoryBroadcastStore {
    async fn put_if_absent(&self, record: &BroadcastRecord, ttl: Duration) -> AppResult<bool> {
        let key = record.event_key();
        let mut inner = self.inner.lock().await;
        if Self::live_payload(&inner, &key).is_some() {
            return Ok(false);
        }
        inner.records.insert(
            key.clone(),
            StoredRecord {
                payload: serde_json::to_string(record)?,
                expires_at: tokio::time::Instant::now() + ttl,
            },
        );
        inner
            .sessions
            .insert(record.stage_session_id.clone(), key);
        Ok(true)
    }

    async fn get(&self, event_key: &str) -> AppResult<Option<BroadcastRecord>> {
        let inner = self.inner.lock().await;
        match Self::live_payload(&inner, event_key) {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn get_by_session(&self, session_id: &str) -> AppResult<Option<BroadcastRecord>> {
        let key = {
            let inner = self.inner.lock().await;
            inner.sessions.get(session_id).cloned()
        };
        match key {
            Some(key) => self.get(&key).await,
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        current: &BroadcastRecord,
        next: &BroadcastRecord,
    ) -> AppResult<bool> {
        let key = current.event_key();
        let expected = serde_json::to_string(current)?;
        let mut inner = self.inner.lock().await;
        match Self::live_payload(&inner, &key) {
            Some(stored) if stored == expected => {
                if let Some(entry) = inner.records.get_mut(&key) {
                    entry.payload = serde_json::to_string(next)?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, record: &BroadcastRecord) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.records.remove(&record.event_key());
        inner.sessions.remove(&record.stage_session_id);
        Ok(())
    }
}
