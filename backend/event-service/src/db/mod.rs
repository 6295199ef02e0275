/// Database access for the event service.
///
/// Repositories are free functions over a `PgPool` (`event_repo`,
/// `admin_repo`). The narrow `EventStore`/`AdminStore` traits cover the
/// operations the lifecycle and admission paths need, so those paths can be
/// exercised against in-memory fakes.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Admin, Event, EventStatus};

pub mod admin_repo;
pub mod event_repo;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

/// Accumulated updates for one status transition, persisted in a single
/// UPDATE. Optional fields only overwrite when set.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub status: EventStatus,
    pub show_started_at: Option<DateTime<Utc>>,
    pub show_ended_at: Option<DateTime<Utc>>,
    pub archive_id: Option<String>,
    pub archive_url: Option<String>,
}

impl StatusChange {
    pub fn to(status: EventStatus) -> Self {
        Self {
            status,
            show_started_at: None,
            show_ended_at: None,
            archive_id: None,
            archive_url: None,
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find(&self, id: Uuid) -> AppResult<Option<Event>>;
    async fn find_by_fan_url(&self, admin_id: Uuid, fan_url: &str) -> AppResult<Option<Event>>;
    async fn apply_status_change(&self, id: Uuid, change: StatusChange) -> AppResult<Event>;
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn find(&self, id: Uuid) -> AppResult<Option<Admin>>;
}

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn find(&self, id: Uuid) -> AppResult<Option<Event>> {
        Ok(event_repo::find_event_by_id(&self.pool, id).await?)
    }

    async fn find_by_fan_url(&self, admin_id: Uuid, fan_url: &str) -> AppResult<Option<Event>> {
        Ok(event_repo::find_event_by_fan_url(&self.pool, admin_id, fan_url).await?)
    }

    async fn apply_status_change(&self, id: Uuid, change: StatusChange) -> AppResult<Event> {
        event_repo::apply_status_change(&self.pool, id, &change)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event {id} not found")))
    }
}

pub struct PgAdminStore {
    pool: PgPool,
}

impl PgAdminStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AdminStore for PgAdminStore {
    async fn find(&self, id: Uuid) -> AppResult<Option<Admin>> {
        Ok(admin_repo::find_admin_by_id(&self.pool, id).await?)
    }
}
