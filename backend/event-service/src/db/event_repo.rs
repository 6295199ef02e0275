/// Event repository - database operations for events
use sqlx::PgPool;
use uuid::Uuid;

use super::StatusChange;
use crate::models::{CreateEventRequest, Event, EventStatus, UpdateEventRequest};

const EVENT_COLUMNS: &str = "id, admin_id, name, fan_url, celebrity_url, host_url, \
     archive_event, uncomposed, session_id, stage_session_id, status, \
     archive_id, archive_url, rtmp_url, redirect_url, start_image, end_image, \
     date_time_start, date_time_end, show_started_at, show_ended_at, \
     created_at, updated_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Create an event with freshly minted session ids.
/// Returns `None` when an open event already uses this (admin, fan URL).
pub async fn create_event(
    pool: &PgPool,
    req: &CreateEventRequest,
    session_id: &str,
    stage_session_id: &str,
) -> Result<Option<Event>, sqlx::Error> {
    let query = format!(
        r#"
        INSERT INTO events (admin_id, name, fan_url, celebrity_url, host_url,
                            archive_event, uncomposed, session_id, stage_session_id, status,
                            rtmp_url, redirect_url, start_image, end_image,
                            date_time_start, date_time_end)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        RETURNING {EVENT_COLUMNS}
        "#
    );

    let inserted = sqlx::query_as::<_, Event>(&query)
        .bind(req.admin_id)
        .bind(&req.name)
        .bind(&req.fan_url)
        .bind(&req.celebrity_url)
        .bind(&req.host_url)
        .bind(req.archive_event)
        .bind(req.uncomposed)
        .bind(session_id)
        .bind(stage_session_id)
        .bind(EventStatus::NotStarted.as_str())
        .bind(&req.rtmp_url)
        .bind(&req.redirect_url)
        .bind(&req.start_image)
        .bind(&req.end_image)
        .bind(req.date_time_start)
        .bind(req.date_time_end)
        .fetch_one(pool)
        .await;

    match inserted {
        Ok(event) => Ok(Some(event)),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn find_event_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Event>, sqlx::Error> {
    let query = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
    sqlx::query_as::<_, Event>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// List events, optionally restricted to one admin, newest first.
pub async fn list_events(
    pool: &PgPool,
    admin_id: Option<Uuid>,
) -> Result<Vec<Event>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM events
        WHERE ($1::uuid IS NULL OR admin_id = $1)
        ORDER BY created_at DESC
        "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(admin_id)
        .fetch_all(pool)
        .await
}

/// Resolve the routing slug used by fans joining an event. Prefers the open
/// event when a closed one still carries the same slug.
pub async fn find_event_by_fan_url(
    pool: &PgPool,
    admin_id: Uuid,
    fan_url: &str,
) -> Result<Option<Event>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM events
        WHERE admin_id = $1 AND fan_url = $2
        ORDER BY (status = 'closed') ASC, created_at DESC
        LIMIT 1
        "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(admin_id)
        .bind(fan_url)
        .fetch_optional(pool)
        .await
}

pub async fn update_event(
    pool: &PgPool,
    id: Uuid,
    req: &UpdateEventRequest,
) -> Result<Option<Event>, sqlx::Error> {
    let query = format!(
        r#"
        UPDATE events
        SET name = COALESCE($2, name),
            rtmp_url = COALESCE($3, rtmp_url),
            redirect_url = COALESCE($4, redirect_url),
            start_image = COALESCE($5, start_image),
            end_image = COALESCE($6, end_image),
            date_time_start = COALESCE($7, date_time_start),
            date_time_end = COALESCE($8, date_time_end),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {EVENT_COLUMNS}
        "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(id)
        .bind(&req.name)
        .bind(&req.rtmp_url)
        .bind(&req.redirect_url)
        .bind(&req.start_image)
        .bind(&req.end_image)
        .bind(req.date_time_start)
        .bind(req.date_time_end)
        .fetch_optional(pool)
        .await
}

/// Persist one status transition as a single update. Timestamps and archive
/// fields only fill in when previously unset, which keeps a replayed
/// transition from rewriting history.
pub async fn apply_status_change(
    pool: &PgPool,
    id: Uuid,
    change: &StatusChange,
) -> Result<Option<Event>, sqlx::Error> {
    let query = format!(
        r#"
        UPDATE events
        SET status = $2,
            show_started_at = COALESCE(show_started_at, $3),
            show_ended_at = COALESCE(show_ended_at, $4),
            archive_id = COALESCE(archive_id, $5),
            archive_url = COALESCE(archive_url, $6),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {EVENT_COLUMNS}
        "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(id)
        .bind(change.status.as_str())
        .bind(change.show_started_at)
        .bind(change.show_ended_at)
        .bind(&change.archive_id)
        .bind(&change.archive_url)
        .fetch_optional(pool)
        .await
}

pub async fn delete_event(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM events WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_events_by_admin(pool: &PgPool, admin_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM events WHERE admin_id = $1")
        .bind(admin_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
