/// Event handlers - HTTP endpoints for event operations
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{admin_repo, event_repo};
use crate::error::{AppError, AppResult};
use crate::models::{ChangeStatusRequest, CreateEventRequest, UpdateEventRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsQuery {
    pub admin_id: Option<Uuid>,
}

pub async fn list_events(
    state: web::Data<AppState>,
    query: web::Query<ListEventsQuery>,
) -> AppResult<HttpResponse> {
    let events = event_repo::list_events(&state.pool, query.admin_id).await?;
    Ok(HttpResponse::Ok().json(events))
}

pub async fn get_event(
    state: web::Data<AppState>,
    event_id: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let event = event_repo::find_event_by_id(&state.pool, *event_id)
        .await?
        .ok_or_else(|| AppError::NotFound("event not found".to_string()))?;
    Ok(HttpResponse::Ok().json(event))
}

/// Create an event. Mints the backstage and stage sessions from the video
/// platform before anything is persisted.
pub async fn create_event(
    state: web::Data<AppState>,
    req: web::Json<CreateEventRequest>,
) -> AppResult<HttpResponse> {
    if req.name.is_empty() || req.fan_url.is_empty() {
        return Err(AppError::BadRequest("name and fanUrl are required".to_string()));
    }

    let req = req.into_inner();
    let admin = admin_repo::find_admin_by_id(&state.pool, req.admin_id)
        .await?
        .ok_or_else(|| AppError::NotFound("admin not found".to_string()))?;
    let creds = state.credentials_for(&admin)?;

    let (session_id, stage_session_id) = tokio::try_join!(
        state.platform.create_session(&creds),
        state.platform.create_session(&creds),
    )
    .map_err(|e| AppError::Platform(e.to_string()))?;

    let event = event_repo::create_event(&state.pool, &req, &session_id, &stage_session_id)
        .await?
        .ok_or_else(|| {
            AppError::Conflict("an open event already uses this fan URL".to_string())
        })?;
    Ok(HttpResponse::Created().json(event))
}

pub async fn update_event(
    state: web::Data<AppState>,
    event_id: web::Path<Uuid>,
    req: web::Json<UpdateEventRequest>,
) -> AppResult<HttpResponse> {
    let event = event_repo::update_event(&state.pool, *event_id, &req.into_inner())
        .await?
        .ok_or_else(|| AppError::NotFound("event not found".to_string()))?;
    Ok(HttpResponse::Ok().json(event))
}

/// Admin-triggered status transition; the lifecycle service owns the side
/// effects and validation.
pub async fn change_status(
    state: web::Data<AppState>,
    event_id: web::Path<Uuid>,
    req: web::Json<ChangeStatusRequest>,
) -> AppResult<HttpResponse> {
    let event = state.lifecycle.change_status(*event_id, req.status).await?;
    Ok(HttpResponse::Ok().json(event))
}

pub async fn delete_event(
    state: web::Data<AppState>,
    event_id: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    if !event_repo::delete_event(&state.pool, *event_id).await? {
        return Err(AppError::NotFound("event not found".to_string()));
    }
    Ok(HttpResponse::NoContent().finish())
}
