/// Admin handlers - HTTP endpoints for admin operations
use actix_web::{web, HttpResponse};
use uuid::Uuid;

use crate::db::admin_repo;
use crate::error::{AppError, AppResult};
use crate::models::{AdminResponse, CreateAdminRequest, UpdateAdminRequest};
use crate::services::opentok::PlatformCredentials;
use crate::state::AppState;

pub async fn list_admins(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let admins = admin_repo::list_admins(&state.pool).await?;
    let response: Vec<AdminResponse> = admins.into_iter().map(AdminResponse::from).collect();
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_admin(
    state: web::Data<AppState>,
    admin_id: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let admin = admin_repo::find_admin_by_id(&state.pool, *admin_id)
        .await?
        .ok_or_else(|| AppError::NotFound("admin not found".to_string()))?;
    Ok(HttpResponse::Ok().json(AdminResponse::from(admin)))
}

/// Create an admin. The vendor credentials are validated by creating a
/// throwaway session before anything is stored; the secret is sealed and
/// never persisted in the clear.
pub async fn create_admin(
    state: web::Data<AppState>,
    req: web::Json<CreateAdminRequest>,
) -> AppResult<HttpResponse> {
    if req.email.is_empty() || req.api_key.is_empty() || req.api_secret.is_empty() {
        return Err(AppError::BadRequest(
            "email, apiKey and apiSecret are required".to_string(),
        ));
    }

    let req = req.into_inner();
    let creds = PlatformCredentials {
        api_key: req.api_key.clone(),
        api_secret: req.api_secret.clone(),
    };
    state.platform.create_session(&creds).await.map_err(|e| {
        AppError::BadRequest(format!("video platform rejected the credentials: {e}"))
    })?;

    let admin_id = Uuid::new_v4();
    let sealed = state.sealer.seal(admin_id, &req.api_secret)?;
    let admin = admin_repo::create_admin(&state.pool, admin_id, &req, &sealed)
        .await?
        .ok_or_else(|| AppError::Conflict("an admin already uses this email".to_string()))?;
    Ok(HttpResponse::Created().json(AdminResponse::from(admin)))
}

pub async fn update_admin(
    state: web::Data<AppState>,
    admin_id: web::Path<Uuid>,
    req: web::Json<UpdateAdminRequest>,
) -> AppResult<HttpResponse> {
    let admin = admin_repo::update_admin(&state.pool, *admin_id, &req.into_inner())
        .await?
        .ok_or_else(|| AppError::NotFound("admin not found".to_string()))?;
    Ok(HttpResponse::Ok().json(AdminResponse::from(admin)))
}

/// Delete an admin and, with it, every event it owns.
pub async fn delete_admin(
    state: web::Data<AppState>,
    admin_id: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    if !admin_repo::delete_admin(&state.pool, *admin_id).await? {
        return Err(AppError::NotFound("admin not found".to_string()));
    }
    Ok(HttpResponse::NoContent().finish())
}
