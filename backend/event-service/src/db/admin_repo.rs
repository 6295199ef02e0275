/// Admin repository - database operations for admins
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Admin, CreateAdminRequest, UpdateAdminRequest};

const ADMIN_COLUMNS: &str = "id, display_name, email, api_key, api_secret_sealed, \
     hls_enabled, http_support, superadmin, created_at, updated_at";

/// Create an admin. The id is minted by the caller because the sealed
/// secret is bound to it. Returns `None` when the email is taken.
pub async fn create_admin(
    pool: &PgPool,
    id: Uuid,
    req: &CreateAdminRequest,
    api_secret_sealed: &str,
) -> Result<Option<Admin>, sqlx::Error> {
    let query = format!(
        r#"
        INSERT INTO admins (id, display_name, email, api_key, api_secret_sealed,
                            hls_enabled, http_support, superadmin)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {ADMIN_COLUMNS}
        "#
    );
    let inserted = sqlx::query_as::<_, Admin>(&query)
        .bind(id)
        .bind(&req.display_name)
        .bind(&req.email)
        .bind(&req.api_key)
        .bind(api_secret_sealed)
        .bind(req.hls_enabled)
        .bind(req.http_support)
        .bind(req.superadmin)
        .fetch_one(pool)
        .await;

    match inserted {
        Ok(admin) => Ok(Some(admin)),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn find_admin_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Admin>, sqlx::Error> {
    let query = format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE id = $1");
    sqlx::query_as::<_, Admin>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_admins(pool: &PgPool) -> Result<Vec<Admin>, sqlx::Error> {
    let query = format!("SELECT {ADMIN_COLUMNS} FROM admins ORDER BY created_at DESC");
    sqlx::query_as::<_, Admin>(&query).fetch_all(pool).await
}

pub async fn update_admin(
    pool: &PgPool,
    id: Uuid,
    req: &UpdateAdminRequest,
) -> Result<Option<Admin>, sqlx::Error> {
    let query = format!(
        r#"
        UPDATE admins
        SET display_name = COALESCE($2, display_name),
            hls_enabled = COALESCE($3, hls_enabled),
            http_support = COALESCE($4, http_support),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {ADMIN_COLUMNS}
        "#
    );
    sqlx::query_as::<_, Admin>(&query)
        .bind(id)
        .bind(&req.display_name)
        .bind(req.hls_enabled)
        .bind(req.http_support)
        .fetch_optional(pool)
        .await
}

/// Delete an admin and every event it owns, in one transaction.
pub async fn delete_admin(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM events WHERE admin_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM admins WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
