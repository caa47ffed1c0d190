// src/routes/role_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{clean_optional, ok, validate_required, ApiOk, AppState, OkResponse},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/{role_id}", get(get_role).patch(update_role).delete(delete_role))
        .route("/roles/{role_id}/permissions", put(put_role_permissions))
        .route("/permissions", get(list_permissions))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct RoleRow {
    pub role_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RoleDetail {
    #[serde(flatten)]
    pub role: RoleRow,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PermissionRow {
    pub code: String,
    pub description: String,
}

pub async fn load_role_permissions(db: &sqlx::PgPool, role_id: Uuid) -> Result<Vec<String>, ApiError> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT permission_code
        FROM role_permission
        WHERE role_id = $1
        ORDER BY permission_code
        "#,
    )
    .bind(role_id)
    .fetch_all(db)
    .await
    .map_err(db_error)
}

async fn load_role(state: &AppState, role_id: Uuid) -> Result<RoleRow, ApiError> {
    sqlx::query_as::<_, RoleRow>(
        r#"
        SELECT role_id, name, description, is_system, created_at, updated_at
        FROM role
        WHERE role_id = $1
        "#,
    )
    .bind(role_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("role"))
}

pub async fn list_roles(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<RoleRow>>>, ApiError> {
    auth.require("roles.manage")?;

    let rows = sqlx::query_as::<_, RoleRow>(
        r#"
        SELECT role_id, name, description, is_system, created_at, updated_at
        FROM role
        ORDER BY is_system DESC, name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

pub async fn get_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
) -> Result<Json<ApiOk<RoleDetail>>, ApiError> {
    auth.require("roles.manage")?;

    let role = load_role(&state, role_id).await?;
    let permissions = load_role_permissions(&state.db, role_id).await?;
    Ok(Json(ApiOk::new(RoleDetail { role, permissions })))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub description: Option<String>,
    pub permissions: Option<Vec<String>>,
}

pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateRoleRequest>,
) -> Result<Json<ApiOk<RoleDetail>>, ApiError> {
    auth.require("roles.manage")?;

    let name = validate_required("name", &req.name, 64)?;
    let description = clean_optional("description", req.description.as_deref(), 256)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let role: RoleRow = sqlx::query_as::<_, RoleRow>(
        r#"
        INSERT INTO role (name, description)
        VALUES ($1, $2)
        RETURNING role_id, name, description, is_system, created_at, updated_at
        "#,
    )
    .bind(&name)
    .bind(description)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;

    let permissions = normalize_permission_codes(req.permissions.unwrap_or_default());
    replace_permissions(&mut tx, role.role_id, &permissions).await?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(role_id = %role.role_id, name = %role.name, "role created");
    Ok(Json(ApiOk::new(RoleDetail { role, permissions })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<ApiOk<RoleRow>>, ApiError> {
    auth.require("roles.manage")?;

    let existing = load_role(&state, role_id).await?;

    let name = match req.name.as_deref() {
        Some(n) => {
            let n = validate_required("name", n, 64)?;
            if existing.is_system && n != existing.name {
                return Err(ApiError::Conflict(
                    "SYSTEM_ROLE",
                    "system roles cannot be renamed".into(),
                ));
            }
            n
        }
        None => existing.name.clone(),
    };
    let description = match req.description.as_deref() {
        Some(d) => clean_optional("description", Some(d), 256)?,
        None => existing.description.clone(),
    };

    let role = sqlx::query_as::<_, RoleRow>(
        r#"
        UPDATE role
        SET name = $1, description = $2, updated_at = now()
        WHERE role_id = $3
        RETURNING role_id, name, description, is_system, created_at, updated_at
        "#,
    )
    .bind(&name)
    .bind(description)
    .bind(role_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(role)))
}

fn ensure_role_deletable(is_system: bool, users: i64) -> Result<(), ApiError> {
    if is_system {
        return Err(ApiError::Conflict(
            "SYSTEM_ROLE",
            "system roles cannot be deleted".into(),
        ));
    }
    if users > 0 {
        return Err(ApiError::Conflict(
            "ROLE_IN_USE",
            format!("role is assigned to {users} user(s)"),
        ));
    }
    Ok(())
}

pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("roles.manage")?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    // locking the role blocks user inserts that reference it until commit
    let is_system: bool =
        sqlx::query_scalar(r#"SELECT is_system FROM role WHERE role_id = $1 FOR UPDATE"#)
            .bind(role_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .ok_or_else(|| ApiError::not_found("role"))?;

    let users: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM app_user WHERE role_id = $1"#)
        .bind(role_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
    ensure_role_deletable(is_system, users)?;

    sqlx::query(r#"DELETE FROM role WHERE role_id = $1"#)
        .bind(role_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;
    tracing::info!(role_id = %role_id, by = %auth.user_id, "role deleted");
    Ok(Json(ok()))
}

#[derive(Debug, Deserialize)]
pub struct PutPermissionsRequest {
    pub permissions: Vec<String>,
}

/// PUT /roles/{id}/permissions  (replace all)
pub async fn put_role_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(role_id): Path<Uuid>,
    Json(req): Json<PutPermissionsRequest>,
) -> Result<Json<ApiOk<RoleDetail>>, ApiError> {
    auth.require("roles.manage")?;

    let role = load_role(&state, role_id).await?;
    let permissions = normalize_permission_codes(req.permissions);

    let mut tx = state.db.begin().await.map_err(db_error)?;
    replace_permissions(&mut tx, role_id, &permissions).await?;
    sqlx::query(r#"UPDATE role SET updated_at = now() WHERE role_id = $1"#)
        .bind(role_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(role_id = %role_id, count = permissions.len(), "role permissions replaced");
    Ok(Json(ApiOk::new(RoleDetail { role, permissions })))
}

pub async fn list_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<PermissionRow>>>, ApiError> {
    auth.require("roles.manage")?;

    let rows = sqlx::query_as::<_, PermissionRow>(
        r#"SELECT code, description FROM permission ORDER BY code"#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

/// Trimmed, deduplicated, sorted.
fn normalize_permission_codes(codes: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = codes
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

async fn replace_permissions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    role_id: Uuid,
    permissions: &[String],
) -> Result<(), ApiError> {
    if !permissions.is_empty() {
        let known: Vec<String> = sqlx::query_scalar(
            r#"SELECT code FROM permission WHERE code = ANY($1)"#,
        )
        .bind(permissions)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error)?;

        let unknown: Vec<&str> = permissions
            .iter()
            .filter(|p| !known.contains(p))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(ApiError::BadRequest(
                "UNKNOWN_PERMISSION",
                format!("unknown permission(s): {}", unknown.join(", ")),
            ));
        }
    }

    sqlx::query(r#"DELETE FROM role_permission WHERE role_id = $1"#)
        .bind(role_id)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

    sqlx::query(
        r#"
        INSERT INTO role_permission (role_id, permission_code)
        SELECT $1, UNNEST($2::varchar[])
        "#,
    )
    .bind(role_id)
    .bind(permissions)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_and_assigned_roles_stay() {
        assert_eq!(ensure_role_deletable(true, 0).unwrap_err().code(), "SYSTEM_ROLE");
        assert_eq!(ensure_role_deletable(false, 2).unwrap_err().code(), "ROLE_IN_USE");
        assert!(ensure_role_deletable(false, 0).is_ok());
    }

    #[test]
    fn permission_codes_are_cleaned() {
        let out = normalize_permission_codes(vec![
            " clients.read ".into(),
            "appointments.read".into(),
            "".into(),
            "clients.read".into(),
        ]);
        assert_eq!(out, vec!["appointments.read".to_string(), "clients.read".to_string()]);
    }
}
