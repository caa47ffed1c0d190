// src/routes/user_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::hash_password,
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        clean_optional, deserialize_double_option, ok, validate_email, validate_required, ApiOk,
        AppState, OkResponse, PageQuery, Paged,
    },
    routes::auth_routes::validate_new_password,
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserPublicRow {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub role_id: Uuid,
    pub role_name: String,
    pub branch_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

const USER_PUBLIC_SELECT: &str = r#"
    SELECT u.user_id, u.username, u.display_name, u.email, u.role_id, r.name AS role_name,
           u.branch_id, u.is_active, u.created_at
    FROM app_user u
    JOIN role r ON r.role_id = u.role_id
"#;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub password: String,
    pub role_id: Uuid,
    pub branch_id: Option<Uuid>,
    pub is_active: Option<bool>, // default true
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    pub role_id: Option<Uuid>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub branch_id: Option<Option<Uuid>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/users
        .route("/", get(list_users).post(create_user))
        // /api/v1/users/{user_id}
        .route("/{user_id}", get(get_user).patch(update_user))
        .route("/{user_id}/disable", post(disable_user))
        .route("/{user_id}/enable", post(enable_user))
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListUsersQuery>,
) -> Result<Json<ApiOk<Paged<UserPublicRow>>>, ApiError> {
    auth.require("users.manage")?;
    let (page, page_size) = PageQuery::new(q.page, q.page_size).resolve()?;

    let like = q
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{s}%"));

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM app_user u
        WHERE ($1::text IS NULL OR u.username ILIKE $1 OR u.display_name ILIKE $1)
        "#,
    )
    .bind(like.as_deref())
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let users: Vec<UserPublicRow> = sqlx::query_as::<_, UserPublicRow>(&format!(
        r#"{USER_PUBLIC_SELECT}
        WHERE ($1::text IS NULL OR u.username ILIKE $1 OR u.display_name ILIKE $1)
        ORDER BY u.created_at DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(like.as_deref())
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(Paged::new(users, page, page_size, total))))
}

async fn load_user(state: &AppState, user_id: Uuid) -> Result<UserPublicRow, ApiError> {
    sqlx::query_as::<_, UserPublicRow>(&format!("{USER_PUBLIC_SELECT} WHERE u.user_id = $1"))
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("user"))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    auth.require("users.manage")?;
    Ok(Json(ApiOk::new(load_user(&state, user_id).await?)))
}

fn validate_username(username: &str) -> Result<String, ApiError> {
    let u = validate_required("username", username, 64)?;
    if u.chars().count() < 3 {
        return Err(ApiError::validation("username must be at least 3 characters"));
    }
    if u.contains(char::is_whitespace) {
        return Err(ApiError::validation("username cannot contain spaces"));
    }
    Ok(u)
}

fn clean_email(email: Option<&str>) -> Result<Option<String>, ApiError> {
    let email = clean_optional("email", email, 256)?;
    if let Some(e) = &email {
        validate_email(e)?;
    }
    Ok(email)
}

/// Hashes the password exactly as sent; login verifies the same bytes.
fn initial_password_hash(password: &str) -> Result<String, ApiError> {
    validate_new_password(password)?;
    hash_password(password).map_err(ApiError::Internal)
}

pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    auth.require("users.manage")?;

    let username = validate_username(&req.username)?;
    let display_name = validate_required("display_name", &req.display_name, 128)?;
    let email = clean_email(req.email.as_deref())?;
    let is_active = req.is_active.unwrap_or(true);

    let pw_hash = initial_password_hash(&req.password)?;

    // unique violation on username surfaces as 409 through db_error
    let user_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO app_user (username, display_name, email, password_hash, role_id, branch_id, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING user_id
        "#,
    )
    .bind(&username)
    .bind(&display_name)
    .bind(email)
    .bind(&pw_hash)
    .bind(req.role_id)
    .bind(req.branch_id)
    .bind(is_active)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(user_id = %user_id, by = %auth.user_id, "user created");
    Ok(Json(ApiOk::new(load_user(&state, user_id).await?)))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    auth.require("users.manage")?;

    let existing = load_user(&state, user_id).await?;

    let display_name = match req.display_name.as_deref() {
        Some(s) => validate_required("display_name", s, 128)?,
        None => existing.display_name.clone(),
    };
    let email = match req.email {
        Some(e) => clean_email(e.as_deref())?,
        None => existing.email.clone(),
    };
    let role_id = req.role_id.unwrap_or(existing.role_id);
    let branch_id = req.branch_id.unwrap_or(existing.branch_id);
    let is_active = req.is_active.unwrap_or(existing.is_active);

    if user_id == auth.user_id && !is_active {
        return Err(ApiError::validation("you cannot disable your own account"));
    }

    sqlx::query(
        r#"
        UPDATE app_user
        SET display_name = $1,
            email = $2,
            role_id = $3,
            branch_id = $4,
            is_active = $5,
            updated_at = now()
        WHERE user_id = $6
        "#,
    )
    .bind(&display_name)
    .bind(email)
    .bind(role_id)
    .bind(branch_id)
    .bind(is_active)
    .bind(user_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(load_user(&state, user_id).await?)))
}

async fn set_active(state: &AppState, user_id: Uuid, active: bool) -> Result<(), ApiError> {
    let res = sqlx::query(
        r#"
        UPDATE app_user
        SET is_active = $1, updated_at = now()
        WHERE user_id = $2
        "#,
    )
    .bind(active)
    .bind(user_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("user"));
    }

    if !active {
        // a disabled user cannot refresh; access tokens expire on their own
        sqlx::query(
            r#"
            UPDATE refresh_token
            SET revoked_at = now()
            WHERE user_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?;
    }
    Ok(())
}

pub async fn disable_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("users.manage")?;
    if user_id == auth.user_id {
        return Err(ApiError::validation("you cannot disable your own account"));
    }
    set_active(&state, user_id, false).await?;
    Ok(Json(ok()))
}

pub async fn enable_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("users.manage")?;
    set_active(&state, user_id, true).await?;
    Ok(Json(ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("  alice ").unwrap(), "alice");
        assert!(validate_username("al").is_err()); // Too short
        assert!(validate_username("").is_err());
        assert!(validate_username("  ").is_err()); // Only whitespace
        assert!(validate_username("ana ruiz").is_err());
    }

    #[test]
    fn test_clean_email() {
        assert_eq!(clean_email(Some(" ana@x.co ")).unwrap(), Some("ana@x.co".into()));
        assert_eq!(clean_email(Some("")).unwrap(), None);
        assert!(clean_email(Some("nope")).is_err());
    }

    #[test]
    fn created_user_can_log_in_with_the_password_as_typed() {
        let req: CreateUserRequest = serde_json::from_value(serde_json::json!({
            "username": "ana",
            "display_name": "Ana",
            "password": "  secret123  ",
            "role_id": Uuid::new_v4(),
        }))
        .unwrap();
        let hash = initial_password_hash(&req.password).unwrap();
        assert!(crate::auth::verify_password("  secret123  ", &hash));
        assert!(initial_password_hash("  short  ").is_err());
    }

    #[test]
    fn patch_body_distinguishes_null_from_absent() {
        let absent: UpdateUserRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert!(absent.branch_id.is_none());

        let cleared: UpdateUserRequest = serde_json::from_str(r#"{"branch_id": null}"#).unwrap();
        assert_eq!(cleared.branch_id, Some(None));
    }
}
