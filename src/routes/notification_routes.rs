// src/routes/notification_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{ok, ApiOk, AppState, OkResponse, PageQuery, Paged},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_my_notifications))
        .route("/read_all", post(mark_all_read))
        .route("/{notification_id}/read", post(mark_read))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct NotificationRow {
    pub notification_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub appointment_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// notifications addressed to the caller directly or to the caller's role
const MINE: &str = "(n.user_id = $1 OR lower(n.role_name) = lower($2))";

// read receipts are keyed by the caller ($1), never shared across a role
const WITH_READ: &str = r#"
    FROM notification n
    LEFT JOIN notification_read r
      ON r.notification_id = n.notification_id AND r.user_id = $1
"#;

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub unread_only: Option<bool>,
}

pub async fn list_my_notifications(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListNotificationsQuery>,
) -> Result<Json<ApiOk<Paged<NotificationRow>>>, ApiError> {
    let (page, page_size) = PageQuery::new(q.page, q.page_size).resolve()?;
    let unread_only = q.unread_only.unwrap_or(false);

    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) {WITH_READ} WHERE {MINE} AND (NOT $3 OR r.user_id IS NULL)"
    ))
    .bind(auth.user_id)
    .bind(&auth.role)
    .bind(unread_only)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        r#"
        SELECT n.notification_id, n.title, n.message, n.kind, n.appointment_id,
               (r.user_id IS NOT NULL) AS is_read, n.created_at
        {WITH_READ}
        WHERE {MINE} AND (NOT $3 OR r.user_id IS NULL)
        ORDER BY n.created_at DESC
        LIMIT $4 OFFSET $5
        "#
    ))
    .bind(auth.user_id)
    .bind(&auth.role)
    .bind(unread_only)
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(Paged::new(rows, page, page_size, total))))
}

pub async fn unread_count(db: &sqlx::PgPool, auth: &AuthContext) -> Result<i64, ApiError> {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) {WITH_READ} WHERE {MINE} AND r.user_id IS NULL"
    ))
    .bind(auth.user_id)
    .bind(&auth.role)
    .fetch_one(db)
    .await
    .map_err(db_error)
}

/// Marks one notification read for the caller only. Marking twice is fine.
pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let visible: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS (SELECT 1 FROM notification n WHERE n.notification_id = $3 AND {MINE})"
    ))
    .bind(auth.user_id)
    .bind(&auth.role)
    .bind(notification_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    if !visible {
        return Err(ApiError::not_found("notification"));
    }

    sqlx::query(
        r#"
        INSERT INTO notification_read (notification_id, user_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(notification_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ok()))
}

#[derive(Debug, Serialize)]
pub struct MarkAllResult {
    pub updated: u64,
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<MarkAllResult>>, ApiError> {
    let res = sqlx::query(&format!(
        r#"
        INSERT INTO notification_read (notification_id, user_id)
        SELECT n.notification_id, $1
        {WITH_READ}
        WHERE {MINE} AND r.user_id IS NULL
        ON CONFLICT DO NOTHING
        "#
    ))
    .bind(auth.user_id)
    .bind(&auth.role)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(MarkAllResult {
        updated: res.rows_affected(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_state_joins_on_the_caller() {
        assert!(WITH_READ.contains("r.user_id = $1"));
        assert!(MINE.contains("n.user_id = $1"));
        assert!(!MINE.contains("is_read"));
    }
}
