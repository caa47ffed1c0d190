// src/routes/appointment_type_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        clean_optional, deserialize_double_option, ok, validate_required, ApiOk, AppState,
        OkResponse,
    },
};

pub const MAX_ESTIMATED_MINUTES: i32 = 480;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_appointment_types).post(create_appointment_type))
        .route(
            "/{appointment_type_id}",
            patch(update_appointment_type).delete(delete_appointment_type),
        )
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AppointmentTypeRow {
    pub appointment_type_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub estimated_time_minutes: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListTypesQuery {
    pub include_inactive: Option<bool>,
}

pub async fn list_appointment_types(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ListTypesQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentTypeRow>>>, ApiError> {
    let rows = sqlx::query_as::<_, AppointmentTypeRow>(
        r#"
        SELECT appointment_type_id, name, description, estimated_time_minutes, is_active,
               created_at, updated_at
        FROM appointment_type
        WHERE $1 OR is_active = true
        ORDER BY name ASC
        "#,
    )
    .bind(q.include_inactive.unwrap_or(false))
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

fn validate_minutes(minutes: i32) -> Result<(), ApiError> {
    if !(1..=MAX_ESTIMATED_MINUTES).contains(&minutes) {
        return Err(ApiError::validation(format!(
            "estimated_time_minutes must be between 1 and {MAX_ESTIMATED_MINUTES}"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateTypeRequest {
    pub name: String,
    pub description: Option<String>,
    pub estimated_time_minutes: i32,
}

pub async fn create_appointment_type(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTypeRequest>,
) -> Result<Json<ApiOk<AppointmentTypeRow>>, ApiError> {
    auth.require("settings.manage")?;

    let name = validate_required("name", &req.name, 128)?;
    let description = clean_optional("description", req.description.as_deref(), 512)?;
    validate_minutes(req.estimated_time_minutes)?;

    let row = sqlx::query_as::<_, AppointmentTypeRow>(
        r#"
        INSERT INTO appointment_type (name, description, estimated_time_minutes)
        VALUES ($1, $2, $3)
        RETURNING appointment_type_id, name, description, estimated_time_minutes, is_active,
                  created_at, updated_at
        "#,
    )
    .bind(&name)
    .bind(description)
    .bind(req.estimated_time_minutes)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTypeRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub description: Option<Option<String>>,
    pub estimated_time_minutes: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_appointment_type(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_type_id): Path<Uuid>,
    Json(req): Json<UpdateTypeRequest>,
) -> Result<Json<ApiOk<AppointmentTypeRow>>, ApiError> {
    auth.require("settings.manage")?;

    let name = req
        .name
        .as_deref()
        .map(|n| validate_required("name", n, 128))
        .transpose()?;
    let set_description = req.description.is_some();
    let description = match req.description {
        Some(d) => clean_optional("description", d.as_deref(), 512)?,
        None => None,
    };
    if let Some(m) = req.estimated_time_minutes {
        validate_minutes(m)?;
    }

    let row = sqlx::query_as::<_, AppointmentTypeRow>(
        r#"
        UPDATE appointment_type
        SET name = COALESCE($1, name),
            description = CASE WHEN $2 THEN $3 ELSE description END,
            estimated_time_minutes = COALESCE($4, estimated_time_minutes),
            is_active = COALESCE($5, is_active),
            updated_at = now()
        WHERE appointment_type_id = $6
        RETURNING appointment_type_id, name, description, estimated_time_minutes, is_active,
                  created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(set_description)
    .bind(description)
    .bind(req.estimated_time_minutes)
    .bind(req.is_active)
    .bind(appointment_type_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment type"))?;

    Ok(Json(ApiOk::new(row)))
}

/// Types referenced by appointments are deactivated instead of removed.
pub async fn delete_appointment_type(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_type_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("settings.manage")?;

    let in_use: bool = sqlx::query_scalar(
        r#"SELECT EXISTS (SELECT 1 FROM appointment WHERE appointment_type_id = $1)"#,
    )
    .bind(appointment_type_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let sql = if in_use {
        r#"
        UPDATE appointment_type
        SET is_active = false, updated_at = now()
        WHERE appointment_type_id = $1
        "#
    } else {
        r#"DELETE FROM appointment_type WHERE appointment_type_id = $1"#
    };

    let res = sqlx::query(sql)
        .bind(appointment_type_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("appointment type"));
    }
    Ok(Json(ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_range() {
        assert!(validate_minutes(1).is_ok());
        assert!(validate_minutes(480).is_ok());
        assert!(validate_minutes(0).is_err());
        assert!(validate_minutes(481).is_err());
    }
}
