// src/routes/branch_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{booking::BranchSchedule, phone::normalize_e164},
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        clean_optional, deserialize_double_option, ok, validate_required, ApiOk, AppState,
        OkResponse, PageQuery, Paged,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/branches", get(list_branches).post(create_branch))
        .route(
            "/branches/{branch_id}",
            get(get_branch).patch(update_branch).delete(delete_branch),
        )
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BranchRow {
    pub branch_id: Uuid,
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub open_saturdays: bool,
    pub daily_capacity: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BranchRow {
    pub fn schedule(&self) -> BranchSchedule {
        BranchSchedule {
            opens_at: self.opens_at,
            closes_at: self.closes_at,
            open_saturdays: self.open_saturdays,
            daily_capacity: self.daily_capacity,
        }
    }
}

pub const BRANCH_SELECT: &str = r#"
    SELECT branch_id, code, name, address, phone, opens_at, closes_at, open_saturdays,
           daily_capacity, is_active, created_at, updated_at
    FROM branch
"#;

/// Live (not soft-deleted) branch by id.
pub async fn load_branch(db: &sqlx::PgPool, branch_id: Uuid) -> Result<Option<BranchRow>, ApiError> {
    sqlx::query_as::<_, BranchRow>(&format!(
        "{BRANCH_SELECT} WHERE branch_id = $1 AND is_deleted = false"
    ))
    .bind(branch_id)
    .fetch_optional(db)
    .await
    .map_err(db_error)
}

#[derive(Debug, Deserialize)]
pub struct ListBranchesQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub include_inactive: Option<bool>,
}

pub async fn list_branches(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ListBranchesQuery>,
) -> Result<Json<ApiOk<Paged<BranchRow>>>, ApiError> {
    let (page, page_size) = PageQuery::new(q.page, q.page_size).resolve()?;
    let include_inactive = q.include_inactive.unwrap_or(false);

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM branch
        WHERE is_deleted = false AND ($1 OR is_active = true)
        "#,
    )
    .bind(include_inactive)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let rows = sqlx::query_as::<_, BranchRow>(&format!(
        r#"{BRANCH_SELECT}
        WHERE is_deleted = false AND ($1 OR is_active = true)
        ORDER BY name ASC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(include_inactive)
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(Paged::new(rows, page, page_size, total))))
}

pub async fn get_branch(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(branch_id): Path<Uuid>,
) -> Result<Json<ApiOk<BranchRow>>, ApiError> {
    let row = load_branch(&state.db, branch_id)
        .await?
        .ok_or_else(|| ApiError::not_found("branch"))?;
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub opens_at: Option<NaiveTime>,
    pub closes_at: Option<NaiveTime>,
    pub open_saturdays: Option<bool>,
    pub daily_capacity: i32,
}

fn validate_code(code: &str) -> Result<String, ApiError> {
    let code = validate_required("code", code, 32)?.to_uppercase();
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ApiError::validation("code may only contain letters, digits, - and _"));
    }
    Ok(code)
}

fn validate_hours(opens_at: NaiveTime, closes_at: NaiveTime) -> Result<(), ApiError> {
    if opens_at >= closes_at {
        return Err(ApiError::validation("opens_at must be before closes_at"));
    }
    Ok(())
}

fn validate_capacity(capacity: i32) -> Result<(), ApiError> {
    if capacity <= 0 {
        return Err(ApiError::validation("daily_capacity must be > 0"));
    }
    Ok(())
}

fn clean_phone(state: &AppState, phone: Option<&str>) -> Result<Option<String>, ApiError> {
    match phone.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(p) => normalize_e164(p, &state.config.default_country_code)
            .map(Some)
            .map_err(ApiError::validation),
    }
}

pub async fn create_branch(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateBranchRequest>,
) -> Result<Json<ApiOk<BranchRow>>, ApiError> {
    auth.require("branches.manage")?;

    let code = validate_code(&req.code)?;
    let name = validate_required("name", &req.name, 128)?;
    let address = clean_optional("address", req.address.as_deref(), 256)?;
    let phone = clean_phone(&state, req.phone.as_deref())?;
    let opens_at = req.opens_at.unwrap_or(NaiveTime::MIN + chrono::Duration::hours(8));
    let closes_at = req.closes_at.unwrap_or(NaiveTime::MIN + chrono::Duration::hours(17));
    validate_hours(opens_at, closes_at)?;
    validate_capacity(req.daily_capacity)?;

    let row = sqlx::query_as::<_, BranchRow>(
        r#"
        INSERT INTO branch (code, name, address, phone, opens_at, closes_at, open_saturdays, daily_capacity)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING branch_id, code, name, address, phone, opens_at, closes_at, open_saturdays,
                  daily_capacity, is_active, created_at, updated_at
        "#,
    )
    .bind(&code)
    .bind(&name)
    .bind(address)
    .bind(phone)
    .bind(opens_at)
    .bind(closes_at)
    .bind(req.open_saturdays.unwrap_or(false))
    .bind(req.daily_capacity)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(branch_id = %row.branch_id, code = %row.code, "branch created");
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBranchRequest {
    pub code: Option<String>,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub address: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    pub opens_at: Option<NaiveTime>,
    pub closes_at: Option<NaiveTime>,
    pub open_saturdays: Option<bool>,
    pub daily_capacity: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_branch(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(branch_id): Path<Uuid>,
    Json(req): Json<UpdateBranchRequest>,
) -> Result<Json<ApiOk<BranchRow>>, ApiError> {
    auth.require("branches.manage")?;

    let existing = load_branch(&state.db, branch_id)
        .await?
        .ok_or_else(|| ApiError::not_found("branch"))?;

    let code = match req.code.as_deref() {
        Some(c) => validate_code(c)?,
        None => existing.code.clone(),
    };
    let name = match req.name.as_deref() {
        Some(n) => validate_required("name", n, 128)?,
        None => existing.name.clone(),
    };
    let address = match req.address {
        Some(a) => clean_optional("address", a.as_deref(), 256)?,
        None => existing.address.clone(),
    };
    let phone = match req.phone {
        Some(p) => clean_phone(&state, p.as_deref())?,
        None => existing.phone.clone(),
    };
    let opens_at = req.opens_at.unwrap_or(existing.opens_at);
    let closes_at = req.closes_at.unwrap_or(existing.closes_at);
    validate_hours(opens_at, closes_at)?;
    let daily_capacity = req.daily_capacity.unwrap_or(existing.daily_capacity);
    validate_capacity(daily_capacity)?;

    let row = sqlx::query_as::<_, BranchRow>(
        r#"
        UPDATE branch
        SET code = $1, name = $2, address = $3, phone = $4, opens_at = $5, closes_at = $6,
            open_saturdays = $7, daily_capacity = $8, is_active = $9, updated_at = now()
        WHERE branch_id = $10
        RETURNING branch_id, code, name, address, phone, opens_at, closes_at, open_saturdays,
                  daily_capacity, is_active, created_at, updated_at
        "#,
    )
    .bind(&code)
    .bind(&name)
    .bind(address)
    .bind(phone)
    .bind(opens_at)
    .bind(closes_at)
    .bind(req.open_saturdays.unwrap_or(existing.open_saturdays))
    .bind(daily_capacity)
    .bind(req.is_active.unwrap_or(existing.is_active))
    .bind(branch_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(row)))
}

fn ensure_no_pending(pending: i64) -> Result<(), ApiError> {
    if pending > 0 {
        return Err(ApiError::Conflict(
            "BRANCH_HAS_APPOINTMENTS",
            format!("branch still has {pending} pending appointment(s)"),
        ));
    }
    Ok(())
}

/// Soft delete. The branch row is locked first, so a booking cannot slip in
/// between the pending count and the update.
pub async fn delete_branch(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(branch_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("branches.manage")?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let locked: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT branch_id FROM branch
        WHERE branch_id = $1 AND is_deleted = false
        FOR UPDATE
        "#,
    )
    .bind(branch_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_error)?;
    if locked.is_none() {
        return Err(ApiError::not_found("branch"));
    }

    let pending: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM appointment
        WHERE branch_id = $1 AND status = 0 AND is_deleted = false
        "#,
    )
    .bind(branch_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;
    ensure_no_pending(pending)?;

    sqlx::query(
        r#"
        UPDATE branch
        SET is_deleted = true, is_active = false, deleted_at = now(), updated_at = now()
        WHERE branch_id = $1
        "#,
    )
    .bind(branch_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;
    tracing::info!(branch_id = %branch_id, by = %auth.user_id, "branch deleted");
    Ok(Json(ok()))
}
