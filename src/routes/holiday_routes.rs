// src/routes/holiday_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::booking::{holiday_on, HolidayEntry},
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{ok, validate_required, ApiOk, AppState, OkResponse},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/holidays", get(list_holidays).post(create_holiday))
        .route("/holidays/check", get(check_holiday))
        .route("/holidays/{holiday_id}", delete(delete_holiday))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct HolidayRow {
    pub holiday_id: Uuid,
    pub holiday_date: NaiveDate,
    pub name: String,
    pub is_recurring: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct HolidayMatchRow {
    holiday_date: NaiveDate,
    name: String,
    is_recurring: bool,
}

/// Holidays that could fall on `date`: the exact date plus recurring ones
/// with the same month and day.
pub async fn load_holidays_for<'e, E>(db: E, date: NaiveDate) -> Result<Vec<HolidayEntry>, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, HolidayMatchRow>(
        r#"
        SELECT holiday_date, name, is_recurring
        FROM holiday
        WHERE holiday_date = $1
           OR (is_recurring
               AND EXTRACT(MONTH FROM holiday_date) = EXTRACT(MONTH FROM $1::date)
               AND EXTRACT(DAY FROM holiday_date) = EXTRACT(DAY FROM $1::date))
        "#,
    )
    .bind(date)
    .fetch_all(db)
    .await
    .map_err(db_error)?;

    Ok(rows
        .into_iter()
        .map(|r| HolidayEntry {
            date: r.holiday_date,
            name: r.name,
            is_recurring: r.is_recurring,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
pub struct ListHolidaysQuery {
    pub year: Option<i32>,
}

/// With `year`, fixed holidays of that year and every recurring one.
pub async fn list_holidays(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ListHolidaysQuery>,
) -> Result<Json<ApiOk<Vec<HolidayRow>>>, ApiError> {
    if let Some(y) = q.year {
        if !(1900..=9999).contains(&y) {
            return Err(ApiError::validation("year is out of range"));
        }
    }

    let rows = sqlx::query_as::<_, HolidayRow>(
        r#"
        SELECT holiday_id, holiday_date, name, is_recurring, created_at
        FROM holiday
        WHERE $1::int IS NULL
           OR is_recurring
           OR EXTRACT(YEAR FROM holiday_date) = $1
        ORDER BY EXTRACT(MONTH FROM holiday_date), EXTRACT(DAY FROM holiday_date), holiday_date
        "#,
    )
    .bind(q.year)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateHolidayRequest {
    pub holiday_date: NaiveDate,
    pub name: String,
    pub is_recurring: Option<bool>,
}

pub async fn create_holiday(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateHolidayRequest>,
) -> Result<Json<ApiOk<HolidayRow>>, ApiError> {
    auth.require("holidays.manage")?;
    let name = validate_required("name", &req.name, 128)?;

    let row = sqlx::query_as::<_, HolidayRow>(
        r#"
        INSERT INTO holiday (holiday_date, name, is_recurring)
        VALUES ($1, $2, $3)
        RETURNING holiday_id, holiday_date, name, is_recurring, created_at
        "#,
    )
    .bind(req.holiday_date)
    .bind(&name)
    .bind(req.is_recurring.unwrap_or(false))
    .fetch_one(&state.db)
    .await
    .map_err(|e| match db_error(e) {
        ApiError::Conflict(..) => ApiError::Conflict(
            "HOLIDAY_EXISTS",
            format!("a holiday is already registered on {}", req.holiday_date),
        ),
        other => other,
    })?;

    tracing::info!(holiday_id = %row.holiday_id, date = %row.holiday_date, "holiday created");
    Ok(Json(ApiOk::new(row)))
}

pub async fn delete_holiday(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(holiday_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("holidays.manage")?;

    let res = sqlx::query(r#"DELETE FROM holiday WHERE holiday_id = $1"#)
        .bind(holiday_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("holiday"));
    }
    Ok(Json(ok()))
}

#[derive(Debug, Deserialize)]
pub struct CheckHolidayQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HolidayCheck {
    pub is_holiday: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl HolidayCheck {
    fn for_date(date: NaiveDate, holidays: &[HolidayEntry]) -> Self {
        let name = holiday_on(date, holidays).map(str::to_string);
        Self {
            is_holiday: name.is_some(),
            name,
        }
    }
}

pub async fn check_holiday(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<CheckHolidayQuery>,
) -> Result<Json<ApiOk<HolidayCheck>>, ApiError> {
    let holidays = load_holidays_for(&state.db, q.date).await?;
    Ok(Json(ApiOk::new(HolidayCheck::for_date(q.date, &holidays))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn check_reports_recurring_name() {
        let holidays = vec![HolidayEntry {
            date: d(2020, 7, 20),
            name: "Independencia".into(),
            is_recurring: true,
        }];
        assert_eq!(
            HolidayCheck::for_date(d(2026, 7, 20), &holidays),
            HolidayCheck { is_holiday: true, name: Some("Independencia".into()) }
        );
        assert_eq!(
            HolidayCheck::for_date(d(2026, 7, 21), &holidays),
            HolidayCheck { is_holiday: false, name: None }
        );
    }

    #[test]
    fn non_holiday_omits_name_in_json() {
        let json = serde_json::to_value(HolidayCheck { is_holiday: false, name: None }).unwrap();
        assert_eq!(json, serde_json::json!({ "is_holiday": false }));
    }
}
