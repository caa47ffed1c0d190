use axum::{extract::State, routing::get, Json, Router};
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::booking::business_now;
use crate::error::{db_error, ApiError};
use crate::middleware::auth_context::AuthContext;
use crate::models::{ApiOk, AppState};
use crate::routes::notification_routes::unread_count;

pub fn router() -> Router<AppState> {
    Router::new().route("/dashboard", get(dashboard))
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct StatusCounts {
    pub pending: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub expired: i64,
    pub total: i64,
}

impl StatusCounts {
    fn from_rows(rows: &[(i16, i64)]) -> Self {
        let mut c = StatusCounts::default();
        for &(status, n) in rows {
            match status {
                0 => c.pending += n,
                1 => c.completed += n,
                2 => c.cancelled += n,
                3 => c.expired += n,
                _ => {}
            }
            c.total += n;
        }
        c
    }
}

#[derive(Debug, Serialize)]
pub struct DashboardData {
    pub date: NaiveDate,
    pub branch_id: Option<Uuid>,
    pub role: String,
    pub today: StatusCounts,
    pub unread_notifications: i64,
}

pub async fn dashboard(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<DashboardData>>, ApiError> {
    let today = business_now(state.config.business_offset()).date();
    // staff bound to a branch see that branch; everyone else sees all of them
    let branch_id = auth.branch_id;

    let rows: Vec<(i16, i64)> = sqlx::query_as(
        r#"
        SELECT status, COUNT(*)
        FROM appointment
        WHERE scheduled_date = $1
          AND is_deleted = false
          AND ($2::uuid IS NULL OR branch_id = $2)
        GROUP BY status
        "#,
    )
    .bind(today)
    .bind(branch_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let unread = unread_count(&state.db, &auth).await?;

    Ok(Json(ApiOk::new(DashboardData {
        date: today,
        branch_id,
        role: auth.role.clone(),
        today: StatusCounts::from_rows(&rows),
        unread_notifications: unread,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_fold_by_status() {
        let c = StatusCounts::from_rows(&[(0, 4), (1, 2), (2, 1)]);
        assert_eq!(
            c,
            StatusCounts { pending: 4, completed: 2, cancelled: 1, expired: 0, total: 7 }
        );
    }
}
