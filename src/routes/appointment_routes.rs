// src/routes/appointment_routes.rs

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::booking::{
        appointment_number, business_now, can_transition, check_capacity, check_duplicate,
        remaining_capacity, validate_day, validate_slot, BookingError, HolidayEntry,
    },
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        clean_optional, deserialize_double_option, ok, validate_required, ApiOk, AppState,
        AppointmentDetailRow, AppointmentStatus, OkResponse, PageQuery, Paged,
        APPOINTMENT_DETAIL_SELECT,
    },
    notifications::AppointmentEvent,
    routes::{
        branch_routes::{load_branch, BranchRow, BRANCH_SELECT},
        holiday_routes::load_holidays_for,
    },
};

type Tx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route("/appointments/availability", get(get_availability))
        .route("/appointments/by_number/{number}", get(get_appointment_by_number))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment)
                .patch(update_appointment)
                .delete(delete_appointment),
        )
        .route("/appointments/{appointment_id}/cancel", post(cancel_appointment))
        .route("/appointments/{appointment_id}/complete", post(complete_appointment))
}

/* ============================================================
   Shared lookups
   ============================================================ */

pub async fn load_detail(db: &sqlx::PgPool, appointment_id: Uuid) -> Result<AppointmentDetailRow, ApiError> {
    sqlx::query_as::<_, AppointmentDetailRow>(&format!(
        "{APPOINTMENT_DETAIL_SELECT} WHERE a.appointment_id = $1 AND a.is_deleted = false"
    ))
    .bind(appointment_id)
    .fetch_optional(db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))
}

fn client_not_found() -> ApiError {
    ApiError::BadRequest("CLIENT_NOT_FOUND", "client does not exist or is inactive".into())
}

fn branch_not_found() -> ApiError {
    ApiError::BadRequest("BRANCH_NOT_FOUND", "branch does not exist or is inactive".into())
}

fn type_not_found() -> ApiError {
    ApiError::BadRequest(
        "APPOINTMENT_TYPE_NOT_FOUND",
        "appointment type does not exist or is inactive".into(),
    )
}

/// Reads the booking guards depend on. Implementations run inside the
/// booking transaction; rows are locked in the order client, then branch.
#[async_trait]
pub trait BookingLookups: Send {
    /// Locks the client row. False when the client is missing, inactive or deleted.
    async fn lock_client(&mut self, client_id: Uuid) -> Result<bool, ApiError>;
    /// Locks the branch row when it exists and takes bookings.
    async fn lock_branch(&mut self, branch_id: Uuid) -> Result<Option<BranchRow>, ApiError>;
    async fn type_is_active(&mut self, appointment_type_id: Uuid) -> Result<bool, ApiError>;
    async fn holidays_on(&mut self, date: NaiveDate) -> Result<Vec<HolidayEntry>, ApiError>;
    /// Pending appointments of the client on `date`, optionally ignoring one.
    async fn client_pending(
        &mut self,
        client_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<i64, ApiError>;
    /// Pending + Completed appointments of the branch on `date`.
    async fn branch_booked(
        &mut self,
        branch_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<i64, ApiError>;
}

struct TxLookups<'a, 'c> {
    tx: &'a mut Tx<'c>,
}

#[async_trait]
impl<'a, 'c> BookingLookups for TxLookups<'a, 'c> {
    async fn lock_client(&mut self, client_id: Uuid) -> Result<bool, ApiError> {
        let bookable: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT is_active AND NOT is_deleted FROM client
            WHERE client_id = $1
            FOR UPDATE
            "#,
        )
        .bind(client_id)
        .fetch_optional(&mut **self.tx)
        .await
        .map_err(db_error)?;
        Ok(bookable.unwrap_or(false))
    }

    async fn lock_branch(&mut self, branch_id: Uuid) -> Result<Option<BranchRow>, ApiError> {
        sqlx::query_as::<_, BranchRow>(&format!(
            "{BRANCH_SELECT} WHERE branch_id = $1 AND is_active = true AND is_deleted = false FOR UPDATE"
        ))
        .bind(branch_id)
        .fetch_optional(&mut **self.tx)
        .await
        .map_err(db_error)
    }

    async fn type_is_active(&mut self, appointment_type_id: Uuid) -> Result<bool, ApiError> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
              SELECT 1 FROM appointment_type
              WHERE appointment_type_id = $1 AND is_active = true
            )
            "#,
        )
        .bind(appointment_type_id)
        .fetch_one(&mut **self.tx)
        .await
        .map_err(db_error)
    }

    async fn holidays_on(&mut self, date: NaiveDate) -> Result<Vec<HolidayEntry>, ApiError> {
        load_holidays_for(&mut **self.tx, date).await
    }

    async fn client_pending(
        &mut self,
        client_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<i64, ApiError> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM appointment
            WHERE client_id = $1
              AND scheduled_date = $2
              AND status = 0
              AND is_deleted = false
              AND ($3::uuid IS NULL OR appointment_id <> $3)
            "#,
        )
        .bind(client_id)
        .bind(date)
        .bind(exclude)
        .fetch_one(&mut **self.tx)
        .await
        .map_err(db_error)
    }

    async fn branch_booked(
        &mut self,
        branch_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<i64, ApiError> {
        count_branch_booked(&mut **self.tx, branch_id, date, exclude).await
    }
}

async fn count_branch_booked<'e, E>(
    db: E,
    branch_id: Uuid,
    date: NaiveDate,
    exclude: Option<Uuid>,
) -> Result<i64, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM appointment
        WHERE branch_id = $1
          AND scheduled_date = $2
          AND status IN (0, 1)
          AND is_deleted = false
          AND ($3::uuid IS NULL OR appointment_id <> $3)
        "#,
    )
    .bind(branch_id)
    .bind(date)
    .bind(exclude)
    .fetch_one(db)
    .await
    .map_err(db_error)
}

/// A requested slot. `exclude` names the appointment being moved, so it does
/// not count against itself.
#[derive(Debug, Clone, Copy)]
pub struct SlotRequest {
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub exclude: Option<Uuid>,
}

/// Guards 4-9: calendar, business hours, one pending per client and day,
/// branch capacity.
pub async fn check_slot<L: BookingLookups>(
    lookups: &mut L,
    branch: &BranchRow,
    slot: &SlotRequest,
    now: NaiveDateTime,
) -> Result<(), ApiError> {
    let holidays = lookups.holidays_on(slot.date).await?;
    validate_slot(slot.date, slot.time, now, &branch.schedule(), &holidays)?;

    let pending = lookups
        .client_pending(slot.client_id, slot.date, slot.exclude)
        .await?;
    check_duplicate(pending)?;

    let booked = lookups
        .branch_booked(branch.branch_id, slot.date, slot.exclude)
        .await?;
    check_capacity(booked, branch.daily_capacity)?;
    Ok(())
}

/// The full guard chain for a new booking, in the order failures are
/// reported. Returns the locked branch.
pub async fn check_new_booking<L: BookingLookups>(
    lookups: &mut L,
    branch_id: Uuid,
    appointment_type_id: Option<Uuid>,
    slot: &SlotRequest,
    now: NaiveDateTime,
) -> Result<BranchRow, ApiError> {
    if !lookups.lock_client(slot.client_id).await? {
        return Err(client_not_found());
    }
    let branch = lookups
        .lock_branch(branch_id)
        .await?
        .ok_or_else(branch_not_found)?;
    if let Some(type_id) = appointment_type_id {
        if !lookups.type_is_active(type_id).await? {
            return Err(type_not_found());
        }
    }
    check_slot(lookups, &branch, slot, now).await?;
    Ok(branch)
}

/// Runs the fan-out off the request path.
fn notify(state: &AppState, event: AppointmentEvent, appt: AppointmentDetailRow, actor: Uuid) {
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        notifier.appointment_event(event, &appt, Some(actor)).await;
    });
}

/* ============================================================
   GET /appointments
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListAppointmentsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub branch_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListAppointmentsQuery>,
) -> Result<Json<ApiOk<Paged<AppointmentDetailRow>>>, ApiError> {
    auth.require("appointments.read")?;
    let (page, page_size) = PageQuery::new(q.page, q.page_size).resolve()?;
    let branch_id = auth.branch_scope(q.branch_id)?;

    if let (Some(from), Some(to)) = (q.date_from, q.date_to) {
        if from > to {
            return Err(ApiError::validation("date_from must be on or before date_to"));
        }
    }
    let status = q.status.map(|s| s as i16);

    let filter = r#"
        WHERE a.is_deleted = false
          AND ($1::uuid IS NULL OR a.branch_id = $1)
          AND ($2::uuid IS NULL OR a.client_id = $2)
          AND ($3::smallint IS NULL OR a.status = $3)
          AND ($4::date IS NULL OR a.scheduled_date >= $4)
          AND ($5::date IS NULL OR a.scheduled_date <= $5)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM appointment a {filter}"))
        .bind(branch_id)
        .bind(q.client_id)
        .bind(status)
        .bind(q.date_from)
        .bind(q.date_to)
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    let rows = sqlx::query_as::<_, AppointmentDetailRow>(&format!(
        r#"{APPOINTMENT_DETAIL_SELECT}
        {filter}
        ORDER BY a.scheduled_date DESC, a.scheduled_time DESC
        LIMIT $6 OFFSET $7
        "#
    ))
    .bind(branch_id)
    .bind(q.client_id)
    .bind(status)
    .bind(q.date_from)
    .bind(q.date_to)
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(Paged::new(rows, page, page_size, total))))
}

/* ============================================================
   GET /appointments/{id}, /appointments/by_number/{number}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentDetailRow>>, ApiError> {
    auth.require("appointments.read")?;
    let appt = load_detail(&state.db, appointment_id).await?;
    auth.branch_scope(Some(appt.branch_id))?;
    Ok(Json(ApiOk::new(appt)))
}

pub async fn get_appointment_by_number(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(number): Path<String>,
) -> Result<Json<ApiOk<AppointmentDetailRow>>, ApiError> {
    auth.require("appointments.read")?;
    let number = number.trim().to_uppercase();

    let appt = sqlx::query_as::<_, AppointmentDetailRow>(&format!(
        "{APPOINTMENT_DETAIL_SELECT} WHERE a.appointment_number = $1 AND a.is_deleted = false"
    ))
    .bind(&number)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    auth.branch_scope(Some(appt.branch_id))?;
    Ok(Json(ApiOk::new(appt)))
}

/* ============================================================
   POST /appointments
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub client_id: Uuid,
    pub branch_id: Uuid,
    pub appointment_type_id: Option<Uuid>,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub notes: Option<String>,
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentDetailRow>>, ApiError> {
    auth.require("appointments.create")?;
    auth.branch_scope(Some(req.branch_id))?;
    let notes = clean_optional("notes", req.notes.as_deref(), 2000)?;

    let slot = SlotRequest {
        client_id: req.client_id,
        date: req.scheduled_date,
        time: req.scheduled_time,
        exclude: None,
    };
    let now = business_now(state.config.business_offset());

    let mut tx = state.db.begin().await.map_err(db_error)?;
    check_new_booking(
        &mut TxLookups { tx: &mut tx },
        req.branch_id,
        req.appointment_type_id,
        &slot,
        now,
    )
    .await?;

    let appointment_id = Uuid::new_v4();
    let number = appointment_number(req.scheduled_date, appointment_id);

    sqlx::query(
        r#"
        INSERT INTO appointment (
          appointment_id,
          appointment_number,
          client_id,
          branch_id,
          appointment_type_id,
          scheduled_date,
          scheduled_time,
          status,
          notes,
          created_by_user_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9)
        "#,
    )
    .bind(appointment_id)
    .bind(&number)
    .bind(req.client_id)
    .bind(req.branch_id)
    .bind(req.appointment_type_id)
    .bind(req.scheduled_date)
    .bind(req.scheduled_time)
    .bind(notes)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    let appt = load_detail(&state.db, appointment_id).await?;
    tracing::info!(
        appointment_id = %appointment_id,
        number = %number,
        branch_id = %req.branch_id,
        by = %auth.user_id,
        "appointment created"
    );
    notify(&state, AppointmentEvent::Created, appt.clone(), auth.user_id);

    Ok(Json(ApiOk::new(appt)))
}

/* ============================================================
   PATCH /appointments/{id}
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<NaiveTime>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub appointment_type_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

#[derive(sqlx::FromRow)]
struct LockedAppointment {
    client_id: Uuid,
    branch_id: Uuid,
    appointment_type_id: Option<Uuid>,
    scheduled_date: NaiveDate,
    scheduled_time: NaiveTime,
    status: AppointmentStatus,
    notes: Option<String>,
}

async fn lock_appointment(tx: &mut Tx<'_>, appointment_id: Uuid) -> Result<LockedAppointment, ApiError> {
    sqlx::query_as::<_, LockedAppointment>(
        r#"
        SELECT client_id, branch_id, appointment_type_id, scheduled_date, scheduled_time,
               status, notes
        FROM appointment
        WHERE appointment_id = $1 AND is_deleted = false
        FOR UPDATE
        "#,
    )
    .bind(appointment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))
}

fn invalid_transition(from: AppointmentStatus, to: AppointmentStatus) -> ApiError {
    ApiError::Conflict(
        "INVALID_STATUS_TRANSITION",
        format!("cannot move an appointment from {from:?} to {to:?}"),
    )
}

pub async fn update_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<UpdateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentDetailRow>>, ApiError> {
    auth.require("appointments.update")?;

    // the client row is locked before the appointment row, same as in
    // create and client deletion
    let client_id: Uuid = sqlx::query_scalar(
        r#"SELECT client_id FROM appointment WHERE appointment_id = $1 AND is_deleted = false"#,
    )
    .bind(appointment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let client_bookable = TxLookups { tx: &mut tx }.lock_client(client_id).await?;
    let current = lock_appointment(&mut tx, appointment_id).await?;
    auth.branch_scope(Some(current.branch_id))?;

    if current.status != AppointmentStatus::Pending {
        return Err(ApiError::Conflict(
            "APPOINTMENT_NOT_PENDING",
            "only pending appointments can be changed".into(),
        ));
    }

    let date = req.scheduled_date.unwrap_or(current.scheduled_date);
    let time = req.scheduled_time.unwrap_or(current.scheduled_time);
    let rescheduled = date != current.scheduled_date || time != current.scheduled_time;

    let appointment_type_id = match req.appointment_type_id {
        Some(Some(type_id)) => {
            if current.appointment_type_id != Some(type_id) {
                let active = TxLookups { tx: &mut tx }.type_is_active(type_id).await?;
                if !active {
                    return Err(type_not_found());
                }
            }
            Some(type_id)
        }
        Some(None) => None,
        None => current.appointment_type_id,
    };
    let notes = match req.notes {
        Some(n) => clean_optional("notes", n.as_deref(), 2000)?,
        None => current.notes,
    };

    if rescheduled {
        if !client_bookable {
            return Err(client_not_found());
        }
        let mut lookups = TxLookups { tx: &mut tx };
        let branch = lookups
            .lock_branch(current.branch_id)
            .await?
            .ok_or_else(branch_not_found)?;
        let slot = SlotRequest {
            client_id: current.client_id,
            date,
            time,
            exclude: Some(appointment_id),
        };
        check_slot(
            &mut lookups,
            &branch,
            &slot,
            business_now(state.config.business_offset()),
        )
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET scheduled_date = $1,
            scheduled_time = $2,
            appointment_type_id = $3,
            notes = $4,
            reminder_sent_at = CASE WHEN $5 THEN NULL ELSE reminder_sent_at END,
            updated_at = now()
        WHERE appointment_id = $6
        "#,
    )
    .bind(date)
    .bind(time)
    .bind(appointment_type_id)
    .bind(notes)
    .bind(rescheduled)
    .bind(appointment_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    let appt = load_detail(&state.db, appointment_id).await?;
    if rescheduled {
        tracing::info!(appointment_id = %appointment_id, date = %date, time = %time, "appointment rescheduled");
        notify(&state, AppointmentEvent::Rescheduled, appt.clone(), auth.user_id);
    }
    Ok(Json(ApiOk::new(appt)))
}

/* ============================================================
   Status transitions
   ============================================================ */

async fn transition(
    state: &AppState,
    auth: &AuthContext,
    appointment_id: Uuid,
    to: AppointmentStatus,
    reason: Option<String>,
) -> Result<AppointmentDetailRow, ApiError> {
    let mut tx = state.db.begin().await.map_err(db_error)?;
    let current = lock_appointment(&mut tx, appointment_id).await?;
    auth.branch_scope(Some(current.branch_id))?;

    if !can_transition(current.status, to) {
        return Err(invalid_transition(current.status, to));
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET status = $1,
            cancellation_reason = COALESCE($2, cancellation_reason),
            completed_at = CASE WHEN $1 = 1 THEN now() ELSE completed_at END,
            cancelled_at = CASE WHEN $1 = 2 THEN now() ELSE cancelled_at END,
            updated_at = now()
        WHERE appointment_id = $3
        "#,
    )
    .bind(to as i16)
    .bind(reason)
    .bind(appointment_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(appointment_id = %appointment_id, status = ?to, by = %auth.user_id, "appointment status changed");
    load_detail(&state.db, appointment_id).await
}

#[derive(Debug, Deserialize)]
pub struct CancelAppointmentRequest {
    pub reason: String,
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<CancelAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentDetailRow>>, ApiError> {
    auth.require("appointments.update")?;
    let reason = validate_required("reason", &req.reason, 500)?;

    let appt = transition(
        &state,
        &auth,
        appointment_id,
        AppointmentStatus::Cancelled,
        Some(reason),
    )
    .await?;
    notify(&state, AppointmentEvent::Cancelled, appt.clone(), auth.user_id);
    Ok(Json(ApiOk::new(appt)))
}

pub async fn complete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentDetailRow>>, ApiError> {
    auth.require("appointments.update")?;
    let appt = transition(&state, &auth, appointment_id, AppointmentStatus::Completed, None).await?;
    Ok(Json(ApiOk::new(appt)))
}

pub async fn delete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("appointments.delete")?;
    let appt = load_detail(&state.db, appointment_id).await?;
    auth.branch_scope(Some(appt.branch_id))?;

    sqlx::query(
        r#"
        UPDATE appointment
        SET is_deleted = true, deleted_at = now(), updated_at = now()
        WHERE appointment_id = $1 AND is_deleted = false
        "#,
    )
    .bind(appointment_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(appointment_id = %appointment_id, by = %auth.user_id, "appointment deleted");
    Ok(Json(ok()))
}

/* ============================================================
   GET /appointments/availability
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub branch_id: Uuid,
    pub date: NaiveDate,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Availability {
    pub branch_id: Uuid,
    pub date: NaiveDate,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub capacity: i32,
    pub booked: i64,
    pub remaining: i64,
    pub bookable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Availability {
    fn new(branch: &BranchRow, date: NaiveDate, booked: i64, day: Result<(), BookingError>) -> Self {
        let remaining = remaining_capacity(booked, branch.daily_capacity);
        // an inactive branch takes no bookings, whatever the calendar says
        let blocker = if branch.is_active {
            day.and_then(|_| check_capacity(booked, branch.daily_capacity))
                .err()
                .map(|e| e.code())
        } else {
            Some("BRANCH_NOT_FOUND")
        };
        Self {
            branch_id: branch.branch_id,
            date,
            opens_at: branch.opens_at,
            closes_at: branch.closes_at,
            capacity: branch.daily_capacity,
            booked,
            remaining,
            bookable: blocker.is_none(),
            reason: blocker.map(str::to_string),
        }
    }
}

pub async fn get_availability(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<AvailabilityQuery>,
) -> Result<Json<ApiOk<Availability>>, ApiError> {
    auth.require("appointments.read")?;
    auth.branch_scope(Some(q.branch_id))?;

    let branch = load_branch(&state.db, q.branch_id)
        .await?
        .ok_or_else(|| ApiError::not_found("branch"))?;

    let today = business_now(state.config.business_offset()).date();
    let holidays = load_holidays_for(&state.db, q.date).await?;
    let day = validate_day(q.date, today, &branch.schedule(), &holidays);
    let booked = count_branch_booked(&state.db, branch.branch_id, q.date, None).await?;

    Ok(Json(ApiOk::new(Availability::new(&branch, q.date, booked, day))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn branch(capacity: i32) -> BranchRow {
        BranchRow {
            branch_id: Uuid::nil(),
            code: "CEN".into(),
            name: "Centro".into(),
            address: None,
            phone: None,
            opens_at: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            closes_at: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            open_saturdays: false,
            daily_capacity: capacity,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()
    }

    #[test]
    fn availability_with_room_is_bookable() {
        let a = Availability::new(&branch(5), date(), 2, Ok(()));
        assert!(a.bookable);
        assert_eq!(a.remaining, 3);
        assert_eq!(a.reason, None);
    }

    #[test]
    fn full_day_reports_capacity_reason() {
        let a = Availability::new(&branch(2), date(), 2, Ok(()));
        assert!(!a.bookable);
        assert_eq!(a.remaining, 0);
        assert_eq!(a.reason.as_deref(), Some("CAPACITY_REACHED"));
    }

    #[test]
    fn day_blocker_wins_over_capacity() {
        let a = Availability::new(&branch(2), date(), 5, Err(BookingError::Holiday("X".into())));
        assert!(!a.bookable);
        assert_eq!(a.reason.as_deref(), Some("HOLIDAY"));
    }

    #[test]
    fn inactive_branch_is_not_bookable() {
        let mut b = branch(5);
        b.is_active = false;
        let a = Availability::new(&b, date(), 0, Ok(()));
        assert!(!a.bookable);
        assert_eq!(a.reason.as_deref(), Some("BRANCH_NOT_FOUND"));
    }

    /// In-memory stand-in for the transaction, recording which reads ran.
    struct FakeLookups {
        client_ok: bool,
        branch: Option<BranchRow>,
        type_ok: bool,
        holidays: Vec<HolidayEntry>,
        // (appointment, client, date, status)
        appointments: Vec<(Uuid, Uuid, NaiveDate, AppointmentStatus)>,
        calls: Vec<&'static str>,
    }

    impl FakeLookups {
        fn open(capacity: i32) -> Self {
            Self {
                client_ok: true,
                branch: Some(branch(capacity)),
                type_ok: true,
                holidays: vec![],
                appointments: vec![],
                calls: vec![],
            }
        }
    }

    #[async_trait]
    impl BookingLookups for FakeLookups {
        async fn lock_client(&mut self, _client_id: Uuid) -> Result<bool, ApiError> {
            self.calls.push("client");
            Ok(self.client_ok)
        }

        async fn lock_branch(&mut self, _branch_id: Uuid) -> Result<Option<BranchRow>, ApiError> {
            self.calls.push("branch");
            Ok(self.branch.clone())
        }

        async fn type_is_active(&mut self, _type_id: Uuid) -> Result<bool, ApiError> {
            self.calls.push("type");
            Ok(self.type_ok)
        }

        async fn holidays_on(&mut self, _date: NaiveDate) -> Result<Vec<HolidayEntry>, ApiError> {
            self.calls.push("holidays");
            Ok(self.holidays.clone())
        }

        async fn client_pending(
            &mut self,
            client_id: Uuid,
            date: NaiveDate,
            exclude: Option<Uuid>,
        ) -> Result<i64, ApiError> {
            self.calls.push("client_pending");
            Ok(self
                .appointments
                .iter()
                .filter(|(id, c, d, st)| {
                    *c == client_id
                        && *d == date
                        && *st == AppointmentStatus::Pending
                        && Some(*id) != exclude
                })
                .count() as i64)
        }

        async fn branch_booked(
            &mut self,
            _branch_id: Uuid,
            date: NaiveDate,
            exclude: Option<Uuid>,
        ) -> Result<i64, ApiError> {
            self.calls.push("branch_booked");
            Ok(self
                .appointments
                .iter()
                .filter(|(id, _, d, st)| {
                    *d == date
                        && matches!(st, AppointmentStatus::Pending | AppointmentStatus::Completed)
                        && Some(*id) != exclude
                })
                .count() as i64)
        }
    }

    // Monday morning, three days before `date()` (a Thursday)
    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 12)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn slot(client_id: Uuid) -> SlotRequest {
        SlotRequest {
            client_id,
            date: date(),
            time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            exclude: None,
        }
    }

    async fn book(lookups: &mut FakeLookups, slot: &SlotRequest) -> Result<BranchRow, ApiError> {
        check_new_booking(lookups, Uuid::nil(), Some(Uuid::new_v4()), slot, now()).await
    }

    #[tokio::test]
    async fn clean_booking_runs_every_guard_in_order() {
        let mut lookups = FakeLookups::open(5);
        book(&mut lookups, &slot(Uuid::new_v4())).await.unwrap();
        assert_eq!(
            lookups.calls,
            vec!["client", "branch", "type", "holidays", "client_pending", "branch_booked"]
        );
    }

    #[tokio::test]
    async fn first_failing_guard_is_reported() {
        let client = Uuid::new_v4();
        let mut past = slot(client);
        past.date = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();

        // everything wrong: the client check wins and nothing else is read
        let mut lookups = FakeLookups {
            client_ok: false,
            branch: None,
            type_ok: false,
            ..FakeLookups::open(0)
        };
        let err = book(&mut lookups, &past).await.unwrap_err();
        assert_eq!(err.code(), "CLIENT_NOT_FOUND");
        assert_eq!(lookups.calls, vec!["client"]);

        let mut lookups = FakeLookups { branch: None, type_ok: false, ..FakeLookups::open(0) };
        assert_eq!(book(&mut lookups, &past).await.unwrap_err().code(), "BRANCH_NOT_FOUND");

        let mut lookups = FakeLookups { type_ok: false, ..FakeLookups::open(0) };
        assert_eq!(
            book(&mut lookups, &past).await.unwrap_err().code(),
            "APPOINTMENT_TYPE_NOT_FOUND"
        );

        let mut lookups = FakeLookups::open(0);
        assert_eq!(book(&mut lookups, &past).await.unwrap_err().code(), "DATE_IN_PAST");

        let mut lookups = FakeLookups::open(0);
        lookups.holidays.push(HolidayEntry {
            date: date(),
            name: "Festivo".into(),
            is_recurring: false,
        });
        assert_eq!(book(&mut lookups, &slot(client)).await.unwrap_err().code(), "HOLIDAY");

        let mut late = slot(client);
        late.time = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        let mut lookups = FakeLookups::open(0);
        assert_eq!(
            book(&mut lookups, &late).await.unwrap_err().code(),
            "OUTSIDE_BUSINESS_HOURS"
        );

        // duplicate is reported before capacity
        let mut lookups = FakeLookups::open(1);
        lookups
            .appointments
            .push((Uuid::new_v4(), client, date(), AppointmentStatus::Pending));
        assert_eq!(
            book(&mut lookups, &slot(client)).await.unwrap_err().code(),
            "DUPLICATE_APPOINTMENT"
        );

        let mut lookups = FakeLookups::open(1);
        lookups
            .appointments
            .push((Uuid::new_v4(), Uuid::new_v4(), date(), AppointmentStatus::Completed));
        assert_eq!(
            book(&mut lookups, &slot(client)).await.unwrap_err().code(),
            "CAPACITY_REACHED"
        );
    }

    #[tokio::test]
    async fn cancelled_and_expired_do_not_use_capacity() {
        let mut lookups = FakeLookups::open(1);
        lookups
            .appointments
            .push((Uuid::new_v4(), Uuid::new_v4(), date(), AppointmentStatus::Cancelled));
        lookups
            .appointments
            .push((Uuid::new_v4(), Uuid::new_v4(), date(), AppointmentStatus::Expired));
        assert!(book(&mut lookups, &slot(Uuid::new_v4())).await.is_ok());
    }

    #[tokio::test]
    async fn rescheduling_does_not_count_the_moved_appointment() {
        let client = Uuid::new_v4();
        let own = Uuid::new_v4();
        let mut lookups = FakeLookups::open(1);
        lookups
            .appointments
            .push((own, client, date(), AppointmentStatus::Pending));
        let b = branch(1);

        // moving to a later time on the same full day
        let mut moved = slot(client);
        moved.time = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        moved.exclude = Some(own);
        assert!(check_slot(&mut lookups, &b, &moved, now()).await.is_ok());
        assert_eq!(lookups.calls, vec!["holidays", "client_pending", "branch_booked"]);

        // without the exclusion it collides with itself
        moved.exclude = None;
        let err = check_slot(&mut lookups, &b, &moved, now()).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_APPOINTMENT");

        // another client's pending booking still fills the day
        lookups
            .appointments
            .push((Uuid::new_v4(), Uuid::new_v4(), date(), AppointmentStatus::Pending));
        moved.exclude = Some(own);
        let err = check_slot(&mut lookups, &b, &moved, now()).await.unwrap_err();
        assert_eq!(err.code(), "CAPACITY_REACHED");
    }

    #[test]
    fn status_filter_parses_snake_case() {
        let q: ListAppointmentsQuery =
            serde_json::from_value(serde_json::json!({ "status": "cancelled" })).unwrap();
        assert_eq!(q.status, Some(AppointmentStatus::Cancelled));
    }

    #[test]
    fn transition_error_is_conflict() {
        let err = invalid_transition(AppointmentStatus::Cancelled, AppointmentStatus::Completed);
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
        assert_eq!(err.code(), "INVALID_STATUS_TRANSITION");
    }
}
