// src/routes/client_routes.rs

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{booking::business_now, phone::normalize_e164},
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        clean_optional, deserialize_double_option, ok, validate_email, validate_required, ApiOk,
        AppState, OkResponse, PageQuery, Paged,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clients", get(search_clients).post(create_client))
        .route(
            "/clients/{client_id}",
            get(get_client).patch(update_client).delete(delete_client),
        )
        .route("/clients/by_document/{document_number}", get(get_client_by_document))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ClientRow {
    pub client_id: Uuid,
    pub document_number: String,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CLIENT_SELECT: &str = r#"
    SELECT client_id, document_number, full_name, email, phone, address, is_active,
           created_at, updated_at
    FROM client
"#;

#[derive(Debug, Deserialize)]
pub struct SearchClientsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>, // name or document number
}

pub async fn search_clients(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SearchClientsQuery>,
) -> Result<Json<ApiOk<Paged<ClientRow>>>, ApiError> {
    auth.require("clients.read")?;
    let (page, page_size) = PageQuery::new(q.page, q.page_size).resolve()?;

    let like = q
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{s}%"));

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM client
        WHERE is_deleted = false
          AND ($1::text IS NULL OR full_name ILIKE $1 OR document_number ILIKE $1)
        "#,
    )
    .bind(like.as_deref())
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let rows = sqlx::query_as::<_, ClientRow>(&format!(
        r#"{CLIENT_SELECT}
        WHERE is_deleted = false
          AND ($1::text IS NULL OR full_name ILIKE $1 OR document_number ILIKE $1)
        ORDER BY full_name ASC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(like.as_deref())
    .bind(page_size)
    .bind((page - 1) * page_size)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(Paged::new(rows, page, page_size, total))))
}

async fn load_client(state: &AppState, client_id: Uuid) -> Result<ClientRow, ApiError> {
    sqlx::query_as::<_, ClientRow>(&format!(
        "{CLIENT_SELECT} WHERE client_id = $1 AND is_deleted = false"
    ))
    .bind(client_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("client"))
}

pub async fn get_client(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(client_id): Path<Uuid>,
) -> Result<Json<ApiOk<ClientRow>>, ApiError> {
    auth.require("clients.read")?;
    Ok(Json(ApiOk::new(load_client(&state, client_id).await?)))
}

pub async fn get_client_by_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_number): Path<String>,
) -> Result<Json<ApiOk<ClientRow>>, ApiError> {
    auth.require("clients.read")?;
    let document_number = validate_document(&document_number)?;

    let row = sqlx::query_as::<_, ClientRow>(&format!(
        "{CLIENT_SELECT} WHERE document_number = $1 AND is_deleted = false"
    ))
    .bind(&document_number)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("client"))?;

    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub document_number: String,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

fn validate_document(raw: &str) -> Result<String, ApiError> {
    let doc = validate_required("document_number", raw, 32)?;
    if doc.contains(char::is_whitespace) {
        return Err(ApiError::validation("document_number cannot contain spaces"));
    }
    Ok(doc)
}

fn clean_email(email: Option<&str>) -> Result<Option<String>, ApiError> {
    let email = clean_optional("email", email, 256)?;
    if let Some(e) = &email {
        validate_email(e)?;
    }
    Ok(email)
}

fn clean_phone(raw: Option<&str>, default_country_code: &str) -> Result<Option<String>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(p) => normalize_e164(p, default_country_code)
            .map(Some)
            .map_err(ApiError::validation),
    }
}

pub async fn create_client(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateClientRequest>,
) -> Result<Json<ApiOk<ClientRow>>, ApiError> {
    auth.require("clients.manage")?;

    let document_number = validate_document(&req.document_number)?;
    let full_name = validate_required("full_name", &req.full_name, 160)?;
    let email = clean_email(req.email.as_deref())?;
    let phone = clean_phone(req.phone.as_deref(), &state.config.default_country_code)?;
    let address = clean_optional("address", req.address.as_deref(), 256)?;

    // a live client with the same document trips the partial unique index -> 409
    let row = sqlx::query_as::<_, ClientRow>(
        r#"
        INSERT INTO client (document_number, full_name, email, phone, address)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING client_id, document_number, full_name, email, phone, address, is_active,
                  created_at, updated_at
        "#,
    )
    .bind(&document_number)
    .bind(&full_name)
    .bind(email)
    .bind(phone)
    .bind(address)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(client_id = %row.client_id, by = %auth.user_id, "client created");
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClientRequest {
    pub document_number: Option<String>,
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub address: Option<Option<String>>,
    pub is_active: Option<bool>,
}

pub async fn update_client(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(client_id): Path<Uuid>,
    Json(req): Json<UpdateClientRequest>,
) -> Result<Json<ApiOk<ClientRow>>, ApiError> {
    auth.require("clients.manage")?;

    let existing = load_client(&state, client_id).await?;

    let document_number = match req.document_number.as_deref() {
        Some(d) => validate_document(d)?,
        None => existing.document_number.clone(),
    };
    let full_name = match req.full_name.as_deref() {
        Some(n) => validate_required("full_name", n, 160)?,
        None => existing.full_name.clone(),
    };
    let email = match req.email {
        Some(e) => clean_email(e.as_deref())?,
        None => existing.email.clone(),
    };
    let phone = match req.phone {
        Some(p) => clean_phone(p.as_deref(), &state.config.default_country_code)?,
        None => existing.phone.clone(),
    };
    let address = match req.address {
        Some(a) => clean_optional("address", a.as_deref(), 256)?,
        None => existing.address.clone(),
    };

    let row = sqlx::query_as::<_, ClientRow>(
        r#"
        UPDATE client
        SET document_number = $1,
            full_name = $2,
            email = $3,
            phone = $4,
            address = $5,
            is_active = $6,
            updated_at = now()
        WHERE client_id = $7
        RETURNING client_id, document_number, full_name, email, phone, address, is_active,
                  created_at, updated_at
        "#,
    )
    .bind(&document_number)
    .bind(&full_name)
    .bind(email)
    .bind(phone)
    .bind(address)
    .bind(req.is_active.unwrap_or(existing.is_active))
    .bind(client_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(row)))
}

/// Soft delete; pending appointments from today on are cancelled with it.
pub const CLIENT_DELETED_REASON: &str = "Client deleted";

/// Writes behind a client deletion, run inside one transaction.
#[async_trait]
pub trait ClientRemoval: Send {
    /// Soft-deletes the client. Updating the row locks it, which serializes
    /// the deletion with bookings that lock the same client. False when the
    /// client is missing or already deleted.
    async fn soft_delete(&mut self, client_id: Uuid) -> Result<bool, ApiError>;
    /// Cancels the client's Pending appointments dated `from` or later.
    async fn cancel_pending_from(
        &mut self,
        client_id: Uuid,
        from: NaiveDate,
        reason: &str,
    ) -> Result<u64, ApiError>;
}

struct TxRemoval<'a, 'c> {
    tx: &'a mut sqlx::Transaction<'c, sqlx::Postgres>,
}

#[async_trait]
impl<'a, 'c> ClientRemoval for TxRemoval<'a, 'c> {
    async fn soft_delete(&mut self, client_id: Uuid) -> Result<bool, ApiError> {
        let res = sqlx::query(
            r#"
            UPDATE client
            SET is_deleted = true, is_active = false, deleted_at = now(), updated_at = now()
            WHERE client_id = $1 AND is_deleted = false
            "#,
        )
        .bind(client_id)
        .execute(&mut **self.tx)
        .await
        .map_err(db_error)?;
        Ok(res.rows_affected() > 0)
    }

    async fn cancel_pending_from(
        &mut self,
        client_id: Uuid,
        from: NaiveDate,
        reason: &str,
    ) -> Result<u64, ApiError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment
            SET status = 2,
                cancellation_reason = $3,
                cancelled_at = now(),
                updated_at = now()
            WHERE client_id = $1
              AND status = 0
              AND is_deleted = false
              AND scheduled_date >= $2
            "#,
        )
        .bind(client_id)
        .bind(from)
        .bind(reason)
        .execute(&mut **self.tx)
        .await
        .map_err(db_error)?;
        Ok(res.rows_affected())
    }
}

/// Deletes the client and cancels what they still had booked from `today`
/// on. Returns how many appointments were cancelled.
pub async fn remove_client<R: ClientRemoval>(
    removal: &mut R,
    client_id: Uuid,
    today: NaiveDate,
) -> Result<u64, ApiError> {
    if !removal.soft_delete(client_id).await? {
        return Err(ApiError::not_found("client"));
    }
    removal
        .cancel_pending_from(client_id, today, CLIENT_DELETED_REASON)
        .await
}

pub async fn delete_client(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(client_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("clients.manage")?;

    let today = business_now(state.config.business_offset()).date();
    let mut tx = state.db.begin().await.map_err(db_error)?;
    let cancelled = remove_client(&mut TxRemoval { tx: &mut tx }, client_id, today).await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(client_id = %client_id, cancelled, "client deleted");
    Ok(Json(ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentStatus;

    struct FakeRemoval {
        client_live: bool,
        // (date, status, cancellation reason)
        appointments: Vec<(NaiveDate, AppointmentStatus, Option<String>)>,
    }

    #[async_trait]
    impl ClientRemoval for FakeRemoval {
        async fn soft_delete(&mut self, _client_id: Uuid) -> Result<bool, ApiError> {
            Ok(std::mem::replace(&mut self.client_live, false))
        }

        async fn cancel_pending_from(
            &mut self,
            _client_id: Uuid,
            from: NaiveDate,
            reason: &str,
        ) -> Result<u64, ApiError> {
            let mut n = 0;
            for (date, status, why) in &mut self.appointments {
                if *status == AppointmentStatus::Pending && *date >= from {
                    *status = AppointmentStatus::Cancelled;
                    *why = Some(reason.to_string());
                    n += 1;
                }
            }
            Ok(n)
        }
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    #[tokio::test]
    async fn deleting_a_client_cancels_today_and_later() {
        let mut removal = FakeRemoval {
            client_live: true,
            appointments: vec![
                (d(10), AppointmentStatus::Pending, None),
                (d(15), AppointmentStatus::Pending, None),
                (d(20), AppointmentStatus::Pending, None),
                (d(20), AppointmentStatus::Completed, None),
            ],
        };

        let cancelled = remove_client(&mut removal, Uuid::new_v4(), d(15)).await.unwrap();
        assert_eq!(cancelled, 2);
        assert_eq!(removal.appointments[0].1, AppointmentStatus::Pending);
        assert_eq!(removal.appointments[1].1, AppointmentStatus::Cancelled);
        assert_eq!(removal.appointments[1].2.as_deref(), Some(CLIENT_DELETED_REASON));
        assert_eq!(removal.appointments[3].1, AppointmentStatus::Completed);

        // second delete finds nothing and touches nothing
        let err = remove_client(&mut removal, Uuid::new_v4(), d(1)).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(removal.appointments[0].1, AppointmentStatus::Pending);
    }

    #[test]
    fn document_is_trimmed_and_single_token() {
        assert_eq!(validate_document(" 1020304050 ").unwrap(), "1020304050");
        assert!(validate_document("10 20").is_err());
        assert!(validate_document("").is_err());
    }

    #[test]
    fn phone_is_normalized_or_rejected() {
        assert_eq!(
            clean_phone(Some("300 123 4567"), "57").unwrap(),
            Some("+573001234567".into())
        );
        assert_eq!(clean_phone(Some("  "), "57").unwrap(), None);
        assert!(clean_phone(Some("12"), "57").is_err());
    }

    #[test]
    fn patch_null_clears_email() {
        let req: UpdateClientRequest = serde_json::from_str(r#"{"email": null}"#).unwrap();
        assert_eq!(req.email, Some(None));
        assert!(req.phone.is_none());
    }
}
