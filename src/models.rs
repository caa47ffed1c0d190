use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::auth::JwtKeys;
use crate::config::Config;
use crate::error::ApiError;
use crate::hub::NotificationHub;
use crate::notifications::NotificationService;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: Arc<Config>,
    pub jwt: JwtKeys,
    pub hub: NotificationHub,
    pub notifier: Arc<NotificationService>,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

impl<T> ApiOk<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

pub type OkResponse = ApiOk<OkData>;

pub fn ok() -> OkResponse {
    ApiOk::new(OkData { ok: true })
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize, Default, Clone, Copy)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl PageQuery {
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        Self { page, page_size }
    }

    /// Validated `(page, page_size)`; pages are 1-based and the row offset
    /// `(page - 1) * page_size` is guaranteed to fit in an i64.
    pub fn resolve(&self) -> Result<(i64, i64), ApiError> {
        let page = self.page.unwrap_or(1);
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page < 1 {
            return Err(ApiError::validation("page must be >= 1"));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ApiError::validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if (page - 1).checked_mul(page_size).is_none() {
            return Err(ApiError::validation("page is out of range"));
        }
        Ok((page, page_size))
    }
}

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, page: i64, page_size: i64, total: i64) -> Self {
        let total_pages = if total == 0 { 0 } else { (total + page_size - 1) / page_size };
        Self {
            items,
            page,
            page_size,
            total,
            total_pages,
        }
    }
}

/* -------------------------
   Enums stored as smallint / text
--------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending = 0,
    Completed = 1,
    Cancelled = 2,
    Expired = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Whatsapp,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "in_app",
            Channel::Whatsapp => "whatsapp",
            Channel::Email => "email",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw.trim() {
            "in_app" => Ok(Channel::InApp),
            "whatsapp" => Ok(Channel::Whatsapp),
            "email" => Ok(Channel::Email),
            other => Err(ApiError::validation(format!(
                "channel must be in_app, whatsapp or email (got {other:?})"
            ))),
        }
    }
}

/* -------------------------
   Shared row models
--------------------------*/

/// Appointment joined with the client and branch fields that views and
/// notifications need.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AppointmentDetailRow {
    pub appointment_id: Uuid,
    pub appointment_number: String,
    pub client_id: Uuid,
    pub client_name: String,
    pub client_document: String,
    #[serde(skip)]
    pub client_phone: Option<String>,
    #[serde(skip)]
    pub client_email: Option<String>,
    pub branch_id: Uuid,
    pub branch_name: String,
    #[serde(skip)]
    pub branch_address: Option<String>,
    pub appointment_type_id: Option<Uuid>,
    pub appointment_type_name: Option<String>,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_by_user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const APPOINTMENT_DETAIL_SELECT: &str = r#"
    SELECT
      a.appointment_id,
      a.appointment_number,
      c.client_id,
      c.full_name       AS client_name,
      c.document_number AS client_document,
      c.phone           AS client_phone,
      c.email           AS client_email,
      b.branch_id,
      b.name            AS branch_name,
      b.address         AS branch_address,
      t.appointment_type_id,
      t.name            AS appointment_type_name,
      a.scheduled_date,
      a.scheduled_time,
      a.status,
      a.notes,
      a.cancellation_reason,
      a.reminder_sent_at,
      a.completed_at,
      a.cancelled_at,
      a.created_by_user_id,
      a.created_at,
      a.updated_at
    FROM appointment a
    JOIN client c ON c.client_id = a.client_id
    JOIN branch b ON b.branch_id = a.branch_id
    LEFT JOIN appointment_type t ON t.appointment_type_id = a.appointment_type_id
"#;

/// Serde helper for PATCH bodies: distinguishes an absent field from `null`.
pub fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    // only called when the field is present; null => Some(None)
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

pub fn validate_required(field: &str, value: &str, max_len: usize) -> Result<String, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if v.chars().count() > max_len {
        return Err(ApiError::validation(format!("{field} is too long (max {max_len})")));
    }
    Ok(v.to_string())
}

/// Trims an optional text field; empty strings become None.
pub fn clean_optional(field: &str, value: Option<&str>, max_len: usize) -> Result<Option<String>, ApiError> {
    match value.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(v) if v.chars().count() > max_len => {
            Err(ApiError::validation(format!("{field} is too long (max {max_len})")))
        }
        Some(v) => Ok(Some(v.to_string())),
    }
}

pub fn validate_email(email: &str) -> Result<(), ApiError> {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None)
            if !local.is_empty() && !domain.is_empty() && !email.contains(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(ApiError::validation("email is not valid")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_query_defaults_and_bounds() {
        assert_eq!(PageQuery::default().resolve().unwrap(), (1, DEFAULT_PAGE_SIZE));
        assert!(PageQuery { page: Some(0), page_size: None }.resolve().is_err());
        assert!(PageQuery { page: None, page_size: Some(101) }.resolve().is_err());
        assert_eq!(
            PageQuery { page: Some(3), page_size: Some(50) }.resolve().unwrap(),
            (3, 50)
        );
    }

    #[test]
    fn huge_page_is_a_validation_error() {
        let err = PageQuery::new(Some(i64::MAX), Some(20)).resolve().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let (page, size) = PageQuery::new(Some(i64::MAX / 100), Some(100)).resolve().unwrap();
        assert!((page - 1).checked_mul(size).is_some());
    }

    #[test]
    fn total_pages_rounds_up() {
        let p: Paged<u8> = Paged::new(vec![], 1, 20, 41);
        assert_eq!(p.total_pages, 3);
        let p: Paged<u8> = Paged::new(vec![], 1, 20, 0);
        assert_eq!(p.total_pages, 0);
    }

    #[test]
    fn email_shape() {
        assert!(validate_email("ana@empresa.co").is_ok());
        assert!(validate_email("ana@").is_err());
        assert!(validate_email("@empresa.co").is_err());
        assert!(validate_email("a@b@c").is_err());
        assert!(validate_email("ana ruiz@empresa.co").is_err());
    }

    #[test]
    fn optional_text_is_trimmed_to_none() {
        assert_eq!(clean_optional("notes", Some("   "), 10).unwrap(), None);
        assert_eq!(clean_optional("notes", Some(" hi "), 10).unwrap(), Some("hi".into()));
        assert!(clean_optional("notes", Some("0123456789x"), 10).is_err());
        assert!(validate_required("name", "  ", 10).is_err());
    }

    #[test]
    fn channel_parsing() {
        assert_eq!(Channel::parse("whatsapp").unwrap(), Channel::Whatsapp);
        assert_eq!(Channel::Email.as_str(), "email");
        assert!(Channel::parse("sms").is_err());
    }
}
