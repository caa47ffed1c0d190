// src/routes/template_routes.rs

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::template::{render, unknown_placeholders},
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        clean_optional, deserialize_double_option, ok, validate_required, ApiOk, AppState,
        Channel, OkResponse,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_templates).post(create_template))
        .route("/render", post(render_preview))
        .route(
            "/{template_id}",
            get(get_template).patch(update_template).delete(delete_template),
        )
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TemplateRow {
    pub template_id: Uuid,
    pub code: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Template plus the placeholders that will not be substituted.
#[derive(Debug, Serialize)]
pub struct TemplateView {
    #[serde(flatten)]
    pub template: TemplateRow,
    pub unknown_placeholders: Vec<String>,
}

impl From<TemplateRow> for TemplateView {
    fn from(template: TemplateRow) -> Self {
        let mut unknown = unknown_placeholders(&template.body);
        if let Some(subject) = &template.subject {
            for key in unknown_placeholders(subject) {
                if !unknown.contains(&key) {
                    unknown.push(key);
                }
            }
        }
        Self {
            template,
            unknown_placeholders: unknown,
        }
    }
}

const TEMPLATE_COLUMNS: &str =
    "template_id, code, channel, subject, body, is_active, created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct ListTemplatesQuery {
    pub code: Option<String>,
    pub channel: Option<String>,
}

pub async fn list_templates(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListTemplatesQuery>,
) -> Result<Json<ApiOk<Vec<TemplateRow>>>, ApiError> {
    auth.require("templates.manage")?;
    let channel = q.channel.as_deref().map(Channel::parse).transpose()?;
    let code = q.code.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let rows = sqlx::query_as::<_, TemplateRow>(&format!(
        r#"
        SELECT {TEMPLATE_COLUMNS}
        FROM notification_template
        WHERE ($1::text IS NULL OR code = $1)
          AND ($2::text IS NULL OR channel = $2)
        ORDER BY code ASC, channel ASC
        "#
    ))
    .bind(code)
    .bind(channel.map(|c| c.as_str()))
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

async fn load_template(state: &AppState, template_id: Uuid) -> Result<TemplateRow, ApiError> {
    sqlx::query_as::<_, TemplateRow>(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM notification_template WHERE template_id = $1"
    ))
    .bind(template_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("template"))
}

pub async fn get_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
) -> Result<Json<ApiOk<TemplateView>>, ApiError> {
    auth.require("templates.manage")?;
    Ok(Json(ApiOk::new(load_template(&state, template_id).await?.into())))
}

fn validate_code(raw: &str) -> Result<String, ApiError> {
    let code = validate_required("code", raw, 64)?.to_lowercase();
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ApiError::validation("code may only contain letters, digits and _"));
    }
    Ok(code)
}

/// Email needs a subject; the other channels ignore it.
fn check_subject(channel: Channel, subject: &Option<String>) -> Result<(), ApiError> {
    if channel == Channel::Email && subject.is_none() {
        return Err(ApiError::validation("email templates need a subject"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub code: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub is_active: Option<bool>,
}

pub async fn create_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<Json<ApiOk<TemplateView>>, ApiError> {
    auth.require("templates.manage")?;

    let code = validate_code(&req.code)?;
    let channel = Channel::parse(&req.channel)?;
    let subject = clean_optional("subject", req.subject.as_deref(), 256)?;
    let body = validate_required("body", &req.body, 10_000)?;
    check_subject(channel, &subject)?;

    let row = sqlx::query_as::<_, TemplateRow>(&format!(
        r#"
        INSERT INTO notification_template (code, channel, subject, body, is_active)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {TEMPLATE_COLUMNS}
        "#
    ))
    .bind(&code)
    .bind(channel.as_str())
    .bind(subject)
    .bind(&body)
    .bind(req.is_active.unwrap_or(true))
    .fetch_one(&state.db)
    .await
    .map_err(|e| match db_error(e) {
        ApiError::Conflict(..) => ApiError::Conflict(
            "TEMPLATE_EXISTS",
            format!("a {} template for {code} already exists", channel.as_str()),
        ),
        other => other,
    })?;

    tracing::info!(template_id = %row.template_id, code = %row.code, channel = %row.channel, "template created");
    Ok(Json(ApiOk::new(row.into())))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub subject: Option<Option<String>>,
    pub body: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn update_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
    Json(req): Json<UpdateTemplateRequest>,
) -> Result<Json<ApiOk<TemplateView>>, ApiError> {
    auth.require("templates.manage")?;

    let existing = load_template(&state, template_id).await?;
    let channel = Channel::parse(&existing.channel)?;

    let subject = match req.subject {
        Some(s) => clean_optional("subject", s.as_deref(), 256)?,
        None => existing.subject.clone(),
    };
    let body = match req.body.as_deref() {
        Some(b) => validate_required("body", b, 10_000)?,
        None => existing.body.clone(),
    };
    check_subject(channel, &subject)?;

    let row = sqlx::query_as::<_, TemplateRow>(&format!(
        r#"
        UPDATE notification_template
        SET subject = $1, body = $2, is_active = $3, updated_at = now()
        WHERE template_id = $4
        RETURNING {TEMPLATE_COLUMNS}
        "#
    ))
    .bind(subject)
    .bind(&body)
    .bind(req.is_active.unwrap_or(existing.is_active))
    .bind(template_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(row.into())))
}

pub async fn delete_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require("templates.manage")?;

    let res = sqlx::query(r#"DELETE FROM notification_template WHERE template_id = $1"#)
        .bind(template_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("template"));
    }
    Ok(Json(ok()))
}

/* -------------------------
   POST /render (preview)
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    /// Stored template to preview; otherwise `body`/`subject` are used.
    pub template_id: Option<Uuid>,
    pub subject: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub subject: Option<String>,
    pub body: String,
    pub unknown_placeholders: Vec<String>,
}

fn sample_values() -> HashMap<&'static str, String> {
    HashMap::from([
        ("client_name", "Ana Gómez".to_string()),
        ("appointment_number", "APT-20260115-3F2A9C1B".to_string()),
        ("appointment_date", "15/01/2026".to_string()),
        ("appointment_time", "09:30".to_string()),
        ("branch_name", "Sede Centro".to_string()),
        ("branch_address", "Calle 10 # 5-20".to_string()),
        ("cancellation_reason", "Solicitud del cliente".to_string()),
        ("company_name", "PQR".to_string()),
    ])
}

fn preview(subject: Option<&str>, body: &str, overrides: &HashMap<String, String>) -> RenderResponse {
    let mut values: HashMap<&str, String> = sample_values();
    for (k, v) in overrides {
        values.insert(k.as_str(), v.clone());
    }
    let mut unknown = unknown_placeholders(body);
    if let Some(s) = subject {
        for key in unknown_placeholders(s) {
            if !unknown.contains(&key) {
                unknown.push(key);
            }
        }
    }
    RenderResponse {
        subject: subject.map(|s| render(s, &values)),
        body: render(body, &values),
        unknown_placeholders: unknown,
    }
}

pub async fn render_preview(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<RenderRequest>,
) -> Result<Json<ApiOk<RenderResponse>>, ApiError> {
    auth.require("templates.manage")?;

    let (subject, body) = match (req.template_id, req.body) {
        (Some(id), _) => {
            let t = load_template(&state, id).await?;
            (t.subject, t.body)
        }
        (None, Some(body)) => (req.subject, body),
        (None, None) => return Err(ApiError::validation("template_id or body is required")),
    };

    Ok(Json(ApiOk::new(preview(subject.as_deref(), &body, &req.values))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_uses_samples_and_overrides() {
        let overrides = HashMap::from([("client_name".to_string(), "Luis".to_string())]);
        let r = preview(
            Some("Cita {{appointment_number}}"),
            "Hola {{client_name}}, {{ branch_name }} {{unknown}}",
            &overrides,
        );
        assert_eq!(r.subject.as_deref(), Some("Cita APT-20260115-3F2A9C1B"));
        assert_eq!(r.body, "Hola Luis, Sede Centro {{unknown}}");
        assert_eq!(r.unknown_placeholders, vec!["unknown".to_string()]);
    }

    #[test]
    fn code_is_normalized() {
        assert_eq!(validate_code(" Appointment_Created ").unwrap(), "appointment_created");
        assert!(validate_code("appointment-created").is_err());
    }

    #[test]
    fn email_requires_subject() {
        assert!(check_subject(Channel::Email, &None).is_err());
        assert!(check_subject(Channel::Whatsapp, &None).is_ok());
    }
}
