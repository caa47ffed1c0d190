// src/routes/theme_routes.rs

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{clean_optional, deserialize_double_option, validate_required, ApiOk, AppState},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/theme", get(get_theme).patch(update_theme))
}

pub const DEFAULT_COMPANY_NAME: &str = "PQR Appointments";
pub const DEFAULT_PRIMARY_COLOR: &str = "#0B5394";
pub const DEFAULT_SECONDARY_COLOR: &str = "#F1C232";

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ThemeSettings {
    pub company_name: String,
    pub primary_color: String,
    pub secondary_color: String,
    pub logo_url: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self {
            company_name: DEFAULT_COMPANY_NAME.to_string(),
            primary_color: DEFAULT_PRIMARY_COLOR.to_string(),
            secondary_color: DEFAULT_SECONDARY_COLOR.to_string(),
            logo_url: None,
            updated_at: None,
        }
    }
}

async fn load_theme(state: &AppState) -> Result<Option<ThemeSettings>, ApiError> {
    sqlx::query_as::<_, ThemeSettings>(
        r#"
        SELECT company_name, primary_color, secondary_color, logo_url, updated_at
        FROM theme_settings
        WHERE singleton_id = TRUE
        "#,
    )
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)
}

/// Public: the login screen is themed before anyone signs in.
pub async fn get_theme(State(state): State<AppState>) -> Result<Json<ApiOk<ThemeSettings>>, ApiError> {
    let theme = load_theme(&state).await?.unwrap_or_default();
    Ok(Json(ApiOk::new(theme)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateThemeRequest {
    pub company_name: Option<String>,
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub logo_url: Option<Option<String>>,
}

/// `#RRGGBB`, returned upper-cased.
fn validate_color(field: &str, raw: &str) -> Result<String, ApiError> {
    let c = raw.trim();
    let ok = c.len() == 7
        && c.starts_with('#')
        && c[1..].chars().all(|ch| ch.is_ascii_hexdigit());
    if !ok {
        return Err(ApiError::validation(format!("{field} must be a #RRGGBB color")));
    }
    Ok(c.to_uppercase())
}

pub async fn update_theme(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateThemeRequest>,
) -> Result<Json<ApiOk<ThemeSettings>>, ApiError> {
    auth.require("settings.manage")?;

    let current = load_theme(&state).await?.unwrap_or_default();

    let company_name = match req.company_name.as_deref() {
        Some(n) => validate_required("company_name", n, 128)?,
        None => current.company_name,
    };
    let primary_color = match req.primary_color.as_deref() {
        Some(c) => validate_color("primary_color", c)?,
        None => current.primary_color,
    };
    let secondary_color = match req.secondary_color.as_deref() {
        Some(c) => validate_color("secondary_color", c)?,
        None => current.secondary_color,
    };
    let logo_url = match req.logo_url {
        Some(u) => clean_optional("logo_url", u.as_deref(), 512)?,
        None => current.logo_url,
    };

    // upsert the singleton row
    let theme = sqlx::query_as::<_, ThemeSettings>(
        r#"
        INSERT INTO theme_settings (singleton_id, company_name, primary_color, secondary_color, logo_url)
        VALUES (TRUE, $1, $2, $3, $4)
        ON CONFLICT (singleton_id)
        DO UPDATE SET company_name = EXCLUDED.company_name,
                      primary_color = EXCLUDED.primary_color,
                      secondary_color = EXCLUDED.secondary_color,
                      logo_url = EXCLUDED.logo_url,
                      updated_at = now()
        RETURNING company_name, primary_color, secondary_color, logo_url, updated_at
        "#,
    )
    .bind(&company_name)
    .bind(&primary_color)
    .bind(&secondary_color)
    .bind(logo_url)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(by = %auth.user_id, "theme updated");
    Ok(Json(ApiOk::new(theme)))
}
