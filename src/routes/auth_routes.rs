use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{
        generate_refresh_token, hash_password, hash_refresh_token, verify_password, TokenSubject,
    },
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{ok, ApiOk, AppState, OkResponse},
    middleware::auth_context::ADMIN_ROLE,
    routes::role_routes::load_role_permissions,
};

// Refresh tokens are capped regardless of configuration.
const MAX_REFRESH_TTL_HOURS: i64 = 24 * 30;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/change_password", post(change_password))
        .route("/reset_password", post(reset_password))
}

#[derive(Debug, sqlx::FromRow)]
pub struct UserAuthRow {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub is_active: bool,
    pub branch_id: Option<Uuid>,
    pub role_id: Uuid,
    pub role_name: String,
}

const USER_AUTH_SELECT: &str = r#"
    SELECT u.user_id, u.username, u.display_name, u.email, u.password_hash,
           u.is_active, u.branch_id, r.role_id, r.name AS role_name
    FROM app_user u
    JOIN role r ON r.role_id = u.role_id
"#;

async fn load_user_by_username(state: &AppState, username: &str) -> Result<Option<UserAuthRow>, ApiError> {
    sqlx::query_as::<_, UserAuthRow>(&format!("{USER_AUTH_SELECT} WHERE u.username = $1"))
        .bind(username)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)
}

async fn load_user_by_id(state: &AppState, user_id: Uuid) -> Result<Option<UserAuthRow>, ApiError> {
    sqlx::query_as::<_, UserAuthRow>(&format!("{USER_AUTH_SELECT} WHERE u.user_id = $1"))
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub role: String,
    pub permissions: Vec<String>,
    pub branch_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub token_type: &'static str,
    pub user: UserProfile,
}

/// Issues a JWT for the user plus a fresh refresh token row.
async fn issue_tokens(
    state: &AppState,
    user: UserAuthRow,
    device_name: Option<&str>,
) -> Result<TokenPair, ApiError> {
    let permissions = load_role_permissions(&state.db, user.role_id).await?;

    let access = state
        .jwt
        .issue(TokenSubject {
            user_id: user.user_id,
            username: &user.username,
            role: &user.role_name,
            permissions: permissions.clone(),
            branch_id: user.branch_id,
        })?;

    let (refresh_token, refresh_expires_at) = mint_refresh_token(
        &state.db,
        user.user_id,
        device_name,
        state.config.refresh_token_ttl_hours,
    )
    .await?;

    Ok(TokenPair {
        access_token: access.token,
        access_token_expires_at: access.expires_at,
        refresh_token,
        refresh_token_expires_at: refresh_expires_at,
        token_type: "Bearer",
        user: UserProfile {
            user_id: user.user_id,
            username: user.username,
            display_name: user.display_name,
            email: user.email,
            role: user.role_name,
            permissions,
            branch_id: user.branch_id,
        },
    })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub device_name: Option<String>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiOk<TokenPair>>, ApiError> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("username and password are required"));
    }

    let user = load_user_by_username(&state, username)
        .await?
        .ok_or_else(ApiError::invalid_credentials)?;

    if !verify_password(&req.password, &user.password_hash) {
        tracing::info!(username, "failed login");
        return Err(ApiError::invalid_credentials());
    }
    if !user.is_active {
        return Err(ApiError::forbidden("Account is disabled"));
    }

    tracing::info!(user_id = %user.user_id, "login");
    let pair = issue_tokens(&state, user, req.device_name.as_deref()).await?;
    Ok(Json(ApiOk::new(pair)))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshGrant {
    pub refresh_token_id: Uuid,
    pub user_id: Uuid,
    pub device_name: Option<String>,
}

/// Persistence for refresh tokens. Only SHA-256 hashes are ever stored.
#[async_trait]
pub trait RefreshTokenStore: Sync {
    async fn save(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device_name: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError>;

    /// Revokes the token if it is live and returns who held it. Unknown,
    /// expired and already used tokens give None.
    async fn consume(&self, token_hash: &str) -> Result<Option<RefreshGrant>, ApiError>;
}

#[async_trait]
impl RefreshTokenStore for sqlx::PgPool {
    async fn save(
        &self,
        user_id: Uuid,
        token_hash: &str,
        device_name: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_token (user_id, token_hash, device_name, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(device_name)
        .bind(expires_at)
        .execute(self)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn consume(&self, token_hash: &str) -> Result<Option<RefreshGrant>, ApiError> {
        // find and revoke in one statement, so a token works exactly once
        sqlx::query_as::<_, RefreshGrant>(
            r#"
            UPDATE refresh_token
            SET revoked_at = now(), last_used_at = now()
            WHERE token_hash = $1
              AND revoked_at IS NULL
              AND expires_at > now()
            RETURNING refresh_token_id, user_id, device_name
            "#,
        )
        .bind(token_hash)
        .fetch_optional(self)
        .await
        .map_err(db_error)
    }
}

/// New opaque refresh token for the user, with its expiry.
pub async fn mint_refresh_token<S: RefreshTokenStore + ?Sized>(
    store: &S,
    user_id: Uuid,
    device_name: Option<&str>,
    ttl_hours: i64,
) -> Result<(String, DateTime<Utc>), ApiError> {
    let token = generate_refresh_token();
    let ttl = ttl_hours.clamp(1, MAX_REFRESH_TTL_HOURS);
    let expires_at = Utc::now() + Duration::hours(ttl);
    store
        .save(user_id, &hash_refresh_token(&token), device_name, expires_at)
        .await?;
    Ok((token, expires_at))
}

/// Spends a presented refresh token. A second use fails with SESSION_EXPIRED.
pub async fn redeem_refresh_token<S: RefreshTokenStore + ?Sized>(
    store: &S,
    presented: &str,
) -> Result<RefreshGrant, ApiError> {
    let token = presented.trim();
    if token.is_empty() {
        return Err(ApiError::validation("refresh_token is required"));
    }
    store
        .consume(&hash_refresh_token(token))
        .await?
        .ok_or_else(ApiError::session_expired)
}

/// POST /api/v1/auth/refresh
/// Rotates the refresh token: the presented one is revoked and a new pair
/// is issued.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<ApiOk<TokenPair>>, ApiError> {
    let grant = redeem_refresh_token(&state.db, &req.refresh_token).await?;

    let user = load_user_by_id(&state, grant.user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(ApiError::session_expired)?;

    tracing::debug!(refresh_token_id = %grant.refresh_token_id, "refresh token rotated");
    let pair = issue_tokens(&state, user, grant.device_name.as_deref()).await?;
    Ok(Json(ApiOk::new(pair)))
}

pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let res = sqlx::query(
        r#"
        UPDATE refresh_token
        SET revoked_at = now()
        WHERE token_hash = $1
          AND user_id = $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(hash_refresh_token(req.refresh_token.trim()))
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::session_expired());
    }
    Ok(Json(ok()))
}

pub async fn me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<UserProfile>>, ApiError> {
    let user = load_user_by_id(&state, auth.user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(ApiError::session_expired)?;
    let permissions = load_role_permissions(&state.db, user.role_id).await?;

    Ok(Json(ApiOk::new(UserProfile {
        user_id: user.user_id,
        username: user.username,
        display_name: user.display_name,
        email: user.email,
        role: user.role_name,
        permissions,
        branch_id: user.branch_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// Passwords are stored exactly as typed; only the length check ignores
/// surrounding whitespace.
pub fn validate_new_password(pw: &str) -> Result<(), ApiError> {
    if pw.trim().chars().count() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }
    Ok(())
}

async fn set_password_and_revoke(state: &AppState, user_id: Uuid, password: &str) -> Result<(), ApiError> {
    let new_hash = hash_password(password).map_err(ApiError::Internal)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    sqlx::query(
        r#"
        UPDATE app_user
        SET password_hash = $1, updated_at = now()
        WHERE user_id = $2
        "#,
    )
    .bind(new_hash)
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    // every refresh token of the user stops working
    sqlx::query(
        r#"
        UPDATE refresh_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)
}

pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.old_password.is_empty() || req.new_password.is_empty() {
        return Err(ApiError::validation("old_password and new_password are required"));
    }
    validate_new_password(&req.new_password)?;

    let user = load_user_by_id(&state, auth.user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(ApiError::session_expired)?;

    if !verify_password(&req.old_password, &user.password_hash) {
        return Err(ApiError::invalid_credentials());
    }

    set_password_and_revoke(&state, user.user_id, &req.new_password).await?;
    tracing::info!(user_id = %user.user_id, "password changed");
    Ok(Json(ok()))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub username: String,
    /// If omitted, a temporary password is generated and returned.
    pub new_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordData {
    pub ok: bool,
    pub user_id: Uuid,
    pub username: String,
    pub temporary_password: Option<String>,
}

fn generate_temp_password() -> String {
    generate_refresh_token().chars().take(16).collect()
}

/// The password to store plus the temporary one to hand back, if generated.
fn choose_reset_password(requested: Option<&str>) -> Result<(String, Option<String>), ApiError> {
    match requested.filter(|s| !s.trim().is_empty()) {
        Some(pw) => {
            validate_new_password(pw)?;
            Ok((pw.to_string(), None))
        }
        None => {
            let temp = generate_temp_password();
            Ok((temp.clone(), Some(temp)))
        }
    }
}

/// Only an Admin may reset another Admin's password.
fn ensure_can_reset(auth: &AuthContext, target_role: &str) -> Result<(), ApiError> {
    if target_role == ADMIN_ROLE && !auth.is_admin() {
        return Err(ApiError::forbidden("only an Admin can reset an Admin password"));
    }
    Ok(())
}

pub async fn reset_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<ApiOk<ResetPasswordData>>, ApiError> {
    auth.require("users.manage")?;

    let username = req.username.trim();
    if username.is_empty() {
        return Err(ApiError::validation("username is required"));
    }

    let (new_pw, temporary_password) = choose_reset_password(req.new_password.as_deref())?;

    let target = load_user_by_username(&state, username)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))?;
    ensure_can_reset(&auth, &target.role_name)?;

    set_password_and_revoke(&state, target.user_id, &new_pw).await?;
    tracing::info!(user_id = %target.user_id, by = %auth.user_id, "password reset");

    Ok(Json(ApiOk::new(ResetPasswordData {
        ok: true,
        user_id: target.user_id,
        username: target.username,
        temporary_password,
    })))
}
