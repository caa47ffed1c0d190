use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::{Claims, JwtKeys, TokenError};
use crate::error::{db_error, ApiError};
use crate::models::AppState;

pub const ADMIN_ROLE: &str = "Admin";

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub branch_id: Option<Uuid>,
}

impl AuthContext {
    pub fn from_claims(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.name,
            role: claims.role,
            permissions: claims.permissions,
            branch_id: claims.branch_id,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    pub fn has(&self, permission: &str) -> bool {
        self.is_admin() || self.permissions.iter().any(|p| p == permission)
    }

    pub fn require(&self, permission: &str) -> Result<(), ApiError> {
        if self.has(permission) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("missing permission {permission}")))
        }
    }

    /// Branch filter for listings: branch-bound staff only see their branch.
    pub fn branch_scope(&self, requested: Option<Uuid>) -> Result<Option<Uuid>, ApiError> {
        match (self.branch_id, requested) {
            (Some(own), Some(req)) if own != req && !self.is_admin() => Err(ApiError::forbidden(
                "you can only access your own branch",
            )),
            (Some(own), _) if !self.is_admin() => Ok(Some(own)),
            (_, req) => Ok(req),
        }
    }
}

pub fn authenticate(jwt: &JwtKeys, token: &str) -> Result<AuthContext, ApiError> {
    jwt.verify(token)
        .map(AuthContext::from_claims)
        .map_err(|e| {
            if !matches!(e, TokenError::Expired) {
                tracing::debug!(error = %e, "rejected bearer token");
            }
            ApiError::from(e)
        })
}

/// `is_active` is the user's current flag, None when the user row is gone.
fn require_active(ctx: AuthContext, is_active: Option<bool>) -> Result<AuthContext, ApiError> {
    match is_active {
        Some(true) => Ok(ctx),
        _ => {
            tracing::info!(user_id = %ctx.user_id, "token of disabled user rejected");
            Err(ApiError::session_expired())
        }
    }
}

/// Verifies the token, then makes sure the user has not been disabled since
/// it was issued.
pub async fn authorize(state: &AppState, token: &str) -> Result<AuthContext, ApiError> {
    let ctx = authenticate(&state.jwt, token)?;

    let is_active: Option<bool> =
        sqlx::query_scalar(r#"SELECT is_active FROM app_user WHERE user_id = $1"#)
            .bind(ctx.user_id)
            .fetch_optional(&state.db)
            .await
            .map_err(db_error)?;

    require_active(ctx, is_active)
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <token>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            authorize(state, authz.token()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: &str, permissions: &[&str], branch_id: Option<Uuid>) -> AuthContext {
        AuthContext {
            user_id: Uuid::new_v4(),
            username: "u".into(),
            role: role.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            branch_id,
        }
    }

    #[test]
    fn admin_role_holds_every_permission() {
        let admin = ctx(ADMIN_ROLE, &[], None);
        assert!(admin.require("roles.manage").is_ok());
    }

    #[test]
    fn other_roles_need_the_claim() {
        let agent = ctx("Agent", &["appointments.read"], None);
        assert!(agent.require("appointments.read").is_ok());
        let err = agent.require("appointments.create").unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn branch_bound_users_are_pinned_to_their_branch() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();
        let staff = ctx("Receptionist", &[], Some(own));
        assert_eq!(staff.branch_scope(None).unwrap(), Some(own));
        assert_eq!(staff.branch_scope(Some(own)).unwrap(), Some(own));
        assert!(staff.branch_scope(Some(other)).is_err());

        let unbound = ctx("Receptionist", &[], None);
        assert_eq!(unbound.branch_scope(Some(other)).unwrap(), Some(other));

        let admin = ctx(ADMIN_ROLE, &[], Some(own));
        assert_eq!(admin.branch_scope(Some(other)).unwrap(), Some(other));
    }

    #[test]
    fn disabled_or_missing_users_lose_access() {
        let staff = ctx("Receptionist", &[], None);
        assert!(require_active(staff.clone(), Some(true)).is_ok());
        let err = require_active(staff.clone(), Some(false)).unwrap_err();
        assert_eq!(err.code(), "SESSION_EXPIRED");
        assert!(require_active(staff, None).is_err());
    }

    #[test]
    fn expired_tokens_are_session_expired() {
        let keys = JwtKeys::new("0123456789abcdef0123456789abcdef", "pqr", -5);
        let issued = keys
            .issue(crate::auth::TokenSubject {
                user_id: Uuid::new_v4(),
                username: "ana",
                role: "Receptionist",
                permissions: vec![],
                branch_id: None,
            })
            .unwrap();
        let err = authenticate(&keys, &issued.token).unwrap_err();
        assert_eq!(err.code(), "SESSION_EXPIRED");
    }

    #[test]
    fn token_errors_map_to_unauthorized() {
        let keys = JwtKeys::new("0123456789abcdef0123456789abcdef", "pqr", 5);
        let err = authenticate(&keys, "not.a.jwt").unwrap_err();
        assert_eq!(err.code(), "INVALID_TOKEN");
    }
}
