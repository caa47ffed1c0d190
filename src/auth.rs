use argon2::{
    Argon2,
    PasswordHash,
    PasswordVerifier,
    PasswordHasher,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use argon2::password_hash::{SaltString, rand_core::OsRng as PHOsRng};

/// Verify password using Argon2 hash stored in DB.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(p) => p,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Hash a new password using Argon2id with a random salt.
/// The PHC string goes into app_user.password_hash.
pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut PHOsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|phc| phc.to_string())
        .map_err(|e| format!("argon2 hash error: {e}"))
}

/// Opaque refresh token handed to the client; only its hash is stored.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex of a refresh token, as stored in refresh_token.token_hash.
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("could not sign token: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<Uuid>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and validates HS256 access tokens.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl: Duration,
}

pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenSubject<'a> {
    pub user_id: Uuid,
    pub username: &'a str,
    pub role: &'a str,
    pub permissions: Vec<String>,
    pub branch_id: Option<Uuid>,
}

impl JwtKeys {
    pub fn new(secret: &str, issuer: &str, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_string(),
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    pub fn issue(&self, subject: TokenSubject<'_>) -> Result<IssuedToken, TokenError> {
        self.issue_at(subject, Utc::now())
    }

    fn issue_at(&self, subject: TokenSubject<'_>, now: DateTime<Utc>) -> Result<IssuedToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: subject.user_id,
            name: subject.username.to_string(),
            role: subject.role.to_string(),
            permissions: subject.permissions,
            branch_id: subject.branch_id,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.leeway = 0;

        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn subject(user_id: Uuid) -> TokenSubject<'static> {
        TokenSubject {
            user_id,
            username: "recepcion1",
            role: "Receptionist",
            permissions: vec!["appointments.create".into()],
            branch_id: None,
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let phc = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &phc));
        assert!(!verify_password("wrong horse", &phc));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn refresh_tokens_are_unique_and_hash_is_hex() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_ne!(a, b);
        let h = hash_refresh_token(&a);
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_refresh_token(&a));
    }

    #[test]
    fn jwt_carries_role_and_permissions() {
        let keys = JwtKeys::new(SECRET, "pqr", 30);
        let id = Uuid::new_v4();
        let issued = keys.issue(subject(id)).unwrap();
        let claims = keys.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.role, "Receptionist");
        assert_eq!(claims.permissions, vec!["appointments.create".to_string()]);
    }

    #[test]
    fn expired_jwt_is_reported_as_expired() {
        let keys = JwtKeys::new(SECRET, "pqr", 30);
        let issued = keys
            .issue_at(subject(Uuid::new_v4()), Utc::now() - Duration::hours(2))
            .unwrap();
        assert!(matches!(keys.verify(&issued.token), Err(TokenError::Expired)));
    }

    #[test]
    fn jwt_from_other_issuer_or_secret_is_rejected() {
        let keys = JwtKeys::new(SECRET, "pqr", 30);
        let other_issuer = JwtKeys::new(SECRET, "someone-else", 30);
        let other_secret = JwtKeys::new("ffffffffffffffffffffffffffffffff", "pqr", 30);

        let token = other_issuer.issue(subject(Uuid::new_v4())).unwrap().token;
        assert!(matches!(keys.verify(&token), Err(TokenError::Invalid(_))));

        let token = other_secret.issue(subject(Uuid::new_v4())).unwrap().token;
        assert!(matches!(keys.verify(&token), Err(TokenError::Invalid(_))));
    }
}
