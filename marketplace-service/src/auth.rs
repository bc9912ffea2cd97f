//! Password hashing, session tokens and the request-level access check.
//!
//! Session tokens are compact `header.payload.signature` strings: base64url
//! (no padding) JSON segments signed with HMAC-SHA256. They carry the user's
//! id, email and role plus issue and expiry times; expiry is the only way a
//! token stops working.

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{async_trait, extract::FromRequestParts, http::header::AUTHORIZATION, http::request::Parts};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared::Role;
use std::sync::Arc;

use crate::api::AppState;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Lifetime of the token handed out right after registration.
pub fn registration_ttl() -> Duration {
    Duration::days(7)
}

/// Lifetime of the token handed out on login.
pub fn login_ttl() -> Duration {
    Duration::days(30)
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(anyhow!("failed to hash password: {}", e)))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub id: i32,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    secret: Arc<Vec<u8>>,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
        }
    }

    pub fn issue(&self, id: i32, email: &str, role: Role, ttl: Duration) -> AppResult<String> {
        self.issue_at(id, email, role, Utc::now(), ttl)
    }

    pub fn issue_at(
        &self,
        id: i32,
        email: &str,
        role: Role,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<String> {
        let claims = SessionClaims {
            id,
            email: email.to_string(),
            role,
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        };
        let payload = serde_json::to_vec(&claims).map_err(anyhow::Error::from)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(TOKEN_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.sign(signing_input.as_bytes())?;
        Ok(format!("{}.{}", signing_input, signature))
    }

    pub fn verify(&self, token: &str) -> AppResult<SessionClaims> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> AppResult<SessionClaims> {
        let (signing_input, signature) = token.rsplit_once('.').ok_or(AppError::InvalidSession)?;
        let (header, payload) = signing_input
            .split_once('.')
            .ok_or(AppError::InvalidSession)?;
        if header != URL_SAFE_NO_PAD.encode(TOKEN_HEADER) {
            return Err(AppError::InvalidSession);
        }

        let expected = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AppError::InvalidSession)?;
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| AppError::InvalidSession)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AppError::InvalidSession)?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| AppError::InvalidSession)?;
        if claims.exp <= now.timestamp() {
            return Err(AppError::InvalidSession);
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> AppResult<String> {
        let mut mac = self.mac()?;
        mac.update(input);
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> AppResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(anyhow!("invalid token secret: {}", e)))
    }
}

/// The authenticated actor of a request. Handlers take ownership fields such
/// as `farmerId` or `buyerId` from here, never from the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: i32,
    pub email: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_any(&self, roles: &[Role]) -> AppResult<()> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden("insufficient privileges"))
        }
    }

    /// Passes for the user identified by `user_id` and for admins.
    pub fn require_self_or_admin(&self, user_id: i32) -> AppResult<()> {
        if self.id == user_id || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("access restricted to the account owner"))
        }
    }
}

impl From<SessionClaims> for CurrentUser {
    fn from(claims: SessionClaims) -> Self {
        Self {
            id: claims.id,
            email: claims.email,
            role: claims.role,
        }
    }
}

/// Resolves the bearer token without a database round trip. Whether the
/// account is still active is checked by the stores on mutating paths.
#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Unauthenticated)?;

        let claims = state.tokens.verify(token)?;
        Ok(claims.into())
    }
}
