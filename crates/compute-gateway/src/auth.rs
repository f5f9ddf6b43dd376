//! Bearer-token authentication.
//!
//! Tokens are `base64url(claims).base64url(HMAC-SHA256(claims))`, signed
//! with the configured secret. They are opaque to every layer below the
//! gateway, which only ever sees the resulting [`CallerContext`].

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use compute_core::CallerContext;
use ring::hmac;
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AuthConfig, UserEntry, MAX_TOKEN_EXPIRATION};
use crate::error::ApiError;
use crate::AppState;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("failed to initialise token key")]
    KeyGeneration,

    #[error("token lifetime of {0}s is out of range")]
    InvalidLifetime(u64),
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: u64,
    name: String,
    roles: Vec<String>,
    iss: String,
    exp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: CallerContext,
}

pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Issues and verifies tokens for the configured users.
pub struct TokenAuthority {
    enabled: bool,
    key: hmac::Key,
    issuer: String,
    lifetime: chrono::Duration,
    users: Vec<UserEntry>,
}

impl TokenAuthority {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let key = if config.secret_key.is_empty() {
            if config.enabled {
                warn!("No auth.secret_key configured; tokens will not survive a restart");
            }
            hmac::Key::generate(hmac::HMAC_SHA256, &SystemRandom::new())
                .map_err(|_| AuthError::KeyGeneration)?
        } else {
            hmac::Key::new(hmac::HMAC_SHA256, config.secret_key.as_bytes())
        };
        let lifetime = Some(config.token_expiration)
            .filter(|secs| *secs <= MAX_TOKEN_EXPIRATION)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::TimeDelta::try_seconds)
            .ok_or(AuthError::InvalidLifetime(config.token_expiration))?;
        Ok(Self {
            enabled: config.enabled,
            key,
            issuer: config.issuer.clone(),
            lifetime,
            users: config.default_users.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let digest = hash_password(&request.password);
        let user = self
            .users
            .iter()
            .find(|u| u.username == request.username && u.password_sha256.eq_ignore_ascii_case(&digest))
            .ok_or(AuthError::InvalidCredentials)?;
        let ctx = CallerContext::new(user.user_id, &user.username, user.roles.clone());
        let expires_at = Utc::now() + self.lifetime;
        let token = self.issue(&ctx, expires_at)?;
        debug!(username = %user.username, "Issued token");
        Ok(LoginResponse {
            token,
            expires_at,
            user: ctx,
        })
    }

    pub fn issue(&self, ctx: &CallerContext, expires_at: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            sub: ctx.user_id,
            name: ctx.username.clone(),
            roles: ctx.roles.clone(),
            iss: self.issuer.clone(),
            exp: expires_at.timestamp(),
        };
        let payload = serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let tag = hmac::sign(&self.key, payload.as_bytes());
        Ok(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    pub fn verify(&self, token: &str) -> Result<CallerContext> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        hmac::verify(&self.key, payload.as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or(AuthError::Malformed)?;
        if claims.iss != self.issuer {
            return Err(AuthError::InvalidSignature);
        }
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(AuthError::Malformed)?;
        if expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Ok(CallerContext::new(claims.sub, claims.name, claims.roles))
    }

    /// Context for a request's `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<CallerContext> {
        if !self.enabled {
            return Ok(CallerContext::admin(0));
        }
        let header = header.ok_or(AuthError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

/// The authenticated caller of a request.
pub struct Caller(pub CallerContext);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let app = AppState::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let ctx = app.auth.authenticate(header)?;
        Ok(Caller(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(lifetime: u64) -> TokenAuthority {
        TokenAuthority::new(&AuthConfig {
            secret_key: "a-very-secret-signing-key".to_string(),
            token_expiration: lifetime,
            default_users: vec![UserEntry {
                username: "alice".to_string(),
                password_sha256: hash_password("wonderland"),
                user_id: 7,
                roles: vec!["user".to_string()],
            }],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_login_and_verify() {
        let auth = authority(60);
        let response = auth
            .login(&LoginRequest {
                username: "alice".to_string(),
                password: "wonderland".to_string(),
            })
            .unwrap();
        assert_eq!(response.user.user_id, 7);

        let header = format!("Bearer {}", response.token);
        let ctx = auth.authenticate(Some(&header)).unwrap();
        assert_eq!(ctx.user_id, 7);
        assert_eq!(ctx.username, "alice");
        assert!(!ctx.is_admin());
    }

    #[test]
    fn test_rejections() {
        let auth = authority(60);
        assert_eq!(
            auth.login(&LoginRequest {
                username: "alice".to_string(),
                password: "guess".to_string(),
            })
            .unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(auth.authenticate(None).unwrap_err(), AuthError::MissingToken);
        assert_eq!(auth.authenticate(Some("Basic abc")).unwrap_err(), AuthError::MissingToken);
        assert_eq!(auth.verify("garbage").unwrap_err(), AuthError::Malformed);

        let token = auth
            .issue(&CallerContext::user(7), Utc::now() + chrono::Duration::seconds(60))
            .unwrap();
        let (payload, _) = token.split_once('.').unwrap();
        let forged = format!("{payload}.{}", URL_SAFE_NO_PAD.encode([0u8; 32]));
        assert_eq!(auth.verify(&forged).unwrap_err(), AuthError::InvalidSignature);

        let other = TokenAuthority::new(&AuthConfig::default()).unwrap();
        assert_eq!(other.verify(&token).unwrap_err(), AuthError::InvalidSignature);

        let stale = auth
            .issue(&CallerContext::user(7), Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(auth.verify(&stale).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_token_lifetime_is_bounded() {
        let auth = authority(MAX_TOKEN_EXPIRATION);
        assert_eq!(auth.lifetime, chrono::TimeDelta::days(30));

        for secs in [MAX_TOKEN_EXPIRATION + 1, u64::MAX] {
            let err = TokenAuthority::new(&AuthConfig {
                token_expiration: secs,
                ..Default::default()
            });
            assert_eq!(err.err(), Some(AuthError::InvalidLifetime(secs)));
        }
    }

    #[test]
    fn test_disabled_auth_yields_admin() {
        let auth = TokenAuthority::new(&AuthConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        assert!(auth.authenticate(None).unwrap().is_admin());
    }
}
