//! JWT-based authentication (§6): short-lived access tokens signed with
//! `config.jwt_secret`, opaque refresh tokens persisted as Store rows and
//! rotated on every `/auth/refresh` call (§8: the old refresh token must fail
//! validation once a new one has been issued). Relay-facing routes use a
//! separate static `X-Internal-Api-Key` check — there is no per-relay user to
//! resolve, so the JWT machinery doesn't apply there.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng as RandOsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::domain::{RefreshToken, User};
use crate::error::{CoreError, Result};

const ACCESS_TOKEN_TTL: Duration = Duration::minutes(15);
const REFRESH_TOKEN_TTL: Duration = Duration::days(30);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    iat: i64,
    exp: i64,
}

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CoreError::Internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    use argon2::Argon2;

    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

pub fn issue_access_token(user_id: Uuid, jwt_secret: &str) -> Result<String> {
    let now = Utc::now();
    let claims = Claims { sub: user_id, iat: now.timestamp(), exp: (now + ACCESS_TOKEN_TTL).timestamp() };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(jwt_secret.as_bytes()))
        .map_err(|e| CoreError::Internal(format!("jwt encode failed: {e}")))
}

fn decode_access_token(token: &str, jwt_secret: &str) -> Result<Uuid> {
    let data = decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret.as_bytes()), &Validation::default())
        .map_err(|e| CoreError::InvalidToken(e.to_string()))?;
    Ok(data.claims.sub)
}

fn generate_opaque_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    RandOsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_refresh_token(user_id: Uuid) -> RefreshToken {
    let now = Utc::now();
    RefreshToken { token: generate_opaque_refresh_token(), user_id, expires_at: now + REFRESH_TOKEN_TTL, created_at: now }
}

pub fn extract_bearer_token(raw: &str) -> Option<&str> {
    raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")).map(str::trim)
}

/// Resolves `Authorization: Bearer <jwt>` into the authenticated [`User`] for
/// any handler that takes `AuthUser` as an extractor. A missing/expired/
/// malformed token or a subject that no longer exists all surface as
/// `unauthorized` at the HTTP edge (§7).
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CoreError::Unauthorized("missing Authorization header".to_string()))?;

        let token = extract_bearer_token(raw)
            .ok_or_else(|| CoreError::Unauthorized("Authorization header must be a bearer token".to_string()))?;

        let user_id = decode_access_token(token, &state.config.jwt_secret)?;

        state
            .store
            .get_user_by_id(user_id)
            .await?
            .map(AuthUser)
            .ok_or_else(|| CoreError::Unauthorized("token subject no longer exists".to_string()))
    }
}

/// Same JWT used for the HTTP API, read from a query parameter instead of a
/// header (§4.8: WebSocket upgrade requests can't easily carry custom
/// headers from a browser client).
pub async fn resolve_ws_user(state: &AppState, token: &str) -> Result<User> {
    let user_id = decode_access_token(token, &state.config.jwt_secret)?;
    state
        .store
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| CoreError::Unauthorized("token subject no longer exists".to_string()))
}

/// Relay routes authenticate with a static key rather than a user identity
/// (§6: `X-Internal-Api-Key`).
pub fn ensure_internal_key_authorized(headers: &HeaderMap, expected: &str) -> Result<()> {
    let provided = headers.get("x-internal-api-key").and_then(|v| v.to_str().ok()).map(str::trim);
    match provided {
        Some(v) if v == expected => Ok(()),
        _ => Err(CoreError::Unauthorized("missing or invalid internal API key".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn access_token_round_trips_to_its_subject() {
        let user_id = Uuid::new_v4();
        let token = issue_access_token(user_id, "test-secret").unwrap();
        assert_eq!(decode_access_token(&token, "test-secret").unwrap(), user_id);
    }

    #[test]
    fn access_token_rejected_under_wrong_secret() {
        let token = issue_access_token(Uuid::new_v4(), "test-secret").unwrap();
        assert!(decode_access_token(&token, "other-secret").is_err());
    }

    #[test]
    fn bearer_prefix_stripped_case_insensitively() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("abc"), None);
    }

    #[test]
    fn refresh_token_expires_in_the_future() {
        let rt = new_refresh_token(Uuid::new_v4());
        assert!(rt.expires_at > Utc::now());
    }
}
