//! `POST /auth/signup|login|refresh|logout|logout-all`, `GET /auth/me` (§6).

use axum::extract::State;
use axum::Json;
use tracing::info;

use crate::api::auth::{
    hash_password, issue_access_token, new_refresh_token, verify_password, AuthUser,
};
use crate::api::state::AppState;
use crate::api::types::{AuthResponse, LoginRequest, LogoutResponse, RefreshRequest, SignupRequest, UserResponse};
use crate::error::{CoreError, Result};

/// `POST /auth/signup` — every new account starts on the trial plan
/// (§3: `create_user_and_assign_trial`). Duplicate email is a 409, not a 400,
/// since the request is otherwise well-formed.
pub async fn signup(State(state): State<AppState>, Json(req): Json<SignupRequest>) -> Result<Json<AuthResponse>> {
    if req.email.trim().is_empty() || req.password.len() < 8 || req.name.trim().is_empty() {
        return Err(CoreError::Validation("email, name and an 8+ character password are required".to_string()));
    }
    if state.store.get_user_by_email(&req.email).await?.is_some() {
        return Err(CoreError::Conflict(format!("an account already exists for {}", req.email)));
    }

    let password_hash = hash_password(&req.password)?;
    let user = state.store.create_user_and_assign_trial(&req.email, &password_hash, &req.name).await?;
    info!(user_id = %user.id, "auth: signup");
    issue_auth_response(&state, &user).await
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Result<Json<AuthResponse>> {
    let user = state.store.get_user_by_email(&req.email).await?.ok_or(CoreError::InvalidCredentials)?;
    if !verify_password(&req.password, &user.password_hash) {
        return Err(CoreError::InvalidCredentials);
    }
    issue_auth_response(&state, &user).await
}

pub async fn refresh(State(state): State<AppState>, Json(req): Json<RefreshRequest>) -> Result<Json<AuthResponse>> {
    let stored = state
        .store
        .get_refresh_token(&req.refresh_token)
        .await?
        .ok_or_else(|| CoreError::InvalidToken("refresh token not found".to_string()))?;

    if stored.expires_at <= chrono::Utc::now() {
        state.store.delete_refresh_token(&req.refresh_token).await?;
        return Err(CoreError::InvalidToken("refresh token expired".to_string()));
    }

    let user = state
        .store
        .get_user_by_id(stored.user_id)
        .await?
        .ok_or_else(|| CoreError::Unauthorized("token subject no longer exists".to_string()))?;

    // Rotation (§8 law): the presented token is consumed unconditionally,
    // valid or not, before a replacement is issued.
    state.store.delete_refresh_token(&req.refresh_token).await?;
    issue_auth_response(&state, &user).await
}

pub async fn logout(State(state): State<AppState>, AuthUser(_user): AuthUser, Json(req): Json<RefreshRequest>) -> Result<Json<LogoutResponse>> {
    state.store.delete_refresh_token(&req.refresh_token).await?;
    Ok(Json(LogoutResponse { success: true }))
}

/// `POST /auth/logout-all` — revokes every refresh token and tunnel token the
/// user holds, not just the presented session (§4.5 `revoke_for_user`).
pub async fn logout_all(State(state): State<AppState>, AuthUser(user): AuthUser) -> Result<Json<LogoutResponse>> {
    state.store.delete_user_refresh_tokens(user.id).await?;
    state.token_broker.revoke_for_user(user.id).await?;
    Ok(Json(LogoutResponse { success: true }))
}

pub async fn me(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(UserResponse::from(&user))
}

async fn issue_auth_response(state: &AppState, user: &crate::domain::User) -> Result<Json<AuthResponse>> {
    let token = issue_access_token(user.id, &state.config.jwt_secret)?;
    let refresh = new_refresh_token(user.id);
    state.store.save_refresh_token(&refresh).await?;
    Ok(Json(AuthResponse { token, refresh_token: refresh.token, user: UserResponse::from(user) }))
}
