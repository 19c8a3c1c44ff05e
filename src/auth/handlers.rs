use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    auth::{
        claims::TokenPair,
        dto::{
            AuthResponse, ChangePasswordRequest, ConfirmInvitationRequest, ForgotPasswordRequest,
            InvitationResponse, InviteRequest, LoginRequest, LogoutRequest, NewUser, ProfileEdit,
            PublicUser, RefreshRequest, ResendInvitationRequest, ResetPasswordRequest,
            SetActiveRequest, UserUpdate,
        },
        jwt::AuthUser,
    },
    error::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/change-password", post(change_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me).patch(edit_me))
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user))
        .route("/users/:id", patch(update_user))
        .route("/users/:id/active", post(set_active))
}

pub fn invitation_routes() -> Router<AppState> {
    Router::new()
        .route("/invitations", post(invite))
        .route("/invitations/resend", post(resend_invitation))
        .route("/invitations/confirm", post(confirm_invitation))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let outcome = state
        .auth
        .login(&payload.email, &payload.password, payload.device_token.as_deref())
        .await?;
    Ok(Json(AuthResponse {
        tokens: outcome.tokens,
        user: outcome.user,
    }))
}

/// Responds `null` when the refresh token is rejected.
#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<Option<TokenPair>>, AuthError> {
    Ok(Json(state.auth.refresh(&payload.refresh_token).await?))
}

#[instrument(skip(state, payload))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Option<Json<LogoutRequest>>,
) -> Result<StatusCode, AuthError> {
    let device_token = payload.and_then(|Json(p)| p.device_token);
    state.auth.logout(user_id, device_token.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<StatusCode, AuthError> {
    state.auth.forgot_password(&payload.email).await?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<StatusCode, AuthError> {
    state
        .auth
        .reset_password(&payload.token, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AuthError> {
    state
        .auth
        .change_password(user_id, &payload.current_password, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, AuthError> {
    Ok(Json(state.auth.current_user(user_id).await?))
}

#[instrument(skip(state, payload))]
pub async fn edit_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ProfileEdit>,
) -> Result<Json<PublicUser>, AuthError> {
    Ok(Json(state.auth.edit_profile(user_id, payload).await?))
}

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(payload): Json<NewUser>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    state.auth.require_owner(actor).await?;
    let user = state.auth.create_user(payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UserUpdate>,
) -> Result<Json<PublicUser>, AuthError> {
    state.auth.require_owner(actor).await?;
    Ok(Json(state.auth.update_user(id, payload).await?))
}

#[instrument(skip(state, payload))]
pub async fn set_active(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetActiveRequest>,
) -> Result<Json<PublicUser>, AuthError> {
    state.auth.require_owner(actor).await?;
    Ok(Json(state.auth.set_active(id, payload.active).await?))
}

#[instrument(skip(state, payload))]
pub async fn invite(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(payload): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InvitationResponse>), AuthError> {
    state.auth.require_owner(actor).await?;
    let token = state
        .auth
        .invite(&payload.email, &payload.password, payload.group_id)
        .await?;
    Ok((StatusCode::CREATED, Json(InvitationResponse { token })))
}

#[instrument(skip(state, payload))]
pub async fn resend_invitation(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(payload): Json<ResendInvitationRequest>,
) -> Result<Json<InvitationResponse>, AuthError> {
    state.auth.require_owner(actor).await?;
    let token = state.auth.resend_invitation(&payload.email).await?;
    Ok(Json(InvitationResponse { token }))
}

#[instrument(skip(state, payload))]
pub async fn confirm_invitation(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmInvitationRequest>,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state
        .auth
        .confirm_invitation(
            &payload.token,
            &payload.password,
            &payload.password_confirmation,
            payload.details,
        )
        .await?;
    Ok(Json(user))
}
