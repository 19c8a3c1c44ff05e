use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::claims::TokenPair;
use super::repo_types::User;

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub device_token: Option<String>,
}

/// Request body for token refresh.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub device_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

/// Optional profile fields; `None` leaves the stored value as is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileDetails {
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub position: Option<String>,
}

/// Self-service profile edit. Never touches the password.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileEdit {
    pub email: Option<String>,
    #[serde(flatten)]
    pub details: ProfileDetails,
}

/// Administrative user update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    #[serde(flatten)]
    pub details: ProfileDetails,
    pub password: Option<String>,
    pub group_ids: Option<Vec<Uuid>>,
}

impl From<ProfileEdit> for UserUpdate {
    fn from(edit: ProfileEdit) -> Self {
        Self {
            email: edit.email,
            details: edit.details,
            password: None,
            group_ids: None,
        }
    }
}

/// Request body for direct user creation.
#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub group_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_owner: bool,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub email: String,
    pub password: String,
    pub group_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ResendInvitationRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmInvitationRequest {
    pub token: String,
    pub password: String,
    pub password_confirmation: String,
    #[serde(flatten)]
    pub details: ProfileDetails,
}

#[derive(Debug, Serialize)]
pub struct InvitationResponse {
    pub token: String,
}

/// Response returned after login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: PublicUser,
}

/// Public part of the user returned to the client.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub position: Option<String>,
    pub group_ids: Vec<Uuid>,
    pub is_active: bool,
    pub is_owner: bool,
}

impl From<&User> for PublicUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            username: u.username.clone(),
            full_name: u.full_name.clone(),
            position: u.position.clone(),
            group_ids: u.group_ids.clone(),
            is_active: u.is_active,
            is_owner: u.is_owner,
        }
    }
}
