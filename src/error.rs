use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failures of the user store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("email already in use")]
    DuplicateEmail,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Domain failures surfaced to API callers. Messages are fixed and user-facing.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Password can not be empty")]
    EmptyPassword,
    #[error("Must contain at least one number and one uppercase and lowercase letter, and at least 8 or more characters")]
    WeakPassword,
    #[error("Password does not match")]
    PasswordMismatch,
    #[error("Password is required")]
    PasswordRequired,
    #[error("Invalid group")]
    InvalidGroup,
    #[error("Duplicated email")]
    DuplicatedEmail,
    #[error("Invalid request")]
    InvalidRequest,
    #[error("User not found")]
    UserNotFound,
    #[error("Token is invalid or has expired")]
    TokenInvalidOrExpired,
    #[error("Invalid login")]
    InvalidLogin,
    #[error("Can not deactivate owner")]
    CannotDeactivateOwner,
    #[error("Incorrect current password")]
    IncorrectCurrentPassword,
    #[error("Invalid email")]
    InvalidEmail,
    #[error("Invalid email format")]
    MalformedEmail,
    #[error("Not allowed")]
    Forbidden,
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => AuthError::DuplicatedEmail,
            StoreError::Db(e) => AuthError::Internal(e.into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyPassword => "EMPTY_PASSWORD",
            Self::WeakPassword => "WEAK_PASSWORD",
            Self::PasswordMismatch => "PASSWORD_MISMATCH",
            Self::PasswordRequired => "PASSWORD_REQUIRED",
            Self::InvalidGroup => "INVALID_GROUP",
            Self::DuplicatedEmail => "DUPLICATED_EMAIL",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::TokenInvalidOrExpired => "TOKEN_INVALID_OR_EXPIRED",
            Self::InvalidLogin => "INVALID_LOGIN",
            Self::CannotDeactivateOwner => "CANNOT_DEACTIVATE_OWNER",
            Self::IncorrectCurrentPassword => "INCORRECT_CURRENT_PASSWORD",
            Self::InvalidEmail => "INVALID_EMAIL",
            Self::MalformedEmail => "MALFORMED_EMAIL",
            Self::Forbidden => "FORBIDDEN",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::EmptyPassword
            | Self::WeakPassword
            | Self::PasswordMismatch
            | Self::PasswordRequired
            | Self::InvalidGroup
            | Self::InvalidRequest
            | Self::TokenInvalidOrExpired
            | Self::MalformedEmail => StatusCode::BAD_REQUEST,
            Self::InvalidLogin | Self::IncorrectCurrentPassword => StatusCode::UNAUTHORIZED,
            Self::CannotDeactivateOwner | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UserNotFound | Self::InvalidEmail => StatusCode::NOT_FOUND,
            Self::DuplicatedEmail => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!(error = %e, "internal error");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
