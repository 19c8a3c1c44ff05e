use std::sync::Arc;

use time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::{dto::ProfileDetails, jwt::JwtKeys, repo::UserStore, repo_types::User},
    config::AppConfig,
    error::AuthError,
    mail::{MailMessage, Mailer},
};

/// Account operations shared by the session and invitation flows.
///
/// Secrets and lifetimes come from the injected `AppConfig`.
#[derive(Clone)]
pub struct AuthService {
    pub(crate) users: Arc<dyn UserStore>,
    pub(crate) mailer: Arc<dyn Mailer>,
    pub(crate) keys: JwtKeys,
    pub(crate) config: Arc<AppConfig>,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, mailer: Arc<dyn Mailer>, config: Arc<AppConfig>) -> Self {
        Self {
            users,
            mailer,
            keys: JwtKeys::from_config(&config.jwt),
            config,
        }
    }

    pub fn keys(&self) -> &JwtKeys {
        &self.keys
    }

    pub(crate) async fn user(&self, id: Uuid) -> Result<User, AuthError> {
        self.users
            .find_by_id(id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    /// Admits the caller of an account-administration operation. Only active
    /// owners pass, so a deactivated owner's unexpired access token is refused.
    pub async fn require_owner(&self, actor_id: Uuid) -> Result<User, AuthError> {
        match self.users.find_by_id(actor_id).await? {
            Some(actor) if actor.is_owner && actor.is_active => Ok(actor),
            _ => {
                warn!(%actor_id, "account administration refused");
                Err(AuthError::Forbidden)
            }
        }
    }

    pub(crate) async fn ensure_group(&self, id: Uuid) -> Result<(), AuthError> {
        match self.users.find_group(id).await? {
            Some(_) => Ok(()),
            None => {
                warn!(group_id = %id, "unknown group");
                Err(AuthError::InvalidGroup)
            }
        }
    }

    pub(crate) async fn notify(&self, message: MailMessage) {
        let to = message.to.clone();
        if let Err(e) = self.mailer.send(message).await {
            warn!(error = %e, %to, "mail delivery failed");
        }
    }

    pub(crate) fn registration_ttl(&self) -> Duration {
        Duration::days(self.config.tokens.registration_ttl_days)
    }

    pub(crate) fn reset_ttl(&self) -> Duration {
        Duration::minutes(self.config.tokens.reset_ttl_minutes)
    }
}

pub(crate) fn apply_details(user: &mut User, details: ProfileDetails) {
    if let Some(v) = details.username {
        user.username = Some(v);
    }
    if let Some(v) = details.full_name {
        user.full_name = Some(v);
    }
    if let Some(v) = details.position {
        user.position = Some(v);
    }
}
