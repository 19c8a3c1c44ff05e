use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::{ProfileDetails, PublicUser},
    password::{hash_password, is_valid_email, normalize_email},
    repo::edit,
    repo_types::User,
    services::{apply_details, AuthService},
    tokens,
};
use crate::{error::AuthError, mail::MailMessage};

impl AuthService {
    /// Creates a pending user in `group_id` and mails a registration link.
    /// Returns the registration token.
    #[instrument(skip(self, password))]
    pub async fn invite(
        &self,
        email: &str,
        password: &str,
        group_id: Uuid,
    ) -> Result<String, AuthError> {
        let email = email.trim();
        if !is_valid_email(email) {
            warn!("invalid email");
            return Err(AuthError::MalformedEmail);
        }
        self.ensure_group(group_id).await?;
        if self.users.find_by_email(&normalize_email(email)).await?.is_some() {
            warn!("email already registered");
            return Err(AuthError::DuplicatedEmail);
        }

        let mut user = User::new(email, hash_password(password)?);
        let token = tokens::generate();
        user.group_ids = vec![group_id];
        user.registration_token = Some(token.clone());
        user.registration_token_expires = Some(tokens::expiry_after(
            OffsetDateTime::now_utc(),
            self.registration_ttl(),
        ));
        self.users.insert(&user).await?;

        self.notify(MailMessage::invitation(&user.email, &self.config.frontend_url, &token))
            .await;
        info!(user_id = %user.id, %group_id, "user invited");
        Ok(token)
    }

    #[instrument(skip(self))]
    pub async fn resend_invitation(&self, email: &str) -> Result<String, AuthError> {
        let user = self
            .users
            .find_by_email(&normalize_email(email))
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let token = tokens::generate();
        let stored = token.clone();
        let expires = tokens::expiry_after(OffsetDateTime::now_utc(), self.registration_ttl());
        let user = self
            .users
            .modify(
                user.id,
                edit(move |user| {
                    if user.registration_token.is_none() {
                        return Err(AuthError::InvalidRequest);
                    }
                    user.registration_token = Some(stored);
                    user.registration_token_expires = Some(expires);
                    Ok(())
                }),
            )
            .await
            .map_err(|e| {
                if matches!(e, AuthError::InvalidRequest) {
                    warn!(user_id = %user.id, "invitation already confirmed");
                }
                e
            })?;

        self.notify(MailMessage::invitation(&user.email, &self.config.frontend_url, &token))
            .await;
        info!(user_id = %user.id, "invitation resent");
        Ok(token)
    }

    #[instrument(skip_all)]
    pub async fn confirm_invitation(
        &self,
        token: &str,
        password: &str,
        password_confirmation: &str,
        details: ProfileDetails,
    ) -> Result<PublicUser, AuthError> {
        let now = OffsetDateTime::now_utc();
        let found = if token.is_empty() {
            None
        } else {
            self.users.find_by_registration_token(token).await?
        };
        let Some(user) = found.filter(|u| tokens::is_live(u.registration_token_expires, now)) else {
            warn!("registration token invalid or expired");
            return Err(AuthError::TokenInvalidOrExpired);
        };

        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        if password != password_confirmation {
            return Err(AuthError::PasswordMismatch);
        }

        let password_hash = hash_password(password)?;
        let user = self
            .users
            .modify(
                user.id,
                edit(move |user| {
                    // Consumed or replaced since the lookup.
                    if user.registration_token.as_deref() != Some(token)
                        || !tokens::is_live(user.registration_token_expires, now)
                    {
                        return Err(AuthError::TokenInvalidOrExpired);
                    }
                    user.password_hash = password_hash;
                    apply_details(user, details);
                    user.registration_token = None;
                    user.registration_token_expires = None;
                    Ok(())
                }),
            )
            .await?;

        info!(user_id = %user.id, "invitation confirmed");
        Ok(PublicUser::from(&user))
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::auth::repo::UserStore;
    use crate::mail::RecordingMailer;
    use crate::state::{AppState, FakeState};

    async fn setup() -> (FakeState, Uuid) {
        let fake = AppState::fake();
        let group = fake.store.add_group("Sales").await;
        (fake, group.id)
    }

    #[tokio::test]
    async fn invite_creates_pending_user_and_mails_token() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;

        let token = auth.invite("New@Example.com", "Initial1", group_id).await.unwrap();

        let user = fake.store.find_by_email("new@example.com").await.unwrap().unwrap();
        assert_eq!(user.registration_token.as_deref(), Some(token.as_str()));
        assert_eq!(user.group_ids, vec![group_id]);
        assert_ne!(user.password_hash, "Initial1");
        let expires = user.registration_token_expires.unwrap();
        let ttl = expires - OffsetDateTime::now_utc();
        assert!(ttl > Duration::days(6) && ttl <= Duration::days(7));

        let sent = fake.mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "New@Example.com");
        assert!(sent[0].body.contains(&token));
    }

    #[tokio::test]
    async fn invite_rejects_unknown_group() {
        let (fake, _) = setup().await;
        let err = fake
            .state
            .auth
            .invite("a@example.com", "Initial1", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGroup));
    }

    #[tokio::test]
    async fn invite_rejects_taken_email_case_insensitively() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        auth.invite("dup@example.com", "Initial1", group_id).await.unwrap();
        let err = auth.invite("DUP@example.com", "Initial1", group_id).await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicatedEmail));
    }

    #[tokio::test]
    async fn invite_rejects_malformed_email_and_empty_password() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        assert!(matches!(
            auth.invite("not-an-email", "Initial1", group_id).await,
            Err(AuthError::MalformedEmail)
        ));
        assert!(matches!(
            auth.invite("ok@example.com", "", group_id).await,
            Err(AuthError::EmptyPassword)
        ));
    }

    #[tokio::test]
    async fn invite_succeeds_when_mail_delivery_fails() {
        let fake = AppState::fake_with_mailer(RecordingMailer::failing());
        let group = fake.store.add_group("Ops").await;
        let token = fake.state.auth.invite("m@example.com", "Initial1", group.id).await;
        assert!(token.is_ok());
    }

    #[tokio::test]
    async fn resend_replaces_token() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        let first = auth.invite("r@example.com", "Initial1", group_id).await.unwrap();
        let second = auth.resend_invitation("R@example.com").await.unwrap();
        assert_ne!(first, second);

        let err = auth
            .confirm_invitation(&first, "Secret123", "Secret123", ProfileDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalidOrExpired));
        auth.confirm_invitation(&second, "Secret123", "Secret123", ProfileDetails::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resend_fails_for_confirmed_or_unknown_user() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        let token = auth.invite("c@example.com", "Initial1", group_id).await.unwrap();
        auth.confirm_invitation(&token, "Secret123", "Secret123", ProfileDetails::default())
            .await
            .unwrap();

        assert!(matches!(
            auth.resend_invitation("c@example.com").await,
            Err(AuthError::InvalidRequest)
        ));
        assert!(matches!(
            auth.resend_invitation("nobody@example.com").await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn confirm_sets_password_profile_and_clears_token() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        let token = auth.invite("p@example.com", "Initial1", group_id).await.unwrap();

        let details = ProfileDetails {
            username: Some("pat".into()),
            full_name: Some("Pat Doe".into()),
            position: None,
        };
        let user = auth
            .confirm_invitation(&token, "Chosen123", "Chosen123", details)
            .await
            .unwrap();
        assert_eq!(user.username.as_deref(), Some("pat"));
        assert_eq!(user.full_name.as_deref(), Some("Pat Doe"));

        let stored = fake.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.registration_token.is_none());
        assert!(stored.registration_token_expires.is_none());
        assert!(auth.login("p@example.com", "Chosen123", None).await.is_ok());
        assert!(matches!(
            auth.login("p@example.com", "Initial1", None).await,
            Err(AuthError::InvalidLogin)
        ));
    }

    #[tokio::test]
    async fn confirm_with_expired_token_fails_even_with_valid_credentials() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        let token = auth.invite("x@example.com", "Initial1", group_id).await.unwrap();

        let user = fake.store.find_by_email("x@example.com").await.unwrap().unwrap();
        fake.store
            .modify(
                user.id,
                edit(|u| {
                    u.registration_token_expires =
                        Some(OffsetDateTime::now_utc() - Duration::minutes(1));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let err = auth
            .confirm_invitation(&token, "Secret123", "Secret123", ProfileDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalidOrExpired));
    }

    #[tokio::test]
    async fn confirm_validates_token_then_password() {
        let (fake, group_id) = setup().await;
        let auth = &fake.state.auth;
        let token = auth.invite("v@example.com", "Initial1", group_id).await.unwrap();

        assert!(matches!(
            auth.confirm_invitation("unknown", "Secret123", "Secret123", ProfileDetails::default())
                .await,
            Err(AuthError::TokenInvalidOrExpired)
        ));
        assert!(matches!(
            auth.confirm_invitation("", "Secret123", "Secret123", ProfileDetails::default())
                .await,
            Err(AuthError::TokenInvalidOrExpired)
        ));
        assert!(matches!(
            auth.confirm_invitation(&token, "", "", ProfileDetails::default()).await,
            Err(AuthError::EmptyPassword)
        ));
        assert!(matches!(
            auth.confirm_invitation(&token, "Secret123", "Secret124", ProfileDetails::default())
                .await,
            Err(AuthError::PasswordMismatch)
        ));
    }
}
