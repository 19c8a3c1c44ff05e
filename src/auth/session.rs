use lazy_static::lazy_static;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    claims::TokenPair,
    dto::{NewUser, ProfileEdit, PublicUser, UserUpdate},
    password::{check_strength, hash_password, is_valid_email, normalize_email, verify_password},
    repo::edit,
    repo_types::User,
    services::{apply_details, AuthService},
    tokens,
};
use crate::{error::AuthError, mail::MailMessage};

lazy_static! {
    // Verified against for unknown emails so both login failures cost one argon2 run.
    static ref DUMMY_HASH: String = hash_password("timing-equalizer-Pw1").unwrap_or_default();
}

/// Successful login: a fresh token pair plus the public user.
#[derive(Debug)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: PublicUser,
}

impl AuthService {
    /// Unauthenticated -> Validated (credentials match an active user) ->
    /// Authenticated (tokens issued). Every rejection is `InvalidLogin`.
    #[instrument(skip(self, password, device_token))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        device_token: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        let Some(user) = self.users.find_by_email(&normalize_email(email)).await? else {
            verify_password(password, &DUMMY_HASH);
            warn!("login unknown email");
            return Err(AuthError::InvalidLogin);
        };
        if !verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidLogin);
        }
        if !user.is_active {
            warn!(user_id = %user.id, "login on deactivated user");
            return Err(AuthError::InvalidLogin);
        }

        if let Some(device_token) = device_token.filter(|t| !t.is_empty()) {
            self.users.add_device_token(user.id, device_token).await?;
        }
        let tokens = self.keys.issue_pair(user.id)?;

        info!(user_id = %user.id, "user logged in");
        Ok(LoginOutcome {
            tokens,
            user: PublicUser::from(&user),
        })
    }

    /// Rotates a refresh token. `None` for bad or expired tokens, and for
    /// subjects that no longer exist or were deactivated.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<Option<TokenPair>, AuthError> {
        let Some((user_id, pair)) = self.keys.refresh(refresh_token) else {
            return Ok(None);
        };
        match self.users.find_by_id(user_id).await? {
            Some(user) if user.is_active => Ok(Some(pair)),
            _ => {
                warn!(%user_id, "refresh for missing or inactive user");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn logout(&self, user_id: Uuid, device_token: Option<&str>) -> Result<(), AuthError> {
        let user = self.user(user_id).await?;
        if let Some(device_token) = device_token {
            self.users.remove_device_token(user.id, device_token).await?;
        }
        info!(%user_id, "user logged out");
        Ok(())
    }

    /// The sole-owner check and the write happen in one store step.
    #[instrument(skip(self))]
    pub async fn set_active(&self, user_id: Uuid, active: bool) -> Result<PublicUser, AuthError> {
        let user = match self.users.set_active(user_id, active).await {
            Err(AuthError::CannotDeactivateOwner) => {
                warn!(%user_id, "refusing to deactivate sole owner");
                return Err(AuthError::CannotDeactivateOwner);
            }
            other => other?,
        };
        info!(%user_id, active, "user activation changed");
        Ok(PublicUser::from(&user))
    }

    #[instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self.user(user_id).await?;
        if !verify_password(current_password, &user.password_hash) {
            warn!(%user_id, "incorrect current password");
            return Err(AuthError::IncorrectCurrentPassword);
        }
        if new_password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        check_strength(new_password)?;

        let verified_hash = user.password_hash;
        let password_hash = hash_password(new_password)?;
        self.users
            .modify(
                user_id,
                edit(move |user| {
                    // Changed by someone else since it was verified.
                    if user.password_hash != verified_hash {
                        return Err(AuthError::IncorrectCurrentPassword);
                    }
                    user.password_hash = password_hash;
                    Ok(())
                }),
            )
            .await?;
        info!(%user_id, "password changed");
        Ok(())
    }

    /// Stores a reset token and mails it. The token is never returned.
    #[instrument(skip(self))]
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        let user = self
            .users
            .find_by_email(&normalize_email(email))
            .await?
            .ok_or_else(|| {
                warn!("password reset for unknown email");
                AuthError::InvalidEmail
            })?;

        let token = tokens::generate();
        let stored = token.clone();
        let expires = tokens::expiry_after(OffsetDateTime::now_utc(), self.reset_ttl());
        let user = self
            .users
            .modify(
                user.id,
                edit(move |user| {
                    user.reset_password_token = Some(stored);
                    user.reset_password_expires = Some(expires);
                    Ok(())
                }),
            )
            .await
            .map_err(|e| match e {
                AuthError::UserNotFound => AuthError::InvalidEmail,
                e => e,
            })?;

        self.notify(MailMessage::password_reset(&user.email, &self.config.frontend_url, &token))
            .await;
        info!(user_id = %user.id, "password reset requested");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let found = if token.is_empty() {
            None
        } else {
            self.users.find_by_reset_token(token).await?
        };
        let Some(user) = found.filter(|u| tokens::is_live(u.reset_password_expires, now)) else {
            warn!("reset token invalid or expired");
            return Err(AuthError::TokenInvalidOrExpired);
        };
        if new_password.is_empty() {
            return Err(AuthError::PasswordRequired);
        }

        let password_hash = hash_password(new_password)?;
        self.users
            .modify(
                user.id,
                edit(move |user| {
                    // Consumed or replaced since the lookup.
                    if user.reset_password_token.as_deref() != Some(token)
                        || !tokens::is_live(user.reset_password_expires, now)
                    {
                        return Err(AuthError::TokenInvalidOrExpired);
                    }
                    user.password_hash = password_hash;
                    user.reset_password_token = None;
                    user.reset_password_expires = None;
                    Ok(())
                }),
            )
            .await?;
        info!(user_id = %user.id, "password reset");
        Ok(())
    }

    #[instrument(skip(self, profile))]
    pub async fn edit_profile(&self, user_id: Uuid, profile: ProfileEdit) -> Result<PublicUser, AuthError> {
        self.apply_update(user_id, profile.into()).await
    }

    #[instrument(skip(self, update))]
    pub async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<PublicUser, AuthError> {
        self.apply_update(user_id, update).await
    }

    #[instrument(skip(self, new_user), fields(email = %new_user.email))]
    pub async fn create_user(&self, new_user: NewUser) -> Result<PublicUser, AuthError> {
        let email = new_user.email.trim();
        if !is_valid_email(email) {
            return Err(AuthError::MalformedEmail);
        }
        if new_user.password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        check_strength(&new_user.password)?;
        for group_id in &new_user.group_ids {
            self.ensure_group(*group_id).await?;
        }

        let mut user = User::new(email, hash_password(&new_user.password)?);
        user.group_ids = new_user.group_ids;
        user.is_owner = new_user.is_owner;
        self.users.insert(&user).await?;
        info!(user_id = %user.id, "user created");
        Ok(PublicUser::from(&user))
    }

    /// Creates the configured owner unless its email is already registered.
    #[instrument(skip(self, password))]
    pub async fn seed_owner(&self, email: &str, password: &str) -> Result<(), AuthError> {
        if self.users.find_by_email(&normalize_email(email)).await?.is_some() {
            info!("owner account already present");
            return Ok(());
        }
        let owner = self
            .create_user(NewUser {
                email: email.to_string(),
                password: password.to_string(),
                group_ids: vec![],
                is_owner: true,
            })
            .await?;
        info!(user_id = %owner.id, "owner account seeded");
        Ok(())
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<PublicUser, AuthError> {
        Ok(PublicUser::from(&self.user(user_id).await?))
    }

    async fn apply_update(&self, user_id: Uuid, update: UserUpdate) -> Result<PublicUser, AuthError> {
        self.user(user_id).await?;
        let UserUpdate {
            email,
            details,
            password,
            group_ids,
        } = update;

        // Stored addresses are always well formed, so any malformed one is a change.
        if let Some(email) = email.as_deref() {
            if !is_valid_email(email.trim()) {
                return Err(AuthError::MalformedEmail);
            }
        }
        let password_hash = match password.as_deref() {
            Some("") => return Err(AuthError::EmptyPassword),
            Some(password) => {
                check_strength(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };
        if let Some(group_ids) = &group_ids {
            for group_id in group_ids {
                self.ensure_group(*group_id).await?;
            }
        }

        // The email_key index rejects a change onto another user's address.
        let user = self
            .users
            .modify(
                user_id,
                edit(move |user| {
                    if let Some(email) = email.as_deref() {
                        if email.trim() != user.email {
                            user.set_email(email);
                        }
                    }
                    apply_details(user, details);
                    if let Some(password_hash) = password_hash {
                        user.password_hash = password_hash;
                    }
                    if let Some(group_ids) = group_ids {
                        user.group_ids = group_ids;
                    }
                    Ok(())
                }),
            )
            .await?;
        info!(%user_id, "user updated");
        Ok(PublicUser::from(&user))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use time::Duration;
    use tokio::task::yield_now;

    use super::*;
    use crate::auth::{
        dto::ProfileDetails,
        memory::InMemoryUserStore,
        repo::{UserEdit, UserStore},
        repo_types::Group,
    };
    use crate::error::StoreError;
    use crate::mail::RecordingMailer;
    use crate::state::{AppState, FakeState};

    const PASSWORD: &str = "Secret123";

    async fn with_user(email: &str) -> (FakeState, PublicUser) {
        let fake = AppState::fake();
        let user = fake
            .state
            .auth
            .create_user(NewUser {
                email: email.into(),
                password: PASSWORD.into(),
                group_ids: vec![],
                is_owner: false,
            })
            .await
            .unwrap();
        (fake, user)
    }

    #[tokio::test]
    async fn login_is_case_insensitive_and_issues_pair() {
        let (fake, user) = with_user("Ann@Example.com").await;
        let auth = &fake.state.auth;
        let out = auth.login("  ANN@example.COM ", PASSWORD, None).await.unwrap();
        assert_eq!(out.user.id, user.id);
        let claims = auth.keys().verify(&out.tokens.access_token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert!(auth.keys().verify_refresh(&out.tokens.refresh_token).is_ok());
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_fail_identically() {
        let (fake, _) = with_user("ann@example.com").await;
        let auth = &fake.state.auth;
        let wrong = auth.login("ann@example.com", "Wrong1234", None).await.unwrap_err();
        let unknown = auth.login("ghost@example.com", PASSWORD, None).await.unwrap_err();
        assert!(matches!(wrong, AuthError::InvalidLogin));
        assert!(matches!(unknown, AuthError::InvalidLogin));
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert_eq!(wrong.status(), unknown.status());
    }

    #[tokio::test]
    async fn deactivated_user_cannot_login() {
        let (fake, user) = with_user("off@example.com").await;
        let auth = &fake.state.auth;
        auth.set_active(user.id, false).await.unwrap();
        assert!(matches!(
            auth.login("off@example.com", PASSWORD, None).await,
            Err(AuthError::InvalidLogin)
        ));
    }

    #[tokio::test]
    async fn login_device_token_is_idempotent() {
        let (fake, user) = with_user("dev@example.com").await;
        let auth = &fake.state.auth;
        auth.login("dev@example.com", PASSWORD, Some("ios-1")).await.unwrap();
        auth.login("dev@example.com", PASSWORD, Some("ios-1")).await.unwrap();
        auth.login("dev@example.com", PASSWORD, Some("android-7")).await.unwrap();
        auth.login("dev@example.com", PASSWORD, Some("")).await.unwrap();
        let stored = fake.store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.device_tokens, vec!["ios-1", "android-7"]);

        auth.logout(user.id, Some("ios-1")).await.unwrap();
        let stored = fake.store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.device_tokens, vec!["android-7"]);
    }

    #[tokio::test]
    async fn logout_unknown_user_fails() {
        let fake = AppState::fake();
        assert!(matches!(
            fake.state.auth.logout(Uuid::new_v4(), None).await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_bad_tokens() {
        let (fake, user) = with_user("ref@example.com").await;
        let auth = &fake.state.auth;
        let out = auth.login("ref@example.com", PASSWORD, None).await.unwrap();

        let pair = auth.refresh(&out.tokens.refresh_token).await.unwrap().unwrap();
        assert_eq!(auth.keys().verify(&pair.access_token).unwrap().sub, user.id);

        let mut tampered = out.tokens.refresh_token.clone();
        tampered.replace_range(tampered.len() - 4.., "AAAA");
        assert!(auth.refresh(&tampered).await.unwrap().is_none());
        assert!(auth.refresh(&out.tokens.access_token).await.unwrap().is_none());
        assert!(auth.refresh("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_for_deactivated_user_is_none() {
        let (fake, user) = with_user("gone@example.com").await;
        let auth = &fake.state.auth;
        let out = auth.login("gone@example.com", PASSWORD, None).await.unwrap();
        auth.set_active(user.id, false).await.unwrap();
        assert!(auth.refresh(&out.tokens.refresh_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_on_create_is_rejected() {
        let (fake, _) = with_user("Same@Example.com").await;
        let err = fake
            .state
            .auth
            .create_user(NewUser {
                email: "same@example.COM".into(),
                password: PASSWORD.into(),
                group_ids: vec![],
                is_owner: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicatedEmail));
    }

    #[tokio::test]
    async fn create_validates_input() {
        let fake = AppState::fake();
        let auth = &fake.state.auth;
        let new = |email: &str, password: &str, group_ids: Vec<Uuid>| NewUser {
            email: email.into(),
            password: password.into(),
            group_ids,
            is_owner: false,
        };
        assert!(matches!(
            auth.create_user(new("bad", PASSWORD, vec![])).await,
            Err(AuthError::MalformedEmail)
        ));
        assert!(matches!(
            auth.create_user(new("a@example.com", "", vec![])).await,
            Err(AuthError::EmptyPassword)
        ));
        assert!(matches!(
            auth.create_user(new("a@example.com", "weakpass", vec![])).await,
            Err(AuthError::WeakPassword)
        ));
        assert!(matches!(
            auth.create_user(new("a@example.com", PASSWORD, vec![Uuid::new_v4()])).await,
            Err(AuthError::InvalidGroup)
        ));
    }

    #[tokio::test]
    async fn sole_owner_cannot_be_deactivated() {
        let fake = AppState::fake();
        let auth = &fake.state.auth;
        let owner = auth
            .create_user(NewUser {
                email: "owner@example.com".into(),
                password: PASSWORD.into(),
                group_ids: vec![],
                is_owner: true,
            })
            .await
            .unwrap();
        assert!(matches!(
            auth.set_active(owner.id, false).await,
            Err(AuthError::CannotDeactivateOwner)
        ));
        assert!(auth.set_active(owner.id, true).await.is_ok());

        let second = auth
            .create_user(NewUser {
                email: "owner2@example.com".into(),
                password: PASSWORD.into(),
                group_ids: vec![],
                is_owner: true,
            })
            .await
            .unwrap();
        let updated = auth.set_active(owner.id, false).await.unwrap();
        assert!(!updated.is_active);
        assert!(matches!(
            auth.set_active(second.id, false).await,
            Err(AuthError::CannotDeactivateOwner)
        ));
        assert!(matches!(
            auth.set_active(Uuid::new_v4(), true).await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn change_password_checks_current_and_strength() {
        let (fake, user) = with_user("cp@example.com").await;
        let auth = &fake.state.auth;
        assert!(matches!(
            auth.change_password(user.id, "Nope1234", "NewSecret1").await,
            Err(AuthError::IncorrectCurrentPassword)
        ));
        assert!(matches!(
            auth.change_password(user.id, PASSWORD, "").await,
            Err(AuthError::EmptyPassword)
        ));
        assert!(matches!(
            auth.change_password(user.id, PASSWORD, "short").await,
            Err(AuthError::WeakPassword)
        ));
        assert!(matches!(
            auth.change_password(Uuid::new_v4(), PASSWORD, "NewSecret1").await,
            Err(AuthError::UserNotFound)
        ));

        auth.change_password(user.id, PASSWORD, "NewSecret1").await.unwrap();
        assert!(auth.login("cp@example.com", "NewSecret1", None).await.is_ok());
        assert!(auth.login("cp@example.com", PASSWORD, None).await.is_err());
    }

    #[tokio::test]
    async fn forgot_password_mails_token_without_returning_it() {
        let (fake, user) = with_user("fp@example.com").await;
        let auth = &fake.state.auth;
        auth.forgot_password("FP@example.com").await.unwrap();

        let stored = fake.store.find_by_id(user.id).await.unwrap().unwrap();
        let token = stored.reset_password_token.expect("token stored");
        assert!(stored.reset_password_expires.unwrap() > OffsetDateTime::now_utc());
        let sent = fake.mailer.sent.lock().await;
        assert!(sent[0].body.contains(&token));

        assert!(matches!(
            auth.forgot_password("nobody@example.com").await,
            Err(AuthError::InvalidEmail)
        ));
    }

    #[tokio::test]
    async fn forgot_password_overwrites_previous_token() {
        let (fake, user) = with_user("ow@example.com").await;
        let auth = &fake.state.auth;
        auth.forgot_password("ow@example.com").await.unwrap();
        let first = fake.store.find_by_id(user.id).await.unwrap().unwrap().reset_password_token;
        auth.forgot_password("ow@example.com").await.unwrap();
        let second = fake.store.find_by_id(user.id).await.unwrap().unwrap().reset_password_token;
        assert_ne!(first, second);
        assert!(matches!(
            auth.reset_password(&first.unwrap(), "Another1").await,
            Err(AuthError::TokenInvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn reset_password_token_cannot_be_reused() {
        let (fake, user) = with_user("rp@example.com").await;
        let auth = &fake.state.auth;
        auth.forgot_password("rp@example.com").await.unwrap();
        let token = fake
            .store
            .find_by_id(user.id)
            .await
            .unwrap()
            .unwrap()
            .reset_password_token
            .unwrap();

        assert!(matches!(
            auth.reset_password(&token, "").await,
            Err(AuthError::PasswordRequired)
        ));
        auth.reset_password(&token, "Fresh1234").await.unwrap();
        let stored = fake.store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.reset_password_token.is_none());
        assert!(stored.reset_password_expires.is_none());
        assert!(auth.login("rp@example.com", "Fresh1234", None).await.is_ok());

        assert!(matches!(
            auth.reset_password(&token, "Again1234").await,
            Err(AuthError::TokenInvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn expired_reset_token_is_rejected() {
        let (fake, user) = with_user("exp@example.com").await;
        let auth = &fake.state.auth;
        auth.forgot_password("exp@example.com").await.unwrap();
        let stored = fake
            .store
            .modify(
                user.id,
                edit(|u| {
                    u.reset_password_expires = Some(OffsetDateTime::now_utc() - Duration::seconds(5));
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let token = stored.reset_password_token.unwrap();

        assert!(matches!(
            auth.reset_password(&token, "Fresh1234").await,
            Err(AuthError::TokenInvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn edit_profile_merges_fields_and_keeps_password() {
        let (fake, user) = with_user("ed@example.com").await;
        let auth = &fake.state.auth;
        auth.edit_profile(
            user.id,
            ProfileEdit {
                email: None,
                details: ProfileDetails {
                    username: Some("ed".into()),
                    full_name: None,
                    position: Some("Growth lead".into()),
                },
            },
        )
        .await
        .unwrap();
        let updated = auth
            .edit_profile(
                user.id,
                ProfileEdit {
                    email: Some("Ed.New@example.com".into()),
                    details: ProfileDetails::default(),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.username.as_deref(), Some("ed"));
        assert_eq!(updated.position.as_deref(), Some("Growth lead"));
        assert_eq!(updated.email, "Ed.New@example.com");
        assert!(auth.login("ed.new@example.com", PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn email_change_onto_taken_address_is_rejected() {
        let (fake, user) = with_user("one@example.com").await;
        let auth = &fake.state.auth;
        auth.create_user(NewUser {
            email: "two@example.com".into(),
            password: PASSWORD.into(),
            group_ids: vec![],
            is_owner: false,
        })
        .await
        .unwrap();

        let err = auth
            .edit_profile(
                user.id,
                ProfileEdit {
                    email: Some("TWO@example.com".into()),
                    details: ProfileDetails::default(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DuplicatedEmail));
        assert!(matches!(
            auth.edit_profile(
                user.id,
                ProfileEdit {
                    email: Some("broken".into()),
                    details: ProfileDetails::default(),
                },
            )
            .await,
            Err(AuthError::MalformedEmail)
        ));
    }

    #[tokio::test]
    async fn update_user_optionally_sets_password_and_groups() {
        let (fake, user) = with_user("up@example.com").await;
        let auth = &fake.state.auth;
        let group = fake.store.add_group("Marketing").await;

        let updated = auth
            .update_user(
                user.id,
                UserUpdate {
                    group_ids: Some(vec![group.id]),
                    ..UserUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.group_ids, vec![group.id]);
        assert!(auth.login("up@example.com", PASSWORD, None).await.is_ok());

        assert!(matches!(
            auth.update_user(
                user.id,
                UserUpdate {
                    password: Some("weak".into()),
                    ..UserUpdate::default()
                },
            )
            .await,
            Err(AuthError::WeakPassword)
        ));
        assert!(matches!(
            auth.update_user(
                user.id,
                UserUpdate {
                    group_ids: Some(vec![Uuid::new_v4()]),
                    ..UserUpdate::default()
                },
            )
            .await,
            Err(AuthError::InvalidGroup)
        ));

        auth.update_user(
            user.id,
            UserUpdate {
                password: Some("Replaced1".into()),
                ..UserUpdate::default()
            },
        )
        .await
        .unwrap();
        assert!(auth.login("up@example.com", "Replaced1", None).await.is_ok());
    }

    /// Yields to the scheduler before every store call so concurrent
    /// operations interleave between their reads and writes.
    struct Interleaving(InMemoryUserStore);

    #[async_trait]
    impl UserStore for Interleaving {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
            yield_now().await;
            self.0.find_by_id(id).await
        }

        async fn find_by_email(&self, email_key: &str) -> Result<Option<User>, StoreError> {
            yield_now().await;
            self.0.find_by_email(email_key).await
        }

        async fn find_by_registration_token(&self, token: &str) -> Result<Option<User>, StoreError> {
            yield_now().await;
            self.0.find_by_registration_token(token).await
        }

        async fn find_by_reset_token(&self, token: &str) -> Result<Option<User>, StoreError> {
            yield_now().await;
            self.0.find_by_reset_token(token).await
        }

        async fn insert(&self, user: &User) -> Result<(), StoreError> {
            yield_now().await;
            self.0.insert(user).await
        }

        async fn modify(&self, id: Uuid, change: UserEdit<'_>) -> Result<User, AuthError> {
            yield_now().await;
            self.0.modify(id, change).await
        }

        async fn set_active(&self, id: Uuid, active: bool) -> Result<User, AuthError> {
            yield_now().await;
            self.0.set_active(id, active).await
        }

        async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
            yield_now().await;
            self.0.delete(id).await
        }

        async fn add_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError> {
            yield_now().await;
            self.0.add_device_token(id, token).await
        }

        async fn remove_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError> {
            yield_now().await;
            self.0.remove_device_token(id, token).await
        }

        async fn find_group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
            yield_now().await;
            self.0.find_group(id).await
        }
    }

    fn interleaving_service() -> (AuthService, Arc<Interleaving>) {
        let store = Arc::new(Interleaving(InMemoryUserStore::new()));
        let auth = AuthService::new(
            store.clone(),
            Arc::new(RecordingMailer::default()),
            Arc::new(AppState::test_config()),
        );
        (auth, store)
    }

    async fn create(auth: &AuthService, email: &str, is_owner: bool) -> PublicUser {
        auth.create_user(NewUser {
            email: email.into(),
            password: PASSWORD.into(),
            group_ids: vec![],
            is_owner,
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_owner_deactivations_keep_one_active_owner() {
        let (auth, store) = interleaving_service();
        let a = create(&auth, "owner-a@example.com", true).await.id;
        let b = create(&auth, "owner-b@example.com", true).await.id;

        let (ra, rb) = tokio::join!(
            tokio::spawn({
                let auth = auth.clone();
                async move { auth.set_active(a, false).await }
            }),
            tokio::spawn({
                let auth = auth.clone();
                async move { auth.set_active(b, false).await }
            }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AuthError::CannotDeactivateOwner))));

        let a_active = store.find_by_id(a).await.unwrap().unwrap().is_active;
        let b_active = store.find_by_id(b).await.unwrap().unwrap().is_active;
        assert!(a_active != b_active);
    }

    #[tokio::test]
    async fn deactivation_does_not_undo_a_concurrent_reset_request() {
        let (auth, store) = interleaving_service();
        let user = create(&auth, "both@example.com", false).await;

        let (forgot, deactivate) = tokio::join!(
            auth.forgot_password("both@example.com"),
            auth.set_active(user.id, false),
        );
        forgot.unwrap();
        deactivate.unwrap();

        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.reset_password_token.is_some());
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn reset_token_is_consumed_once_under_concurrency() {
        let (auth, store) = interleaving_service();
        let user = create(&auth, "race@example.com", false).await;
        auth.forgot_password("race@example.com").await.unwrap();
        let token = store
            .find_by_id(user.id)
            .await
            .unwrap()
            .unwrap()
            .reset_password_token
            .unwrap();

        let (first, second) = tokio::join!(
            auth.reset_password(&token, "FirstPw1"),
            auth.reset_password(&token, "SecondPw1"),
        );
        assert!(first.is_ok() != second.is_ok());
        let failed = if first.is_err() { first } else { second };
        assert!(matches!(failed, Err(AuthError::TokenInvalidOrExpired)));
    }

    #[tokio::test]
    async fn seed_owner_creates_once() {
        let fake = AppState::fake();
        let auth = &fake.state.auth;
        auth.seed_owner("Root@Example.com", PASSWORD).await.unwrap();
        auth.seed_owner("root@example.com", "Different1").await.unwrap();

        let root = fake.store.find_by_email("root@example.com").await.unwrap().unwrap();
        assert!(root.is_owner && root.is_active);
        assert!(auth.login("root@example.com", PASSWORD, None).await.is_ok());
        assert!(auth.require_owner(root.id).await.is_ok());
    }

    #[tokio::test]
    async fn current_user_reports_public_fields() {
        let (fake, user) = with_user("me@example.com").await;
        let me = fake.state.auth.current_user(user.id).await.unwrap();
        assert_eq!(me, user);
        assert!(matches!(
            fake.state.auth.current_user(Uuid::new_v4()).await,
            Err(AuthError::UserNotFound)
        ));
    }
}
