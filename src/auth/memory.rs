use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::repo::{UserEdit, UserStore};
use crate::auth::repo_types::{Group, User};
use crate::error::{AuthError, StoreError};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    by_email: HashMap<String, Uuid>,
    groups: HashMap<Uuid, Group>,
}

impl Inner {
    fn active_owners(&self) -> usize {
        self.users
            .values()
            .filter(|u| u.is_owner && u.is_active)
            .count()
    }
}

/// Process-local store. Every operation holds one lock, so the uniqueness
/// check and the write happen together.
#[derive(Default)]
pub struct InMemoryUserStore {
    inner: Mutex<Inner>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_group(&self, name: &str) -> Group {
        let group = Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.inner
            .lock()
            .await
            .groups
            .insert(group.id, group.clone());
        group
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email_key: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_email
            .get(email_key)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn find_by_registration_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.registration_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_by_reset_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.reset_password_token.as_deref() == Some(token))
            .cloned())
    }

    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.by_email.contains_key(&user.email_key) {
            return Err(StoreError::DuplicateEmail);
        }
        inner.by_email.insert(user.email_key.clone(), user.id);
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn modify(&self, id: Uuid, change: UserEdit<'_>) -> Result<User, AuthError> {
        let mut inner = self.inner.lock().await;
        let mut user = inner.users.get(&id).cloned().ok_or(AuthError::UserNotFound)?;
        let old_key = user.email_key.clone();
        change(&mut user)?;

        if old_key != user.email_key {
            if inner.by_email.contains_key(&user.email_key) {
                return Err(StoreError::DuplicateEmail.into());
            }
            inner.by_email.remove(&old_key);
            inner.by_email.insert(user.email_key.clone(), id);
        }
        inner.users.insert(id, user.clone());
        Ok(user)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<User, AuthError> {
        let mut inner = self.inner.lock().await;
        let sole_owner = inner.active_owners() <= 1;
        let user = inner.users.get_mut(&id).ok_or(AuthError::UserNotFound)?;
        if !active && user.is_owner && user.is_active && sole_owner {
            return Err(AuthError::CannotDeactivateOwner);
        }
        user.is_active = active;
        Ok(user.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.users.remove(&id) {
            Some(user) => {
                inner.by_email.remove(&user.email_key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(&id) else {
            return Ok(false);
        };
        if !user.device_tokens.iter().any(|t| t == token) {
            user.device_tokens.push(token.to_string());
        }
        Ok(true)
    }

    async fn remove_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(&id) else {
            return Ok(false);
        };
        user.device_tokens.retain(|t| t != token);
        Ok(true)
    }

    async fn find_group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        Ok(self.inner.lock().await.groups.get(&id).cloned())
    }
}
