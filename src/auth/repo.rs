use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::auth::repo_types::{Group, User};
use crate::error::{AuthError, StoreError};

const EMAIL_KEY_INDEX: &str = "users_email_key_idx";

const USER_COLUMNS: &str = r#"
    id, email, email_key, password_hash, username, full_name, position,
    device_tokens, group_ids, registration_token, registration_token_expires,
    reset_password_token, reset_password_expires, is_active, is_owner, created_at
"#;

/// Change applied to a freshly read user while the store holds the row.
/// An `Err` aborts the write and is returned to the caller unchanged.
pub type UserEdit<'a> = Box<dyn FnOnce(&mut User) -> Result<(), AuthError> + Send + 'a>;

pub fn edit<'a, F>(f: F) -> UserEdit<'a>
where
    F: FnOnce(&mut User) -> Result<(), AuthError> + Send + 'a,
{
    Box::new(f)
}

/// Persistence boundary for user records.
///
/// Writes that would give two users the same `email_key` fail with
/// `StoreError::DuplicateEmail`; backends enforce this atomically.
/// `modify` and `set_active` read and write as one step, so concurrent
/// callers never overwrite each other with stale rows.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_by_email(&self, email_key: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_registration_token(&self, token: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_reset_token(&self, token: &str) -> Result<Option<User>, StoreError>;
    async fn insert(&self, user: &User) -> Result<(), StoreError>;
    /// Applies `change` to the current row. `UserNotFound` for an unknown id.
    async fn modify(&self, id: Uuid, change: UserEdit<'_>) -> Result<User, AuthError>;
    /// Deactivating the last active owner fails with `CannotDeactivateOwner`.
    async fn set_active(&self, id: Uuid, active: bool) -> Result<User, AuthError>;
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Adds the device token unless already present. Returns false for an unknown user.
    async fn add_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError>;
    async fn remove_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError>;
    async fn find_group(&self, id: Uuid) -> Result<Option<Group>, StoreError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }
}

fn map_write_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() && db_err.constraint() == Some(EMAIL_KEY_INDEX) {
            return StoreError::DuplicateEmail;
        }
    }
    StoreError::Db(e)
}

async fn lock_user(conn: &mut PgConnection, id: Uuid) -> Result<User, AuthError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, User>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(StoreError::from)?
        .ok_or(AuthError::UserNotFound)
}

async fn write_user(conn: &mut PgConnection, user: &User) -> Result<(), StoreError> {
    // device_tokens is owned by add/remove_device_token and left alone here.
    sqlx::query(
        r#"
        UPDATE users
           SET email = $2, email_key = $3, password_hash = $4, username = $5,
               full_name = $6, position = $7, group_ids = $8,
               registration_token = $9, registration_token_expires = $10,
               reset_password_token = $11, reset_password_expires = $12,
               is_active = $13, is_owner = $14
         WHERE id = $1
        "#,
    )
    .bind(user.id)
    .bind(&user.email)
    .bind(&user.email_key)
    .bind(&user.password_hash)
    .bind(&user.username)
    .bind(&user.full_name)
    .bind(&user.position)
    .bind(&user.group_ids)
    .bind(&user.registration_token)
    .bind(user.registration_token_expires)
    .bind(&user.reset_password_token)
    .bind(user.reset_password_expires)
    .bind(user.is_active)
    .bind(user.is_owner)
    .execute(conn)
    .await
    .map_err(map_write_err)?;
    Ok(())
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email_key: &str) -> Result<Option<User>, StoreError> {
        self.find_one("email_key", email_key).await
    }

    async fn find_by_registration_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        self.find_one("registration_token", token).await
    }

    async fn find_by_reset_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        self.find_one("reset_password_token", token).await
    }

    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, email_key, password_hash, username, full_name, position,
                device_tokens, group_ids, registration_token, registration_token_expires,
                reset_password_token, reset_password_expires, is_active, is_owner, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.email_key)
        .bind(&user.password_hash)
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(&user.position)
        .bind(&user.device_tokens)
        .bind(&user.group_ids)
        .bind(&user.registration_token)
        .bind(user.registration_token_expires)
        .bind(&user.reset_password_token)
        .bind(user.reset_password_expires)
        .bind(user.is_active)
        .bind(user.is_owner)
        .bind(user.created_at)
        .execute(&self.db)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    async fn modify(&self, id: Uuid, change: UserEdit<'_>) -> Result<User, AuthError> {
        let mut tx = self.db.begin().await.map_err(StoreError::from)?;
        let mut user = lock_user(&mut *tx, id).await?;
        change(&mut user)?;
        write_user(&mut *tx, &user).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(user)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<User, AuthError> {
        let mut tx = self.db.begin().await.map_err(StoreError::from)?;
        // Active owner rows are locked in id order before the target, so two
        // deactivations of different owners serialize and the second sees the first.
        let owners: Vec<Uuid> = if active {
            Vec::new()
        } else {
            sqlx::query_scalar(
                "SELECT id FROM users WHERE is_owner AND is_active ORDER BY id FOR UPDATE",
            )
            .fetch_all(&mut *tx)
            .await
            .map_err(StoreError::from)?
        };
        let mut user = lock_user(&mut *tx, id).await?;
        if !active && user.is_owner && user.is_active && owners.len() <= 1 {
            warn!(user_id = %id, "refusing to deactivate sole owner");
            return Err(AuthError::CannotDeactivateOwner);
        }

        sqlx::query("UPDATE users SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;
        user.is_active = active;
        Ok(user)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn add_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET device_tokens = CASE
                       WHEN $2 = ANY(device_tokens) THEN device_tokens
                       ELSE array_append(device_tokens, $2)
                   END
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn remove_device_token(&self, id: Uuid, token: &str) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE users SET device_tokens = array_remove(device_tokens, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn find_group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        let group = sqlx::query_as::<_, Group>("SELECT id, name FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(group)
    }
}
