use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::password::normalize_email;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub email_key: String,            // lower-cased email, unique index
    #[serde(skip_serializing)]
    pub password_hash: String,        // Argon2 hash, not exposed in JSON
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub position: Option<String>,
    pub device_tokens: Vec<String>,
    pub group_ids: Vec<Uuid>,
    #[serde(skip_serializing)]
    pub registration_token: Option<String>,
    pub registration_token_expires: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub reset_password_token: Option<String>,
    pub reset_password_expires: Option<OffsetDateTime>,
    pub is_active: bool,
    pub is_owner: bool,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn new(email: &str, password_hash: String) -> Self {
        let email = email.trim().to_string();
        Self {
            id: Uuid::new_v4(),
            email_key: normalize_email(&email),
            email,
            password_hash,
            username: None,
            full_name: None,
            position: None,
            device_tokens: Vec::new(),
            group_ids: Vec::new(),
            registration_token: None,
            registration_token_expires: None,
            reset_password_token: None,
            reset_password_expires: None,
            is_active: true,
            is_owner: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn set_email(&mut self, email: &str) {
        self.email = email.trim().to_string();
        self.email_key = normalize_email(email);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
}
