use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use lazy_static::lazy_static;
use rand::rngs::OsRng;
use regex::Regex;
use tracing::error;

use crate::error::AuthError;

const MIN_PASSWORD_LEN: usize = 8;

pub fn hash_password(plain: &str) -> Result<String, AuthError> {
    if plain.is_empty() {
        return Err(AuthError::EmptyPassword);
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

/// Digest comparison inside argon2 is constant-time.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "argon2 parse hash error");
            return false;
        }
    };
    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}

pub fn check_strength(plain: &str) -> Result<(), AuthError> {
    let strong = plain.chars().count() >= MIN_PASSWORD_LEN
        && plain.chars().any(|c| c.is_ascii_digit())
        && plain.chars().any(|c| c.is_uppercase())
        && plain.chars().any(|c| c.is_lowercase());
    if strong {
        Ok(())
    } else {
        Err(AuthError::WeakPassword)
    }
}

pub fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Lookup key used for the unique email index.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
