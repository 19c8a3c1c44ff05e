use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Lifetimes of the single-use registration and reset tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub registration_ttl_days: i64,
    pub reset_ttl_minutes: i64,
}

/// Owner account created at startup when no user holds its email yet.
#[derive(Debug, Clone, Deserialize)]
pub struct OwnerSeed {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string. Without it the in-memory store is used.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    pub jwt: JwtConfig,
    pub tokens: TokenConfig,
    pub owner: Option<OwnerSeed>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = non_empty_var("DATABASE_URL");
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "growthdesk".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "growthdesk-users".into()),
            ttl_minutes: env_parse("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 7),
        };
        let tokens = TokenConfig {
            registration_ttl_days: env_parse("REGISTRATION_TOKEN_TTL_DAYS", 7),
            reset_ttl_minutes: env_parse("RESET_TOKEN_TTL_MINUTES", 60 * 24),
        };
        let owner = match (non_empty_var("OWNER_EMAIL"), non_empty_var("OWNER_PASSWORD")) {
            (Some(email), Some(password)) => Some(OwnerSeed { email, password }),
            _ => None,
        };
        Ok(Self {
            database_url,
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("APP_PORT", 8080),
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            jwt,
            tokens,
            owner,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
