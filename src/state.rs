use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;
use tracing::{info, warn};

use crate::auth::{
    jwt::JwtKeys,
    memory::InMemoryUserStore,
    repo::{PgUserStore, UserStore},
    services::AuthService,
};
use crate::config::AppConfig;
use crate::mail::{LogMailer, Mailer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: AuthService,
}

impl AppState {
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let users: Arc<dyn UserStore> = match config.database_url.as_deref() {
            Some(url) => {
                let db = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("connect to database")?;
                if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
                    warn!(error = %e, "migration failed; continuing");
                }
                info!("using postgres user store");
                Arc::new(PgUserStore::new(db)) as Arc<dyn UserStore>
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory user store");
                Arc::new(InMemoryUserStore::new()) as Arc<dyn UserStore>
            }
        };
        let mailer = Arc::new(LogMailer) as Arc<dyn Mailer>;

        let state = Self::from_parts(users, mailer, config);
        if let Some(seed) = &state.config.owner {
            state
                .auth
                .seed_owner(&seed.email, &seed.password)
                .await
                .context("seed owner account")?;
        }
        Ok(state)
    }

    pub fn from_parts(
        users: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
        config: Arc<AppConfig>,
    ) -> Self {
        let auth = AuthService::new(users, mailer, config.clone());
        Self { config, auth }
    }
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.auth.keys().clone()
    }
}

#[cfg(test)]
pub struct FakeState {
    pub state: AppState,
    pub store: Arc<InMemoryUserStore>,
    pub mailer: Arc<crate::mail::RecordingMailer>,
}

#[cfg(test)]
impl AppState {
    pub fn test_config() -> AppConfig {
        AppConfig {
            database_url: None,
            host: "127.0.0.1".into(),
            port: 0,
            frontend_url: "https://crm.test".into(),
            jwt: crate::config::JwtConfig {
                secret: "test".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_minutes: 5,
                refresh_ttl_minutes: 60 * 24 * 7,
            },
            tokens: crate::config::TokenConfig {
                registration_ttl_days: 7,
                reset_ttl_minutes: 60,
            },
            owner: None,
        }
    }

    pub fn fake() -> FakeState {
        Self::fake_with_mailer(crate::mail::RecordingMailer::default())
    }

    pub fn fake_with_mailer(mailer: crate::mail::RecordingMailer) -> FakeState {
        let store = Arc::new(InMemoryUserStore::new());
        let mailer = Arc::new(mailer);
        let state = Self::from_parts(
            store.clone() as Arc<dyn UserStore>,
            mailer.clone() as Arc<dyn Mailer>,
            Arc::new(Self::test_config()),
        );
        FakeState {
            state,
            store,
            mailer,
        }
    }
}
