use std::sync::Arc;

use crate::{
    auth::{identity::IdentityProvider, jwt::JwtService, rate_limit::AuthRateLimits},
    config::AppConfig,
    db::{PgPool, PgPooledConnection},
    documents::BusinessCalendar,
    error::{AppError, AppResult},
    storage::ObjectStorage,
    uploads::ObjectKeyGenerator,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub jwt: JwtService,
    pub identity_provider: Option<Arc<IdentityProvider>>,
    pub rate_limits: Arc<AuthRateLimits>,
    pub object_keys: Arc<ObjectKeyGenerator>,
    pub calendar: BusinessCalendar,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        jwt: JwtService,
    ) -> Self {
        let identity_provider = IdentityProvider::from_config(&config).map(Arc::new);
        let rate_limits = Arc::new(AuthRateLimits::from_config(&config));
        let calendar = BusinessCalendar::from_offset_minutes(config.business_utc_offset_minutes);

        Self {
            pool,
            config: Arc::new(config),
            storage,
            jwt,
            identity_provider,
            rate_limits,
            object_keys: Arc::new(ObjectKeyGenerator::default()),
            calendar,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
