use std::path::Path;
use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::{jwt::JwtService, AuthenticatedUser},
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    policy::ActingUser,
    storage::PublicStorage,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn PublicStorage>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn PublicStorage>,
        jwt: JwtService,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            jwt,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    /// A pooled connection plus the acting user behind `user`, for handlers
    /// whose queries are scoped or authorized per user.
    pub fn db_as(&self, user: &AuthenticatedUser) -> AppResult<(PgPooledConnection, ActingUser)> {
        let mut conn = self.db()?;
        let acting = user.acting(&mut conn)?;
        Ok((conn, acting))
    }

    /// Directory served under `/public`; stored keys are relative to it.
    pub fn public_root(&self) -> &Path {
        self.storage.root()
    }
}
