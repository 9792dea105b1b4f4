pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts, http::StatusCode};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};

use self::jwt::Claims;
use crate::error::{AppError, AppResult};
use crate::policy::{load_acting_user, ActingUser, Role};
use crate::state::AppState;

/// Identity carried by a verified bearer token.
///
/// `role` is `None` when the token names a role this service does not know;
/// such users are scoped like a teacher without subjects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: i32,
    pub username: String,
    pub role: Option<Role>,
}

impl AuthenticatedUser {
    pub fn from_claims(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: Role::parse(&claims.role),
            username: claims.username,
        }
    }

    /// Loads the school and subjects behind this token. A token whose user
    /// has since been deleted is treated as unauthenticated.
    pub fn acting(&self, conn: &mut PgConnection) -> AppResult<ActingUser> {
        load_acting_user(conn, self.user_id).map_err(|err| {
            if err.status() == StatusCode::NOT_FOUND {
                AppError::unauthorized()
            } else {
                err
            }
        })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let claims = state
            .jwt
            .verify_token(bearer.token())
            .map_err(|_| AppError::unauthorized())?;

        Ok(AuthenticatedUser::from_claims(claims))
    }
}
