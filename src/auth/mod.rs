pub mod identity;
pub mod jwt;
pub mod password;
pub mod rate_limit;

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::User,
    schema::users,
    state::AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Professional,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Professional => "professional",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "professional" => Ok(Role::Professional),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::invalid_field(
                "role",
                format!("unknown role '{other}'"),
            )),
        }
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        authenticate(state, bearer.token()).await
    }
}

/// Resolves a bearer credential: self-issued tokens first, then tokens from
/// the external identity provider mapped to a local user by email.
pub async fn authenticate(state: &AppState, token: &str) -> AppResult<Principal> {
    if let Ok(claims) = state.jwt.verify_token(token) {
        return Ok(Principal {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
        });
    }

    let provider = state
        .identity_provider
        .as_ref()
        .ok_or_else(AppError::unauthorized)?;

    let claims = provider.verify(token).await.map_err(|err| {
        debug!(error = %err, "identity provider token rejected");
        AppError::unauthorized()
    })?;
    let email = claims
        .normalized_email()
        .map_err(|_| AppError::unauthorized())?;

    let mut conn = state.db()?;
    let user: User = users::table
        .filter(users::email.eq(&email))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    Ok(Principal {
        user_id: user.id,
        email: user.email,
        role: user.role.parse()?,
    })
}

/// The single role gate every engine entry point goes through.
pub fn authorize(principal: &Principal, allowed: &[Role]) -> AppResult<()> {
    if allowed.contains(&principal.role) {
        Ok(())
    } else {
        debug!(
            user_id = %principal.user_id,
            role = %principal.role,
            "role not permitted for operation"
        );
        Err(AppError::forbidden())
    }
}

/// Like [`authorize`], but re-reads the role from the database first since
/// token claims are never revoked.
pub fn authorize_current(
    conn: &mut PgConnection,
    principal: &Principal,
    allowed: &[Role],
) -> AppResult<Principal> {
    let role: Option<String> = users::table
        .find(principal.user_id)
        .select(users::role)
        .first(conn)
        .optional()?;
    let role: Role = role.ok_or_else(AppError::unauthorized)?.parse()?;

    let current = Principal {
        role,
        ..principal.clone()
    };
    authorize(&current, allowed)?;
    Ok(current)
}

/// Caller network details used for rate limiting and audit entries.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn ip_or_unknown(&self) -> &str {
        self.ip.as_deref().unwrap_or("unknown")
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let ip = header("cf-connecting-ip")
            .or_else(|| {
                header("x-forwarded-for")
                    .and_then(|value| value.split(',').next().map(|ip| ip.trim().to_string()))
            })
            .or_else(|| header("x-real-ip"));
        let user_agent = header("user-agent");

        Ok(ClientContext { ip, user_agent })
    }
}
