use axum::{extract::State, http::StatusCode, Json};
use diesel::{prelude::*, result::DatabaseErrorKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::to_iso;
use crate::{
    auth::{
        password::{self, MIN_PASSWORD_LENGTH},
        rate_limit::AuthRateLimits,
        ClientContext, Principal, Role,
    },
    error::{AppError, AppResult},
    models::{NewUser, User},
    schema::users,
    state::AppState,
};

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub full_name: String,
    pub password: String,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
            created_at: to_iso(user.created_at),
        }
    }
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserResponse,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user: UserResponse,
}

fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(AppError::invalid_field("email", "must be a valid email address")),
    }
}

fn signup_role(raw: Option<&str>) -> AppResult<Role> {
    let role = match raw {
        None => Role::User,
        Some(value) => value.parse()?,
    };
    if role == Role::Admin {
        return Err(AppError::invalid_field(
            "role",
            "admin accounts cannot be created through signup",
        ));
    }
    Ok(role)
}

fn issue(state: &AppState, user: User) -> AppResult<AuthResponse> {
    let role: Role = user.role.parse()?;
    let token = state.jwt.generate_token(user.id, &user.email, role)?;
    Ok(AuthResponse {
        token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt.expires_in_seconds(),
        user: user.into(),
    })
}

pub async fn signup(
    State(state): State<AppState>,
    client: ClientContext,
    Json(payload): Json<SignupRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    state
        .rate_limits
        .signup_by_ip
        .check(client.ip_or_unknown())
        .map_err(|limited| AppError::rate_limited(limited.message()))?;

    let email = normalize_email(&payload.email)?;
    let full_name = payload.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(AppError::invalid_field("full_name", "must not be empty"));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::invalid_field(
            "password",
            format!("must be at least {MIN_PASSWORD_LENGTH} characters"),
        ));
    }
    let role = signup_role(payload.role.as_deref())?;

    let password_hash = password::hash_password(&payload.password)?;
    let new_user = NewUser {
        id: Uuid::new_v4(),
        email,
        full_name,
        password_hash,
        role: role.as_str().to_string(),
    };

    let mut conn = state.db()?;
    let user: User = match diesel::insert_into(users::table)
        .values(&new_user)
        .get_result(&mut conn)
    {
        Ok(user) => user,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::conflict(
                "Conflict",
                "an account with this email already exists",
            ));
        }
        Err(err) => return Err(err.into()),
    };

    info!(user_id = %user.id, role = %role, "account created");
    Ok((StatusCode::CREATED, Json(issue(&state, user)?)))
}

pub async fn login(
    State(state): State<AppState>,
    client: ClientContext,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();
    let ip = client.ip_or_unknown();
    let pair_key = AuthRateLimits::login_key(ip, &email);

    let limits = &state.rate_limits;
    limits
        .login_by_ip
        .check(ip)
        .and_then(|_| limits.login_by_ip_email.check(&pair_key))
        .map_err(|limited| {
            warn!(ip, "login rate limited");
            AppError::rate_limited(limited.message())
        })?;

    let mut conn = state.db()?;
    let user: Option<User> = users::table
        .filter(users::email.eq(&email))
        .first(&mut conn)
        .optional()?;
    drop(conn);

    let Some(user) = user else {
        password::verify_unknown_account(&payload.password);
        return Err(AppError::unauthorized());
    };

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        return Err(AppError::unauthorized());
    }

    limits.login_by_ip_email.reset(&pair_key);
    info!(user_id = %user.id, "login succeeded");
    Ok(Json(issue(&state, user)?))
}

pub async fn me(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<MeResponse>> {
    let mut conn = state.db()?;
    let user: User = users::table
        .find(principal.user_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    Ok(Json(MeResponse { user: user.into() }))
}
