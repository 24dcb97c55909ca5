use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub environment: String,
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    pub idp_jwks_url: Option<String>,
    pub idp_issuer: Option<String>,
    pub idp_audience: Option<String>,
    pub cors_allowed_origin: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: String,
    pub download_url_expiry_seconds: u64,
    pub signup_rate_limit: usize,
    pub login_rate_limit: usize,
    pub login_email_rate_limit: usize,
    pub rate_limit_window_seconds: u64,
    pub business_utc_offset_minutes: i32,
    pub strict_rut_validation: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let environment = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = parse_var("SERVER_PORT", 3000u16)?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "compliance-backend".to_string());
        let jwt_audience =
            env::var("JWT_AUDIENCE").unwrap_or_else(|_| "compliance-clients".to_string());
        let jwt_expiry_minutes = parse_var("JWT_EXPIRY_MINUTES", 7 * 24 * 60i64)?;
        let idp_jwks_url = non_empty_var("IDP_JWKS_URL");
        let idp_issuer = non_empty_var("IDP_ISSUER");
        let idp_audience = non_empty_var("IDP_AUDIENCE");
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let aws_endpoint_url = env::var("AWS_ENDPOINT_URL").ok();
        let aws_access_key_id = env::var("AWS_ACCESS_KEY_ID").ok();
        let aws_secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
        let aws_region = env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let s3_bucket = env::var("S3_BUCKET").context("S3_BUCKET must be set")?;
        let download_url_expiry_seconds = parse_var("DOWNLOAD_URL_EXPIRY_SECONDS", 300u64)?;
        let signup_rate_limit = parse_var("SIGNUP_RATE_LIMIT", 5usize)?;
        let login_rate_limit = parse_var("LOGIN_RATE_LIMIT", 20usize)?;
        let login_email_rate_limit = parse_var("LOGIN_EMAIL_RATE_LIMIT", 5usize)?;
        let rate_limit_window_seconds = parse_var("RATE_LIMIT_WINDOW_SECONDS", 15 * 60u64)?;
        let business_utc_offset_minutes = parse_var("BUSINESS_UTC_OFFSET_MINUTES", -4 * 60i32)?;
        let strict_rut_validation = env::var("STRICT_RUT_VALIDATION")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        Ok(Self {
            environment,
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_expiry_minutes,
            idp_jwks_url,
            idp_issuer,
            idp_audience,
            cors_allowed_origin,
            aws_endpoint_url,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            s3_bucket,
            download_url_expiry_seconds,
            signup_rate_limit,
            login_rate_limit,
            login_email_rate_limit,
            rate_limit_window_seconds,
            business_utc_offset_minutes,
            strict_rut_validation,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
