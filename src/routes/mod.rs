use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use chrono::NaiveDateTime;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth::Principal, state::AppState};

pub mod auth;
pub mod companies;
pub mod documents;
pub mod files;
pub mod health;
pub mod jobs;
pub mod workers;

const MAX_REQUEST_BODY_BYTES: usize = 512 * 1024 * 1024;

fn cors_layer(state: &AppState) -> CorsLayer {
    let allow_origin = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = value, "ignoring invalid CORS allowed origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(&state);

    let public_auth_routes = Router::new()
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login));

    let company_routes = Router::new()
        .route(
            "/",
            get(companies::list_companies).post(companies::create_company),
        )
        .route(
            "/:id",
            get(companies::get_company)
                .patch(companies::update_company)
                .delete(companies::delete_company),
        );

    let worker_routes = Router::new()
        .route("/", get(workers::list_workers).post(workers::create_worker))
        .route(
            "/:id",
            get(workers::get_worker)
                .patch(workers::update_worker)
                .delete(workers::delete_worker),
        )
        .route("/:id/photo", post(workers::upload_photo))
        .route("/:id/documents", get(documents::list_for_worker));

    let document_routes = Router::new()
        .route("/", post(documents::create_document))
        .route("/types", get(documents::list_types))
        .route("/upload", post(documents::upload_document))
        .route("/pending", get(documents::list_pending))
        .route(
            "/:id",
            get(documents::get_document)
                .patch(documents::update_document)
                .delete(documents::delete_document),
        )
        .route("/:id/download-url", get(documents::download_url));

    let job_routes = Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::create_job))
        .route("/:id", get(jobs::get_job))
        .route("/:id/review", post(jobs::start_review))
        .route("/:id/quotes", post(jobs::create_quote))
        .route("/:id/quotes/:quote_id/accept", post(jobs::accept_quote))
        .route("/:id/finish", post(jobs::finish_job));

    let file_routes = Router::new()
        .route("/", post(files::upload_file))
        .route("/:id", get(files::get_file))
        .route("/:id/download", get(files::download_file));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .route("/api/auth/me", get(auth::me))
        .nest("/api/companies", company_routes)
        .nest("/api/workers", worker_routes)
        .nest("/api/documents", document_routes)
        .nest("/api/jobs", job_routes)
        .nest("/api/files", file_routes)
        .layer(middleware::from_extractor_with_state::<Principal, _>(
            protected_state,
        ));

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", public_auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    dt.and_utc().to_rfc3339()
}
