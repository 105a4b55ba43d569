//! HTTP routes. Every `/api` route except the public share view requires a
//! bearer session.

pub mod attachments;
pub mod branches;
pub mod chat;
pub mod conversations;
pub mod personas;
pub mod settings;
pub mod shares;

use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::storage::{ObjectStore, UrlSigner};
use axum::extract::{DefaultBodyLimit, FromRequest};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub store: Arc<dyn ObjectStore>,
    pub signer: UrlSigner,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, db: Database, store: Arc<dyn ObjectStore>) -> Self {
        let signer = UrlSigner::new(
            &config.storage.signing_secret,
            &config.server.public_url,
            config.storage.url_ttl_secs,
        );
        Self {
            config,
            db,
            store,
            signer,
            http: reqwest::Client::new(),
        }
    }
}

/// JSON body extractor whose rejections use the API error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);
    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    // Multipart framing needs headroom above the file limit itself.
    let upload_limit = state.config.uploads.max_bytes + 64 * 1024;

    let api = Router::new()
        .route("/models", get(settings::list_models))
        .route("/chat", post(chat::chat))
        .route(
            "/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route(
            "/conversations/:id",
            get(conversations::fetch)
                .patch(conversations::update)
                .delete(conversations::remove),
        )
        .route("/conversations/:id/messages", get(conversations::messages))
        .route(
            "/conversations/:id/messages/:message_id/branch",
            post(branches::branch_from_message),
        )
        .route(
            "/conversations/:id/branches",
            get(branches::list).post(branches::create),
        )
        .route(
            "/conversations/:id/branches/:branch",
            axum::routing::patch(branches::rename).delete(branches::remove),
        )
        .route(
            "/conversations/:id/branches/:branch/activate",
            post(branches::activate),
        )
        .route(
            "/conversations/:id/shares",
            get(shares::list).post(shares::create),
        )
        .route(
            "/conversations/:id/shares/:share_id",
            axum::routing::delete(shares::remove),
        )
        .route("/shared/:token", get(shares::view))
        .route(
            "/attachments",
            post(attachments::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/attachments/:id",
            get(attachments::fetch).delete(attachments::remove),
        )
        .route("/keys", get(settings::list_keys))
        .route(
            "/keys/:provider",
            axum::routing::put(settings::put_key).delete(settings::delete_key),
        )
        .route(
            "/settings",
            get(settings::get_settings).patch(settings::patch_settings),
        )
        .route("/personas", get(personas::list).post(personas::create))
        .route(
            "/personas/:id",
            get(personas::fetch)
                .patch(personas::update)
                .delete(personas::remove),
        )
        .route(
            "/personas/:id/memories",
            get(personas::list_memories).post(personas::add_memory),
        )
        .route(
            "/personas/:id/memories/:memory_id",
            axum::routing::delete(personas::delete_memory),
        );

    Router::new()
        .route("/health", get(health))
        .route("/files/*path", get(attachments::download))
        .nest("/api", api)
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
