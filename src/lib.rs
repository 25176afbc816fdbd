pub mod auth;
pub mod balance;
pub mod config;
pub mod conversion;
pub mod error;
pub mod http;
pub mod logging;
pub mod models;
pub mod routing;
pub mod state;
pub mod upstream;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    let model_routes = Router::new()
        .route("/v1/chat/completions", post(http::routes::chat_completions))
        .route("/v1/messages", post(http::routes::messages))
        .route("/v1/messages/count_tokens", post(http::routes::count_tokens))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::model_auth,
        ));

    let control_routes = Router::new()
        .route(
            "/api/providers",
            get(http::admin::list_providers).post(http::admin::create_provider),
        )
        .route(
            "/api/providers/{id}",
            get(http::admin::get_provider)
                .put(http::admin::update_provider)
                .delete(http::admin::delete_provider),
        )
        .route(
            "/api/providers/{id}/toggle",
            post(http::admin::toggle_provider),
        )
        .route(
            "/api/rules",
            get(http::admin::get_rules).put(http::admin::put_rules),
        )
        .route("/api/provider-models", get(http::admin::all_provider_models))
        .route(
            "/api/provider-models/{name}",
            get(http::admin::provider_models),
        )
        .route("/api/probe", post(http::admin::probe_provider))
        .route("/api/token", post(http::admin::issue_token))
        .route("/api/status", get(http::admin::status))
        .route("/api/history", get(http::admin::history))
        .route("/api/server/{action}", post(http::admin::server_action))
        .layer(middleware::from_fn_with_state(state.clone(), auth::user_auth));

    Router::new()
        .merge(model_routes)
        .merge(control_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .layer(axum::extract::DefaultBodyLimit::max(
            http::routes::MAX_BODY_BYTES + 1024,
        ))
        .with_state(state)
}
