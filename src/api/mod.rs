//! HTTP surface: REST handlers, OpenAPI document, and router composition.

pub mod handlers;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::error::{ErrorBody, ErrorResponse};
use crate::ws;

/// OpenAPI document for the REST endpoints.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "wsbroker",
        description = "In-memory WebSocket session broker. Clients connect on `/ws`."
    ),
    paths(handlers::system::health_handler),
    components(schemas(handlers::system::HealthResponse, ErrorResponse, ErrorBody)),
    tags((name = "System", description = "Service health"))
)]
pub struct ApiDoc;

/// Builds the complete application router: REST endpoints, the WebSocket
/// endpoint, API docs, and the HTTP tracing and CORS layers.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new().merge(handlers::routes()).merge(ws::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    #[cfg(not(feature = "swagger-ui"))]
    let router = router.route(
        "/api-docs/openapi.json",
        axum::routing::get(|| async { axum::Json(ApiDoc::openapi()) }),
    );

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
