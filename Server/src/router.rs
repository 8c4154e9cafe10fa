use axum::{
    http::Request,
    routing::get,
    Router,
};
use metrics::metrics_handler;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::{DefaultMakeSpan, TraceLayer}};
use tracing::instrument;

use crate::handlers::{dash, sources, websocket};
use crate::types::{AppState, Services};

#[instrument(skip_all)]
pub fn create_router(services: Services) -> Router {
    // Initialize SocketIo
    let (socket_io_layer, socket_io) = websocket::create_websocket_router_layer(services.clone());

    let app_state = AppState {
        services,
        socket_io: Arc::new(socket_io),
    };

    Router::new()
        // Dash endpoints
        .route(
            "/dash/:session_id/:participant_id/:file_name",
            get(dash::fetch_dash_file),
        )
        // Source endpoints
        .route("/sources", get(sources::list_sources))
        .route("/sources/list", get(sources::list_sources))
        // Session endpoints
        .route("/sessions", get(sources::list_sessions))
        // Socket management
        .route("/sockets", get(websocket::list_sockets))
        // Metrics endpoint
        .route("/metrics", get(metrics_handler))
        // Apply middleware
        .layer(
            // We allow cross-origin requests from any origin
            CorsLayer::permissive(),
        )
        .layer(
            // Add logging middleware
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_request(|request: &Request<axum::body::Body>, _span: &tracing::Span| {
                        #[instrument(skip_all, name = "request")]
                        fn log_request(request: &Request<axum::body::Body>) {
                            // If the path is /metrics, don't log it
                            if request.uri().path() == "/metrics" {
                                return;
                            }

                            if request.uri().path().ends_with(".m4s") {
                                return;
                            }

                            tracing::info!(
                                "Received request for endpoint: {}",
                                request.uri().path()
                            );
                        }
                        log_request(request);
                    }),
            ),
        )
        // SocketIo layer
        .layer(socket_io_layer)
        // Share state
        .with_state(app_state)
}
