//! Route configuration.

use crate::auth::team_middleware;
use crate::handlers;
use crate::ratelimit::rate_limit_middleware;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let volume_routes = Router::new()
        .route(
            "/volumes",
            axum::routing::post(handlers::volumes::create_volume).get(handlers::volumes::list_volumes),
        )
        .route(
            "/volumes/{id_or_name}",
            get(handlers::volumes::get_volume).delete(handlers::volumes::delete_volume),
        )
        .route(
            "/v2/sandbox-runs",
            get(handlers::sandbox_runs::list_sandbox_runs),
        );

    // List and delete share one route; their limiters are method-scoped so
    // each carries its own budget. The segment name must match the
    // lifecycle routes, though file routes only accept ids.
    let file_routes = Router::new()
        .route(
            "/volumes/{id_or_name}/files",
            get(handlers::volume_files::list_files).delete(handlers::volume_files::delete_file),
        )
        .route_layer(middleware::from_fn_with_state(
            state.limiters.list.clone(),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.limiters.delete.clone(),
            rate_limit_middleware,
        ));

    let download_routes = Router::new()
        .route(
            "/volumes/{id_or_name}/files/download",
            get(handlers::volume_files::download_file),
        )
        .route_layer(middleware::from_fn_with_state(
            state.limiters.download.clone(),
            rate_limit_middleware,
        ));

    let upload_routes = Router::new()
        .route(
            "/volumes/{id_or_name}/files/upload",
            put(handlers::volume_files::upload_file),
        )
        .route_layer(middleware::from_fn_with_state(
            state.limiters.upload.clone(),
            rate_limit_middleware,
        ));

    // Every tenant route requires team resolution; health stays open for
    // probes.
    let tenant_routes = volume_routes
        .merge(file_routes)
        .merge(download_routes)
        .merge(upload_routes)
        .layer(middleware::from_fn(team_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(tenant_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
