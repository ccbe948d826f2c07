/// HTTP surface assembly
pub mod firehose;
pub mod middleware;
pub mod oauth;
pub mod repo;
pub mod server;
pub mod sync;
pub mod well_known;

use crate::context::AppContext;
use axum::{routing::get, Router};

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_text() -> String {
    crate::metrics::render()
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/xrpc/_health", get(health))
        .route("/metrics", get(metrics_text))
        .merge(well_known::routes())
        .merge(oauth::routes())
        .merge(server::routes())
        .merge(repo::routes())
        .merge(sync::routes())
        .merge(firehose::routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ctx)
}
