//! Metrics HTTP surface: a single text endpoint for scraping.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;

use banter_gateway::Gateway;

pub fn metrics_app(gateway: Arc<Gateway>) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(render))
        .with_state(gateway)
}

async fn render(State(gateway): State<Arc<Gateway>>) -> String {
    gateway.render_metrics()
}
