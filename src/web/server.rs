use axum::{routing::get, routing::post, Router};
use tower_http::trace::TraceLayer;

use crate::config::Topology;
use crate::relay::LinkMonitor;
use crate::scheduler::SchedulerHandle;

use super::api::status as status_handlers;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub topology: Topology,
    pub link: Option<LinkMonitor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handlers::status))
        .route("/api/passes", get(status_handlers::passes))
        .route("/api/jobs", get(status_handlers::jobs))
        .route("/api/events/next", get(status_handlers::next_event))
        .route("/api/scheduler/stop", post(status_handlers::stop))
        .route("/api/scheduler/refresh", post(status_handlers::refresh))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(bind_addr: String, state: AppState) -> std::io::Result<()> {
    let app = router(state);

    log::info!("Starting status API on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await
}
