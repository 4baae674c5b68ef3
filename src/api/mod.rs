//! HTTP interface over the admission engine.

mod dto;
mod error;
mod handlers;

pub use dto::*;
pub use error::ApiError;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/bookings", post(handlers::create_booking))
        .route("/bookings/:id", get(handlers::get_booking))
        .route("/bookings/:id/approve", post(handlers::approve_booking))
        .route("/bookings/:id/cancel", post(handlers::cancel_booking))
        .route("/bookings/:id/reevaluate", post(handlers::reevaluate_booking))
        .route("/vehicles", post(handlers::register_vehicle).get(handlers::list_vehicles))
        .route("/vehicles/:id", delete(handlers::remove_vehicle))
        .route("/vehicles/:id/group", get(handlers::get_group).put(handlers::put_group))
        .route("/vehicles/:id/bookings", get(handlers::list_bookings))
        .route("/vehicles/:id/availability", get(handlers::availability))
        .route("/vehicles/:id/events", get(handlers::events))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(req).await;

    metrics::histogram!(crate::observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(
        crate::observability::HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}
