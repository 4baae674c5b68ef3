use std::convert::Infallible;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::engine::{BookingRequest, Decision, EngineError, Outcome, now_ms, validate_group};
use crate::model::*;

use super::AppState;
use super::dto::*;
use super::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<Ulid> {
    Ulid::from_string(raw).map_err(|_| ApiError::BadRequest(format!("invalid id: {raw}")))
}

/// 200 for an admitted request, 409 for a rejected one; both carry the decision.
fn decision_response(decision: Decision) -> Response {
    let status = match decision.outcome {
        Outcome::Admitted => StatusCode::OK,
        Outcome::Rejected => StatusCode::CONFLICT,
    };
    (status, Json(DecisionBody::from(decision))).into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "vehicles": state.engine.list_vehicles().await.len(),
    }))
}

pub async fn create_booking(
    State(state): State<AppState>,
    payload: Result<Json<CreateBooking>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = payload?;
    let request = BookingRequest {
        vehicle_id: body.vehicle_id,
        user_id: body.user_id,
        start: to_ms(body.start_at),
        end: to_ms(body.end_at),
        estimated_usage_km: body.estimated_usage_km,
        requested_at: now_ms(),
    };
    let decision = state.engine.evaluate(request).await?;
    Ok(decision_response(decision))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BookingBody>> {
    let booking = state.engine.get_booking(parse_id(&id)?).await?;
    Ok(Json(booking.into()))
}

pub async fn approve_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BookingBody>> {
    let booking = state.engine.approve_booking(parse_id(&id)?).await?;
    Ok(Json(booking.into()))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BookingBody>> {
    let booking = state.engine.cancel_booking(parse_id(&id)?).await?;
    Ok(Json(booking.into()))
}

pub async fn reevaluate_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let decision = state.engine.reevaluate(parse_id(&id)?, now_ms()).await?;
    Ok(decision_response(decision))
}

/// Register a vehicle together with its ownership group.
pub async fn register_vehicle(
    State(state): State<AppState>,
    payload: Result<Json<RegisterVehicle>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RegisteredVehicle>)> {
    let Json(body) = payload?;
    let (id, name, group) = body.into_parts();
    validate_group(&group)?;

    state.engine.register_vehicle(id, name.clone()).await?;
    let require_approval = group.require_approval;
    let members = group.members.len();
    if let Err(e) = state.engine.put_group(group).await {
        // Without a group nobody could book it
        if let Err(undo) = state.engine.remove_vehicle(id).await {
            tracing::error!(vehicle = %id, "rollback of registration failed: {undo}");
        }
        return Err(e.into());
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisteredVehicle { id, name, require_approval, members }),
    ))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OwnershipGroup>> {
    let vehicle_id = parse_id(&id)?;
    let group = state
        .engine
        .group(vehicle_id)
        .await?
        .ok_or(ApiError::NoGroup(vehicle_id))?;
    Ok(Json(group))
}

pub async fn put_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<GroupBody>, JsonRejection>,
) -> ApiResult<Json<OwnershipGroup>> {
    let vehicle_id = parse_id(&id)?;
    let Json(body) = payload?;
    let group = body.into_group(vehicle_id);
    state.engine.put_group(group.clone()).await?;
    Ok(Json(group))
}

pub async fn list_vehicles(State(state): State<AppState>) -> Json<Vec<VehicleInfo>> {
    Json(state.engine.list_vehicles().await)
}

pub async fn remove_vehicle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.remove_vehicle(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_bookings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<BookingBody>>> {
    let bookings = state.engine.list_bookings(parse_id(&id)?).await?;
    Ok(Json(bookings.into_iter().map(BookingBody::from).collect()))
}

pub async fn availability(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<AvailabilityParams>, QueryRejection>,
) -> ApiResult<Json<Vec<SpanBody>>> {
    let vehicle_id = parse_id(&id)?;
    let Query(params) = params?;
    let min_duration = params
        .min_duration_minutes
        .map(|m| m.saturating_mul(MINUTE_MS));
    let free = state
        .engine
        .availability(vehicle_id, to_ms(params.start), to_ms(params.end), min_duration)
        .await?;
    Ok(Json(free.into_iter().map(SpanBody::from).collect()))
}

/// Server-sent stream of ledger events for one vehicle.
pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let vehicle_id = parse_id(&id)?;
    if state.engine.get_vehicle(&vehicle_id).is_none() {
        return Err(EngineError::VehicleNotFound(vehicle_id).into());
    }
    let rx = state.engine.notify.subscribe(vehicle_id);

    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    let sse = SseEvent::default().event(event.kind()).data(data);
                    return Some((Ok::<_, Infallible>(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(vehicle = %vehicle_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
