use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::engine::EngineError;

/// Failure of an HTTP handler, rendered as `{error, message}`.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    /// Registered vehicle without an ownership group.
    NoGroup(ulid::Ulid),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NoGroup(_) => StatusCode::NOT_FOUND,
            ApiError::Engine(e) => match e {
                EngineError::InvalidInterval { .. }
                | EngineError::InvalidGroup(_)
                | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
                EngineError::NotAMember { .. } => StatusCode::FORBIDDEN,
                EngineError::VehicleNotFound(_) | EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::AlreadyExists(_)
                | EngineError::InvalidTransition { .. }
                | EngineError::HasActiveBookings(_) => StatusCode::CONFLICT,
                EngineError::Store(_) | EngineError::WalError(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NoGroup(_) => "group_not_found",
            ApiError::Engine(e) => match e {
                EngineError::InvalidInterval { .. } => "invalid_interval",
                EngineError::VehicleNotFound(_) => "vehicle_not_found",
                EngineError::NotFound(_) => "not_found",
                EngineError::AlreadyExists(_) => "already_exists",
                EngineError::NotAMember { .. } => "not_a_member",
                EngineError::InvalidTransition { .. } => "invalid_transition",
                EngineError::HasActiveBookings(_) => "has_active_bookings",
                EngineError::InvalidGroup(_) => "invalid_group",
                EngineError::LimitExceeded(_) => "limit_exceeded",
                EngineError::Store(_) => "store_unavailable",
                EngineError::WalError(_) => "wal_error",
            },
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Engine(e) => write!(f, "{e}"),
            ApiError::BadRequest(msg) => write!(f, "{msg}"),
            ApiError::NoGroup(id) => write!(f, "vehicle {id} has no ownership group"),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        } else {
            tracing::debug!("request refused: {self}");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StoreError;
    use crate::model::BookingStatus;
    use ulid::Ulid;

    #[test]
    fn status_mapping() {
        let id = Ulid::new();
        let cases = [
            (EngineError::InvalidInterval { start: 2, end: 1 }, StatusCode::BAD_REQUEST),
            (EngineError::LimitExceeded("x"), StatusCode::BAD_REQUEST),
            (
                EngineError::NotAMember { vehicle_id: id, user_id: "eve".into() },
                StatusCode::FORBIDDEN,
            ),
            (EngineError::VehicleNotFound(id), StatusCode::NOT_FOUND),
            (EngineError::NotFound(id), StatusCode::NOT_FOUND),
            (
                EngineError::InvalidTransition {
                    id,
                    from: BookingStatus::Rejected,
                    to: BookingStatus::Approved,
                },
                StatusCode::CONFLICT,
            ),
            (EngineError::HasActiveBookings(id), StatusCode::CONFLICT),
            (
                EngineError::Store(StoreError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
        assert_eq!(ApiError::NoGroup(id).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn code_names_the_variant() {
        let err = ApiError::from(EngineError::NotAMember {
            vehicle_id: Ulid::new(),
            user_id: "eve".into(),
        });
        assert_eq!(err.code(), "not_a_member");
        assert!(err.to_string().contains("eve"));
    }
}
