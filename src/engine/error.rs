use ulid::Ulid;

use crate::model::BookingStatus;

use super::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Requested interval has `start >= end`.
    InvalidInterval { start: i64, end: i64 },
    VehicleNotFound(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NotAMember { vehicle_id: Ulid, user_id: String },
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    HasActiveBookings(Ulid),
    InvalidGroup(String),
    LimitExceeded(&'static str),
    /// A collaborator store failed; nothing was written.
    Store(StoreError),
    WalError(String),
}

impl EngineError {
    /// Transient failures: the caller may retry the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: start {start} must be before end {end}")
            }
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotAMember { vehicle_id, user_id } => {
                write!(f, "user {user_id} is not a co-owner of vehicle {vehicle_id}")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot remove vehicle {id}: has active bookings")
            }
            EngineError::InvalidGroup(msg) => write!(f, "invalid ownership group: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store unavailable: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WalError(e.to_string())
    }
}
