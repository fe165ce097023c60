use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::model::VehicleType;

/// Malformed or unsupported input. User-correctable, never has side effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInput {
    #[error("window end must be after its start")]
    EmptyWindow,
    #[error("window must start in the future")]
    StartInPast,
    #[error("window must start at least {0} minutes from now")]
    LeadTooShort(i64),
    #[error("duration is below the minimum of {0} minutes")]
    TooShort(i64),
    #[error("duration is above the maximum of {0} minutes")]
    TooLong(i64),
    #[error("timestamp out of range")]
    TimestampOutOfRange,
    #[error("{0} is too long")]
    TextTooLong(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("hourly price must not be negative")]
    NegativePrice,
}

/// The booking rule a request violated. Reported verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictReason {
    #[error("spot {0} is walk-in only and cannot be reserved")]
    SpotNotReservable(Ulid),
    #[error("spot {0} is reservable and cannot take walk-ins")]
    SpotReservable(Ulid),
    #[error("vehicle type {vehicle} does not match spot type {spot}")]
    TypeMismatch { vehicle: VehicleType, spot: VehicleType },
    #[error("spot already reserved in that window (reservation {0})")]
    SpotOverlap(Ulid),
    #[error("vehicle already has a reservation in that window (reservation {0})")]
    VehicleOverlap(Ulid),
    #[error("spot {0} is not free")]
    SpotNotFree(Ulid),
    #[error("plate already has an active walk-in ({0})")]
    PlateAlreadyActive(Ulid),
}

impl ConflictReason {
    /// Short rule name, used as a metrics label.
    pub fn rule(&self) -> &'static str {
        match self {
            ConflictReason::SpotNotReservable(_) => "spot_not_reservable",
            ConflictReason::SpotReservable(_) => "spot_reservable",
            ConflictReason::TypeMismatch { .. } => "type_mismatch",
            ConflictReason::SpotOverlap(_) => "spot_overlap",
            ConflictReason::VehicleOverlap(_) => "vehicle_overlap",
            ConflictReason::SpotNotFree(_) => "spot_not_free",
            ConflictReason::PlateAlreadyActive(_) => "plate_already_active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Facility,
    Floor,
    Spot,
    Vehicle,
    Reservation,
    QuickReservation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Facility => "facility",
            Entity::Floor => "floor",
            Entity::Spot => "spot",
            Entity::Vehicle => "vehicle",
            Entity::Reservation => "reservation",
            Entity::QuickReservation => "quick reservation",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] InvalidInput),
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictReason),
    #[error("{0} not found: {1}")]
    NotFound(Entity, Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    InvalidState,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::AlreadyExists(_) => ErrorKind::Validation,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn conflict_reason(&self) -> Option<&ConflictReason> {
        match self {
            EngineError::Conflict(reason) => Some(reason),
            _ => None,
        }
    }
}
