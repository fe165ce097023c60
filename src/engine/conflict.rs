use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::limits::*;
use crate::model::*;

use super::{ConflictReason, EngineError, InvalidInput};

/// Build a window from raw bounds, rejecting empty or inverted ones.
pub fn window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(InvalidInput::EmptyWindow.into());
    }
    Ok(Span::new(start, end))
}

/// Rule 1: window validity relative to `now`.
pub(crate) fn validate_window(
    span: &Span,
    now: Ms,
    policy: &BookingPolicy,
) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(InvalidInput::TimestampOutOfRange.into());
    }
    if span.start <= now {
        return Err(InvalidInput::StartInPast.into());
    }
    if span.start - now < policy.min_lead {
        return Err(InvalidInput::LeadTooShort(policy.min_lead / MINUTE_MS).into());
    }
    if span.duration_ms() < policy.min_duration {
        return Err(InvalidInput::TooShort(policy.min_duration / MINUTE_MS).into());
    }
    if span.duration_ms() > policy.max_duration {
        return Err(InvalidInput::TooLong(policy.max_duration / MINUTE_MS).into());
    }
    Ok(())
}

/// Rules 2–5, in order, against locked spot and vehicle state.
/// `exclude` is the reservation being modified, if any.
pub(crate) fn check_reservation(
    spot: &SpotState,
    vehicle: &VehicleState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if !spot.spot.reservable {
        return Err(ConflictReason::SpotNotReservable(spot.spot.id).into());
    }
    check_type(vehicle.vehicle.vehicle_type, spot.spot.vehicle_type)?;
    if let Some(other) = first_overlap(&spot.claims, span, exclude) {
        return Err(ConflictReason::SpotOverlap(other).into());
    }
    if let Some(other) = first_overlap(&vehicle.claims, span, exclude) {
        return Err(ConflictReason::VehicleOverlap(other).into());
    }
    Ok(())
}

/// Walk-in admission: the inverse reservability rule, type match, and a free spot.
pub(crate) fn check_walk_in(spot: &SpotState, vehicle_type: VehicleType) -> Result<(), EngineError> {
    if spot.spot.reservable {
        return Err(ConflictReason::SpotReservable(spot.spot.id).into());
    }
    check_type(vehicle_type, spot.spot.vehicle_type)?;
    if spot.occupancy != Occupancy::Free || spot.quick.is_some() {
        return Err(ConflictReason::SpotNotFree(spot.spot.id).into());
    }
    Ok(())
}

fn check_type(vehicle: VehicleType, spot: VehicleType) -> Result<(), EngineError> {
    if vehicle != spot {
        return Err(ConflictReason::TypeMismatch { vehicle, spot }.into());
    }
    Ok(())
}

/// `existing.start < end AND existing.end > start`, skipping `exclude`.
fn first_overlap(claims: &Claims, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    claims
        .overlapping(span)
        .find(|c| Some(c.id) != exclude)
        .map(|c| c.id)
}

pub(crate) fn normalize_plate(plate: &str) -> Result<String, EngineError> {
    let plate: String = plate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase();
    if plate.is_empty() {
        return Err(InvalidInput::Empty("plate").into());
    }
    if plate.len() > MAX_PLATE_LEN {
        return Err(InvalidInput::TextTooLong("plate").into());
    }
    Ok(plate)
}

pub(crate) fn check_text(value: &str, what: &'static str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(InvalidInput::Empty(what).into());
    }
    if value.len() > max {
        return Err(InvalidInput::TextTooLong(what).into());
    }
    Ok(())
}
