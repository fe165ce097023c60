use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::HOUR_MS;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// `hours(duration) × hourly_price`, exact to the millisecond.
pub fn price_for(duration: Ms, hourly_price: Decimal) -> Decimal {
    let hours = Decimal::from(duration.max(0)) / Decimal::from(HOUR_MS);
    (hours * hourly_price).round_dp(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Special,
    Electric,
    Accessible,
    Vip,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Special => "special",
            VehicleType::Electric => "electric",
            VehicleType::Accessible => "accessible",
            VehicleType::Vip => "vip",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "car" => Ok(VehicleType::Car),
            "motorcycle" | "moto" => Ok(VehicleType::Motorcycle),
            "special" => Ok(VehicleType::Special),
            "electric" => Ok(VehicleType::Electric),
            "accessible" => Ok(VehicleType::Accessible),
            "vip" => Ok(VehicleType::Vip),
            other => Err(format!("unknown vehicle type: {other}")),
        }
    }
}

/// Live state of a spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    Free,
    Reserved,
    Occupied,
}

impl Occupancy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Occupancy::Free => "free",
            Occupancy::Reserved => "reserved",
            Occupancy::Occupied => "occupied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Completed,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Active)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Status::Active),
            "completed" => Ok(Status::Completed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Floor {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub name: String,
}

/// Spot metadata as published by the external catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: Ulid,
    pub floor_id: Ulid,
    pub facility_id: Ulid,
    pub label: String,
    pub vehicle_type: VehicleType,
    pub hourly_price: Decimal,
    /// true = bookable ahead of time, false = walk-in only.
    pub reservable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub plate: String,
    pub vehicle_type: VehicleType,
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub vehicle_id: Ulid,
    pub spot_id: Ulid,
    pub facility_id: Ulid,
    pub span: Span,
    pub status: Status,
    pub total_price: Decimal,
    pub created_at: Ms,
    /// When the record reached a terminal status.
    pub closed_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReservation {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub facility_id: Ulid,
    pub plate: String,
    pub vehicle_type: VehicleType,
    pub start: Ms,
    pub end: Option<Ms>,
    pub status: Status,
    /// Only known once the reservation completes.
    pub total_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Entry,
    Exit,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Entry => "entry",
            SensorKind::Exit => "exit",
        }
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "entry" => Ok(SensorKind::Entry),
            "exit" => Ok(SensorKind::Exit),
            other => Err(format!("unknown sensor event: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorOutcome {
    /// The plate had a legitimate claim on the spot.
    Acknowledged,
    /// No matching claim: surfaced for human review, no state change.
    Anomaly,
}

impl SensorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorOutcome::Acknowledged => "acknowledged",
            SensorOutcome::Anomaly => "anomaly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub at: Ms,
    pub spot_id: Ulid,
    pub facility_id: Ulid,
    pub plate: String,
    pub kind: SensorKind,
    pub outcome: SensorOutcome,
    pub detail: String,
}

// ── Locked per-spot / per-vehicle state ──────────────────────────

/// An Active reservation's hold on a spot or vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub id: Ulid,
    pub span: Span,
}

/// Sorted claim list with binary-search overlap lookup.
#[derive(Debug, Clone, Default)]
pub struct Claims(Vec<Claim>);

impl Claims {
    pub fn insert(&mut self, claim: Claim) {
        let pos = self
            .0
            .binary_search_by_key(&claim.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.0.insert(pos, claim);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Claim> {
        let pos = self.0.iter().position(|c| c.id == id)?;
        Some(self.0.remove(pos))
    }

    /// Claims whose span overlaps `query`.
    /// Everything at index >= right_bound starts at or after query.end.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Claim> {
        let right_bound = self.0.partition_point(|c| c.span.start < query.end);
        self.0[..right_bound]
            .iter()
            .filter(move |c| c.span.end > query.start)
    }

    pub fn at_instant(&self, t: Ms) -> impl Iterator<Item = &Claim> {
        self.0.iter().filter(move |c| c.span.contains_instant(t))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Claim> {
        self.0.iter()
    }
}

/// Everything guarded by a spot's lock: metadata, occupancy, and the records holding it.
#[derive(Debug, Clone)]
pub struct SpotState {
    pub spot: Spot,
    pub occupancy: Occupancy,
    /// Active reservations on this spot, sorted by start.
    pub claims: Claims,
    /// Active walk-in reservation, if any.
    pub quick: Option<Ulid>,
}

impl SpotState {
    pub fn new(spot: Spot) -> Self {
        Self {
            spot,
            occupancy: Occupancy::Free,
            claims: Claims::default(),
            quick: None,
        }
    }

    /// Occupied if a walk-in holds it, Reserved if any Active reservation does, else Free.
    pub fn derive_occupancy(&self) -> Occupancy {
        if self.quick.is_some() {
            Occupancy::Occupied
        } else if !self.claims.is_empty() {
            Occupancy::Reserved
        } else {
            Occupancy::Free
        }
    }

    /// Recompute occupancy; returns true if it changed.
    pub fn refresh_occupancy(&mut self) -> bool {
        let next = self.derive_occupancy();
        let changed = next != self.occupancy;
        self.occupancy = next;
        changed
    }
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    /// Active reservations for this vehicle across all spots.
    pub claims: Claims,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            claims: Claims::default(),
        }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityRegistered {
        id: Ulid,
        name: String,
    },
    FloorRegistered {
        id: Ulid,
        facility_id: Ulid,
        name: String,
    },
    SpotRegistered {
        id: Ulid,
        floor_id: Ulid,
        label: String,
        vehicle_type: VehicleType,
        hourly_price: Decimal,
        reservable: bool,
    },
    VehicleRegistered {
        id: Ulid,
        owner_id: Ulid,
        plate: String,
        vehicle_type: VehicleType,
    },
    ReservationCreated {
        id: Ulid,
        user_id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        span: Span,
        total_price: Decimal,
        at: Ms,
    },
    ReservationModified {
        id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        span: Span,
        total_price: Decimal,
    },
    ReservationCancelled {
        id: Ulid,
        at: Ms,
    },
    ReservationCompleted {
        id: Ulid,
        at: Ms,
    },
    ReservationDeleted {
        id: Ulid,
    },
    QuickReservationStarted {
        id: Ulid,
        spot_id: Ulid,
        plate: String,
        vehicle_type: VehicleType,
        at: Ms,
    },
    QuickReservationCompleted {
        id: Ulid,
        at: Ms,
        total_price: Decimal,
    },
    QuickReservationCancelled {
        id: Ulid,
        at: Ms,
    },
    SensorRecorded(SensorRecord),
}

// ── Change feed ──────────────────────────────────────────────────

/// Why a spot's published state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    ReservationCreated,
    ReservationModified,
    ReservationCancelled,
    ReservationCompleted,
    ReservationDeleted,
    QuickStarted,
    QuickCompleted,
    QuickCancelled,
    SpotUpdated,
}

/// One message per committed transition, per affected spot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotChange {
    pub facility_id: Ulid,
    pub spot_id: Ulid,
    pub state: Occupancy,
    pub reason: ChangeReason,
    /// Reservation or walk-in that caused the change.
    pub reference: Option<Ulid>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotInfo {
    pub spot: Spot,
    pub occupancy: Occupancy,
    pub active_reservations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancySummary {
    pub free: usize,
    pub reserved: usize,
    pub occupied: usize,
}

impl OccupancySummary {
    pub fn total(&self) -> usize {
        self.free + self.reserved + self.occupied
    }
}

/// Which records a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Active,
    /// Completed and Cancelled.
    History,
    All,
}

impl Scope {
    pub fn admits(&self, status: Status) -> bool {
        match self {
            Scope::Active => status == Status::Active,
            Scope::History => status.is_terminal(),
            Scope::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    User(Ulid),
    Facility(Ulid),
}
