use dashmap::mapref::entry::Entry;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{SENSOR_EVENTS_TOTAL, WALK_IN_OPS_TOTAL};

use super::conflict::{check_walk_in, normalize_plate};
use super::{Completion, ConflictReason, Engine, EngineError, Entity, ExpiryAction, TxnLocks};

/// Who currently holds a spot for a given plate.
enum Holder {
    WalkIn(Ulid),
    Reservation(Ulid),
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(WALK_IN_OPS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}

impl Engine {
    fn quick_snapshot(&self, id: Ulid) -> Result<QuickReservation, EngineError> {
        self.quick
            .get(&id)
            .map(|q| q.value().clone())
            .ok_or(EngineError::NotFound(Entity::QuickReservation, id))
    }

    /// Start a walk-in on a free, non-reservable spot.
    pub async fn create_quick_reservation(
        &self,
        id: Ulid,
        spot_id: Ulid,
        plate: &str,
        vehicle_type: VehicleType,
    ) -> Result<QuickReservation, EngineError> {
        let result = self
            .try_create_quick(id, spot_id, plate, vehicle_type)
            .await;
        record_outcome("create", &result);
        result
    }

    async fn try_create_quick(
        &self,
        id: Ulid,
        spot_id: Ulid,
        plate: &str,
        vehicle_type: VehicleType,
    ) -> Result<QuickReservation, EngineError> {
        let plate = normalize_plate(plate)?;
        let mut txn = self.lock(&[], &[spot_id]).await?;
        let spot = txn
            .spot(spot_id)
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;
        check_walk_in(spot, vehicle_type)?;
        if self.quick.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // Claim the plate before the WAL append; released again if the append fails.
        match self.active_plates.entry(plate.clone()) {
            Entry::Occupied(holder) => {
                return Err(ConflictReason::PlateAlreadyActive(*holder.get()).into());
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let event = Event::QuickReservationStarted {
            id,
            spot_id,
            plate: plate.clone(),
            vehicle_type,
            at: self.now(),
        };
        let changes = match self.commit(&mut txn, event).await {
            Ok(changes) => changes,
            Err(e) => {
                self.active_plates.remove_if(&plate, |_, holder| *holder == id);
                return Err(e);
            }
        };
        drop(txn);
        self.after_commit(changes, ExpiryAction::None).await;

        info!(walk_in = %id, spot = %spot_id, %plate, "walk-in started");
        self.quick_snapshot(id)
    }

    /// Close the spot's Active walk-in, pricing the elapsed time at the spot's rate.
    pub async fn complete_quick_reservation(
        &self,
        spot_id: Ulid,
    ) -> Result<QuickReservation, EngineError> {
        let result = self.try_complete_quick(spot_id, None).await;
        record_outcome("complete", &result);
        result
    }

    /// Close walk-in `id` on `spot_id`, failing with `InvalidState` if another
    /// walk-in (or none) holds the spot by the time the lock is taken.
    pub(super) async fn complete_walk_in(
        &self,
        spot_id: Ulid,
        id: Ulid,
    ) -> Result<QuickReservation, EngineError> {
        let result = self.try_complete_quick(spot_id, Some(id)).await;
        record_outcome("complete", &result);
        result
    }

    async fn try_complete_quick(
        &self,
        spot_id: Ulid,
        expected: Option<Ulid>,
    ) -> Result<QuickReservation, EngineError> {
        let mut txn = self.lock(&[], &[spot_id]).await?;
        let spot = txn
            .spot(spot_id)
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;
        let id = spot.quick.ok_or_else(|| {
            EngineError::InvalidState(format!("spot {spot_id} has no active walk-in"))
        })?;
        if let Some(expected) = expected
            && expected != id
        {
            return Err(EngineError::InvalidState(format!(
                "walk-in {expected} no longer holds spot {spot_id}"
            )));
        }
        let hourly_price = spot.spot.hourly_price;
        let record = self.quick_snapshot(id)?;

        let now = self.now();
        let total_price = price_for((now - record.start).max(0), hourly_price);
        let event = Event::QuickReservationCompleted {
            id,
            at: now,
            total_price,
        };
        let changes = self.commit(&mut txn, event).await?;
        drop(txn);
        self.after_commit(changes, ExpiryAction::None).await;

        info!(walk_in = %id, spot = %spot_id, %total_price, "walk-in completed");
        self.quick_snapshot(id)
    }

    pub async fn cancel_quick_reservation(&self, id: Ulid) -> Result<QuickReservation, EngineError> {
        let result = self.try_cancel_quick(id).await;
        record_outcome("cancel", &result);
        result
    }

    async fn try_cancel_quick(&self, id: Ulid) -> Result<QuickReservation, EngineError> {
        let spot_id = self.quick_snapshot(id)?.spot_id;
        let mut txn = self.lock(&[], &[spot_id]).await?;
        let record = self.quick_snapshot(id)?;
        let holds_spot = txn.spot(spot_id).is_some_and(|s| s.quick == Some(id));
        if record.status != Status::Active || !holds_spot {
            return Err(EngineError::InvalidState(format!(
                "walk-in {id} is {}; only active walk-ins can be cancelled",
                record.status
            )));
        }

        let event = Event::QuickReservationCancelled { id, at: self.now() };
        let changes = self.commit(&mut txn, event).await?;
        drop(txn);
        self.after_commit(changes, ExpiryAction::None).await;

        info!(walk_in = %id, spot = %spot_id, "walk-in cancelled");
        self.quick_snapshot(id)
    }

    /// Record a physical entry or exit at a spot.
    ///
    /// An entry is acknowledged when the plate holds the spot (walk-in or an
    /// Active reservation covering now) and never creates a reservation. An
    /// exit closes whatever the plate holds. Anything else is an anomaly and
    /// changes no reservation state. Every event is persisted.
    pub async fn sensor_event(
        &self,
        spot_id: Ulid,
        plate: &str,
        kind: SensorKind,
    ) -> Result<SensorRecord, EngineError> {
        let plate = normalize_plate(plate)?;
        let facility_id = self
            .spot_catalog
            .get(&spot_id)
            .map(|s| s.facility_id)
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;

        let holder = self.holder_for_plate(spot_id, &plate).await?;
        let (outcome, detail) = match (kind, holder) {
            (SensorKind::Entry, Some(Holder::WalkIn(id))) => {
                (SensorOutcome::Acknowledged, format!("walk-in {id}"))
            }
            (SensorKind::Entry, Some(Holder::Reservation(id))) => {
                (SensorOutcome::Acknowledged, format!("reservation {id}"))
            }
            (SensorKind::Exit, Some(Holder::WalkIn(id))) => {
                match self.complete_walk_in(spot_id, id).await {
                    Ok(closed) => {
                        let total = closed.total_price.unwrap_or_default();
                        (
                            SensorOutcome::Acknowledged,
                            format!("walk-in {id} completed, total {total}"),
                        )
                    }
                    Err(EngineError::InvalidState(_)) => (
                        SensorOutcome::Anomaly,
                        format!("walk-in {id} closed before exit"),
                    ),
                    Err(e) => return Err(e),
                }
            }
            (SensorKind::Exit, Some(Holder::Reservation(id))) => {
                match self.complete_reservation(id).await? {
                    Completion::Completed(_) => (
                        SensorOutcome::Acknowledged,
                        format!("reservation {id} completed early"),
                    ),
                    Completion::AlreadyClosed(status) => (
                        SensorOutcome::Anomaly,
                        format!("reservation {id} was already {status}"),
                    ),
                }
            }
            (SensorKind::Entry, None) => (
                SensorOutcome::Anomaly,
                "entry without an active claim for this plate".to_string(),
            ),
            (SensorKind::Exit, None) => (
                SensorOutcome::Anomaly,
                "exit without an active claim for this plate".to_string(),
            ),
        };

        let record = SensorRecord {
            at: self.now(),
            spot_id,
            facility_id,
            plate,
            kind,
            outcome,
            detail,
        };
        let mut txn = TxnLocks::default();
        self.commit(&mut txn, Event::SensorRecorded(record.clone()))
            .await?;

        metrics::counter!(SENSOR_EVENTS_TOTAL, "kind" => kind.as_str(), "outcome" => outcome.as_str())
            .increment(1);
        match outcome {
            SensorOutcome::Acknowledged => {
                info!(spot = %spot_id, plate = %record.plate, kind = kind.as_str(), detail = %record.detail, "sensor event")
            }
            SensorOutcome::Anomaly => {
                warn!(spot = %spot_id, plate = %record.plate, kind = kind.as_str(), detail = %record.detail, "sensor anomaly")
            }
        }
        Ok(record)
    }

    async fn holder_for_plate(&self, spot_id: Ulid, plate: &str) -> Result<Option<Holder>, EngineError> {
        let state = self
            .spots
            .get(&spot_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;
        let guard = state.read().await;

        if let Some(id) = guard.quick
            && self.quick.get(&id).is_some_and(|q| q.plate == plate)
        {
            return Ok(Some(Holder::WalkIn(id)));
        }
        let now = self.now();
        for claim in guard.claims.at_instant(now) {
            let vehicle_id = self.reservations.get(&claim.id).map(|r| r.vehicle_id);
            if let Some(vehicle_id) = vehicle_id
                && self
                    .vehicle_catalog
                    .get(&vehicle_id)
                    .is_some_and(|v| v.plate == plate)
            {
                return Ok(Some(Holder::Reservation(claim.id)));
            }
        }
        Ok(None)
    }
}
