use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;
use crate::observability::{CONFLICTS_TOTAL, RESERVATION_OPS_TOTAL};

use super::conflict::{check_reservation, validate_window};
use super::{Engine, EngineError, Entity, ExpiryAction, TxnLocks};

/// Result of completing a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed(Reservation),
    /// The record was already Completed or Cancelled. Nothing changed.
    AlreadyClosed(Status),
}

/// Result of an expiry task firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    Completed(Reservation),
    AlreadyClosed(Status),
    /// The task predates the current window; a new one fires at this end.
    Rescheduled(Ms),
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(RESERVATION_OPS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    if let Err(EngineError::Conflict(reason)) = result {
        metrics::counter!(CONFLICTS_TOTAL, "rule" => reason.rule()).increment(1);
    }
}

fn ensure_active(record: &Reservation, action: &str) -> Result<(), EngineError> {
    if record.status != Status::Active {
        return Err(EngineError::InvalidState(format!(
            "reservation {} is {}; only active reservations can be {action}",
            record.id, record.status
        )));
    }
    Ok(())
}

impl Engine {
    fn reservation_snapshot(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Reservation, id))
    }

    /// Lock a reservation's vehicle and spot (plus any extras). Retries if the
    /// record moved to another vehicle or spot between lookup and lock.
    async fn lock_reservation(
        &self,
        id: Ulid,
        extra_vehicles: &[Ulid],
        extra_spots: &[Ulid],
    ) -> Result<(Reservation, TxnLocks), EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let before = self.reservation_snapshot(id)?;
            let mut vehicles = vec![before.vehicle_id];
            vehicles.extend_from_slice(extra_vehicles);
            let mut spots = vec![before.spot_id];
            spots.extend_from_slice(extra_spots);

            let txn = self.lock(&vehicles, &spots).await?;
            let current = self.reservation_snapshot(id)?;
            if current.vehicle_id == before.vehicle_id && current.spot_id == before.spot_id {
                return Ok((current, txn));
            }
        }
        Err(EngineError::Internal(format!(
            "reservation {id} kept moving while being locked"
        )))
    }

    /// Dry-run of the booking rules. Takes the locks but commits nothing.
    pub async fn check_conflict(
        &self,
        spot_id: Ulid,
        vehicle_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        validate_window(&span, self.now(), &self.policy)?;
        let txn = self.lock(&[vehicle_id], &[spot_id]).await?;
        let spot = txn
            .spot(spot_id)
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;
        let vehicle = txn
            .vehicle(vehicle_id)
            .ok_or(EngineError::NotFound(Entity::Vehicle, vehicle_id))?;
        check_reservation(spot, vehicle, &span, exclude)
    }

    pub async fn create_reservation(
        &self,
        id: Ulid,
        user_id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .try_create_reservation(id, user_id, vehicle_id, spot_id, span)
            .await;
        record_outcome("create", &result);
        result
    }

    async fn try_create_reservation(
        &self,
        id: Ulid,
        user_id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let now = self.now();
        validate_window(&span, now, &self.policy)?;

        let mut txn = self.lock(&[vehicle_id], &[spot_id]).await?;
        let vehicle = txn
            .vehicle(vehicle_id)
            .ok_or(EngineError::NotFound(Entity::Vehicle, vehicle_id))?;
        // Someone else's vehicle is indistinguishable from a missing one.
        if vehicle.vehicle.owner_id != user_id {
            return Err(EngineError::NotFound(Entity::Vehicle, vehicle_id));
        }
        let spot = txn
            .spot(spot_id)
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;
        check_reservation(spot, vehicle, &span, None)?;
        if self.reservations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let total_price = price_for(span.duration_ms(), spot.spot.hourly_price);

        let event = Event::ReservationCreated {
            id,
            user_id,
            vehicle_id,
            spot_id,
            span,
            total_price,
            at: now,
        };
        let changes = self.commit(&mut txn, event).await?;
        self.after_commit(changes, ExpiryAction::Schedule(id, span.end))
            .await;
        drop(txn);

        info!(reservation = %id, spot = %spot_id, vehicle = %vehicle_id, %total_price, "reservation created");
        self.reservation_snapshot(id)
    }

    /// Move a pending reservation to a new vehicle, spot, or window.
    /// The record's own claim never conflicts with its new window.
    pub async fn modify_reservation(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .try_modify_reservation(id, vehicle_id, spot_id, span)
            .await;
        record_outcome("modify", &result);
        result
    }

    async fn try_modify_reservation(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let now = self.now();
        let current = self.reservation_snapshot(id)?;
        ensure_modifiable(&current, now)?;
        validate_window(&span, now, &self.policy)?;

        let (current, mut txn) = self.lock_reservation(id, &[vehicle_id], &[spot_id]).await?;
        ensure_modifiable(&current, now)?;
        let vehicle = txn
            .vehicle(vehicle_id)
            .ok_or(EngineError::NotFound(Entity::Vehicle, vehicle_id))?;
        if vehicle.vehicle.owner_id != current.user_id {
            return Err(EngineError::NotFound(Entity::Vehicle, vehicle_id));
        }
        let spot = txn
            .spot(spot_id)
            .ok_or(EngineError::NotFound(Entity::Spot, spot_id))?;
        check_reservation(spot, vehicle, &span, Some(id))?;
        let total_price = price_for(span.duration_ms(), spot.spot.hourly_price);

        let event = Event::ReservationModified {
            id,
            vehicle_id,
            spot_id,
            span,
            total_price,
        };
        let changes = self.commit(&mut txn, event).await?;
        self.after_commit(changes, ExpiryAction::Schedule(id, span.end))
            .await;
        drop(txn);

        info!(reservation = %id, spot = %spot_id, vehicle = %vehicle_id, %total_price, "reservation modified");
        self.reservation_snapshot(id)
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let result = self.try_cancel_reservation(id).await;
        record_outcome("cancel", &result);
        result
    }

    async fn try_cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (current, mut txn) = self.lock_reservation(id, &[], &[]).await?;
        ensure_active(&current, "cancelled")?;

        let event = Event::ReservationCancelled { id, at: self.now() };
        let changes = self.commit(&mut txn, event).await?;
        self.after_commit(changes, ExpiryAction::Unschedule(id)).await;
        drop(txn);

        info!(reservation = %id, spot = %current.spot_id, "reservation cancelled");
        self.reservation_snapshot(id)
    }

    /// Mark an Active reservation Completed. Completing a closed record is a
    /// no-op, so an expiry firing after a cancel changes nothing.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<Completion, EngineError> {
        let result = self.try_complete_reservation(id).await;
        record_outcome("complete", &result);
        result
    }

    async fn try_complete_reservation(&self, id: Ulid) -> Result<Completion, EngineError> {
        let (current, txn) = self.lock_reservation(id, &[], &[]).await?;
        if current.status != Status::Active {
            warn!(reservation = %id, status = %current.status, "completion skipped: reservation already closed");
            return Ok(Completion::AlreadyClosed(current.status));
        }
        self.finish_reservation(&current, txn)
            .await
            .map(Completion::Completed)
    }

    /// Fire the expiry task for `id` that was scheduled at `fire_at`.
    ///
    /// Completes the reservation only if `fire_at` is still its end. A task
    /// left behind by an earlier window is replaced with one at the real end.
    pub async fn expire_reservation(&self, id: Ulid, fire_at: Ms) -> Result<Expiry, EngineError> {
        let result = self.try_expire_reservation(id, fire_at).await;
        record_outcome("expire", &result);
        result
    }

    async fn try_expire_reservation(&self, id: Ulid, fire_at: Ms) -> Result<Expiry, EngineError> {
        let (current, txn) = self.lock_reservation(id, &[], &[]).await?;
        if current.status != Status::Active {
            warn!(reservation = %id, status = %current.status, "expiry skipped: reservation already closed");
            return Ok(Expiry::AlreadyClosed(current.status));
        }
        let end = current.span.end;
        if end != fire_at {
            self.expiry
                .schedule(id, end)
                .await
                .map_err(|e| EngineError::Internal(format!("expiry reschedule failed: {e}")))?;
            warn!(reservation = %id, fire_at, end, "stale expiry task, rescheduled at window end");
            return Ok(Expiry::Rescheduled(end));
        }
        self.finish_reservation(&current, txn)
            .await
            .map(Expiry::Completed)
    }

    async fn finish_reservation(
        &self,
        current: &Reservation,
        mut txn: TxnLocks,
    ) -> Result<Reservation, EngineError> {
        let id = current.id;
        let event = Event::ReservationCompleted { id, at: self.now() };
        let changes = self.commit(&mut txn, event).await?;
        self.after_commit(changes, ExpiryAction::Unschedule(id)).await;
        drop(txn);

        info!(reservation = %id, spot = %current.spot_id, "reservation completed");
        self.reservation_snapshot(id)
    }

    /// Hard delete. Frees the spot if the record was still Active.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let result = self.try_delete_reservation(id).await;
        record_outcome("delete", &result);
        result
    }

    async fn try_delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (current, mut txn) = self.lock_reservation(id, &[], &[]).await?;

        let changes = self
            .commit(&mut txn, Event::ReservationDeleted { id })
            .await?;
        let expiry = if current.status == Status::Active {
            ExpiryAction::Unschedule(id)
        } else {
            ExpiryAction::None
        };
        self.after_commit(changes, expiry).await;
        drop(txn);

        info!(reservation = %id, status = %current.status, "reservation deleted");
        Ok(current)
    }
}

fn ensure_modifiable(record: &Reservation, now: Ms) -> Result<(), EngineError> {
    ensure_active(record, "modified")?;
    if now >= record.span.start {
        return Err(EngineError::InvalidState(format!(
            "reservation {} has already started",
            record.id
        )));
    }
    Ok(())
}
