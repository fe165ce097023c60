use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_LABEL_LEN, MAX_NAME_LEN};
use crate::model::*;

use super::conflict::{check_text, normalize_plate};
use super::{Engine, EngineError, Entity, ExpiryAction, InvalidInput, TxnLocks};

// Catalog writes are upserts synced from the system of record. They are
// serialized by `catalog_lock` and never race each other.

impl Engine {
    pub async fn register_facility(&self, id: Ulid, name: &str) -> Result<Facility, EngineError> {
        check_text(name, "facility name", MAX_NAME_LEN)?;
        let _catalog = self.catalog_lock.lock().await;

        let event = Event::FacilityRegistered {
            id,
            name: name.to_string(),
        };
        self.commit(&mut TxnLocks::default(), event).await?;
        info!(facility = %id, name, "facility registered");
        self.facility(id)
            .ok_or(EngineError::NotFound(Entity::Facility, id))
    }

    pub async fn register_floor(
        &self,
        id: Ulid,
        facility_id: Ulid,
        name: &str,
    ) -> Result<Floor, EngineError> {
        check_text(name, "floor name", MAX_NAME_LEN)?;
        let _catalog = self.catalog_lock.lock().await;

        if !self.facilities.contains_key(&facility_id) {
            return Err(EngineError::NotFound(Entity::Facility, facility_id));
        }
        if let Some(existing) = self.floors.get(&id)
            && existing.facility_id != facility_id
        {
            return Err(EngineError::InvalidState(format!(
                "floor {id} belongs to facility {}",
                existing.facility_id
            )));
        }

        let event = Event::FloorRegistered {
            id,
            facility_id,
            name: name.to_string(),
        };
        self.commit(&mut TxnLocks::default(), event).await?;
        info!(floor = %id, facility = %facility_id, name, "floor registered");
        self.floors
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(EngineError::NotFound(Entity::Floor, id))
    }

    /// Create or update a spot. Reservability and vehicle type are frozen
    /// while the spot carries Active reservations or a walk-in.
    pub async fn register_spot(
        &self,
        id: Ulid,
        floor_id: Ulid,
        label: &str,
        vehicle_type: VehicleType,
        hourly_price: Decimal,
        reservable: bool,
    ) -> Result<Spot, EngineError> {
        check_text(label, "spot label", MAX_LABEL_LEN)?;
        if hourly_price < Decimal::ZERO {
            return Err(InvalidInput::NegativePrice.into());
        }
        let _catalog = self.catalog_lock.lock().await;

        let facility_id = self
            .floors
            .get(&floor_id)
            .map(|f| f.facility_id)
            .ok_or(EngineError::NotFound(Entity::Floor, floor_id))?;

        let mut txn = if self.spots.contains_key(&id) {
            self.lock(&[], &[id]).await?
        } else {
            TxnLocks::default()
        };
        if let Some(state) = txn.spot(id) {
            if state.spot.facility_id != facility_id {
                return Err(EngineError::InvalidState(format!(
                    "spot {id} belongs to facility {}",
                    state.spot.facility_id
                )));
            }
            let busy = state.quick.is_some() || !state.claims.is_empty();
            if busy && (state.spot.reservable != reservable || state.spot.vehicle_type != vehicle_type) {
                return Err(EngineError::InvalidState(format!(
                    "spot {id} has active reservations; reservability and vehicle type cannot change"
                )));
            }
        }

        let event = Event::SpotRegistered {
            id,
            floor_id,
            label: label.to_string(),
            vehicle_type,
            hourly_price,
            reservable,
        };
        let changes = self.commit(&mut txn, event).await?;
        drop(txn);
        self.after_commit(changes, ExpiryAction::None).await;

        info!(spot = %id, floor = %floor_id, label, %hourly_price, reservable, "spot registered");
        self.spot_catalog
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Spot, id))
    }

    /// Create or update a vehicle. Ownership never changes; the type is
    /// frozen while the vehicle has Active reservations.
    pub async fn register_vehicle(
        &self,
        id: Ulid,
        owner_id: Ulid,
        plate: &str,
        vehicle_type: VehicleType,
    ) -> Result<Vehicle, EngineError> {
        let plate = normalize_plate(plate)?;
        let _catalog = self.catalog_lock.lock().await;

        let mut txn = if self.vehicles.contains_key(&id) {
            self.lock(&[id], &[]).await?
        } else {
            TxnLocks::default()
        };
        if let Some(state) = txn.vehicle(id) {
            if state.vehicle.owner_id != owner_id {
                return Err(EngineError::InvalidState(format!(
                    "vehicle {id} belongs to another user"
                )));
            }
            if state.vehicle.vehicle_type != vehicle_type && !state.claims.is_empty() {
                return Err(EngineError::InvalidState(format!(
                    "vehicle {id} has active reservations; its type cannot change"
                )));
            }
        }

        let event = Event::VehicleRegistered {
            id,
            owner_id,
            plate: plate.clone(),
            vehicle_type,
        };
        self.commit(&mut txn, event).await?;
        drop(txn);

        info!(vehicle = %id, owner = %owner_id, %plate, "vehicle registered");
        self.vehicle(id)
            .ok_or(EngineError::NotFound(Entity::Vehicle, id))
    }
}
