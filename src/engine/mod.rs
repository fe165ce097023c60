mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod walkin;

pub use conflict::window;
pub use error::{ConflictReason, EngineError, Entity, ErrorKind, InvalidInput};
pub use mutations::{Completion, Expiry};

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::expiry::ExpiryQueue;
use crate::limits::MAX_SENSOR_LOG_PER_FACILITY;
use crate::model::*;
use crate::notify::ChangePublisher;
use crate::wal::Wal;

pub type SharedSpotState = Arc<RwLock<SpotState>>;
pub type SharedVehicleState = Arc<Mutex<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal<Event>,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append(&event);
            let _ = response.send(result);
        }
    }
}

// ── Transaction locks ────────────────────────────────────

/// Locks held by one transition. Vehicles are always taken before spots,
/// each group in ascending id order.
#[derive(Default)]
pub(crate) struct TxnLocks {
    vehicles: Vec<OwnedMutexGuard<VehicleState>>,
    spots: Vec<OwnedRwLockWriteGuard<SpotState>>,
}

impl TxnLocks {
    pub(crate) fn spot(&self, id: Ulid) -> Option<&SpotState> {
        self.spots.iter().find(|g| g.spot.id == id).map(|g| &**g)
    }

    pub(crate) fn spot_mut(&mut self, id: Ulid) -> Option<&mut SpotState> {
        self.spots.iter_mut().find(|g| g.spot.id == id).map(|g| &mut **g)
    }

    pub(crate) fn vehicle(&self, id: Ulid) -> Option<&VehicleState> {
        self.vehicles
            .iter()
            .find(|g| g.vehicle.id == id)
            .map(|g| &**g)
    }

    pub(crate) fn vehicle_mut(&mut self, id: Ulid) -> Option<&mut VehicleState> {
        self.vehicles
            .iter_mut()
            .find(|g| g.vehicle.id == id)
            .map(|g| &mut **g)
    }
}

/// Expiry bookkeeping to run once a transition has committed.
pub(crate) enum ExpiryAction {
    None,
    Schedule(Ulid, Ms),
    Unschedule(Ulid),
}

/// Collaborators the engine is wired to at construction.
pub struct Services {
    pub notify: Arc<dyn ChangePublisher>,
    pub expiry: Arc<dyn ExpiryQueue>,
    pub clock: Arc<dyn Clock>,
    pub policy: BookingPolicy,
}

pub struct Engine {
    // Catalog, readable without taking spot or vehicle locks.
    pub(super) facilities: DashMap<Ulid, Facility>,
    pub(super) floors: DashMap<Ulid, Floor>,
    pub(super) spot_catalog: DashMap<Ulid, Spot>,
    pub(super) vehicle_catalog: DashMap<Ulid, Vehicle>,
    /// Serializes catalog upserts.
    pub(super) catalog_lock: Mutex<()>,

    pub(super) spots: DashMap<Ulid, SharedSpotState>,
    pub(super) vehicles: DashMap<Ulid, SharedVehicleState>,

    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) quick: DashMap<Ulid, QuickReservation>,
    /// Normalized plate → its Active walk-in.
    pub(super) active_plates: DashMap<String, Ulid>,
    pub(super) sensor_log: DashMap<Ulid, VecDeque<SensorRecord>>,

    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared across append + apply; compaction holds it exclusively.
    commit_gate: RwLock<()>,

    pub(super) notify: Arc<dyn ChangePublisher>,
    pub(super) expiry: Arc<dyn ExpiryQueue>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: BookingPolicy,
}

fn change_for(state: &SpotState, reason: ChangeReason, reference: Option<Ulid>) -> SpotChange {
    SpotChange {
        facility_id: state.spot.facility_id,
        spot_id: state.spot.id,
        state: state.occupancy,
        reason,
        reference,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, services: Services) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            facilities: DashMap::new(),
            floors: DashMap::new(),
            spot_catalog: DashMap::new(),
            vehicle_catalog: DashMap::new(),
            catalog_lock: Mutex::new(()),
            spots: DashMap::new(),
            vehicles: DashMap::new(),
            reservations: DashMap::new(),
            quick: DashMap::new(),
            active_plates: DashMap::new(),
            sensor_log: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify: services.notify,
            expiry: services.expiry,
            clock: services.clock,
            policy: services.policy,
        };

        // Replay goes through the same apply path as live commits. Nothing else
        // holds these Arcs yet, so try_lock never contends.
        for event in &events {
            let (vehicle_ids, spot_ids) = engine.lock_targets(event);
            let mut txn = engine.lock_uncontended(&vehicle_ids, &spot_ids)?;
            engine.apply_event(event, &mut txn);
        }

        info!(
            path = %wal_path.display(),
            events = events.len(),
            spots = engine.spots.len(),
            reservations = engine.reservations.len(),
            "engine state restored"
        );
        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL append failed: {e}")))
    }

    /// Resolve and lock vehicles then spots, each in ascending id order.
    pub(crate) async fn lock(
        &self,
        vehicle_ids: &[Ulid],
        spot_ids: &[Ulid],
    ) -> Result<TxnLocks, EngineError> {
        let vehicles = sorted_unique(vehicle_ids)
            .into_iter()
            .map(|id| {
                self.vehicles
                    .get(&id)
                    .map(|e| e.value().clone())
                    .ok_or(EngineError::NotFound(Entity::Vehicle, id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let spots = sorted_unique(spot_ids)
            .into_iter()
            .map(|id| {
                self.spots
                    .get(&id)
                    .map(|e| e.value().clone())
                    .ok_or(EngineError::NotFound(Entity::Spot, id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut txn = TxnLocks::default();
        for vehicle in vehicles {
            txn.vehicles.push(vehicle.lock_owned().await);
        }
        for spot in spots {
            txn.spots.push(spot.write_owned().await);
        }
        Ok(txn)
    }

    /// Replay-time locking. Unknown ids are skipped.
    fn lock_uncontended(&self, vehicle_ids: &[Ulid], spot_ids: &[Ulid]) -> io::Result<TxnLocks> {
        let contended = |what: &str| io::Error::other(format!("replay: {what} lock contended"));
        let mut txn = TxnLocks::default();
        for id in sorted_unique(vehicle_ids) {
            if let Some(entry) = self.vehicles.get(&id) {
                let guard = entry.value().clone().try_lock_owned().map_err(|_| contended("vehicle"))?;
                txn.vehicles.push(guard);
            }
        }
        for id in sorted_unique(spot_ids) {
            if let Some(entry) = self.spots.get(&id) {
                let guard = entry.value().clone().try_write_owned().map_err(|_| contended("spot"))?;
                txn.spots.push(guard);
            }
        }
        Ok(txn)
    }

    /// Vehicles and spots an event touches, for replay.
    fn lock_targets(&self, event: &Event) -> (Vec<Ulid>, Vec<Ulid>) {
        match event {
            Event::SpotRegistered { id, .. } => (vec![], vec![*id]),
            Event::VehicleRegistered { id, .. } => (vec![*id], vec![]),
            Event::ReservationCreated {
                vehicle_id,
                spot_id,
                ..
            } => (vec![*vehicle_id], vec![*spot_id]),
            Event::ReservationModified {
                id,
                vehicle_id,
                spot_id,
                ..
            } => {
                let mut vehicles = vec![*vehicle_id];
                let mut spots = vec![*spot_id];
                if let Some(r) = self.reservations.get(id) {
                    vehicles.push(r.vehicle_id);
                    spots.push(r.spot_id);
                }
                (vehicles, spots)
            }
            Event::ReservationCancelled { id, .. }
            | Event::ReservationCompleted { id, .. }
            | Event::ReservationDeleted { id } => self
                .reservations
                .get(id)
                .map(|r| (vec![r.vehicle_id], vec![r.spot_id]))
                .unwrap_or_default(),
            Event::QuickReservationStarted { spot_id, .. } => (vec![], vec![*spot_id]),
            Event::QuickReservationCompleted { id, .. }
            | Event::QuickReservationCancelled { id, .. } => self
                .quick
                .get(id)
                .map(|q| (vec![], vec![q.spot_id]))
                .unwrap_or_default(),
            Event::FacilityRegistered { .. }
            | Event::FloorRegistered { .. }
            | Event::SensorRecorded(_) => (vec![], vec![]),
        }
    }

    /// WAL append under the commit gate, then apply. The append is the commit point.
    pub(crate) async fn commit(
        &self,
        txn: &mut TxnLocks,
        event: Event,
    ) -> Result<Vec<SpotChange>, EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        Ok(self.apply_event(&event, txn))
    }

    /// Publish and update the expiry queue. Reservation transitions call this
    /// before releasing their locks, so queue writes for one reservation land
    /// in commit order. A failed schedule is logged and left to the boot-time
    /// reconcile.
    pub(crate) async fn after_commit(&self, changes: Vec<SpotChange>, expiry: ExpiryAction) {
        match expiry {
            ExpiryAction::Schedule(id, at) => {
                if let Err(e) = self.expiry.schedule(id, at).await {
                    error!(reservation = %id, "failed to schedule expiry: {e}");
                }
            }
            ExpiryAction::Unschedule(id) => {
                if let Err(e) = self.expiry.unschedule(id).await {
                    error!(reservation = %id, "failed to unschedule expiry: {e}");
                }
            }
            ExpiryAction::None => {}
        }
        for change in &changes {
            self.notify.publish(change);
        }
    }

    /// Apply a committed event to in-memory state. Caller holds the locks from
    /// `lock_targets`. Returns one change per affected spot.
    fn apply_event(&self, event: &Event, txn: &mut TxnLocks) -> Vec<SpotChange> {
        let mut changes = Vec::new();
        match event {
            Event::FacilityRegistered { id, name } => {
                self.facilities.insert(
                    *id,
                    Facility {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::FloorRegistered {
                id,
                facility_id,
                name,
            } => {
                self.floors.insert(
                    *id,
                    Floor {
                        id: *id,
                        facility_id: *facility_id,
                        name: name.clone(),
                    },
                );
            }
            Event::SpotRegistered {
                id,
                floor_id,
                label,
                vehicle_type,
                hourly_price,
                reservable,
            } => {
                let Some(facility_id) = self.floors.get(floor_id).map(|f| f.facility_id) else {
                    return changes;
                };
                let spot = Spot {
                    id: *id,
                    floor_id: *floor_id,
                    facility_id,
                    label: label.clone(),
                    vehicle_type: *vehicle_type,
                    hourly_price: *hourly_price,
                    reservable: *reservable,
                };
                self.spot_catalog.insert(*id, spot.clone());
                if let Some(state) = txn.spot_mut(*id) {
                    state.spot = spot;
                    changes.push(change_for(state, ChangeReason::SpotUpdated, None));
                } else {
                    self.spots
                        .entry(*id)
                        .or_insert_with(|| Arc::new(RwLock::new(SpotState::new(spot))));
                }
            }
            Event::VehicleRegistered {
                id,
                owner_id,
                plate,
                vehicle_type,
            } => {
                let vehicle = Vehicle {
                    id: *id,
                    owner_id: *owner_id,
                    plate: plate.clone(),
                    vehicle_type: *vehicle_type,
                };
                self.vehicle_catalog.insert(*id, vehicle.clone());
                if let Some(state) = txn.vehicle_mut(*id) {
                    state.vehicle = vehicle;
                } else {
                    self.vehicles
                        .entry(*id)
                        .or_insert_with(|| Arc::new(Mutex::new(VehicleState::new(vehicle))));
                }
            }
            Event::ReservationCreated {
                id,
                user_id,
                vehicle_id,
                spot_id,
                span,
                total_price,
                at,
            } => {
                let claim = Claim {
                    id: *id,
                    span: *span,
                };
                if let Some(vehicle) = txn.vehicle_mut(*vehicle_id) {
                    vehicle.claims.insert(claim);
                }
                let mut facility_id = Ulid::nil();
                if let Some(state) = txn.spot_mut(*spot_id) {
                    state.claims.insert(claim);
                    state.refresh_occupancy();
                    facility_id = state.spot.facility_id;
                    changes.push(change_for(state, ChangeReason::ReservationCreated, Some(*id)));
                }
                self.reservations.insert(
                    *id,
                    Reservation {
                        id: *id,
                        user_id: *user_id,
                        vehicle_id: *vehicle_id,
                        spot_id: *spot_id,
                        facility_id,
                        span: *span,
                        status: Status::Active,
                        total_price: *total_price,
                        created_at: *at,
                        closed_at: None,
                    },
                );
            }
            Event::ReservationModified {
                id,
                vehicle_id,
                spot_id,
                span,
                total_price,
            } => {
                let Some(old) = self.reservations.get(id).map(|r| r.value().clone()) else {
                    return changes;
                };
                if let Some(vehicle) = txn.vehicle_mut(old.vehicle_id) {
                    vehicle.claims.remove(*id);
                }
                if let Some(state) = txn.spot_mut(old.spot_id) {
                    state.claims.remove(*id);
                    state.refresh_occupancy();
                    if old.spot_id != *spot_id {
                        changes.push(change_for(state, ChangeReason::ReservationModified, Some(*id)));
                    }
                }
                let claim = Claim {
                    id: *id,
                    span: *span,
                };
                if let Some(vehicle) = txn.vehicle_mut(*vehicle_id) {
                    vehicle.claims.insert(claim);
                }
                let mut facility_id = old.facility_id;
                if let Some(state) = txn.spot_mut(*spot_id) {
                    state.claims.insert(claim);
                    state.refresh_occupancy();
                    facility_id = state.spot.facility_id;
                    changes.push(change_for(state, ChangeReason::ReservationModified, Some(*id)));
                }
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.vehicle_id = *vehicle_id;
                    r.spot_id = *spot_id;
                    r.facility_id = facility_id;
                    r.span = *span;
                    r.total_price = *total_price;
                }
            }
            Event::ReservationCancelled { id, at } => {
                self.close_reservation(*id, Status::Cancelled, *at, txn, &mut changes);
            }
            Event::ReservationCompleted { id, at } => {
                self.close_reservation(*id, Status::Completed, *at, txn, &mut changes);
            }
            Event::ReservationDeleted { id } => {
                if let Some((_, old)) = self.reservations.remove(id)
                    && old.status == Status::Active
                {
                    release_claim(&old, txn, ChangeReason::ReservationDeleted, &mut changes);
                }
            }
            Event::QuickReservationStarted {
                id,
                spot_id,
                plate,
                vehicle_type,
                at,
            } => {
                let mut facility_id = Ulid::nil();
                if let Some(state) = txn.spot_mut(*spot_id) {
                    state.quick = Some(*id);
                    state.refresh_occupancy();
                    facility_id = state.spot.facility_id;
                    changes.push(change_for(state, ChangeReason::QuickStarted, Some(*id)));
                }
                self.active_plates.insert(plate.clone(), *id);
                self.quick.insert(
                    *id,
                    QuickReservation {
                        id: *id,
                        spot_id: *spot_id,
                        facility_id,
                        plate: plate.clone(),
                        vehicle_type: *vehicle_type,
                        start: *at,
                        end: None,
                        status: Status::Active,
                        total_price: None,
                    },
                );
            }
            Event::QuickReservationCompleted { id, at, total_price } => {
                self.close_quick(*id, Status::Completed, *at, Some(*total_price), txn, &mut changes);
            }
            Event::QuickReservationCancelled { id, at } => {
                self.close_quick(*id, Status::Cancelled, *at, None, txn, &mut changes);
            }
            Event::SensorRecorded(record) => {
                let mut log = self.sensor_log.entry(record.facility_id).or_default();
                log.push_back(record.clone());
                if log.len() > MAX_SENSOR_LOG_PER_FACILITY {
                    log.pop_front();
                }
            }
        }
        changes
    }

    fn close_reservation(
        &self,
        id: Ulid,
        status: Status,
        at: Ms,
        txn: &mut TxnLocks,
        changes: &mut Vec<SpotChange>,
    ) {
        let Some(mut record) = self.reservations.get_mut(&id) else {
            return;
        };
        if record.status != Status::Active {
            return;
        }
        record.status = status;
        record.closed_at = Some(at);
        let closed = record.clone();
        drop(record);
        let reason = match status {
            Status::Completed => ChangeReason::ReservationCompleted,
            _ => ChangeReason::ReservationCancelled,
        };
        release_claim(&closed, txn, reason, changes);
    }

    fn close_quick(
        &self,
        id: Ulid,
        status: Status,
        at: Ms,
        total_price: Option<rust_decimal::Decimal>,
        txn: &mut TxnLocks,
        changes: &mut Vec<SpotChange>,
    ) {
        let Some(mut record) = self.quick.get_mut(&id) else {
            return;
        };
        if record.status != Status::Active {
            return;
        }
        record.status = status;
        record.end = Some(at);
        record.total_price = total_price;
        let (spot_id, plate) = (record.spot_id, record.plate.clone());
        drop(record);

        self.active_plates.remove_if(&plate, |_, holder| *holder == id);
        if let Some(state) = txn.spot_mut(spot_id) {
            if state.quick == Some(id) {
                state.quick = None;
            }
            state.refresh_occupancy();
            let reason = match status {
                Status::Completed => ChangeReason::QuickCompleted,
                _ => ChangeReason::QuickCancelled,
            };
            changes.push(change_for(state, reason, Some(id)));
        }
    }

    /// Schedule a completion task for every Active reservation missing one.
    /// Returns how many were (re)scheduled.
    pub async fn reconcile_expiry(&self) -> usize {
        let active: Vec<(Ulid, Ms)> = self
            .reservations
            .iter()
            .filter(|r| r.status == Status::Active)
            .map(|r| (r.id, r.span.end))
            .collect();
        let mut scheduled = 0;
        for (id, end) in active {
            if self.expiry.scheduled_at(id).await == Some(end) {
                continue;
            }
            match self.expiry.schedule(id, end).await {
                Ok(()) => scheduled += 1,
                Err(e) => error!(reservation = %id, "reconcile: failed to schedule expiry: {e}"),
            }
        }
        if scheduled > 0 {
            info!(scheduled, "reconciled missing expiry tasks");
        }
        scheduled
    }

    /// Rewrite the WAL as the minimal event sequence that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL compaction failed: {e}")))
    }

    fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for f in self.facilities.iter() {
            events.push(Event::FacilityRegistered {
                id: f.id,
                name: f.name.clone(),
            });
        }
        for f in self.floors.iter() {
            events.push(Event::FloorRegistered {
                id: f.id,
                facility_id: f.facility_id,
                name: f.name.clone(),
            });
        }
        for s in self.spot_catalog.iter() {
            events.push(Event::SpotRegistered {
                id: s.id,
                floor_id: s.floor_id,
                label: s.label.clone(),
                vehicle_type: s.vehicle_type,
                hourly_price: s.hourly_price,
                reservable: s.reservable,
            });
        }
        for v in self.vehicle_catalog.iter() {
            events.push(Event::VehicleRegistered {
                id: v.id,
                owner_id: v.owner_id,
                plate: v.plate.clone(),
                vehicle_type: v.vehicle_type,
            });
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|r| r.value().clone()).collect();
        reservations.sort_by_key(|r| (r.created_at, r.id));
        for r in reservations {
            events.push(Event::ReservationCreated {
                id: r.id,
                user_id: r.user_id,
                vehicle_id: r.vehicle_id,
                spot_id: r.spot_id,
                span: r.span,
                total_price: r.total_price,
                at: r.created_at,
            });
            let at = r.closed_at.unwrap_or(r.created_at);
            match r.status {
                Status::Active => {}
                Status::Completed => events.push(Event::ReservationCompleted { id: r.id, at }),
                Status::Cancelled => events.push(Event::ReservationCancelled { id: r.id, at }),
            }
        }

        let mut quick: Vec<QuickReservation> = self.quick.iter().map(|q| q.value().clone()).collect();
        quick.sort_by_key(|q| (q.start, q.id));
        for q in quick {
            events.push(Event::QuickReservationStarted {
                id: q.id,
                spot_id: q.spot_id,
                plate: q.plate.clone(),
                vehicle_type: q.vehicle_type,
                at: q.start,
            });
            let at = q.end.unwrap_or(q.start);
            match (q.status, q.total_price) {
                (Status::Completed, Some(total_price)) => {
                    events.push(Event::QuickReservationCompleted {
                        id: q.id,
                        at,
                        total_price,
                    })
                }
                (Status::Active, _) => {}
                _ => events.push(Event::QuickReservationCancelled { id: q.id, at }),
            }
        }

        let mut sensor: Vec<SensorRecord> = self
            .sensor_log
            .iter()
            .flat_map(|log| log.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        sensor.sort_by_key(|r| r.at);
        events.extend(sensor.into_iter().map(Event::SensorRecorded));
        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn release_claim(
    record: &Reservation,
    txn: &mut TxnLocks,
    reason: ChangeReason,
    changes: &mut Vec<SpotChange>,
) {
    if let Some(vehicle) = txn.vehicle_mut(record.vehicle_id) {
        vehicle.claims.remove(record.id);
    }
    if let Some(state) = txn.spot_mut(record.spot_id) {
        state.claims.remove(record.id);
        state.refresh_occupancy();
        changes.push(change_for(state, reason, Some(record.id)));
    }
}

fn sorted_unique(ids: &[Ulid]) -> Vec<Ulid> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}
