use ulid::Ulid;

use crate::limits::MAX_ROWS_PER_QUERY;
use crate::model::*;

use super::{Engine, SharedSpotState};

impl Engine {
    pub fn facility(&self, id: Ulid) -> Option<Facility> {
        self.facilities.get(&id).map(|f| f.value().clone())
    }

    pub fn vehicle(&self, id: Ulid) -> Option<Vehicle> {
        self.vehicle_catalog.get(&id).map(|v| v.value().clone())
    }

    pub fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        self.reservations.get(&id).map(|r| r.value().clone())
    }

    /// A user's or a facility's reservations, sorted by start time. At most
    /// `MAX_ROWS_PER_QUERY` rows, earliest first.
    pub fn list_reservations(&self, filter: ReservationFilter, scope: Scope) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| match filter {
                ReservationFilter::User(user_id) => r.user_id == user_id,
                ReservationFilter::Facility(facility_id) => r.facility_id == facility_id,
            })
            .filter(|r| scope.admits(r.status))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        head(out, MAX_ROWS_PER_QUERY)
    }

    pub fn get_quick_reservation(&self, id: Ulid) -> Option<QuickReservation> {
        self.quick.get(&id).map(|q| q.value().clone())
    }

    /// The Active walk-in for a plate, if any.
    pub fn active_walk_in(&self, plate: &str) -> Option<QuickReservation> {
        let id = *self.active_plates.get(plate)?;
        self.get_quick_reservation(id)
    }

    pub fn list_quick_reservations(&self, facility_id: Ulid, scope: Scope) -> Vec<QuickReservation> {
        let mut out: Vec<QuickReservation> = self
            .quick
            .iter()
            .filter(|q| q.facility_id == facility_id && scope.admits(q.status))
            .map(|q| q.value().clone())
            .collect();
        out.sort_by_key(|q| (q.start, q.id));
        head(out, MAX_ROWS_PER_QUERY)
    }

    fn spot_handles(&self, facility_id: Ulid) -> Vec<SharedSpotState> {
        self.spot_catalog
            .iter()
            .filter(|s| s.facility_id == facility_id)
            .filter_map(|s| self.spots.get(&s.id).map(|e| e.value().clone()))
            .collect()
    }

    pub async fn spot(&self, id: Ulid) -> Option<SpotInfo> {
        let state = self.spots.get(&id).map(|e| e.value().clone())?;
        let guard = state.read().await;
        Some(spot_info(&guard))
    }

    /// All spots in a facility with their current occupancy, sorted by label.
    pub async fn list_spots(&self, facility_id: Ulid) -> Vec<SpotInfo> {
        let mut out = Vec::new();
        for state in self.spot_handles(facility_id) {
            let guard = state.read().await;
            out.push(spot_info(&guard));
        }
        out.sort_by(|a, b| a.spot.label.cmp(&b.spot.label));
        head(out, MAX_ROWS_PER_QUERY)
    }

    pub async fn occupancy_summary(&self, facility_id: Ulid) -> OccupancySummary {
        let mut summary = OccupancySummary::default();
        for state in self.spot_handles(facility_id) {
            match state.read().await.occupancy {
                Occupancy::Free => summary.free += 1,
                Occupancy::Reserved => summary.reserved += 1,
                Occupancy::Occupied => summary.occupied += 1,
            }
        }
        summary
    }

    /// Recent sensor events for a facility, oldest first. Keeps the newest
    /// `MAX_ROWS_PER_QUERY` when there are more.
    pub fn sensor_log(&self, facility_id: Ulid, anomalies_only: bool) -> Vec<SensorRecord> {
        let Some(log) = self.sensor_log.get(&facility_id) else {
            return Vec::new();
        };
        let rows = log
            .iter()
            .filter(|r| !anomalies_only || r.outcome == SensorOutcome::Anomaly)
            .cloned()
            .collect();
        tail(rows, MAX_ROWS_PER_QUERY)
    }
}

fn head<T>(mut rows: Vec<T>, limit: usize) -> Vec<T> {
    rows.truncate(limit);
    rows
}

fn tail<T>(mut rows: Vec<T>, limit: usize) -> Vec<T> {
    let excess = rows.len().saturating_sub(limit);
    rows.drain(..excess);
    rows
}

fn spot_info(state: &SpotState) -> SpotInfo {
    SpotInfo {
        spot: state.spot.clone(),
        occupancy: state.occupancy,
        active_reservations: state.claims.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_keeps_earliest_rows() {
        assert_eq!(head(vec![1, 2, 3, 4], 2), vec![1, 2]);
        assert_eq!(head(vec![1, 2], 5), vec![1, 2]);
    }

    #[test]
    fn tail_keeps_newest_rows() {
        assert_eq!(tail(vec![1, 2, 3, 4], 3), vec![2, 3, 4]);
        assert_eq!(tail(vec![1], 3), vec![1]);
        assert!(tail(Vec::<u8>::new(), 0).is_empty());
    }
}
