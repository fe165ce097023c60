use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError, ErrorKind, Expiry};
use crate::expiry::ExpiryQueue;
use crate::model::Ms;
use crate::observability::{EXPIRY_FIRED_TOTAL, EXPIRY_PENDING};

/// Tasks fired per pass before the worker re-checks the clock.
const FIRE_BATCH: usize = 256;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Fire every task due at `now`. A task is acknowledged once its reservation
/// is completed, already closed, or gone. A stale task is replaced by one at
/// the reservation's current end. Internal failures stay queued and are
/// retried on the next pass. Returns how many tasks were acknowledged.
pub async fn fire_due(engine: &Engine, queue: &dyn ExpiryQueue, now: Ms) -> usize {
    let mut acked = 0;
    for (id, fire_at) in queue.due(now, FIRE_BATCH).await {
        let outcome = match engine.expire_reservation(id, fire_at).await {
            Ok(Expiry::Completed(_)) => "completed",
            Ok(Expiry::AlreadyClosed(_)) => "skipped",
            Ok(Expiry::Rescheduled(_)) => {
                metrics::counter!(EXPIRY_FIRED_TOTAL, "outcome" => "rescheduled").increment(1);
                continue;
            }
            Err(EngineError::NotFound(..)) => "missing",
            Err(e) if e.kind() != ErrorKind::Internal => {
                debug!(reservation = %id, "expiry dropped: {e}");
                "rejected"
            }
            Err(e) => {
                error!(reservation = %id, "expiry failed, will retry: {e}");
                metrics::counter!(EXPIRY_FIRED_TOTAL, "outcome" => "retry").increment(1);
                continue;
            }
        };
        metrics::counter!(EXPIRY_FIRED_TOTAL, "outcome" => outcome).increment(1);
        match queue.ack(id, fire_at).await {
            Ok(_) => acked += 1,
            Err(e) => error!(reservation = %id, "failed to ack expiry task: {e}"),
        }
    }
    acked
}

/// Background task that completes reservations when their window ends.
pub async fn run_expiry_worker(
    engine: Arc<Engine>,
    queue: Arc<dyn ExpiryQueue>,
    poll: Duration,
    shutdown: CancellationToken,
) {
    let pending = queue.len().await;
    info!(pending, "expiry worker started");
    loop {
        let now = engine.now();
        let acked = fire_due(&engine, queue.as_ref(), now).await;
        metrics::gauge!(EXPIRY_PENDING).set(queue.len().await as f64);
        if acked >= FIRE_BATCH {
            continue;
        }

        // Sleep until the next task is due, capped at the poll interval.
        // Tasks still due after a pass are failing; wait a full poll before retrying.
        let wait = match queue.next_fire_at().await {
            Some(at) if at > now => Duration::from_millis((at - now) as u64).min(poll),
            Some(_) if acked > 0 => Duration::ZERO,
            _ => poll,
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = queue.changed() => {}
            _ = shutdown.cancelled() => break,
        }
    }
    info!("expiry worker stopped");
}

/// Background task that compacts the WAL once enough appends have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BookingPolicy;
    use crate::engine::{window, Services};
    use crate::expiry::DurableExpiryQueue;
    use crate::limits::{HOUR_MS, MINUTE_MS};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    const NOON: Ms = 1_740_830_400_000;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkline_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Setup {
        engine: Arc<Engine>,
        queue: Arc<DurableExpiryQueue>,
        clock: Arc<ManualClock>,
        user: Ulid,
        car: Ulid,
        spot: Ulid,
    }

    async fn setup(name: &str) -> Setup {
        let clock = Arc::new(ManualClock::new(NOON));
        let queue = Arc::new(DurableExpiryQueue::open(&test_path(&format!("{name}.expiry.wal"))).unwrap());
        let services = Services {
            notify: Arc::new(NotifyHub::new()),
            expiry: queue.clone(),
            clock: clock.clone(),
            policy: BookingPolicy::default(),
        };
        let engine = Arc::new(Engine::new(test_path(&format!("{name}.wal")), services).unwrap());

        let (facility, floor, spot) = (Ulid::new(), Ulid::new(), Ulid::new());
        let (user, car) = (Ulid::new(), Ulid::new());
        engine.register_facility(facility, "Reaper").await.unwrap();
        engine.register_floor(floor, facility, "G").await.unwrap();
        engine
            .register_spot(spot, floor, "R1", VehicleType::Car, Decimal::new(100, 2), true)
            .await
            .unwrap();
        engine
            .register_vehicle(car, user, "RP1", VehicleType::Car)
            .await
            .unwrap();
        Setup {
            engine,
            queue,
            clock,
            user,
            car,
            spot,
        }
    }

    impl Setup {
        async fn book(&self, start: Ms, end: Ms) -> Reservation {
            self.engine
                .create_reservation(Ulid::new(), self.user, self.car, self.spot, window(start, end).unwrap())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn fires_only_due_tasks() {
        let s = setup("fires_due").await;
        let early = s.book(NOON + HOUR_MS, NOON + 2 * HOUR_MS).await;
        let late = s.book(NOON + 3 * HOUR_MS, NOON + 4 * HOUR_MS).await;

        s.clock.set(NOON + 2 * HOUR_MS);
        assert_eq!(fire_due(&s.engine, s.queue.as_ref(), s.engine.now()).await, 1);

        assert_eq!(s.engine.get_reservation(early.id).unwrap().status, Status::Completed);
        assert_eq!(s.engine.get_reservation(late.id).unwrap().status, Status::Active);
        assert_eq!(s.queue.len().await, 1);
    }

    #[tokio::test]
    async fn cancelled_reservation_is_not_completed() {
        let s = setup("cancelled_skip").await;
        let r = s.book(NOON + HOUR_MS, NOON + 2 * HOUR_MS).await;
        s.engine.cancel_reservation(r.id).await.unwrap();
        // Simulate a task left behind by a crash between commit and unschedule.
        s.queue.schedule(r.id, r.span.end).await.unwrap();

        s.clock.set(NOON + 3 * HOUR_MS);
        assert_eq!(fire_due(&s.engine, s.queue.as_ref(), s.engine.now()).await, 1);
        assert_eq!(s.engine.get_reservation(r.id).unwrap().status, Status::Cancelled);
        assert_eq!(s.queue.len().await, 0);
    }

    #[tokio::test]
    async fn modified_reservation_fires_at_new_end() {
        let s = setup("modified_end").await;
        let r = s.book(NOON + HOUR_MS, NOON + 2 * HOUR_MS).await;
        s.engine
            .modify_reservation(r.id, s.car, s.spot, window(NOON + HOUR_MS, NOON + 3 * HOUR_MS).unwrap())
            .await
            .unwrap();

        s.clock.set(NOON + 2 * HOUR_MS + 30 * MINUTE_MS);
        assert_eq!(fire_due(&s.engine, s.queue.as_ref(), s.engine.now()).await, 0);
        assert_eq!(s.engine.get_reservation(r.id).unwrap().status, Status::Active);

        s.clock.set(NOON + 3 * HOUR_MS);
        assert_eq!(fire_due(&s.engine, s.queue.as_ref(), s.engine.now()).await, 1);
        assert_eq!(s.engine.get_reservation(r.id).unwrap().status, Status::Completed);
    }

    #[tokio::test]
    async fn stale_task_is_rescheduled_not_fired() {
        let s = setup("stale_task").await;
        let r = s.book(NOON + HOUR_MS, NOON + 2 * HOUR_MS).await;
        s.engine
            .modify_reservation(r.id, s.car, s.spot, window(NOON + HOUR_MS, NOON + 4 * HOUR_MS).unwrap())
            .await
            .unwrap();
        // A schedule for the old window that reached the queue last.
        s.queue.schedule(r.id, r.span.end).await.unwrap();

        s.clock.set(r.span.end);
        assert_eq!(fire_due(&s.engine, s.queue.as_ref(), s.engine.now()).await, 0);
        assert_eq!(s.engine.get_reservation(r.id).unwrap().status, Status::Active);
        assert_eq!(s.queue.scheduled_at(r.id).await, Some(NOON + 4 * HOUR_MS));

        s.clock.set(NOON + 4 * HOUR_MS);
        assert_eq!(fire_due(&s.engine, s.queue.as_ref(), s.engine.now()).await, 1);
        assert_eq!(s.engine.get_reservation(r.id).unwrap().status, Status::Completed);
        assert_eq!(s.queue.len().await, 0);
    }

    #[tokio::test]
    async fn worker_completes_and_stops_on_shutdown() {
        let s = setup("worker").await;
        let r = s.book(NOON + HOUR_MS, NOON + 2 * HOUR_MS).await;
        s.clock.set(NOON + 2 * HOUR_MS);

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_expiry_worker(
            s.engine.clone(),
            s.queue.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        let mut done = false;
        for _ in 0..200 {
            if s.engine.get_reservation(r.id).unwrap().status == Status::Completed {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done, "worker never completed the reservation");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
