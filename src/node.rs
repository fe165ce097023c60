use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::{Engine, Services};
use crate::expiry::{DurableExpiryQueue, ExpiryQueue};
use crate::notify::NotifyHub;
use crate::reaper;

/// A booted engine with its expiry worker and WAL compactor running.
pub struct Node {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
    pub expiry: Arc<DurableExpiryQueue>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(config: &Config) -> io::Result<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Replay both logs, reconcile expiry tasks, then spawn the background tasks.
    pub async fn start_with_clock(config: &Config, clock: Arc<dyn Clock>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let hub = Arc::new(NotifyHub::new());
        let expiry = Arc::new(DurableExpiryQueue::open(&config.expiry_path())?);
        let services = Services {
            notify: hub.clone(),
            expiry: expiry.clone(),
            clock,
            policy: config.policy,
        };
        let engine = Arc::new(Engine::new(config.wal_path(), services)?);
        engine.reconcile_expiry().await;

        let shutdown = CancellationToken::new();
        let queue: Arc<dyn ExpiryQueue> = expiry.clone();
        let tasks = vec![
            tokio::spawn(reaper::run_expiry_worker(
                engine.clone(),
                queue,
                Duration::from_millis(config.expiry_poll_ms),
                shutdown.clone(),
            )),
            tokio::spawn(reaper::run_compactor(
                engine.clone(),
                config.compact_threshold,
                shutdown.clone(),
            )),
        ];

        info!(data_dir = %config.data_dir.display(), "node started");
        Ok(Self {
            engine,
            hub,
            expiry,
            shutdown,
            tasks,
        })
    }

    /// Stop the background tasks and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::window;
    use crate::limits::HOUR_MS;
    use crate::model::*;
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    const NOON: Ms = 1_740_830_400_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkline_test_node").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn config(name: &str) -> Config {
        Config {
            data_dir: test_data_dir(name),
            expiry_poll_ms: 10,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn restart_reschedules_and_completes_overdue() {
        let config = config("overdue");
        let clock = Arc::new(ManualClock::new(NOON));
        let reservation = {
            let node = Node::start_with_clock(&config, clock.clone()).await.unwrap();
            let e = &node.engine;
            let (facility, floor, spot, user, car) =
                (Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new());
            e.register_facility(facility, "Node").await.unwrap();
            e.register_floor(floor, facility, "L1").await.unwrap();
            e.register_spot(spot, floor, "N1", VehicleType::Car, Decimal::ONE, true)
                .await
                .unwrap();
            e.register_vehicle(car, user, "ND1", VehicleType::Car).await.unwrap();
            let r = e
                .create_reservation(Ulid::new(), user, car, spot, window(NOON + HOUR_MS, NOON + 2 * HOUR_MS).unwrap())
                .await
                .unwrap();
            node.shutdown().await;
            r
        };

        // Down across the reservation's end.
        clock.set(NOON + 3 * HOUR_MS);
        let node = Node::start_with_clock(&config, clock).await.unwrap();
        let mut status = Status::Active;
        for _ in 0..200 {
            status = node.engine.get_reservation(reservation.id).unwrap().status;
            if status == Status::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Status::Completed);
        assert_eq!(node.expiry.len().await, 0);
        node.shutdown().await;
    }
}
