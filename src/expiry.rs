use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use ulid::Ulid;

use crate::model::Ms;
use crate::wal::Wal;

/// Durable, at-least-once delayed task queue keyed by reservation id.
///
/// A task stays in the queue until the worker acknowledges it, so a crash
/// between firing and acknowledging fires it again after restart.
#[async_trait]
pub trait ExpiryQueue: Send + Sync {
    /// Enqueue (or replace) the completion task for `key`.
    async fn schedule(&self, key: Ulid, fire_at: Ms) -> io::Result<()>;

    /// Remove the pending task for `key`. No-op if absent.
    async fn unschedule(&self, key: Ulid) -> io::Result<()>;

    /// When the task for `key` fires, if one is pending.
    async fn scheduled_at(&self, key: Ulid) -> Option<Ms>;

    /// Up to `limit` tasks with `fire_at <= now`, earliest first. Not removed.
    async fn due(&self, now: Ms, limit: usize) -> Vec<(Ulid, Ms)>;

    /// Remove `key` only if it is still scheduled at `fire_at`, so a task
    /// rescheduled while it was firing survives. Returns whether it was removed.
    async fn ack(&self, key: Ulid, fire_at: Ms) -> io::Result<bool>;

    async fn next_fire_at(&self) -> Option<Ms>;

    async fn len(&self) -> usize;

    /// Resolves when the queue changes. Default: never.
    async fn changed(&self) {
        futures::future::pending::<()>().await
    }
}

/// Record format of the expiry WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRecord {
    Scheduled { key: Ulid, fire_at: Ms },
    Unscheduled { key: Ulid },
}

#[derive(Debug, Default)]
struct TaskTable {
    by_key: HashMap<Ulid, Ms>,
    by_time: BTreeSet<(Ms, Ulid)>,
}

impl TaskTable {
    fn upsert(&mut self, key: Ulid, fire_at: Ms) {
        if let Some(old) = self.by_key.insert(key, fire_at) {
            self.by_time.remove(&(old, key));
        }
        self.by_time.insert((fire_at, key));
    }

    fn remove(&mut self, key: Ulid) -> Option<Ms> {
        let old = self.by_key.remove(&key)?;
        self.by_time.remove(&(old, key));
        Some(old)
    }

    fn apply(&mut self, record: &TaskRecord) {
        match record {
            TaskRecord::Scheduled { key, fire_at } => self.upsert(*key, *fire_at),
            TaskRecord::Unscheduled { key } => {
                self.remove(*key);
            }
        }
    }

    fn snapshot(&self) -> Vec<TaskRecord> {
        self.by_time
            .iter()
            .map(|&(fire_at, key)| TaskRecord::Scheduled { key, fire_at })
            .collect()
    }
}

struct Inner {
    wal: Wal<TaskRecord>,
    tasks: TaskTable,
}

impl Inner {
    /// WAL first, then memory. Replace-on-key is one record and one table update.
    fn write(&mut self, record: TaskRecord) -> io::Result<()> {
        self.wal.append(&record)?;
        self.tasks.apply(&record);
        let live = self.tasks.by_key.len() as u64;
        if self.wal.appends_since_compact() > 1024 + 4 * live {
            let snapshot = self.tasks.snapshot();
            self.wal.compact(&snapshot)?;
        }
        Ok(())
    }
}

/// `ExpiryQueue` persisted in its own WAL file, separate from the engine log.
pub struct DurableExpiryQueue {
    inner: Arc<Mutex<Inner>>,
    changed: Notify,
}

impl DurableExpiryQueue {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut tasks = TaskTable::default();
        for record in Wal::<TaskRecord>::replay(path)? {
            tasks.apply(&record);
        }
        let mut wal = Wal::open(path)?;
        // Start each run from a compact file.
        wal.compact(&tasks.snapshot())?;
        tracing::info!(
            path = %path.display(),
            pending = tasks.by_key.len(),
            "expiry queue loaded"
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { wal, tasks })),
            changed: Notify::new(),
        })
    }

    /// Run a mutation on the blocking pool while holding the queue lock.
    /// The WAL append fsyncs, so it stays off the runtime workers.
    async fn mutate<T, F>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce(&mut Inner) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut inner = self.inner.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *inner))
            .await
            .map_err(io::Error::other)?
    }
}

#[async_trait]
impl ExpiryQueue for DurableExpiryQueue {
    async fn schedule(&self, key: Ulid, fire_at: Ms) -> io::Result<()> {
        self.mutate(move |inner| inner.write(TaskRecord::Scheduled { key, fire_at }))
            .await?;
        self.changed.notify_waiters();
        Ok(())
    }

    async fn unschedule(&self, key: Ulid) -> io::Result<()> {
        let removed = self
            .mutate(move |inner| {
                if !inner.tasks.by_key.contains_key(&key) {
                    return Ok(false);
                }
                inner.write(TaskRecord::Unscheduled { key })?;
                Ok(true)
            })
            .await?;
        if removed {
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn scheduled_at(&self, key: Ulid) -> Option<Ms> {
        self.inner.lock().await.tasks.by_key.get(&key).copied()
    }

    async fn due(&self, now: Ms, limit: usize) -> Vec<(Ulid, Ms)> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .by_time
            .iter()
            .take_while(|(fire_at, _)| *fire_at <= now)
            .take(limit)
            .map(|&(fire_at, key)| (key, fire_at))
            .collect()
    }

    async fn ack(&self, key: Ulid, fire_at: Ms) -> io::Result<bool> {
        self.mutate(move |inner| {
            if inner.tasks.by_key.get(&key) != Some(&fire_at) {
                return Ok(false);
            }
            inner.write(TaskRecord::Unscheduled { key })?;
            Ok(true)
        })
        .await
    }

    async fn next_fire_at(&self) -> Option<Ms> {
        let inner = self.inner.lock().await;
        inner.tasks.by_time.first().map(|&(fire_at, _)| fire_at)
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.tasks.by_key.len()
    }

    async fn changed(&self) {
        self.changed.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkline_test_expiry");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn schedule_replaces_existing_key() {
        let q = DurableExpiryQueue::open(&test_path("replace.wal")).unwrap();
        let key = Ulid::new();
        q.schedule(key, 1_000).await.unwrap();
        q.schedule(key, 5_000).await.unwrap();

        assert_eq!(q.len().await, 1);
        assert_eq!(q.scheduled_at(key).await, Some(5_000));
        assert!(q.due(1_000, 10).await.is_empty());
        assert_eq!(q.due(5_000, 10).await, vec![(key, 5_000)]);
    }

    #[tokio::test]
    async fn unschedule_absent_is_noop() {
        let q = DurableExpiryQueue::open(&test_path("unschedule_absent.wal")).unwrap();
        q.unschedule(Ulid::new()).await.unwrap();
        assert_eq!(q.len().await, 0);
        assert_eq!(q.next_fire_at().await, None);
    }

    #[tokio::test]
    async fn due_is_ordered_and_limited() {
        let q = DurableExpiryQueue::open(&test_path("due_order.wal")).unwrap();
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        q.schedule(a, 300).await.unwrap();
        q.schedule(b, 100).await.unwrap();
        q.schedule(c, 200).await.unwrap();

        assert_eq!(q.next_fire_at().await, Some(100));
        assert_eq!(q.due(250, 10).await, vec![(b, 100), (c, 200)]);
        assert_eq!(q.due(1_000, 1).await, vec![(b, 100)]);
    }

    #[tokio::test]
    async fn ack_ignores_rescheduled_task() {
        let q = DurableExpiryQueue::open(&test_path("ack_stale.wal")).unwrap();
        let key = Ulid::new();
        q.schedule(key, 100).await.unwrap();
        q.schedule(key, 900).await.unwrap();

        assert!(!q.ack(key, 100).await.unwrap());
        assert_eq!(q.scheduled_at(key).await, Some(900));
        assert!(q.ack(key, 900).await.unwrap());
        assert_eq!(q.len().await, 0);
    }

    #[tokio::test]
    async fn tasks_survive_reopen() {
        let path = test_path("reopen.wal");
        let (kept, dropped) = (Ulid::new(), Ulid::new());
        {
            let q = DurableExpiryQueue::open(&path).unwrap();
            q.schedule(kept, 100).await.unwrap();
            q.schedule(kept, 200).await.unwrap();
            q.schedule(dropped, 300).await.unwrap();
            q.unschedule(dropped).await.unwrap();
        }
        let q = DurableExpiryQueue::open(&path).unwrap();
        assert_eq!(q.len().await, 1);
        assert_eq!(q.scheduled_at(kept).await, Some(200));
        assert_eq!(q.scheduled_at(dropped).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_leave_one_task_per_key() {
        let path = test_path("concurrent.wal");
        let q = std::sync::Arc::new(DurableExpiryQueue::open(&path).unwrap());
        let keys: Vec<Ulid> = (0..8).map(|_| Ulid::new()).collect();
        let mut handles = Vec::new();
        for (i, key) in keys.iter().copied().enumerate() {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..20 {
                    q.schedule(key, (i * 100 + n) as Ms).await.unwrap();
                }
                if i % 2 == 0 {
                    q.unschedule(key).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(q.len().await, 4);
        drop(q);
        let q = DurableExpiryQueue::open(&path).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let expected = (i % 2 == 1).then_some((i * 100 + 19) as Ms);
            assert_eq!(q.scheduled_at(*key).await, expected);
        }
    }

    #[tokio::test]
    async fn heavy_churn_compacts() {
        let path = test_path("churn.wal");
        let q = DurableExpiryQueue::open(&path).unwrap();
        let key = Ulid::new();
        for i in 0..3_000 {
            q.schedule(key, i).await.unwrap();
        }
        let size = std::fs::metadata(&path).unwrap().len();
        // 3000 uncompacted records would be well over 100KB
        assert!(size < 100_000, "size {size}");
        drop(q);
        let q = DurableExpiryQueue::open(&path).unwrap();
        assert_eq!(q.scheduled_at(key).await, Some(2_999));
    }

    #[tokio::test]
    async fn changed_wakes_on_schedule() {
        let q = std::sync::Arc::new(DurableExpiryQueue::open(&test_path("wake.wal")).unwrap());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.changed().await })
        };
        tokio::task::yield_now().await;
        // Retry until the waiter has registered.
        for _ in 0..50 {
            q.schedule(Ulid::new(), 10).await.unwrap();
            if waiter.is_finished() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
