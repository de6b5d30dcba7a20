//! Durable queue persistence and restore.
//!
//! The queue snapshot (tracks, current index, playhead position) is
//! persisted so a restart resumes where the listener left off:
//!
//! * **Debounced** - 2 s after the last queue mutation
//! * **Periodic** - while playing, at most every 5 s, forced early when
//!   the playhead moved 15 s or more since the last save
//! * **Synchronous** - on pause and stop
//!
//! On startup the snapshot is restored only when it is younger than five
//! minutes; a listener returning hours later expects a clean slate, not a
//! stale queue.
//!
//! Storage goes through the [`StateStore`] trait - a stand-in for
//! whatever persistent map the embedding application provides. The
//! bundled [`JsonFileStore`] keeps one JSON file per key.

use std::{
    path::PathBuf,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::Result, track::Track};

/// Snapshot age beyond which a restore is refused.
const RESTORE_TTL: Duration = Duration::from_secs(5 * 60);

/// Quiet period after the last mutation before a debounced save runs.
pub const DEBOUNCE_DELAY: Duration = Duration::from_secs(2);

/// Minimum interval between periodic saves while playing.
const PERIODIC_INTERVAL: Duration = Duration::from_secs(5);

/// Playhead delta that forces a periodic save early.
const FORCE_SAVE_DELTA: Duration = Duration::from_secs(15);

/// Store key of the queue snapshot.
const QUEUE_KEY: &str = "player_queue";

/// Store key of the one-shot duration migration flag.
const DURATION_MIGRATION_KEY: &str = "queue_duration_migrated";

/// Generic persistent string map.
///
/// Out-of-scope collaborator: the embedding application decides where
/// state lives (key-value box, settings store, plain files).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a value.
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;

    /// Writes a value.
    async fn put_raw(&self, key: &str, value: &str) -> Result<()>;

    /// Removes a value.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// [`StateStore`] keeping one JSON file per key in a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Creates a store under the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write-then-rename so a crash never leaves a torn snapshot.
        let path = self.path_for(key);
        let temp = path.with_extension("json.part");
        tokio::fs::write(&temp, value).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// On-disk queue snapshot format.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    queue: Vec<Track>,
    current_index: i64,
    position_ms: i64,
    saved_at_ms: i64,
}

/// A restored queue snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct RestoredQueue {
    /// Tracks in playing order.
    pub queue: Vec<Track>,
    /// Current index, clamped into the restored queue.
    pub current_index: usize,
    /// Playhead position to seek to once the track is ready.
    pub position: Duration,
}

/// Decides when a periodic save is due.
///
/// Pure bookkeeping over the playhead; the controller consults it on
/// position ticks while playing.
#[derive(Debug, Default)]
pub struct PeriodicGate {
    last_save: Option<tokio::time::Instant>,
    last_position: Duration,
}

impl PeriodicGate {
    /// Returns whether a save is due at this position tick, and records
    /// it as done when it is.
    pub fn should_save(&mut self, position: Duration) -> bool {
        let now = tokio::time::Instant::now();

        let due = match self.last_save {
            None => true,
            Some(last) => {
                let elapsed = now.duration_since(last);
                elapsed >= PERIODIC_INTERVAL
                    || position
                        .checked_sub(self.last_position)
                        .or_else(|| self.last_position.checked_sub(position))
                        .is_some_and(|delta| delta >= FORCE_SAVE_DELTA)
            }
        };

        if due {
            self.last_save = Some(now);
            self.last_position = position;
        }
        due
    }
}

/// Queue persistence over a [`StateStore`].
pub struct QueuePersistor {
    store: std::sync::Arc<dyn StateStore>,

    /// Handle of the pending debounced save, if any.
    pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueuePersistor {
    /// Creates a persistor over the given store.
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn StateStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(None),
        }
    }

    /// Saves a snapshot immediately.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the store write fails.
    pub async fn save(
        &self,
        queue: &[Track],
        current_index: Option<usize>,
        position: Duration,
    ) -> Result<()> {
        let snapshot = PersistedQueue {
            version: 1,
            queue: queue.to_vec(),
            current_index: current_index.map_or(-1, |index| {
                i64::try_from(index).unwrap_or(i64::MAX)
            }),
            position_ms: i64::try_from(position.as_millis()).unwrap_or(i64::MAX),
            saved_at_ms: now_ms(),
        };

        let json = serde_json::to_string(&snapshot)?;
        self.store.put_raw(QUEUE_KEY, &json).await?;
        trace!("persisted queue of {} tracks", snapshot.queue.len());
        Ok(())
    }

    /// Schedules a debounced save two seconds out.
    ///
    /// A newer schedule replaces a pending one, so a burst of mutations
    /// produces a single write.
    pub fn schedule_debounced(
        self: &std::sync::Arc<Self>,
        queue: Vec<Track>,
        current_index: Option<usize>,
        position: Duration,
    ) {
        let persistor = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_DELAY).await;
            if let Err(e) = persistor.save(&queue, current_index, position).await {
                error!("debounced queue save failed: {e}");
            }
        });

        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Cancels a pending debounced save.
    pub fn cancel_pending(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }

    /// Loads the snapshot, TTL-gated.
    ///
    /// Returns `None` when nothing was saved, the snapshot is older than
    /// five minutes, or the format version is unknown. The restored index
    /// is clamped into the restored queue.
    ///
    /// # Errors
    ///
    /// Returns error if the store read fails; a corrupt snapshot is
    /// treated as absent.
    pub async fn load(&self) -> Result<Option<RestoredQueue>> {
        let Some(json) = self.store.get_raw(QUEUE_KEY).await? else {
            return Ok(None);
        };

        let snapshot: PersistedQueue = match serde_json::from_str(&json) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("discarding corrupt queue snapshot: {e}");
                self.store.remove(QUEUE_KEY).await.ok();
                return Ok(None);
            }
        };

        if snapshot.version != 1 {
            warn!("discarding queue snapshot of unknown version {}", snapshot.version);
            return Ok(None);
        }

        let age_ms = now_ms().saturating_sub(snapshot.saved_at_ms);
        if age_ms < 0 || Duration::from_millis(age_ms.unsigned_abs()) > RESTORE_TTL {
            debug!("queue snapshot expired ({age_ms} ms old)");
            return Ok(None);
        }

        if snapshot.queue.is_empty() {
            return Ok(None);
        }

        let current_index = usize::try_from(snapshot.current_index.max(0))
            .unwrap_or_default()
            .min(snapshot.queue.len() - 1);

        Ok(Some(RestoredQueue {
            current_index,
            position: Duration::from_millis(snapshot.position_ms.max(0).unsigned_abs()),
            queue: snapshot.queue,
        }))
    }

    /// Returns whether the one-shot duration migration still has to run.
    ///
    /// # Errors
    ///
    /// Returns error if the store read fails.
    pub async fn needs_duration_migration(&self) -> Result<bool> {
        Ok(self.store.get_raw(DURATION_MIGRATION_KEY).await?.is_none())
    }

    /// Marks the duration migration as done.
    ///
    /// # Errors
    ///
    /// Returns error if the store write fails.
    pub async fn mark_duration_migrated(&self) -> Result<()> {
        self.store.put_raw(DURATION_MIGRATION_KEY, "1").await
    }
}

/// Current wall clock in milliseconds since the epoch.
fn now_ms() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Title {id}"), "Artist", Duration::from_secs(180))
    }

    fn scratch_store(tag: &str) -> (PathBuf, Arc<JsonFileStore>) {
        let dir = std::env::temp_dir().join(format!(
            "cadenza-persist-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        (dir.clone(), Arc::new(JsonFileStore::new(dir)))
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let (dir, store) = scratch_store("roundtrip");
        let persistor = QueuePersistor::new(store);

        let queue = vec![track("a"), track("b"), track("c")];
        persistor
            .save(&queue, Some(1), Duration::from_secs(42))
            .await
            .unwrap();

        let restored = persistor.load().await.unwrap().unwrap();
        assert_eq!(restored.queue, queue);
        assert_eq!(restored.current_index, 1);
        assert_eq!(restored.position, Duration::from_secs(42));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn stale_snapshot_is_refused() {
        let (dir, store) = scratch_store("ttl");
        let persistor = QueuePersistor::new(Arc::clone(&store) as Arc<dyn StateStore>);

        // Write a snapshot aged six minutes.
        let snapshot = PersistedQueue {
            version: 1,
            queue: vec![track("a")],
            current_index: 0,
            position_ms: 1000,
            saved_at_ms: now_ms() - 6 * 60 * 1000,
        };
        store
            .put_raw(QUEUE_KEY, &serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        assert!(persistor.load().await.unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn restored_index_is_clamped() {
        let (dir, store) = scratch_store("clamp");
        let persistor = QueuePersistor::new(Arc::clone(&store) as Arc<dyn StateStore>);

        let snapshot = PersistedQueue {
            version: 1,
            queue: vec![track("a"), track("b")],
            current_index: 9,
            position_ms: 0,
            saved_at_ms: now_ms(),
        };
        store
            .put_raw(QUEUE_KEY, &serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        let restored = persistor.load().await.unwrap().unwrap();
        assert_eq!(restored.current_index, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_discarded() {
        let (dir, store) = scratch_store("corrupt");
        let persistor = QueuePersistor::new(Arc::clone(&store) as Arc<dyn StateStore>);

        store.put_raw(QUEUE_KEY, "not json at all").await.unwrap();
        assert!(persistor.load().await.unwrap().is_none());
        // And it cleaned up after itself.
        assert!(store.get_raw(QUEUE_KEY).await.unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn debounce_replaces_pending_saves() {
        let (dir, store) = scratch_store("debounce");
        let persistor = Arc::new(QueuePersistor::new(store as Arc<dyn StateStore>));

        persistor.schedule_debounced(vec![track("a")], Some(0), Duration::ZERO);
        persistor.schedule_debounced(vec![track("a"), track("b")], Some(1), Duration::ZERO);

        tokio::time::sleep(DEBOUNCE_DELAY + Duration::from_millis(300)).await;

        let restored = persistor.load().await.unwrap().unwrap();
        assert_eq!(restored.queue.len(), 2);
        assert_eq!(restored.current_index, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn periodic_gate_intervals() {
        tokio::time::pause();
        let mut gate = PeriodicGate::default();

        assert!(gate.should_save(Duration::from_secs(0)));
        assert!(!gate.should_save(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(gate.should_save(Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn periodic_gate_forces_on_position_jump() {
        tokio::time::pause();
        let mut gate = PeriodicGate::default();

        assert!(gate.should_save(Duration::from_secs(0)));
        // A seek 20 s ahead forces a save before the interval elapses.
        assert!(gate.should_save(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn migration_flag_is_one_shot() {
        let (dir, store) = scratch_store("migration");
        let persistor = QueuePersistor::new(store as Arc<dyn StateStore>);

        assert!(persistor.needs_duration_migration().await.unwrap());
        persistor.mark_duration_migrated().await.unwrap();
        assert!(!persistor.needs_duration_migration().await.unwrap());

        std::fs::remove_dir_all(&dir).ok();
    }
}
