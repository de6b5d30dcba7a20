//! Automatic queue extension with related tracks ("radio").
//!
//! Radio mode keeps a near-empty queue alive: when few tracks remain
//! after the current index, the extender asks the external recommender
//! for tracks related to a seed and appends the ones the listener has not
//! seen this session.
//!
//! # Seed Rotation
//!
//! The first fetch seeds from the track that started the radio. Later
//! fetches pick a seed from the last 30% of the queue, rotating with the
//! fetch counter so consecutive fetches explore different neighborhoods.
//! When a fetch returns only duplicates, the seed is re-picked at random
//! from the middle of the queue and nothing is appended; the next trigger
//! fetches from the fresh seed.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    error::Result,
    queue::QueueModel,
    track::{Track, TrackId},
};

/// Queue tail length that triggers an extension.
const EXTEND_THRESHOLD: usize = 5;

/// Maximum related tracks requested per fetch.
const FETCH_LIMIT: usize = 25;

/// Share of the queue tail that seeds rotate over.
const SEED_TAIL_SHARE: f64 = 0.3;

/// External recommender contract.
///
/// Out-of-scope collaborator: given a seed track, returns up to `limit`
/// related tracks in recommendation order.
#[async_trait]
pub trait RelatedSource: Send + Sync {
    /// Fetches tracks related to the seed.
    ///
    /// # Errors
    ///
    /// Returns error when the recommender is unreachable.
    async fn related(&self, seed_id: &str, limit: usize) -> Result<Vec<Track>>;
}

/// Automatic queue extension state.
pub struct RadioExtender {
    source: std::sync::Arc<dyn RelatedSource>,

    /// Ids ever offered this radio session, including rejected ones.
    seen_ids: HashSet<TrackId>,

    /// Number of completed fetches; rotates the seed window.
    fetch_count: u32,

    /// Seed for the next fetch.
    seed_id: Option<TrackId>,

    /// Set when the seed was re-picked after an all-duplicate fetch; the
    /// next fetch then uses it instead of the tail rotation.
    reseeded: bool,
}

impl RadioExtender {
    /// Creates an extender over the recommender contract.
    #[must_use]
    pub fn new(source: std::sync::Arc<dyn RelatedSource>) -> Self {
        Self {
            source,
            seen_ids: HashSet::new(),
            fetch_count: 0,
            seed_id: None,
            reseeded: false,
        }
    }

    /// Starts a radio session seeded by the given track.
    pub fn reset(&mut self, seed: &Track) {
        self.seen_ids.clear();
        self.seen_ids.insert(seed.id.clone());
        self.fetch_count = 0;
        self.seed_id = Some(seed.id.clone());
        self.reseeded = false;
    }

    /// Seed the next fetch will use.
    #[must_use]
    pub fn seed_id(&self) -> Option<&str> {
        self.seed_id.as_deref()
    }

    /// Returns whether the queue is low enough to warrant an extension.
    #[must_use]
    pub fn should_extend(&self, queue: &QueueModel) -> bool {
        !queue.is_empty() && queue.remaining_after_current() <= EXTEND_THRESHOLD
    }

    /// Fetches related tracks and appends the unseen ones.
    ///
    /// Returns the number of appended tracks. Zero appends with a
    /// successful fetch mean everything was a duplicate; in that case the
    /// seed is re-picked from the middle of the queue for the next round.
    ///
    /// # Errors
    ///
    /// Returns error when the recommender is unreachable; the session
    /// state is unchanged so the next trigger retries.
    pub async fn extend(&mut self, queue: &mut QueueModel) -> Result<usize> {
        let seed = self.pick_seed(queue);
        let Some(seed) = seed else {
            return Ok(0);
        };

        debug!("radio fetch #{} seeded by {seed}", self.fetch_count);
        let related = self.source.related(&seed, FETCH_LIMIT).await?;
        self.fetch_count += 1;

        let queued: HashSet<TrackId> = queue.track_ids().into_iter().collect();
        let fresh: Vec<Track> = related
            .into_iter()
            .filter(|track| !queued.contains(&track.id) && !self.seen_ids.contains(&track.id))
            .collect();

        for track in &fresh {
            self.seen_ids.insert(track.id.clone());
        }

        if fresh.is_empty() {
            // Exhausted this neighborhood: jump the seed to the middle of
            // the queue and let the next trigger explore from there.
            let len = queue.len();
            if len > 0 {
                let middle_start = len / 3;
                let middle_len = (len / 3).max(1);
                let index = middle_start + fastrand::usize(0..middle_len);
                if let Some(track) = queue.track_at(index.min(len - 1)) {
                    info!("radio neighborhood exhausted, re-seeding from {track}");
                    self.seed_id = Some(track.id.clone());
                    self.reseeded = true;
                }
            }
            return Ok(0);
        }

        // Move the seed into the new batch for variety.
        let pick = fastrand::usize(0..fresh.len());
        self.seed_id = Some(fresh[pick].id.clone());

        let appended = fresh.len();
        info!("radio appended {appended} tracks");
        queue.append(fresh);
        Ok(appended)
    }

    /// Selects the seed for this fetch.
    ///
    /// First fetch uses the session seed; later fetches rotate over the
    /// last 30% of the queue by fetch count.
    fn pick_seed(&mut self, queue: &QueueModel) -> Option<TrackId> {
        if self.fetch_count == 0 || self.reseeded || queue.is_empty() {
            self.reseeded = false;
            return self.seed_id.clone();
        }

        let len = queue.len();
        #[expect(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let tail_len = ((len as f64 * SEED_TAIL_SHARE).ceil() as usize).clamp(1, len);
        let tail_start = len - tail_len;
        let index = tail_start + (self.fetch_count as usize % tail_len);

        queue.track_at(index).map(|track| track.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Title {id}"), "Artist", Duration::from_secs(200))
    }

    /// Recommender returning a fixed list regardless of seed.
    struct FixedRelated(Vec<Track>);

    #[async_trait]
    impl RelatedSource for FixedRelated {
        async fn related(&self, _seed_id: &str, limit: usize) -> Result<Vec<Track>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    fn radio_queue() -> QueueModel {
        let mut queue = QueueModel::default();
        queue.install(vec![track("seed")], 0, None);
        queue
    }

    #[tokio::test]
    async fn extend_appends_unseen_tracks() {
        let mut queue = radio_queue();
        let mut radio = RadioExtender::new(Arc::new(FixedRelated(vec![
            track("seed"), // duplicate of the session seed
            track("r1"),
            track("r2"),
        ])));
        radio.reset(queue.track_at(0).unwrap());

        let appended = radio.extend(&mut queue).await.unwrap();
        assert_eq!(appended, 2);
        assert_eq!(queue.len(), 3);

        let ids = queue.track_ids();
        assert!(ids.contains(&"r1".to_string()));
        assert!(ids.contains(&"r2".to_string()));
    }

    #[tokio::test]
    async fn duplicates_never_reappend() {
        let mut queue = radio_queue();
        let mut radio = RadioExtender::new(Arc::new(FixedRelated(vec![
            track("r1"),
            track("r2"),
        ])));
        radio.reset(queue.track_at(0).unwrap());

        assert_eq!(radio.extend(&mut queue).await.unwrap(), 2);
        // Second fetch returns the same tracks; all are seen now.
        assert_eq!(radio.extend(&mut queue).await.unwrap(), 0);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn all_duplicates_moves_the_seed() {
        let mut queue = QueueModel::default();
        queue.install((0..9).map(|i| track(&format!("q{i}"))).collect(), 0, None);

        let mut radio = RadioExtender::new(Arc::new(FixedRelated(vec![track("q1")])));
        radio.reset(queue.track_at(0).unwrap());
        let before = radio.seed_id().unwrap().to_string();

        // Three all-duplicate rounds must leave the seed re-picked.
        for _ in 0..3 {
            assert_eq!(radio.extend(&mut queue).await.unwrap(), 0);
        }
        let after = radio.seed_id().unwrap().to_string();
        assert_ne!(after, before);
    }

    #[test]
    fn trigger_threshold() {
        let mut queue = QueueModel::default();
        queue.install((0..10).map(|i| track(&format!("q{i}"))).collect(), 0, None);

        let radio = RadioExtender::new(Arc::new(FixedRelated(Vec::new())));
        assert!(!radio.should_extend(&queue));

        queue.skip_to(4);
        assert!(radio.should_extend(&queue));
    }

    #[test]
    fn later_seeds_come_from_queue_tail() {
        let mut queue = QueueModel::default();
        queue.install((0..10).map(|i| track(&format!("q{i}"))).collect(), 0, None);

        let mut radio = RadioExtender::new(Arc::new(FixedRelated(Vec::new())));
        radio.reset(queue.track_at(0).unwrap());
        radio.fetch_count = 1;

        let seed = radio.pick_seed(&queue).unwrap();
        let index = queue.track_ids().iter().position(|id| *id == seed).unwrap();
        assert!(index >= 7, "seed {seed} not in the last 30%");
    }
}
