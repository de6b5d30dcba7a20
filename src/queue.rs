//! Queue state and skip policy.
//!
//! The queue model is a plain value type mutated only by the controller
//! task. It tracks:
//! * the playing order (`queue`) and the pre-shuffle order
//!   (`original_order`)
//! * the current index, `-1`-equivalent being represented as [`None`]
//!   while the queue is empty
//! * shuffle and loop settings
//! * a monotonic revision counter bumped on every mutation, so
//!   subscribers can tell queue snapshots apart
//!
//! # Skip Policy
//!
//! * next: advance; at the tail wrap only under [`LoopMode::All`]
//! * previous: with more than three seconds played, restart the current
//!   track instead of changing index
//!
//! Shuffle is a Fisher-Yates pass over a copy; the original order is kept
//! so disabling shuffle restores it and relocates the current track by
//! identity.

use std::time::Duration;

use crate::track::{LoopMode, Track, TrackId};

/// Position threshold for the previous-track rule.
///
/// Below this the previous command changes tracks; above it the command
/// restarts the current one.
const PREVIOUS_RESTART_THRESHOLD: Duration = Duration::from_secs(3);

/// Outcome of a skip-to-previous request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PreviousAction {
    /// Seek the current track to zero; the index does not change.
    RestartCurrent,
    /// Move to the given queue index.
    SkipTo(usize),
    /// Nothing to do.
    None,
}

/// The play queue with ordering, shuffle and loop state.
#[derive(Clone, Debug, Default)]
pub struct QueueModel {
    /// Tracks in playing order.
    queue: Vec<Track>,

    /// Tracks in the order they were installed, for unshuffling.
    original_order: Vec<Track>,

    /// Index of the current track; `None` iff the queue is empty.
    current_index: Option<usize>,

    /// Whether the playing order is shuffled.
    shuffle_enabled: bool,

    /// Queue boundary behavior.
    loop_mode: LoopMode,

    /// Identity of the playlist or album that seeded the queue.
    source_id: Option<String>,

    /// Monotonic revision; bumps on every mutation.
    revision: u64,
}

impl QueueModel {
    /// Replaces the queue and positions playback at `start_index`.
    ///
    /// `start_index` is clamped into the new queue; an empty install
    /// clears the current index.
    pub fn install(&mut self, tracks: Vec<Track>, start_index: usize, source_id: Option<String>) {
        self.original_order = tracks.clone();
        self.queue = tracks;
        self.current_index = if self.queue.is_empty() {
            None
        } else {
            Some(start_index.min(self.queue.len() - 1))
        };
        self.shuffle_enabled = false;
        self.source_id = source_id;
        self.bump();
    }

    /// Appends tracks to the end of the queue.
    ///
    /// Also appended to the original order so unshuffling keeps them.
    pub fn append(&mut self, tracks: Vec<Track>) {
        if tracks.is_empty() {
            return;
        }

        self.original_order.extend(tracks.iter().cloned());
        self.queue.extend(tracks);
        if self.current_index.is_none() {
            self.current_index = Some(0);
        }
        self.bump();
    }

    /// Inserts a track immediately after the current one.
    pub fn insert_next(&mut self, track: Track) {
        match self.current_index {
            Some(current) => {
                self.queue.insert(current + 1, track.clone());
                // Keep the original order aligned by inserting after the
                // current track's original position.
                let original_pos = self
                    .original_order
                    .iter()
                    .position(|t| self.queue.get(current).is_some_and(|cur| cur.id == t.id))
                    .map_or(self.original_order.len(), |pos| pos + 1);
                self.original_order.insert(original_pos, track);
            }
            None => {
                self.queue.push(track.clone());
                self.original_order.push(track);
                self.current_index = Some(0);
            }
        }
        self.bump();
    }

    /// Removes the track at `index`.
    ///
    /// Returns the removed track. Removing the current track keeps the
    /// index in place (the next track slides into it); removing before
    /// the current track shifts the index down.
    pub fn remove_at(&mut self, index: usize) -> Option<Track> {
        if index >= self.queue.len() {
            return None;
        }

        let removed = self.queue.remove(index);
        self.original_order.retain(|t| t.id != removed.id);

        self.current_index = match self.current_index {
            Some(_) if self.queue.is_empty() => None,
            Some(current) if index < current => Some(current - 1),
            Some(current) => Some(current.min(self.queue.len() - 1)),
            None => None,
        };

        self.bump();
        Some(removed)
    }

    /// Moves the track at `old_index` to `new_index`.
    pub fn reorder(&mut self, old_index: usize, new_index: usize) {
        if old_index >= self.queue.len() || new_index >= self.queue.len() {
            return;
        }

        let track = self.queue.remove(old_index);
        self.queue.insert(new_index, track);

        // Follow the current track through the move.
        if let Some(current) = self.current_index {
            self.current_index = Some(if current == old_index {
                new_index
            } else if old_index < current && new_index >= current {
                current - 1
            } else if old_index > current && new_index <= current {
                current + 1
            } else {
                current
            });
        }

        self.bump();
    }

    /// Jumps to the given index.
    ///
    /// Out-of-range indices are ignored.
    pub fn skip_to(&mut self, index: usize) -> bool {
        if index >= self.queue.len() {
            return false;
        }
        self.current_index = Some(index);
        self.bump();
        true
    }

    /// Clears the queue entirely.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.original_order.clear();
        self.current_index = None;
        self.shuffle_enabled = false;
        self.source_id = None;
        self.bump();
    }

    /// Computes the next index per the skip policy.
    ///
    /// Returns `None` at the tail unless [`LoopMode::All`] wraps.
    #[must_use]
    pub fn next_index(&self) -> Option<usize> {
        let current = self.current_index?;
        if current + 1 < self.queue.len() {
            Some(current + 1)
        } else if self.loop_mode == LoopMode::All && !self.queue.is_empty() {
            Some(0)
        } else {
            None
        }
    }

    /// Computes the action for a skip-to-previous request.
    ///
    /// With more than three seconds played the current track restarts;
    /// otherwise the index moves back, wrapping only under
    /// [`LoopMode::All`].
    #[must_use]
    pub fn previous_action(&self, position: Duration) -> PreviousAction {
        let Some(current) = self.current_index else {
            return PreviousAction::None;
        };

        if position > PREVIOUS_RESTART_THRESHOLD {
            return PreviousAction::RestartCurrent;
        }

        if current > 0 {
            PreviousAction::SkipTo(current - 1)
        } else if self.loop_mode == LoopMode::All && !self.queue.is_empty() {
            PreviousAction::SkipTo(self.queue.len() - 1)
        } else {
            PreviousAction::RestartCurrent
        }
    }

    /// Enables shuffle, keeping the current track at the front.
    ///
    /// Fisher-Yates over a copy; the pre-shuffle order stays in
    /// `original_order`.
    pub fn enable_shuffle(&mut self) {
        if self.shuffle_enabled || self.queue.len() < 2 {
            self.shuffle_enabled = true;
            self.bump();
            return;
        }

        let keep_at_start = self.current_index;

        let mut shuffled = self.queue.clone();
        for i in (1..shuffled.len()).rev() {
            let j = fastrand::usize(0..=i);
            shuffled.swap(i, j);
        }

        if let Some(keep) = keep_at_start {
            if let Some(current) = self.queue.get(keep) {
                if let Some(pos) = shuffled.iter().position(|t| t.id == current.id) {
                    shuffled.swap(0, pos);
                }
            }
            self.current_index = Some(0);
        }

        self.queue = shuffled;
        self.shuffle_enabled = true;
        self.bump();
    }

    /// Disables shuffle and restores the original order.
    ///
    /// The current track is relocated by identity; if it is gone the
    /// index clamps to the head.
    pub fn disable_shuffle(&mut self) {
        let current_id = self.current_track().map(|t| t.id.clone());

        self.queue = self.original_order.clone();
        self.current_index = match current_id {
            Some(id) => Some(
                self.queue
                    .iter()
                    .position(|t| t.id == id)
                    .unwrap_or_default(),
            ),
            None => None,
        };

        self.shuffle_enabled = false;
        self.bump();
    }

    /// Replaces a track's metadata in place, preserving position.
    ///
    /// Used for the one-shot duration fix-up after the player reports an
    /// authoritative duration.
    pub fn update_track(&mut self, track: &Track) {
        let mut changed = false;
        for slot in self
            .queue
            .iter_mut()
            .chain(self.original_order.iter_mut())
            .filter(|t| t.id == track.id)
        {
            *slot = track.clone();
            changed = true;
        }
        if changed {
            self.bump();
        }
    }

    /// Tracks in playing order.
    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.queue
    }

    /// Number of queued tracks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Index of the current track; `None` iff the queue is empty.
    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// The current track.
    #[must_use]
    pub fn current_track(&self) -> Option<&Track> {
        self.queue.get(self.current_index?)
    }

    /// The track at an index.
    #[must_use]
    pub fn track_at(&self, index: usize) -> Option<&Track> {
        self.queue.get(index)
    }

    /// Ids of all queued tracks.
    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.queue.iter().map(|t| t.id.clone()).collect()
    }

    /// Number of tracks after the current one.
    #[must_use]
    pub fn remaining_after_current(&self) -> usize {
        match self.current_index {
            Some(current) => self.queue.len().saturating_sub(current + 1),
            None => 0,
        }
    }

    /// Whether shuffle is on.
    #[must_use]
    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle_enabled
    }

    /// Queue boundary behavior.
    #[must_use]
    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Sets the queue boundary behavior.
    pub fn set_loop_mode(&mut self, loop_mode: LoopMode) {
        self.loop_mode = loop_mode;
        self.bump();
    }

    /// Identity of the playlist or album that seeded the queue.
    #[must_use]
    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    /// Current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Title {id}"), "Artist", Duration::from_secs(180))
    }

    fn queue_of(n: usize) -> QueueModel {
        let mut model = QueueModel::default();
        model.install(
            (0..n).map(|i| track(&format!("t{i}"))).collect(),
            0,
            Some("playlist-1".to_string()),
        );
        model
    }

    #[test]
    fn install_positions_current() {
        let mut model = QueueModel::default();
        model.install(vec![track("a"), track("b"), track("c")], 1, None);
        assert_eq!(model.current_index(), Some(1));
        assert_eq!(model.current_track().unwrap().id, "b");
    }

    #[test]
    fn empty_queue_has_no_current() {
        let mut model = QueueModel::default();
        model.install(Vec::new(), 0, None);
        assert_eq!(model.current_index(), None);
        assert!(model.is_empty());
    }

    #[test]
    fn queue_and_original_stay_same_length() {
        let mut model = queue_of(5);
        model.append(vec![track("x")]);
        model.insert_next(track("y"));
        model.remove_at(2);
        assert_eq!(model.len(), model.original_order.len());
    }

    #[test]
    fn revision_strictly_increases() {
        let mut model = queue_of(3);
        let mut last = model.revision();
        model.append(vec![track("x")]);
        assert!(model.revision() > last);
        last = model.revision();
        model.skip_to(1);
        assert!(model.revision() > last);
        last = model.revision();
        model.clear();
        assert!(model.revision() > last);
    }

    #[test]
    fn next_stops_at_tail_without_loop() {
        let mut model = queue_of(3);
        model.skip_to(2);
        assert_eq!(model.next_index(), None);
    }

    #[test]
    fn next_wraps_with_loop_all() {
        let mut model = queue_of(3);
        model.set_loop_mode(LoopMode::All);
        model.skip_to(2);
        assert_eq!(model.next_index(), Some(0));
    }

    #[test]
    fn previous_restarts_when_deep_into_track() {
        let mut model = queue_of(3);
        model.skip_to(1);
        assert_eq!(
            model.previous_action(Duration::from_secs(10)),
            PreviousAction::RestartCurrent
        );
        // The index must not have changed.
        assert_eq!(model.current_index(), Some(1));
    }

    #[test]
    fn previous_moves_back_early_in_track() {
        let mut model = queue_of(3);
        model.skip_to(1);
        assert_eq!(
            model.previous_action(Duration::from_secs(1)),
            PreviousAction::SkipTo(0)
        );
    }

    #[test]
    fn previous_at_head_restarts() {
        let model = queue_of(3);
        assert_eq!(
            model.previous_action(Duration::from_secs(1)),
            PreviousAction::RestartCurrent
        );
    }

    #[test]
    fn shuffle_keeps_current_at_front() {
        let mut model = queue_of(10);
        model.skip_to(7);
        let current = model.current_track().unwrap().id.clone();

        model.enable_shuffle();
        assert_eq!(model.current_index(), Some(0));
        assert_eq!(model.current_track().unwrap().id, current);
        assert_eq!(model.len(), 10);
    }

    #[test]
    fn shuffle_round_trip_restores_order() {
        let mut model = queue_of(10);
        model.skip_to(4);
        let original: Vec<_> = model.tracks().iter().map(|t| t.id.clone()).collect();
        let current = model.current_track().unwrap().id.clone();

        model.enable_shuffle();
        model.disable_shuffle();

        let restored: Vec<_> = model.tracks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(restored, original);
        assert_eq!(model.current_track().unwrap().id, current);
        assert_eq!(model.current_index(), Some(4));
    }

    #[test]
    fn remove_before_current_shifts_index() {
        let mut model = queue_of(5);
        model.skip_to(3);
        model.remove_at(1);
        assert_eq!(model.current_index(), Some(2));
        assert_eq!(model.current_track().unwrap().id, "t3");
    }

    #[test]
    fn remove_last_track_empties_current() {
        let mut model = queue_of(1);
        model.remove_at(0);
        assert_eq!(model.current_index(), None);
        assert!(model.is_empty());
    }

    #[test]
    fn reorder_follows_current() {
        let mut model = queue_of(5);
        model.skip_to(2);
        model.reorder(2, 0);
        assert_eq!(model.current_index(), Some(0));
        assert_eq!(model.current_track().unwrap().id, "t2");

        model.reorder(4, 0);
        assert_eq!(model.current_index(), Some(1));
        assert_eq!(model.current_track().unwrap().id, "t2");
    }

    #[test]
    fn insert_next_lands_after_current() {
        let mut model = queue_of(3);
        model.skip_to(1);
        model.insert_next(track("x"));
        assert_eq!(model.track_at(2).unwrap().id, "x");
        assert_eq!(model.len(), 4);
    }

    #[test]
    fn current_index_always_in_bounds() {
        let mut model = queue_of(4);
        model.skip_to(3);
        model.remove_at(3);
        let index = model.current_index().unwrap();
        assert!(index < model.len());
    }

    #[test]
    fn update_track_fixes_duration_everywhere() {
        let mut model = queue_of(3);
        let fixed = track("t1").with_duration(Duration::from_secs(241));
        model.update_track(&fixed);
        assert_eq!(
            model.track_at(1).unwrap().duration,
            Duration::from_secs(241)
        );
        model.enable_shuffle();
        model.disable_shuffle();
        assert_eq!(
            model
                .tracks()
                .iter()
                .find(|t| t.id == "t1")
                .unwrap()
                .duration,
            Duration::from_secs(241)
        );
    }
}
