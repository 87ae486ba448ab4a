//! Keyed per-play aggregation state.
//!
//! The store is owned by exactly one coordinator, which is the only writer for
//! every key routed to its partition, so no per-key locking happens here.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;

use crate::records::{PlayEnd, PlayEvent, PlayKey, TrackingFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Plays,
    Frames,
}

/// One sampled moment of a play: every row sharing a `frame_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    pub frame_id: u32,
    pub event_time: DateTime<Utc>,
    pub event: Option<String>,
    pub rows: Vec<TrackingFrame>,
}

impl FrameSnapshot {
    fn from_rows(frame_id: u32, rows: Vec<TrackingFrame>) -> Option<Self> {
        let event_time = rows.iter().map(|r| r.event_time).min()?;
        let event = rows.iter().find_map(|r| r.event.clone());
        Some(Self {
            frame_id,
            event_time,
            event,
            rows,
        })
    }
}

/// Holds rows until no earlier `frame_id` can legitimately arrive.
///
/// A frame group is released once a row more than `max_gap` frames ahead has been
/// seen. Rows for an already released frame id are late.
#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    max_gap: u32,
    pending: BTreeMap<u32, Vec<TrackingFrame>>,
    released_through: Option<u32>,
    max_seen: Option<u32>,
}

impl ReorderBuffer {
    pub fn new(max_gap: u32) -> Self {
        Self {
            max_gap,
            pending: BTreeMap::new(),
            released_through: None,
            max_seen: None,
        }
    }

    /// Returns the late row back when it cannot be placed in order.
    pub fn push(&mut self, frame: TrackingFrame) -> Result<Vec<FrameSnapshot>, TrackingFrame> {
        if self
            .released_through
            .is_some_and(|released| frame.frame_id <= released)
        {
            return Err(frame);
        }
        let frame_id = frame.frame_id;
        self.pending.entry(frame_id).or_default().push(frame);
        self.max_seen = Some(self.max_seen.map_or(frame_id, |seen| seen.max(frame_id)));
        Ok(self.release_ready())
    }

    pub fn flush(&mut self) -> Vec<FrameSnapshot> {
        let pending = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(pending.len());
        for (frame_id, rows) in pending {
            self.released_through = Some(frame_id);
            if let Some(snapshot) = FrameSnapshot::from_rows(frame_id, rows) {
                out.push(snapshot);
            }
        }
        out
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    fn release_ready(&mut self) -> Vec<FrameSnapshot> {
        let Some(max_seen) = self.max_seen else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some((&frame_id, _)) = self.pending.first_key_value() {
            if u64::from(frame_id) + u64::from(self.max_gap) >= u64::from(max_seen) {
                break;
            }
            let Some((frame_id, rows)) = self.pending.pop_first() else {
                break;
            };
            self.released_through = Some(frame_id);
            if let Some(snapshot) = FrameSnapshot::from_rows(frame_id, rows) {
                out.push(snapshot);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct PlayState {
    pub key: PlayKey,
    pub event: Option<PlayEvent>,
    /// Released frames, ordered by `frame_id`.
    pub frames: Vec<FrameSnapshot>,
    pub reorder: ReorderBuffer,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// Processing time of the first sighting.
    pub created_at: DateTime<Utc>,
    /// Watermark minus last observed time at the last closure scan.
    pub watermark_age_ms: Option<i64>,
    pub complete: bool,
    pub min_play_offset: Option<u64>,
    pub min_frame_offset: Option<u64>,
    /// Highest offset routed to this play per stream, late rows included.
    pub max_play_offset: Option<u64>,
    pub max_frame_offset: Option<u64>,
}

impl PlayState {
    fn new(key: PlayKey, max_gap: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            event: None,
            frames: Vec::new(),
            reorder: ReorderBuffer::new(max_gap),
            last_frame_time: None,
            terminal_at: None,
            created_at,
            watermark_age_ms: None,
            complete: false,
            min_play_offset: None,
            min_frame_offset: None,
            max_play_offset: None,
            max_frame_offset: None,
        }
    }

    /// Last frame timestamp, falling back to the play event time.
    pub fn last_observed_time(&self) -> Option<DateTime<Utc>> {
        self.last_frame_time
            .or_else(|| self.event.as_ref().map(|e| e.event_time))
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn row_count(&self) -> usize {
        self.frames.iter().map(|f| f.rows.len()).sum::<usize>() + self.reorder.pending_len()
    }

    pub fn mark_terminal(&mut self, at: DateTime<Utc>) {
        self.terminal_at = Some(self.terminal_at.map_or(at, |prev| prev.min(at)));
    }

    pub fn flush_pending(&mut self) {
        let released = self.reorder.flush();
        self.frames.extend(released);
    }

    pub fn update_age(&mut self, watermark: Option<DateTime<Utc>>) {
        self.watermark_age_ms = match (watermark, self.last_observed_time()) {
            (Some(wm), Some(last)) => Some((wm - last).num_milliseconds()),
            _ => None,
        };
    }

    fn track_offset(&mut self, stream: StreamKind, offset: u64) {
        let slot = match stream {
            StreamKind::Plays => &mut self.min_play_offset,
            StreamKind::Frames => &mut self.min_frame_offset,
        };
        *slot = Some(slot.map_or(offset, |prev| prev.min(offset)));
        self.note_offset(stream, offset);
    }

    fn note_offset(&mut self, stream: StreamKind, offset: u64) {
        let slot = match stream {
            StreamKind::Plays => &mut self.max_play_offset,
            StreamKind::Frames => &mut self.max_frame_offset,
        };
        *slot = Some(slot.map_or(offset, |prev| prev.max(offset)));
    }
}

/// Marker left behind by a closed play.
///
/// `*_through` is one past the highest offset that carried a record for the
/// play. Until the committed offsets reach it, a restart would replay some of
/// those records, so the marker has to outlive them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tombstone {
    pub closed_at: DateTime<Utc>,
    pub plays_through: Option<u64>,
    pub frames_through: Option<u64>,
}

impl Tombstone {
    pub fn new(closed_at: DateTime<Utc>) -> Self {
        Self {
            closed_at,
            plays_through: None,
            frames_through: None,
        }
    }

    fn cover(&mut self, stream: StreamKind, offset: u64) {
        let slot = match stream {
            StreamKind::Plays => &mut self.plays_through,
            StreamKind::Frames => &mut self.frames_through,
        };
        let through = offset + 1;
        *slot = Some(slot.map_or(through, |prev| prev.max(through)));
    }

    /// True once neither log can hand any covered record back on restart.
    fn replay_safe(&self, plays_committed: Option<u64>, frames_committed: Option<u64>) -> bool {
        let passed = |through: Option<u64>, committed: Option<u64>| match through {
            None => true,
            Some(through) => committed.is_some_and(|c| c >= through),
        };
        passed(self.plays_through, plays_committed) && passed(self.frames_through, frames_committed)
    }
}

/// Input accepted by [`PlayStateStore::upsert`].
#[derive(Debug, Clone)]
pub enum StoreInput {
    Event(PlayEvent),
    End(PlayEnd),
    Frame(TrackingFrame),
}

impl StoreInput {
    pub fn event_time(&self) -> DateTime<Utc> {
        match self {
            StoreInput::Event(e) => e.event_time,
            StoreInput::End(e) => e.event_time,
            StoreInput::Frame(f) => f.event_time,
        }
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            StoreInput::Event(_) | StoreInput::End(_) => StreamKind::Plays,
            StoreInput::Frame(_) => StreamKind::Frames,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateReason {
    /// The play was already emitted.
    PlayClosed,
    /// The row fell behind the reorder window.
    OutOfOrder,
    /// A new play would start already behind the watermark plus grace.
    BehindWatermark,
}

#[derive(Debug)]
pub enum UpsertOutcome<'a> {
    Updated(&'a mut PlayState),
    /// A second, different PlayEvent for a play that already has one. The
    /// ingested event is kept.
    DuplicateEvent(PlayEvent),
    Late(LateReason, StoreInput),
}

#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub reorder_max_gap: u32,
    pub max_active_plays: usize,
    pub grace: ChronoDuration,
}

#[derive(Debug)]
pub struct PlayStateStore {
    limits: StoreLimits,
    states: HashMap<PlayKey, PlayState>,
    closed: HashMap<PlayKey, Tombstone>,
}

impl PlayStateStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            states: HashMap::new(),
            closed: HashMap::new(),
        }
    }

    pub fn upsert(
        &mut self,
        key: &PlayKey,
        input: StoreInput,
        offset: u64,
        now: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
    ) -> UpsertOutcome<'_> {
        if let Some(tombstone) = self.closed.get_mut(key) {
            tombstone.cover(input.stream(), offset);
            return UpsertOutcome::Late(LateReason::PlayClosed, input);
        }
        if !self.states.contains_key(key)
            && watermark.is_some_and(|wm| input.event_time() + self.limits.grace < wm)
        {
            return UpsertOutcome::Late(LateReason::BehindWatermark, input);
        }

        let max_gap = self.limits.reorder_max_gap;
        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| PlayState::new(key.clone(), max_gap, now));
        let stream = input.stream();

        match input {
            StoreInput::Event(event) => {
                state.track_offset(stream, offset);
                if state.event.is_none() {
                    state.event = Some(event);
                    UpsertOutcome::Updated(state)
                } else if state.event.as_ref() == Some(&event) {
                    UpsertOutcome::Updated(state)
                } else {
                    UpsertOutcome::DuplicateEvent(event)
                }
            }
            StoreInput::End(end) => {
                state.track_offset(stream, offset);
                state.mark_terminal(end.event_time);
                UpsertOutcome::Updated(state)
            }
            StoreInput::Frame(frame) => {
                let frame_time = frame.event_time;
                match state.reorder.push(frame) {
                    Ok(released) => {
                        state.track_offset(stream, offset);
                        state.last_frame_time = Some(
                            state
                                .last_frame_time
                                .map_or(frame_time, |prev| prev.max(frame_time)),
                        );
                        state.frames.extend(released);
                        UpsertOutcome::Updated(state)
                    }
                    Err(frame) => {
                        state.note_offset(stream, offset);
                        UpsertOutcome::Late(LateReason::OutOfOrder, StoreInput::Frame(frame))
                    }
                }
            }
        }
    }

    pub fn get(&self, key: &PlayKey) -> Option<&PlayState> {
        self.states.get(key)
    }

    pub fn get_mut(&mut self, key: &PlayKey) -> Option<&mut PlayState> {
        self.states.get_mut(key)
    }

    /// Drops the state without recording closure.
    pub fn evict(&mut self, key: &PlayKey) -> Option<PlayState> {
        self.states.remove(key)
    }

    /// Evicts and tombstones the key so later records for it are treated as late.
    pub fn close(&mut self, key: &PlayKey, at: DateTime<Utc>) -> Option<PlayState> {
        let state = self.states.remove(key);
        let mut tombstone = Tombstone::new(at);
        if let Some(state) = &state {
            if let Some(offset) = state.max_play_offset {
                tombstone.cover(StreamKind::Plays, offset);
            }
            if let Some(offset) = state.max_frame_offset {
                tombstone.cover(StreamKind::Frames, offset);
            }
        }
        self.closed.insert(key.clone(), tombstone);
        state
    }

    pub fn is_closed(&self, key: &PlayKey) -> bool {
        self.closed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn keys(&self) -> Vec<PlayKey> {
        self.states.keys().cloned().collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &PlayState> {
        self.states.values()
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut PlayState> {
        self.states.values_mut()
    }

    pub fn over_capacity(&self) -> usize {
        self.states.len().saturating_sub(self.limits.max_active_plays)
    }

    /// Oldest-first keys, by first sighting.
    pub fn oldest_keys(&self, count: usize) -> Vec<PlayKey> {
        let mut by_age = self
            .states
            .values()
            .map(|s| (s.created_at, s.key.clone()))
            .collect::<Vec<_>>();
        by_age.sort();
        by_age.into_iter().take(count).map(|(_, key)| key).collect()
    }

    /// Lowest offset an open play still needs from `stream`.
    pub fn min_required_offset(&self, stream: StreamKind) -> Option<u64> {
        self.states
            .values()
            .filter_map(|s| match stream {
                StreamKind::Plays => s.min_play_offset,
                StreamKind::Frames => s.min_frame_offset,
            })
            .min()
    }

    /// Drops tombstones older than `retention` behind the watermark, but only
    /// once the committed offsets are past every record they cover.
    pub fn prune_closed(
        &mut self,
        watermark: DateTime<Utc>,
        retention: ChronoDuration,
        plays_committed: Option<u64>,
        frames_committed: Option<u64>,
    ) -> usize {
        let before = self.closed.len();
        self.closed.retain(|_, tombstone| {
            tombstone.closed_at + retention > watermark
                || !tombstone.replay_safe(plays_committed, frames_committed)
        });
        let pruned = before - self.closed.len();
        if pruned > 0 {
            debug!("Pruned {pruned} closed-play tombstones");
        }
        pruned
    }

    pub fn tombstone(&self, key: &PlayKey) -> Option<&Tombstone> {
        self.closed.get(key)
    }

    pub fn closed_entries(&self) -> Vec<(PlayKey, Tombstone)> {
        let mut entries = self
            .closed
            .iter()
            .map(|(k, tombstone)| (k.clone(), *tombstone))
            .collect::<Vec<_>>();
        entries.sort();
        entries
    }

    pub fn restore_closed(&mut self, entries: impl IntoIterator<Item = (PlayKey, Tombstone)>) {
        self.closed.extend(entries);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    use super::{
        LateReason, PlayStateStore, ReorderBuffer, StoreInput, StoreLimits, StreamKind,
        UpsertOutcome,
    };
    use crate::records::{PlayKey, TrackingFrame};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 9, 7, 20, 20, 0).unwrap()
    }

    fn row(frame_id: u32, player: &str) -> TrackingFrame {
        TrackingFrame {
            game_id: "g1".to_string(),
            play_id: 7,
            frame_id,
            player_id: player.to_string(),
            team: "DET".to_string(),
            position: "WR".to_string(),
            x: 30.0,
            y: 20.0,
            speed: 1.0,
            acceleration: 0.5,
            direction: 90.0,
            event: None,
            event_time: t0() + ChronoDuration::milliseconds(i64::from(frame_id) * 100),
        }
    }

    fn limits() -> StoreLimits {
        StoreLimits {
            reorder_max_gap: 2,
            max_active_plays: 2,
            grace: ChronoDuration::milliseconds(1000),
        }
    }

    #[test]
    fn reorder_buffer_releases_in_frame_order() {
        let mut buffer = ReorderBuffer::new(2);
        assert!(buffer.push(row(2, "a")).expect("in window").is_empty());
        assert!(buffer.push(row(1, "a")).expect("in window").is_empty());
        assert!(buffer.push(row(3, "a")).expect("in window").is_empty());
        let released = buffer.push(row(4, "a")).expect("in window");
        assert_eq!(released.iter().map(|f| f.frame_id).collect::<Vec<_>>(), vec![1]);
        let released = buffer.push(row(5, "a")).expect("in window");
        assert_eq!(released.iter().map(|f| f.frame_id).collect::<Vec<_>>(), vec![2]);
        let rest = buffer.flush();
        assert_eq!(rest.iter().map(|f| f.frame_id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn rows_behind_the_released_frame_are_late() {
        let mut buffer = ReorderBuffer::new(0);
        buffer.push(row(1, "a")).expect("first");
        buffer.push(row(1, "b")).expect("same frame still pending");
        let released = buffer.push(row(2, "a")).expect("advance");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].rows.len(), 2);
        let late = buffer.push(row(1, "c")).unwrap_err();
        assert_eq!(late.player_id, "c");
    }

    #[test]
    fn closed_plays_divert_new_records() {
        let mut store = PlayStateStore::new(limits());
        let key = PlayKey::new("g1", 7);
        store.upsert(&key, StoreInput::Frame(row(1, "a")), 0, t0(), None);
        assert!(store.close(&key, t0()).is_some());
        let outcome = store.upsert(&key, StoreInput::Frame(row(2, "a")), 1, t0(), None);
        assert!(matches!(
            outcome,
            UpsertOutcome::Late(LateReason::PlayClosed, _)
        ));
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn new_state_behind_watermark_is_late() {
        let mut store = PlayStateStore::new(limits());
        let key = PlayKey::new("g1", 7);
        let watermark = t0() + ChronoDuration::seconds(10);
        let outcome = store.upsert(&key, StoreInput::Frame(row(1, "a")), 0, t0(), Some(watermark));
        assert!(matches!(
            outcome,
            UpsertOutcome::Late(LateReason::BehindWatermark, _)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn tracks_minimum_offsets_and_capacity() {
        let mut store = PlayStateStore::new(limits());
        for (idx, play_id) in [3_i64, 4, 5].iter().enumerate() {
            let mut frame = row(1, "a");
            frame.play_id = *play_id;
            let key = frame.key();
            store.upsert(
                &key,
                StoreInput::Frame(frame),
                10 + idx as u64,
                t0() + ChronoDuration::seconds(idx as i64),
                None,
            );
        }
        assert_eq!(store.min_required_offset(StreamKind::Frames), Some(10));
        assert_eq!(store.min_required_offset(StreamKind::Plays), None);
        assert_eq!(store.over_capacity(), 1);
        assert_eq!(store.oldest_keys(1), vec![PlayKey::new("g1", 3)]);
    }

    #[test]
    fn tombstones_expire_after_retention() {
        let mut store = PlayStateStore::new(limits());
        let key = PlayKey::new("g1", 7);
        store.close(&key, t0());
        let retention = ChronoDuration::seconds(10);
        assert_eq!(store.prune_closed(t0() + ChronoDuration::seconds(5), retention, None, None), 0);
        assert_eq!(store.prune_closed(t0() + ChronoDuration::seconds(11), retention, None, None), 1);
        assert!(!store.is_closed(&key));
    }

    #[test]
    fn tombstones_outlive_uncommitted_records() {
        let mut store = PlayStateStore::new(limits());
        let key = PlayKey::new("g1", 7);
        store.upsert(&key, StoreInput::Frame(row(3, "a")), 4, t0(), None);
        store.upsert(&key, StoreInput::Frame(row(4, "a")), 9, t0(), None);
        store.close(&key, t0());
        // A straggler after closure extends what the tombstone covers.
        store.upsert(&key, StoreInput::Frame(row(5, "a")), 12, t0(), None);
        let tombstone = *store.tombstone(&key).expect("tombstone");
        assert_eq!(tombstone.frames_through, Some(13));
        assert_eq!(tombstone.plays_through, None);

        let wm = t0() + ChronoDuration::seconds(60);
        let retention = ChronoDuration::seconds(10);
        assert_eq!(store.prune_closed(wm, retention, None, None), 0);
        assert_eq!(store.prune_closed(wm, retention, Some(0), Some(12)), 0);
        assert!(store.is_closed(&key));
        assert_eq!(store.prune_closed(wm, retention, Some(0), Some(13)), 1);
    }
}
