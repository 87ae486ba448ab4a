//! Per-partition event loop: poll, merge into play state, close, enrich, emit,
//! checkpoint, commit.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::checkpoint::{Checkpoint, CheckpointStore, ClosedPlay};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::enrich;
use crate::log_cursor::{LogCursor, LogRecord, poll_with_retry};
use crate::records::{ClosureReason, EnrichedPlay, PlayKey, PlayRecord, decode_frame, decode_play_record};
use crate::scoring::Scorer;
use crate::sink::{Diverted, PublishOutcome, SideChannel, SinkEmitter};
use crate::store::{LateReason, PlayStateStore, StoreInput, StoreLimits, StreamKind, UpsertOutcome};
use crate::watermark::{ClosureDecision, WatermarkManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Stop reading, emit what is already closable, checkpoint, commit, exit.
    Drain,
    /// Exit without further commits.
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub partition: usize,
    pub records: u64,
    pub malformed: u64,
    pub late: u64,
    pub orphaned: u64,
    pub emitted: u64,
    pub unchanged: u64,
    pub timeouts: u64,
    pub commits: u64,
    pub open_plays: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub polled: usize,
    pub closed: usize,
}

/// Everything a worker needs besides configuration.
pub struct WorkerParts {
    pub plays: Box<dyn LogCursor>,
    pub frames: Box<dyn LogCursor>,
    pub emitter: SinkEmitter,
    pub side: SideChannel,
    pub checkpoints: Box<dyn CheckpointStore>,
    pub scorer: Arc<dyn Scorer>,
    pub clock: Arc<dyn Clock>,
    pub pool: Option<Arc<rayon::ThreadPool>>,
}

pub struct EnrichmentCoordinator {
    name: String,
    partition: usize,
    config: Arc<PipelineConfig>,
    plays: Box<dyn LogCursor>,
    frames: Box<dyn LogCursor>,
    emitter: SinkEmitter,
    side: SideChannel,
    checkpoints: Box<dyn CheckpointStore>,
    scorer: Arc<dyn Scorer>,
    clock: Arc<dyn Clock>,
    pool: Option<Arc<rayon::ThreadPool>>,
    store: PlayStateStore,
    watermarks: WatermarkManager,
    report: WorkerReport,
}

impl EnrichmentCoordinator {
    /// Restores closed-play tombstones from the last checkpoint. Cursors are
    /// expected to already sit at their committed offsets.
    pub fn new(partition: usize, config: Arc<PipelineConfig>, parts: WorkerParts) -> Result<Self> {
        let now = parts.clock.now();
        let mut store = PlayStateStore::new(StoreLimits {
            reorder_max_gap: config.reorder_max_gap,
            max_active_plays: config.max_active_plays,
            grace: config.grace(),
        });
        let name = format!("p{partition}");
        if let Some(checkpoint) = parts.checkpoints.load(partition)? {
            info!(
                "Worker '{name}': restored {} closed plays from checkpoint saved {}",
                checkpoint.closed.len(),
                checkpoint.saved_at
            );
            store.restore_closed(checkpoint.closed.into_iter().map(ClosedPlay::into_parts));
        }
        Ok(Self {
            name,
            partition,
            watermarks: WatermarkManager::new(&config, now),
            config,
            plays: parts.plays,
            frames: parts.frames,
            emitter: parts.emitter,
            side: parts.side,
            checkpoints: parts.checkpoints,
            scorer: parts.scorer,
            clock: parts.clock,
            pool: parts.pool,
            store,
            report: WorkerReport {
                partition,
                ..WorkerReport::default()
            },
        })
    }

    pub fn report(&self) -> WorkerReport {
        WorkerReport {
            open_plays: self.store.len(),
            ..self.report.clone()
        }
    }

    pub fn store(&self) -> &PlayStateStore {
        &self.store
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermarks.current()
    }

    pub fn run(mut self, commands: Receiver<WorkerCommand>) -> Result<WorkerReport> {
        info!("Worker '{}': started", self.name);
        loop {
            match commands.try_recv() {
                Ok(WorkerCommand::Drain) | Err(TryRecvError::Disconnected) => {
                    return self.drain();
                }
                Ok(WorkerCommand::Stop) => {
                    info!("Worker '{}': stopped with {} open plays", self.name, self.store.len());
                    return Ok(self.report());
                }
                Err(TryRecvError::Empty) => {}
            }
            if let Err(err) = self.step() {
                error!("Worker '{}': {err}", self.name);
                return Err(err);
            }
        }
    }

    /// One poll/close/emit/commit cycle.
    pub fn step(&mut self) -> Result<StepStats> {
        let plays = poll_with_retry(
            self.plays.as_mut(),
            self.config.poll_max_batch,
            Duration::ZERO,
            &self.config.retry,
        )?;
        // Only block on the second stream when the first had nothing.
        let frames_timeout = if plays.is_empty() {
            self.config.poll_timeout
        } else {
            Duration::ZERO
        };
        let frames = poll_with_retry(
            self.frames.as_mut(),
            self.config.poll_max_batch,
            frames_timeout,
            &self.config.retry,
        )?;

        let now = self.clock.now();
        let polled = plays.len() + frames.len();
        for record in plays {
            self.ingest_play(record, now);
        }
        for record in frames {
            self.ingest_frame(record, now);
        }

        let closed = self.close_ready(now)?;
        Ok(StepStats { polled, closed })
    }

    /// Emits every play that is already closable, persists the checkpoint and
    /// commits offsets so open plays resume from the log after a restart.
    pub fn drain(mut self) -> Result<WorkerReport> {
        let now = self.clock.now();
        info!(
            "Worker '{}': draining with {} open plays",
            self.name,
            self.store.len()
        );
        self.close_ready(now)?;
        self.checkpoint_and_commit(now, true)?;
        let report = self.report();
        info!(
            "Worker '{}': drained; emitted={} late={} orphaned={} open={}",
            self.name, report.emitted, report.late, report.orphaned, report.open_plays
        );
        Ok(report)
    }

    fn ingest_play(&mut self, record: LogRecord, now: DateTime<Utc>) {
        self.report.records += 1;
        let decoded = match undecodable(&record) {
            Some(reason) => Err(reason),
            None => decode_play_record(&record.payload),
        };
        let parsed = match decoded {
            Ok(parsed) => parsed,
            Err(reason) => return self.divert_malformed(StreamKind::Plays, record, reason),
        };
        let key = parsed.key();
        self.watermarks.observe(StreamKind::Plays, parsed.event_time(), now);
        let input = match parsed {
            PlayRecord::Play(event) => StoreInput::Event(event),
            PlayRecord::PlayEnd(end) => StoreInput::End(end),
        };
        let watermark = self.watermarks.current();
        match self.store.upsert(&key, input, record.offset, now, watermark) {
            UpsertOutcome::Updated(_) => {}
            UpsertOutcome::DuplicateEvent(event) => {
                warn!(
                    "Worker '{}': conflicting play event for {key} at offset {} ignored",
                    self.name, record.offset
                );
                self.report.late += 1;
                self.side.divert(Diverted::LateEvent {
                    reason: "conflicts with the ingested play event".to_string(),
                    record: PlayRecord::Play(event),
                });
            }
            UpsertOutcome::Late(reason, input) => self.divert_late(key, reason, input),
        }
    }

    fn ingest_frame(&mut self, record: LogRecord, now: DateTime<Utc>) {
        self.report.records += 1;
        let decoded = match undecodable(&record) {
            Some(reason) => Err(reason),
            None => decode_frame(&record.payload),
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(reason) => return self.divert_malformed(StreamKind::Frames, record, reason),
        };
        let key = frame.key();
        let event_time = frame.event_time;
        let terminal = self.config.features.is_terminal_event(frame.event.as_deref());
        self.watermarks.observe(StreamKind::Frames, event_time, now);
        let watermark = self.watermarks.current();
        match self
            .store
            .upsert(&key, StoreInput::Frame(frame), record.offset, now, watermark)
        {
            UpsertOutcome::Updated(state) => {
                if terminal {
                    state.mark_terminal(event_time);
                }
            }
            UpsertOutcome::DuplicateEvent(_) => {}
            UpsertOutcome::Late(reason, input) => self.divert_late(key, reason, input),
        }
    }

    fn divert_malformed(&mut self, stream: StreamKind, record: LogRecord, reason: String) {
        self.report.malformed += 1;
        let stream_name = match stream {
            StreamKind::Plays => crate::log_cursor::PLAYS_STREAM,
            StreamKind::Frames => crate::log_cursor::FRAMES_STREAM,
        };
        let err = PipelineError::MalformedRecord {
            stream: stream_name,
            offset: record.offset,
            reason: reason.clone(),
        };
        warn!("Worker '{}': {err}", self.name);
        self.side.divert(Diverted::Malformed {
            stream: stream_name.to_string(),
            partition: record.partition,
            offset: record.offset,
            reason,
            payload: record.payload,
        });
    }

    fn divert_late(&mut self, key: PlayKey, reason: LateReason, input: StoreInput) {
        self.report.late += 1;
        let reason = match reason {
            LateReason::PlayClosed => "play already closed",
            LateReason::OutOfOrder => "frame behind reorder window",
            LateReason::BehindWatermark => "behind watermark plus grace",
        }
        .to_string();
        let err = PipelineError::LateData {
            key,
            reason: reason.clone(),
        };
        debug!("Worker '{}': {err}", self.name);
        let diverted = match input {
            StoreInput::Frame(frame) => Diverted::LateFrame { reason, frame },
            StoreInput::Event(event) => Diverted::LateEvent {
                reason,
                record: PlayRecord::Play(event),
            },
            StoreInput::End(end) => Diverted::LateEvent {
                reason,
                record: PlayRecord::PlayEnd(end),
            },
        };
        self.side.divert(diverted);
    }

    fn close_ready(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let watermark = self.watermarks.advance(now);
        for state in self.store.states_mut() {
            state.update_age(watermark);
        }

        let mut closing = Vec::new();
        let mut orphaned = Vec::new();
        for state in self.store.states() {
            match self.watermarks.decide(state, now) {
                ClosureDecision::Open => {}
                ClosureDecision::Close(reason) => closing.push((state.key.clone(), reason)),
                ClosureDecision::Orphaned(reason) => orphaned.push((state.key.clone(), reason)),
            }
        }
        let excess = self
            .store
            .over_capacity()
            .saturating_sub(closing.len() + orphaned.len());
        if excess > 0 {
            let chosen = closing
                .iter()
                .chain(orphaned.iter())
                .map(|(key, _)| key.clone())
                .collect::<HashSet<_>>();
            let evicted = self
                .store
                .oldest_keys(self.store.len())
                .into_iter()
                .filter(|key| !chosen.contains(key))
                .take(excess)
                .collect::<Vec<_>>();
            warn!(
                "Worker '{}': {} active plays over capacity, forcing {} closures",
                self.name,
                self.store.len(),
                evicted.len()
            );
            for key in evicted {
                let has_event = self.store.get(&key).is_some_and(|s| s.event.is_some());
                if has_event {
                    closing.push((key, ClosureReason::StateTimeout));
                } else {
                    orphaned.push((key, ClosureReason::StateTimeout));
                }
            }
        }

        let mut pruned = 0;
        if let Some(wm) = watermark {
            pruned = self.store.prune_closed(
                wm,
                self.config.closed_retention(),
                self.plays.committed(),
                self.frames.committed(),
            );
        }
        if closing.is_empty() && orphaned.is_empty() {
            self.checkpoint_and_commit(now, pruned > 0)?;
            return Ok(0);
        }

        orphaned.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, reason) in orphaned {
            self.divert_orphan(&key, reason, watermark, now);
        }

        closing.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, reason) in &closing {
            if let Some(state) = self.store.get_mut(key) {
                state.flush_pending();
                state.complete = *reason != ClosureReason::StateTimeout;
            }
        }
        let enriched = self.enrich_all(&closing, now);
        let mut closed = 0;
        for (key, reason, play) in enriched {
            let Some(play) = play else {
                continue;
            };
            self.emit(&key, reason, &play, watermark)?;
            closed += 1;
        }
        // New tombstones must reach the checkpoint even when no offset moves.
        self.checkpoint_and_commit(now, true)?;
        Ok(closed)
    }

    fn enrich_all(
        &self,
        closing: &[(PlayKey, ClosureReason)],
        processed_at: DateTime<Utc>,
    ) -> Vec<(PlayKey, ClosureReason, Option<EnrichedPlay>)> {
        let store = &self.store;
        let scorer = self.scorer.as_ref();
        let features = &self.config.features;
        let compute = || {
            closing
                .par_iter()
                .map(|(key, reason)| {
                    let play = store
                        .get(key)
                        .and_then(|state| enrich(state, *reason, scorer, features, processed_at));
                    (key.clone(), *reason, play)
                })
                .collect::<Vec<_>>()
        };
        match self.pool.as_deref() {
            Some(pool) => pool.install(compute),
            None => compute(),
        }
    }

    fn emit(
        &mut self,
        key: &PlayKey,
        reason: ClosureReason,
        play: &EnrichedPlay,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // Offsets stay uncommitted and the state stays put when this fails.
        let outcome = self.emitter.emit(play)?;
        match outcome {
            PublishOutcome::Written => self.report.emitted += 1,
            PublishOutcome::Unchanged => self.report.unchanged += 1,
        }
        if reason == ClosureReason::StateTimeout {
            self.report.timeouts += 1;
            let err = PipelineError::StateTimeout {
                key: key.clone(),
                max_age_ms: self.config.max_state_age_ms,
            };
            warn!("Worker '{}': {err}; emitted with completeness=false", self.name);
        }
        let closed_at = self.closure_time(key, watermark, play.processed_at);
        self.store.close(key, closed_at);
        debug!(
            "Worker '{}': closed {key} ({reason:?}, {} frames)",
            self.name, play.frame_count
        );
        Ok(())
    }

    fn divert_orphan(
        &mut self,
        key: &PlayKey,
        reason: ClosureReason,
        watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        if let Some(state) = self.store.get_mut(key) {
            state.flush_pending();
        }
        let closed_at = self.closure_time(key, watermark, now);
        let Some(state) = self.store.close(key, closed_at) else {
            return;
        };
        self.report.orphaned += 1;
        let rows = state
            .frames
            .into_iter()
            .flat_map(|frame| frame.rows)
            .collect::<Vec<_>>();
        warn!(
            "Worker '{}': {key} closed ({reason:?}) without a play event; diverting {} rows",
            self.name,
            rows.len()
        );
        self.side.divert(Diverted::OrphanFrames {
            key: key.clone(),
            reason: format!("no play event before closure ({reason:?})"),
            rows,
        });
    }

    fn closure_time(
        &self,
        key: &PlayKey,
        watermark: Option<DateTime<Utc>>,
        fallback: DateTime<Utc>,
    ) -> DateTime<Utc> {
        watermark
            .or_else(|| self.store.get(key).and_then(|s| s.last_observed_time()))
            .unwrap_or(fallback)
    }

    /// Tombstones are persisted before offsets move past the records they cover.
    fn checkpoint_and_commit(&mut self, now: DateTime<Utc>, force: bool) -> Result<()> {
        let plays_target = self
            .store
            .min_required_offset(StreamKind::Plays)
            .unwrap_or(self.plays.position());
        let frames_target = self
            .store
            .min_required_offset(StreamKind::Frames)
            .unwrap_or(self.frames.position());
        let plays_moves = self.plays.committed() != Some(plays_target);
        let frames_moves = self.frames.committed() != Some(frames_target);
        if !force && !plays_moves && !frames_moves {
            return Ok(());
        }

        let mut checkpoint = Checkpoint::new(self.partition, now);
        checkpoint.closed = self
            .store
            .closed_entries()
            .into_iter()
            .map(|(key, tombstone)| ClosedPlay::new(key, tombstone))
            .collect();
        self.checkpoints.save(&checkpoint)?;

        self.commit(StreamKind::Plays, plays_target)?;
        self.commit(StreamKind::Frames, frames_target)?;
        self.report.commits += 1;
        debug!(
            "Worker '{}': committed plays={plays_target} frames={frames_target} ({} open)",
            self.name,
            self.store.len()
        );
        Ok(())
    }

    fn commit(&mut self, stream: StreamKind, offset: u64) -> Result<()> {
        let cursor = match stream {
            StreamKind::Plays => self.plays.as_mut(),
            StreamKind::Frames => self.frames.as_mut(),
        };
        if cursor.committed().is_some_and(|c| c >= offset) {
            return Ok(());
        }
        cursor
            .commit(offset)
            .map_err(|source| PipelineError::StreamUnavailable {
                stream: cursor.stream().to_string(),
                partition: cursor.partition(),
                attempts: 1,
                source,
            })
    }
}

fn undecodable(record: &LogRecord) -> Option<String> {
    record
        .encoding_error
        .as_ref()
        .map(|err| format!("payload is not UTF-8: {err}"))
}
