//! Event-time progress tracking and the play closure policy.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::PipelineConfig;
use crate::records::ClosureReason;
use crate::store::{PlayState, StreamKind};

/// Watermark of one stream partition: max event time seen minus the allowed
/// out-of-orderness.
#[derive(Debug, Clone)]
pub struct StreamWatermark {
    out_of_orderness: ChronoDuration,
    max_event_time: Option<DateTime<Utc>>,
    // Processing time of the last record, or of creation before any record.
    last_activity: DateTime<Utc>,
    seen_records: bool,
}

impl StreamWatermark {
    pub fn new(out_of_orderness: ChronoDuration, created_at: DateTime<Utc>) -> Self {
        Self {
            out_of_orderness,
            max_event_time: None,
            last_activity: created_at,
            seen_records: false,
        }
    }

    pub fn observe(&mut self, event_time: DateTime<Utc>, now: DateTime<Utc>) {
        self.max_event_time = Some(
            self.max_event_time
                .map_or(event_time, |prev| prev.max(event_time)),
        );
        self.last_activity = self.last_activity.max(now);
        self.seen_records = true;
    }

    pub fn value(&self) -> Option<DateTime<Utc>> {
        self.max_event_time.map(|t| t - self.out_of_orderness)
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: ChronoDuration) -> bool {
        now - self.last_activity >= idle_timeout
    }

    pub fn has_records(&self) -> bool {
        self.seen_records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureDecision {
    Open,
    Close(ClosureReason),
    /// Closable, but the play event never arrived.
    Orphaned(ClosureReason),
}

/// Combined watermark for one worker, which owns one partition of each stream.
#[derive(Debug, Clone)]
pub struct WatermarkManager {
    plays: StreamWatermark,
    frames: StreamWatermark,
    idle_timeout: ChronoDuration,
    grace: ChronoDuration,
    terminal_grace: ChronoDuration,
    max_state_age: ChronoDuration,
    current: Option<DateTime<Utc>>,
}

impl WatermarkManager {
    pub fn new(config: &PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            plays: StreamWatermark::new(config.out_of_orderness(), now),
            frames: StreamWatermark::new(config.out_of_orderness(), now),
            idle_timeout: config.idle_timeout(),
            grace: config.grace(),
            terminal_grace: config.terminal_grace(),
            max_state_age: config.max_state_age(),
            current: None,
        }
    }

    pub fn observe(&mut self, stream: StreamKind, event_time: DateTime<Utc>, now: DateTime<Utc>) {
        match stream {
            StreamKind::Plays => self.plays.observe(event_time, now),
            StreamKind::Frames => self.frames.observe(event_time, now),
        }
    }

    pub fn stream(&self, stream: StreamKind) -> &StreamWatermark {
        match stream {
            StreamKind::Plays => &self.plays,
            StreamKind::Frames => &self.frames,
        }
    }

    /// Recomputes and returns the combined watermark. Never moves backwards.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let plays_idle = self.plays.is_idle(now, self.idle_timeout);
        let frames_idle = self.frames.is_idle(now, self.idle_timeout);
        let combined = match (plays_idle, frames_idle) {
            (false, false) => match (self.plays.value(), self.frames.value()) {
                (Some(p), Some(f)) => Some(p.min(f)),
                _ => None,
            },
            (true, false) => self.frames.value(),
            (false, true) => self.plays.value(),
            (true, true) => match (self.plays.value(), self.frames.value()) {
                (Some(p), Some(f)) => Some(p.max(f)),
                (p, f) => p.or(f),
            },
        };
        if let Some(candidate) = combined {
            self.current = Some(self.current.map_or(candidate, |prev| prev.max(candidate)));
        }
        self.current
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.current
    }

    /// Closure rule for one play against the current watermark.
    pub fn decide(&self, state: &PlayState, now: DateTime<Utc>) -> ClosureDecision {
        let reason = self.closure_reason(state, now);
        match reason {
            None => ClosureDecision::Open,
            Some(reason) if state.event.is_some() => ClosureDecision::Close(reason),
            Some(reason) => ClosureDecision::Orphaned(reason),
        }
    }

    fn closure_reason(&self, state: &PlayState, now: DateTime<Utc>) -> Option<ClosureReason> {
        if let Some(watermark) = self.current {
            if state
                .terminal_at
                .is_some_and(|at| watermark >= at + self.terminal_grace)
            {
                return Some(ClosureReason::TerminalSignal);
            }
            if state
                .last_observed_time()
                .is_some_and(|last| watermark >= last + self.grace)
            {
                return Some(ClosureReason::Watermark);
            }
        }
        if now - state.created_at > self.max_state_age {
            return Some(ClosureReason::StateTimeout);
        }
        None
    }
}
