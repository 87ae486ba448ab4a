//! Pure per-play feature derivation.
//!
//! Everything here works on partial data: a missing passer, snap, release or
//! defender yields `None` for the affected feature rather than an error.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;

use crate::config::FeatureConfig;
use crate::records::{ClosureReason, EnrichedPlay, PlayEvent, PocketLocation, TrackingFrame};
use crate::scoring::{FeatureVector, Prediction, Scorer};
use crate::store::{FrameSnapshot, PlayState};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureSet {
    pub pressure_rate: Option<f64>,
    pub time_to_throw: Option<f64>,
    pub was_pressure: bool,
    pub nearest_defender_dist: Option<f64>,
    pub qb_pocket_location: Option<PocketLocation>,
    pub chaos_score: f64,
}

/// Snap and release positions within the ordered frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassWindow {
    pub snap: usize,
    pub snap_tagged: bool,
    pub release: Option<usize>,
    pub end: usize,
}

pub fn compute_features(
    event: &PlayEvent,
    frames: &[FrameSnapshot],
    config: &FeatureConfig,
) -> FeatureSet {
    let window = pass_window(frames, config);
    let passer = passer_id(event, frames, window, config);

    let distances = match (window, passer.as_deref()) {
        (Some(w), Some(id)) => frames[w.snap..=w.end]
            .iter()
            .map(|frame| defender_distance(event, frame, id))
            .collect::<Vec<_>>(),
        _ => Vec::new(),
    };

    let nearest_defender_dist = window.and_then(|w| {
        let offset = frames[w.snap..=w.end]
            .iter()
            .position(|frame| has_rusher(event, frame, config))?;
        distances
            .get(offset..)?
            .iter()
            .flatten()
            .copied()
            .reduce(f64::min)
    });
    let pressure_rate = pressure_rate(&distances, config.proximity_threshold);
    let was_pressure = nearest_defender_dist.is_some_and(|d| d < config.proximity_threshold);
    let time_to_throw = window.and_then(|w| time_to_throw(frames, w));
    let qb_pocket_location = match (window, passer.as_deref()) {
        (Some(w), Some(id)) => pocket_location(&frames[w.snap], id, config.field_width),
        _ => None,
    };
    let chaos_score = chaos_score(event, pressure_rate, frames, config);

    FeatureSet {
        pressure_rate,
        time_to_throw,
        was_pressure,
        nearest_defender_dist,
        qb_pocket_location,
        chaos_score,
    }
}

/// Builds the output record for a closed play. `None` when the play event is missing.
pub fn enrich(
    state: &PlayState,
    reason: ClosureReason,
    scorer: &dyn Scorer,
    config: &FeatureConfig,
    processed_at: DateTime<Utc>,
) -> Option<EnrichedPlay> {
    let event = state.event.as_ref()?;
    let features = compute_features(event, &state.frames, config);
    let vector = FeatureVector::new(event, &features);
    let prediction = match scorer.score(&vector) {
        Ok(prediction) => prediction,
        Err(err) => {
            warn!("Scoring failed for {}: {err:#}", state.key);
            Prediction::unknown()
        }
    };
    let play = EnrichedPlay {
        event: event.clone(),
        predicted_play_type: prediction.predicted_play_type,
        pressure_rate: features.pressure_rate,
        time_to_throw: features.time_to_throw,
        was_pressure: features.was_pressure,
        nearest_defender_dist: features.nearest_defender_dist,
        qb_pocket_location: features.qb_pocket_location,
        chaos_score: features.chaos_score,
        epa: finite_or_zero(prediction.epa),
        completeness: reason != ClosureReason::StateTimeout,
        closure_reason: reason,
        frame_count: state.frame_count(),
        feature_version: config.version.clone(),
        fingerprint: String::new(),
        processed_at,
    };
    Some(play.with_fingerprint())
}

pub fn pass_window(frames: &[FrameSnapshot], config: &FeatureConfig) -> Option<PassWindow> {
    if frames.is_empty() {
        return None;
    }
    let tagged = frames
        .iter()
        .position(|f| config.is_snap_event(f.event.as_deref()));
    let snap = tagged.unwrap_or(0);
    let release = frames[snap + 1..]
        .iter()
        .position(|f| config.is_release_event(f.event.as_deref()))
        .map(|idx| snap + 1 + idx);
    Some(PassWindow {
        snap,
        snap_tagged: tagged.is_some(),
        release,
        end: release.unwrap_or(frames.len() - 1),
    })
}

fn is_offense(event: &PlayEvent, row: &TrackingFrame) -> bool {
    row.team.eq_ignore_ascii_case(&event.posteam)
}

fn is_defense(event: &PlayEvent, row: &TrackingFrame) -> bool {
    row.team.eq_ignore_ascii_case(&event.defteam)
}

fn passer_id(
    event: &PlayEvent,
    frames: &[FrameSnapshot],
    window: Option<PassWindow>,
    config: &FeatureConfig,
) -> Option<String> {
    let start = window.map_or(0, |w| w.snap);
    frames[start..]
        .iter()
        .chain(frames[..start].iter())
        .flat_map(|frame| frame.rows.iter())
        .find(|row| is_offense(event, row) && config.is_passer(&row.position))
        .map(|row| row.player_id.clone())
}

fn has_rusher(event: &PlayEvent, frame: &FrameSnapshot, config: &FeatureConfig) -> bool {
    frame
        .rows
        .iter()
        .any(|row| is_defense(event, row) && config.is_rusher(&row.position))
}

/// Closest defender to the passer in one frame.
pub fn defender_distance(event: &PlayEvent, frame: &FrameSnapshot, passer: &str) -> Option<f64> {
    let qb = frame.rows.iter().find(|row| row.player_id == passer)?;
    frame
        .rows
        .iter()
        .filter(|row| is_defense(event, row))
        .map(|row| ((row.x - qb.x).powi(2) + (row.y - qb.y).powi(2)).sqrt())
        .filter(|d| d.is_finite())
        .reduce(f64::min)
}

pub fn pressure_rate(distances: &[Option<f64>], threshold: f64) -> Option<f64> {
    let computable = distances.iter().flatten().count();
    if computable == 0 {
        return None;
    }
    let close = distances.iter().flatten().filter(|d| **d < threshold).count();
    Some((close as f64 / computable as f64).clamp(0.0, 1.0))
}

fn time_to_throw(frames: &[FrameSnapshot], window: PassWindow) -> Option<f64> {
    if !window.snap_tagged {
        return None;
    }
    let release = frames.get(window.release?)?;
    let snap = frames.get(window.snap)?;
    let secs = (release.event_time - snap.event_time).num_milliseconds() as f64 / 1000.0;
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

pub fn pocket_location(snap: &FrameSnapshot, passer: &str, field_width: f64) -> Option<PocketLocation> {
    let qb = snap.rows.iter().find(|row| row.player_id == passer)?;
    let centerline = snap
        .rows
        .iter()
        .find(|row| row.is_ball())
        .map_or(field_width / 2.0, |ball| ball.y);
    let lateral = field_width / 2.0 + (qb.y - centerline);
    let location = if lateral < field_width / 3.0 {
        PocketLocation::Right
    } else if lateral > 2.0 * field_width / 3.0 {
        PocketLocation::Left
    } else {
        PocketLocation::Center
    };
    Some(location)
}

/// Population variance of consecutive per-player acceleration deltas.
pub fn acceleration_delta_variance(frames: &[FrameSnapshot]) -> Option<f64> {
    let mut last_accel: HashMap<&str, f64> = HashMap::new();
    let mut deltas = Vec::new();
    for row in frames.iter().flat_map(|f| f.rows.iter()) {
        if row.is_ball() {
            continue;
        }
        if let Some(prev) = last_accel.insert(row.player_id.as_str(), row.acceleration) {
            deltas.push(row.acceleration - prev);
        }
    }
    if deltas.is_empty() {
        return None;
    }
    let n = deltas.len() as f64;
    let mean = deltas.iter().sum::<f64>() / n;
    Some(deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n)
}

pub fn chaos_score(
    event: &PlayEvent,
    pressure_rate: Option<f64>,
    frames: &[FrameSnapshot],
    config: &FeatureConfig,
) -> f64 {
    let weights = &config.chaos_weights;
    let total = weights.total();
    if !(total.is_finite() && total > 0.0) {
        return 0.0;
    }
    let pressure = pressure_rate.unwrap_or(0.0);
    let density = (f64::from(event.defenders_in_box) / config.max_box_count).clamp(0.0, 1.0);
    let accel = acceleration_delta_variance(frames)
        .map_or(0.0, |v| (v / config.accel_variance_cap).clamp(0.0, 1.0));
    let raw = 100.0
        * (weights.pressure * pressure + weights.density * density + weights.accel * accel)
        / total;
    finite_or_zero(raw).clamp(0.0, 100.0)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}
