use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use gridiron_stream::config::FeatureConfig;
use gridiron_stream::features::{compute_features, enrich};
use gridiron_stream::records::{ClosureReason, PlayEvent, PocketLocation, TrackingFrame};
use gridiron_stream::scoring::{FeatureVector, Prediction, RuleScorer, Scorer};
use gridiron_stream::store::{PlayStateStore, StoreInput, StoreLimits, UpsertOutcome};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 9, 10, 17, 0, 0).unwrap()
}

fn first_down_event() -> PlayEvent {
    PlayEvent {
        game_id: "2023_01_DET_KC".to_string(),
        play_id: 77,
        quarter: 1,
        down: 1,
        ydstogo: 10,
        yardline_100: 75,
        posteam: "DET".to_string(),
        defteam: "KC".to_string(),
        play_type: "pass".to_string(),
        shotgun: true,
        no_huddle: false,
        formation: "SHOTGUN".to_string(),
        personnel: "1 RB, 1 TE, 3 WR".to_string(),
        defenders_in_box: 6,
        number_of_pass_rushers: 4,
        event_time: t0(),
    }
}

fn row(frame_id: u32, player: &str, team: &str, position: &str, x: f64, y: f64) -> TrackingFrame {
    TrackingFrame {
        game_id: "2023_01_DET_KC".to_string(),
        play_id: 77,
        frame_id,
        player_id: player.to_string(),
        team: team.to_string(),
        position: position.to_string(),
        x,
        y,
        speed: 2.0,
        acceleration: 1.0 + f64::from(frame_id % 3),
        direction: 180.0,
        event: (frame_id == 1).then(|| "ball_snap".to_string()),
        event_time: t0() + ChronoDuration::milliseconds(i64::from(frame_id) * 100),
    }
}

/// 30 frames; the defender sits `close` yards from the passer on the first
/// `close_frames` frames and 5 yards away on the rest.
fn pressure_rows(defender_position: &str, close_frames: u32, close: f64) -> Vec<TrackingFrame> {
    let mut rows = Vec::new();
    for frame_id in 1..=30 {
        let gap = if frame_id <= close_frames { close } else { 5.0 };
        rows.push(row(frame_id, "qb-9", "DET", "QB", 40.0, 26.0));
        rows.push(row(frame_id, "de-97", "KC", defender_position, 40.0 + gap, 26.0));
        rows.push(row(frame_id, "ball", "football", "", 41.0, 26.65));
    }
    rows
}

fn ingest(rows: Vec<TrackingFrame>, event: Option<PlayEvent>) -> PlayStateStore {
    let mut store = PlayStateStore::new(StoreLimits {
        reorder_max_gap: 3,
        max_active_plays: 16,
        grace: ChronoDuration::milliseconds(1500),
    });
    let key = first_down_event().key();
    if let Some(event) = event {
        store.upsert(&key, StoreInput::Event(event), 0, t0(), None);
    }
    // Reverse pairs of frames to exercise the reorder buffer.
    let mut rows = rows;
    rows.sort_by_key(|r| (r.frame_id + (r.frame_id % 2) * 2, r.player_id.clone()));
    for (offset, frame) in rows.into_iter().enumerate() {
        let outcome = store.upsert(&key, StoreInput::Frame(frame), offset as u64, t0(), None);
        assert!(matches!(outcome, UpsertOutcome::Updated(_)), "row diverted");
    }
    store
        .get_mut(&key)
        .expect("state exists")
        .flush_pending();
    store
}

#[test]
fn rusher_close_on_18_of_30_frames_gives_pressure_rate_point_six() {
    let config = FeatureConfig::default();
    let store = ingest(pressure_rows("DE", 18, 1.2), Some(first_down_event()));
    let state = store.get(&first_down_event().key()).expect("state");
    assert_eq!(state.frame_count(), 30);
    assert!(state.frames.windows(2).all(|w| w[0].frame_id < w[1].frame_id));

    let play = enrich(state, ClosureReason::Watermark, &RuleScorer, &config, t0())
        .expect("event present");
    let rate = play.pressure_rate.expect("pressure rate");
    assert!((rate - 0.6).abs() < 1e-12, "pressure_rate={rate}");
    let nearest = play.nearest_defender_dist.expect("rusher frames present");
    assert!((nearest - 1.2).abs() < 1e-9);
    assert!(play.was_pressure);
    assert_eq!(play.qb_pocket_location, Some(PocketLocation::Center));
    assert_eq!(play.predicted_play_type, "run");
    assert!(play.completeness);
    assert_eq!(play.frame_count, 30);
    assert_eq!(play.feature_version, config.version);
    assert!((0.0..=100.0).contains(&play.chaos_score));
    assert_eq!(play.fingerprint, play.content_fingerprint());
}

#[test]
fn no_rusher_frames_yield_null_distance_and_no_pressure() {
    let config = FeatureConfig::default();
    let store = ingest(pressure_rows("CB", 30, 1.0), Some(first_down_event()));
    let state = store.get(&first_down_event().key()).expect("state");
    let play = enrich(state, ClosureReason::Watermark, &RuleScorer, &config, t0())
        .expect("event present");
    assert_eq!(play.nearest_defender_dist, None);
    assert!(!play.was_pressure);
    // The corner is still a defender, so the per-frame proximity count is defined.
    assert_eq!(play.pressure_rate, Some(1.0));
}

#[test]
fn partial_state_without_passer_still_enriches() {
    let config = FeatureConfig::default();
    let rows = (1..=4)
        .map(|frame_id| row(frame_id, "de-97", "KC", "DE", 50.0, 20.0))
        .collect::<Vec<_>>();
    let store = ingest(rows, Some(first_down_event()));
    let state = store.get(&first_down_event().key()).expect("state");
    let play = enrich(state, ClosureReason::StateTimeout, &RuleScorer, &config, t0())
        .expect("event present");
    assert_eq!(play.pressure_rate, None);
    assert_eq!(play.time_to_throw, None);
    assert_eq!(play.nearest_defender_dist, None);
    assert_eq!(play.qb_pocket_location, None);
    assert!(!play.completeness);
    assert_eq!(play.closure_reason, ClosureReason::StateTimeout);
    assert!(play.chaos_score.is_finite());
}

#[test]
fn frames_without_event_do_not_enrich() {
    let config = FeatureConfig::default();
    let store = ingest(pressure_rows("DE", 10, 1.0), None);
    let state = store.get(&first_down_event().key()).expect("state");
    assert!(enrich(state, ClosureReason::Watermark, &RuleScorer, &config, t0()).is_none());
}

struct BrokenScorer;

impl Scorer for BrokenScorer {
    fn score(&self, _features: &FeatureVector) -> anyhow::Result<Prediction> {
        Err(anyhow!("model not loaded"))
    }
}

#[test]
fn scorer_failure_degrades_to_unknown_prediction() {
    let config = FeatureConfig::default();
    let store = ingest(pressure_rows("DE", 18, 1.2), Some(first_down_event()));
    let state = store.get(&first_down_event().key()).expect("state");
    let play = enrich(state, ClosureReason::TerminalSignal, &BrokenScorer, &config, t0())
        .expect("event present");
    assert_eq!(play.predicted_play_type, "unknown");
    assert_eq!(play.epa, 0.0);
    assert!(play.pressure_rate.is_some());
}

#[test]
fn threshold_and_weights_come_from_config() {
    let mut config = FeatureConfig::default();
    config.proximity_threshold = 1.0;
    let event = first_down_event();
    let store = ingest(pressure_rows("DE", 18, 1.2), Some(event.clone()));
    let state = store.get(&event.key()).expect("state");
    let features = compute_features(&event, &state.frames, &config);
    assert_eq!(features.pressure_rate, Some(0.0));
    assert!(!features.was_pressure);

    config.chaos_weights.pressure = 0.0;
    config.chaos_weights.accel = 0.0;
    config.chaos_weights.density = 1.0;
    let density_only = compute_features(&event, &state.frames, &config);
    assert!((density_only.chaos_score - 100.0 * 6.0 / 11.0).abs() < 1e-9);
}
