//! Property tests for feature bounds, frame ordering and watermark progress.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;

use gridiron_stream::config::{ChaosWeights, FeatureConfig, PipelineConfig};
use gridiron_stream::features::compute_features;
use gridiron_stream::records::{PlayEvent, TrackingFrame};
use gridiron_stream::store::{FrameSnapshot, ReorderBuffer, StreamKind};
use gridiron_stream::watermark::WatermarkManager;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 9, 7, 20, 20, 0).unwrap()
}

fn event(defenders_in_box: i32) -> PlayEvent {
    PlayEvent {
        game_id: "g".to_string(),
        play_id: 1,
        quarter: 1,
        down: 2,
        ydstogo: 5,
        yardline_100: 40,
        posteam: "DET".to_string(),
        defteam: "KC".to_string(),
        play_type: "pass".to_string(),
        shotgun: false,
        no_huddle: false,
        formation: String::new(),
        personnel: String::new(),
        defenders_in_box,
        number_of_pass_rushers: 4,
        event_time: t0(),
    }
}

fn row(frame_id: u32, player: String, team: &str, position: &str, x: f64, y: f64, accel: f64) -> TrackingFrame {
    TrackingFrame {
        game_id: "g".to_string(),
        play_id: 1,
        frame_id,
        player_id: player,
        team: team.to_string(),
        position: position.to_string(),
        x,
        y,
        speed: 0.0,
        acceleration: accel,
        direction: 0.0,
        event: None,
        event_time: t0() + ChronoDuration::milliseconds(i64::from(frame_id) * 100),
    }
}

type PlayerSample = (f64, f64, f64);

fn arb_frame() -> impl Strategy<Value = (Option<PlayerSample>, Vec<(usize, PlayerSample)>)> {
    let sample = (0.0..120.0f64, 0.0..53.3f64, -1.0e3..1.0e3f64);
    (
        prop::option::weighted(0.8, sample.clone()),
        prop::collection::vec((0usize..3, sample), 0..5),
    )
}

fn build_frames(samples: Vec<(Option<PlayerSample>, Vec<(usize, PlayerSample)>)>) -> Vec<FrameSnapshot> {
    const POSITIONS: [&str; 3] = ["DE", "CB", "DT"];
    samples
        .into_iter()
        .enumerate()
        .map(|(idx, (passer, defenders))| {
            let frame_id = idx as u32 + 1;
            let mut rows = Vec::new();
            if let Some((x, y, a)) = passer {
                rows.push(row(frame_id, "qb".to_string(), "DET", "QB", x, y, a));
            }
            for (n, (position, (x, y, a))) in defenders.into_iter().enumerate() {
                rows.push(row(frame_id, format!("d{n}"), "KC", POSITIONS[position], x, y, a));
            }
            FrameSnapshot {
                frame_id,
                event_time: t0() + ChronoDuration::milliseconds(i64::from(frame_id) * 100),
                event: (frame_id == 1).then(|| "ball_snap".to_string()),
                rows,
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn features_stay_bounded_and_finite(
        samples in prop::collection::vec(arb_frame(), 0..40),
        defenders_in_box in -5i32..20,
        threshold in 0.1..5.0f64,
        weights in (0.0..1.0f64, 0.0..1.0f64, 0.0..1.0f64),
    ) {
        let config = FeatureConfig {
            proximity_threshold: threshold,
            chaos_weights: ChaosWeights {
                pressure: weights.0,
                density: weights.1,
                accel: weights.2,
            },
            ..FeatureConfig::default()
        };
        let frames = build_frames(samples);
        let features = compute_features(&event(defenders_in_box), &frames, &config);

        prop_assert!(features.chaos_score.is_finite());
        prop_assert!((0.0..=100.0).contains(&features.chaos_score));
        if let Some(rate) = features.pressure_rate {
            prop_assert!((0.0..=1.0).contains(&rate));
        }
        if let Some(dist) = features.nearest_defender_dist {
            prop_assert!(dist.is_finite() && dist >= 0.0);
            prop_assert_eq!(features.was_pressure, dist < threshold);
        } else {
            prop_assert!(!features.was_pressure);
        }
        if let Some(ttt) = features.time_to_throw {
            prop_assert!(ttt.is_finite() && ttt >= 0.0);
        }
    }

    #[test]
    fn reorder_buffer_emits_each_frame_once_in_order(
        ids in prop::collection::vec(1u32..60, 1..120),
        max_gap in 0u32..6,
    ) {
        let mut buffer = ReorderBuffer::new(max_gap);
        let mut released = Vec::new();
        let mut late = 0usize;
        for (n, frame_id) in ids.iter().enumerate() {
            match buffer.push(row(*frame_id, format!("p{n}"), "DET", "WR", 10.0, 10.0, 0.0)) {
                Ok(frames) => released.extend(frames),
                Err(_) => late += 1,
            }
        }
        released.extend(buffer.flush());

        prop_assert!(released.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
        let rows = released.iter().map(|f| f.rows.len()).sum::<usize>();
        prop_assert_eq!(rows + late, ids.len());
    }

    #[test]
    fn combined_watermark_never_moves_backwards(
        observations in prop::collection::vec((any::<bool>(), 0i64..600_000, 0i64..20_000), 1..80),
    ) {
        let config = PipelineConfig::default();
        let mut manager = WatermarkManager::new(&config, t0());
        let mut now = t0();
        let mut last = None;
        for (plays, event_ms, pause_ms) in observations {
            now += ChronoDuration::milliseconds(pause_ms);
            let stream = if plays { StreamKind::Plays } else { StreamKind::Frames };
            manager.observe(stream, t0() + ChronoDuration::milliseconds(event_ms), now);
            let current = manager.advance(now);
            if let (Some(prev), Some(cur)) = (last, current) {
                prop_assert!(cur >= prev);
            }
            prop_assert!(last.is_none() || current.is_some());
            last = current;
        }
    }
}
