use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use gridiron_stream::config::PipelineConfig;
use gridiron_stream::records::{ClosureReason, PlayEvent, PlayKey, TrackingFrame};
use gridiron_stream::store::{PlayStateStore, StoreInput, StoreLimits, StreamKind};
use gridiron_stream::watermark::{ClosureDecision, WatermarkManager};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 9, 7, 20, 20, 0).unwrap()
}

fn ms(n: i64) -> ChronoDuration {
    ChronoDuration::milliseconds(n)
}

fn event(play_id: i64) -> PlayEvent {
    PlayEvent {
        game_id: "2023_01_DET_KC".to_string(),
        play_id,
        quarter: 2,
        down: 3,
        ydstogo: 8,
        yardline_100: 45,
        posteam: "KC".to_string(),
        defteam: "DET".to_string(),
        play_type: "pass".to_string(),
        shotgun: true,
        no_huddle: false,
        formation: "SHOTGUN".to_string(),
        personnel: String::new(),
        defenders_in_box: 6,
        number_of_pass_rushers: 4,
        event_time: t0(),
    }
}

fn frame(play_id: i64, frame_id: u32) -> TrackingFrame {
    TrackingFrame {
        game_id: "2023_01_DET_KC".to_string(),
        play_id,
        frame_id,
        player_id: "KC-0".to_string(),
        team: "KC".to_string(),
        position: "QB".to_string(),
        x: 50.0,
        y: 26.0,
        speed: 1.0,
        acceleration: 0.0,
        direction: 0.0,
        event: None,
        event_time: t0() + ms(i64::from(frame_id) * 100),
    }
}

fn store(config: &PipelineConfig) -> PlayStateStore {
    PlayStateStore::new(StoreLimits {
        reorder_max_gap: config.reorder_max_gap,
        max_active_plays: config.max_active_plays,
        grace: config.grace(),
    })
}

/// A play with 30 frames (t0+100ms .. t0+3000ms) fed through the manager.
fn play_with_frames(
    config: &PipelineConfig,
    manager: &mut WatermarkManager,
    with_event: bool,
) -> (PlayStateStore, PlayKey) {
    let mut store = store(config);
    let key = PlayKey::new("2023_01_DET_KC", 12);
    if with_event {
        manager.observe(StreamKind::Plays, t0(), t0());
        store.upsert(&key, StoreInput::Event(event(12)), 0, t0(), None);
    }
    for frame_id in 1..=30 {
        let row = frame(12, frame_id);
        manager.observe(StreamKind::Frames, row.event_time, t0());
        store.upsert(&key, StoreInput::Frame(row), u64::from(frame_id), t0(), None);
    }
    store.get_mut(&key).expect("state").flush_pending();
    (store, key)
}

#[test]
fn closure_never_precedes_watermark_past_last_frame_plus_grace() {
    let config = PipelineConfig::default();
    let mut manager = WatermarkManager::new(&config, t0());
    let (store, key) = play_with_frames(&config, &mut manager, true);
    let state = store.get(&key).expect("state");
    let deadline = state.last_observed_time().expect("frames seen") + config.grace();

    let mut closed_at = None;
    for step in 0..=40 {
        // Later traffic on both streams pushes event time forward.
        let seen = t0() + ms(3000 + step * 100);
        manager.observe(StreamKind::Plays, seen, t0());
        manager.observe(StreamKind::Frames, seen, t0());
        let watermark = manager.advance(t0()).expect("both streams seen");
        match manager.decide(state, t0()) {
            ClosureDecision::Open => assert!(watermark < deadline, "open past {deadline}"),
            ClosureDecision::Close(reason) => {
                assert!(watermark >= deadline, "closed early at {watermark}");
                assert_eq!(reason, ClosureReason::Watermark);
                closed_at.get_or_insert(watermark);
            }
            ClosureDecision::Orphaned(reason) => panic!("unexpected orphan ({reason:?})"),
        }
    }
    assert_eq!(closed_at, Some(deadline));
}

#[test]
fn terminal_signal_wins_when_both_rules_fire() {
    let config = PipelineConfig::default();
    let mut manager = WatermarkManager::new(&config, t0());
    let (mut store, key) = play_with_frames(&config, &mut manager, true);
    store
        .get_mut(&key)
        .expect("state")
        .mark_terminal(t0() + ms(3000));

    let seen = t0() + ms(5000);
    manager.observe(StreamKind::Plays, seen, t0());
    manager.observe(StreamKind::Frames, seen, t0());
    assert_eq!(manager.advance(t0()), Some(t0() + ms(4500)));
    let state = store.get(&key).expect("state");
    assert_eq!(
        manager.decide(state, t0()),
        ClosureDecision::Close(ClosureReason::TerminalSignal)
    );
}

#[test]
fn short_terminal_grace_closes_before_the_plain_watermark_rule() {
    let config = PipelineConfig {
        terminal_grace_ms: 300,
        ..PipelineConfig::default()
    };
    let mut manager = WatermarkManager::new(&config, t0());
    let (mut store, key) = play_with_frames(&config, &mut manager, true);
    store
        .get_mut(&key)
        .expect("state")
        .mark_terminal(t0() + ms(3000));

    let seen = t0() + ms(3800);
    manager.observe(StreamKind::Plays, seen, t0());
    manager.observe(StreamKind::Frames, seen, t0());
    manager.advance(t0());
    let state = store.get(&key).expect("state");
    assert_eq!(
        manager.decide(state, t0()),
        ClosureDecision::Close(ClosureReason::TerminalSignal)
    );
}

#[test]
fn frames_without_event_are_orphaned_not_emitted() {
    let config = PipelineConfig::default();
    let mut manager = WatermarkManager::new(&config, t0());
    let (store, key) = play_with_frames(&config, &mut manager, false);
    let seen = t0() + ms(10_000);
    manager.observe(StreamKind::Plays, seen, t0());
    manager.observe(StreamKind::Frames, seen, t0());
    manager.advance(t0());
    let state = store.get(&key).expect("state");
    assert_eq!(
        manager.decide(state, t0()),
        ClosureDecision::Orphaned(ClosureReason::Watermark)
    );
}

#[test]
fn stalled_watermark_falls_back_to_state_age() {
    let config = PipelineConfig {
        max_state_age_ms: 30_000,
        ..PipelineConfig::default()
    };
    let mut manager = WatermarkManager::new(&config, t0());
    let mut store = store(&config);
    let key = PlayKey::new("2023_01_DET_KC", 12);
    // Only the plays stream ever reports, so the combined watermark stays unset.
    manager.observe(StreamKind::Plays, t0(), t0());
    store.upsert(&key, StoreInput::Event(event(12)), 0, t0(), None);
    assert_eq!(manager.advance(t0()), None);

    let state = store.get(&key).expect("state");
    assert_eq!(manager.decide(state, t0() + ms(30_000)), ClosureDecision::Open);
    assert_eq!(
        manager.decide(state, t0() + ms(30_001)),
        ClosureDecision::Close(ClosureReason::StateTimeout)
    );
}

#[test]
fn both_streams_idle_uses_the_furthest_watermark() {
    let config = PipelineConfig::default();
    let mut manager = WatermarkManager::new(&config, t0());
    let (store, key) = play_with_frames(&config, &mut manager, true);
    // Plays stream is far ahead; frames stopped at the end of the play.
    manager.observe(StreamKind::Plays, t0() + ms(20_000), t0());
    assert_eq!(manager.advance(t0()), Some(t0() + ms(2500)));
    let state = store.get(&key).expect("state");
    assert_eq!(manager.decide(state, t0()), ClosureDecision::Open);

    let later = t0() + config.idle_timeout() + ms(1);
    assert_eq!(manager.advance(later), Some(t0() + ms(19_500)));
    assert_eq!(
        manager.decide(state, later),
        ClosureDecision::Close(ClosureReason::Watermark)
    );
}
