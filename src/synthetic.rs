//! Seeded synthetic games: play events, end markers and tracking frames with
//! bounded arrival jitter.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::log_cursor::{FRAMES_STREAM, FileLog, MemoryLog, PLAYS_STREAM, partition_for};
use crate::records::{BALL_TEAM, FIELD_LENGTH, FIELD_WIDTH, PlayEnd, PlayEvent, PlayRecord, TrackingFrame};

const TEAMS: [&str; 8] = ["DET", "KC", "BUF", "PHI", "SF", "DAL", "MIA", "BAL"];
const OFFENSE: [&str; 5] = ["QB", "RB", "WR", "WR", "TE"];
const DEFENSE: [&str; 5] = ["DE", "DT", "OLB", "CB", "SS"];

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub games: usize,
    pub plays_per_game: usize,
    pub min_frames: u32,
    pub max_frames: u32,
    pub frame_interval_ms: i64,
    pub play_gap_ms: i64,
    /// Maximum frame displacement on arrival; keep at or below the reorder gap.
    pub jitter_frames: u32,
    pub seed: u64,
    pub start: DateTime<Utc>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            games: 1,
            plays_per_game: 20,
            min_frames: 30,
            max_frames: 60,
            frame_interval_ms: 100,
            play_gap_ms: 25_000,
            jitter_frames: 3,
            seed: 7,
            start: Utc
                .with_ymd_and_hms(2023, 9, 7, 20, 20, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticPlay {
    pub event: PlayEvent,
    pub end: PlayEnd,
    pub frames: Vec<TrackingFrame>,
}

#[derive(Debug, Clone)]
pub struct SyntheticGame {
    pub game_id: String,
    pub plays: Vec<SyntheticPlay>,
}

/// Serialized log lines, keyed by `game_id`, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct SyntheticFeed {
    pub plays: Vec<(String, String)>,
    pub frames: Vec<(String, String)>,
}

pub fn generate(config: &SyntheticConfig) -> Vec<SyntheticGame> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    (0..config.games)
        .map(|idx| {
            let home = TEAMS[idx % TEAMS.len()];
            let away = TEAMS[(idx + 1 + idx / TEAMS.len()) % TEAMS.len()];
            let game_id = format!("2023_{:02}_{away}_{home}", idx + 1);
            let mut clock = config.start;
            let plays = (0..config.plays_per_game)
                .map(|n| {
                    let (posteam, defteam) = if n % 8 < 4 { (home, away) } else { (away, home) };
                    let play = synth_play(&mut rng, config, &game_id, n as i64 + 1, posteam, defteam, clock);
                    clock = play.end.event_time + ChronoDuration::milliseconds(config.play_gap_ms);
                    play
                })
                .collect();
            SyntheticGame { game_id, plays }
        })
        .collect()
}

fn synth_play(
    rng: &mut StdRng,
    config: &SyntheticConfig,
    game_id: &str,
    play_id: i64,
    posteam: &str,
    defteam: &str,
    start: DateTime<Utc>,
) -> SyntheticPlay {
    let down = rng.gen_range(1..=4);
    let shotgun = rng.gen_bool(0.6);
    let event = PlayEvent {
        game_id: game_id.to_string(),
        play_id,
        quarter: ((play_id - 1) / 15 + 1).min(4) as i32,
        down,
        ydstogo: if down == 1 { 10 } else { rng.gen_range(1..=15) },
        yardline_100: rng.gen_range(1..=99),
        posteam: posteam.to_string(),
        defteam: defteam.to_string(),
        play_type: if rng.gen_bool(0.55) { "pass" } else { "run" }.to_string(),
        shotgun,
        no_huddle: rng.gen_bool(0.1),
        formation: if shotgun { "SHOTGUN" } else { "SINGLEBACK" }.to_string(),
        personnel: "1 RB, 1 TE, 3 WR".to_string(),
        defenders_in_box: rng.gen_range(5..=8),
        number_of_pass_rushers: rng.gen_range(3..=6),
        event_time: start,
    };

    let frame_count = rng.gen_range(config.min_frames..=config.max_frames.max(config.min_frames));
    let snap_frame = frame_count.min(5);
    let release_frame = (event.play_type == "pass")
        .then(|| rng.gen_range(snap_frame + 10..snap_frame + 30))
        .filter(|f| *f < frame_count);
    let pressure = rng.gen_bool(0.35);
    let line_x = rng.gen_range(20.0..100.0);
    let ball_y = rng.gen_range(18.0..35.0);
    let qb_y = ball_y + rng.gen_range(-3.0..3.0);

    let mut frames = Vec::with_capacity(frame_count as usize * 11);
    for frame_id in 1..=frame_count {
        let t = start + ChronoDuration::milliseconds(i64::from(frame_id) * config.frame_interval_ms);
        let tag = if frame_id == snap_frame {
            Some("ball_snap")
        } else if Some(frame_id) == release_frame {
            Some("pass_forward")
        } else if frame_id == frame_count {
            Some(if release_frame.is_some() { "pass_outcome_incomplete" } else { "tackle" })
        } else {
            None
        };
        let progress = f64::from(frame_id.saturating_sub(snap_frame)) / f64::from(frame_count);
        let qb_x = line_x - 1.0 - 6.0 * progress.min(0.5);
        let mut row = |player: String, team: &str, position: &str, x: f64, y: f64, rng: &mut StdRng| {
            frames.push(TrackingFrame {
                game_id: game_id.to_string(),
                play_id,
                frame_id,
                player_id: player,
                team: team.to_string(),
                position: position.to_string(),
                x: x.clamp(0.0, FIELD_LENGTH),
                y: y.clamp(0.0, FIELD_WIDTH),
                speed: rng.gen_range(0.0..8.0),
                acceleration: rng.gen_range(0.0..5.0),
                direction: rng.gen_range(0.0..360.0),
                event: tag.map(str::to_string),
                event_time: t,
            });
        };
        row(format!("{game_id}-ball"), BALL_TEAM, "", line_x, ball_y, rng);
        for (idx, position) in OFFENSE.iter().enumerate() {
            let (x, y) = if idx == 0 {
                (qb_x, qb_y)
            } else {
                (line_x - 2.0 + progress * 15.0, ball_y + (idx as f64 - 2.5) * 6.0)
            };
            row(format!("{posteam}-{idx}"), posteam, position, x, y, rng);
        }
        for (idx, position) in DEFENSE.iter().enumerate() {
            let rusher = idx < 3;
            let (x, y) = if rusher {
                // Rushers close on the passer; pressured plays get inside two yards.
                let target = if pressure { 1.2 } else { 4.5 };
                let gap = (6.0 - progress * 12.0).max(target);
                (qb_x + gap, qb_y + (idx as f64 - 1.0) * 0.8)
            } else {
                (line_x + 8.0, ball_y + (idx as f64 - 3.5) * 10.0)
            };
            row(format!("{defteam}-{idx}"), defteam, position, x, y, rng);
        }
    }

    let end_time = start
        + ChronoDuration::milliseconds(i64::from(frame_count) * config.frame_interval_ms + 200);
    SyntheticPlay {
        end: PlayEnd {
            game_id: game_id.to_string(),
            play_id,
            event_time: end_time,
        },
        event,
        frames,
    }
}

/// Orders every record by (jittered) event time across games, the way a live
/// feed would interleave them.
pub fn render(games: &[SyntheticGame], config: &SyntheticConfig) -> Result<SyntheticFeed> {
    let mut rng = StdRng::seed_from_u64(config.seed ^ 0x5eed);
    let mut plays = Vec::new();
    let mut frames = Vec::new();
    for game in games {
        for play in &game.plays {
            let event = serde_json::to_string(&PlayRecord::Play(play.event.clone()))?;
            let end = serde_json::to_string(&PlayRecord::PlayEnd(play.end.clone()))?;
            plays.push((play.event.event_time.timestamp_millis(), game.game_id.clone(), event));
            plays.push((play.end.event_time.timestamp_millis(), game.game_id.clone(), end));
            for frame in &play.frames {
                let shift = i64::from(rng.gen_range(0..=config.jitter_frames)) * config.frame_interval_ms;
                let line = serde_json::to_string(frame)?;
                frames.push((frame.event_time.timestamp_millis() + shift, game.game_id.clone(), line));
            }
        }
    }
    plays.sort_by_key(|(at, _, _)| *at);
    frames.sort_by_key(|(at, _, _)| *at);
    Ok(SyntheticFeed {
        plays: plays.into_iter().map(|(_, game, line)| (game, line)).collect(),
        frames: frames.into_iter().map(|(_, game, line)| (game, line)).collect(),
    })
}

impl SyntheticFeed {
    pub fn append_to(&self, plays: &MemoryLog, frames: &MemoryLog) {
        for (game_id, line) in &self.plays {
            plays.append_keyed(game_id, line.clone());
        }
        for (game_id, line) in &self.frames {
            frames.append_keyed(game_id, line.clone());
        }
    }

    /// Writes `plays-<p>.jsonl` / `frames-<p>.jsonl`, appending to existing files.
    pub fn write_jsonl(&self, dir: &Path, partitions: usize) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        write_stream(&FileLog::new(dir, PLAYS_STREAM), partitions, &self.plays)?;
        write_stream(&FileLog::new(dir, FRAMES_STREAM), partitions, &self.frames)?;
        Ok(())
    }
}

fn write_stream(log: &FileLog, partitions: usize, lines: &[(String, String)]) -> Result<()> {
    let partitions = partitions.max(1);
    let mut writers = (0..partitions)
        .map(|p| {
            let path = log.data_path(p);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map(BufWriter::new)
                .with_context(|| format!("open {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    for (game_id, line) in lines {
        let writer = &mut writers[partition_for(game_id, partitions)];
        writeln!(writer, "{line}").context("write log line")?;
    }
    for writer in &mut writers {
        writer.flush().context("flush log")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{SyntheticConfig, generate, render};
    use crate::records::{decode_frame, decode_play_record};

    #[test]
    fn same_seed_same_games() {
        let config = SyntheticConfig {
            games: 2,
            plays_per_game: 3,
            ..SyntheticConfig::default()
        };
        let a = generate(&config);
        let b = generate(&config);
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].plays[2].frames, b[1].plays[2].frames);
        assert_ne!(a[0].game_id, a[1].game_id);
    }

    #[test]
    fn rendered_lines_pass_ingest_validation() {
        let config = SyntheticConfig {
            plays_per_game: 4,
            ..SyntheticConfig::default()
        };
        let games = generate(&config);
        let feed = render(&games, &config).expect("render");
        assert_eq!(feed.plays.len(), 8);
        for (_, line) in &feed.plays {
            decode_play_record(line).expect("valid play record");
        }
        for (_, line) in &feed.frames {
            decode_frame(line).expect("valid frame");
        }
    }
}
