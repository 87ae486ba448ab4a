use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

pub const FIELD_LENGTH: f64 = 120.0;
pub const FIELD_WIDTH: f64 = 53.3;
pub const BALL_TEAM: &str = "football";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayKey {
    pub game_id: String,
    pub play_id: i64,
}

impl PlayKey {
    pub fn new(game_id: impl Into<String>, play_id: i64) -> Self {
        Self {
            game_id: game_id.into(),
            play_id,
        }
    }
}

impl fmt::Display for PlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.game_id, self.play_id)
    }
}

/// Discrete per-play metadata. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEvent {
    pub game_id: String,
    pub play_id: i64,
    pub quarter: i32,
    pub down: i32,
    pub ydstogo: i32,
    pub yardline_100: i32,
    pub posteam: String,
    pub defteam: String,
    pub play_type: String,
    #[serde(deserialize_with = "bool_or_int")]
    pub shotgun: bool,
    #[serde(deserialize_with = "bool_or_int")]
    pub no_huddle: bool,
    #[serde(default, alias = "offense_formation")]
    pub formation: String,
    #[serde(default, alias = "offense_personnel")]
    pub personnel: String,
    pub defenders_in_box: i32,
    pub number_of_pass_rushers: i32,
    pub event_time: DateTime<Utc>,
}

impl PlayEvent {
    pub fn key(&self) -> PlayKey {
        PlayKey::new(self.game_id.clone(), self.play_id)
    }

    pub fn validate(&self) -> Result<(), String> {
        check_identity(&self.game_id, self.play_id)?;
        check_range("quarter", self.quarter, 1, 5)?;
        check_range("down", self.down, 1, 4)?;
        check_range("ydstogo", self.ydstogo, 0, 99)?;
        check_range("yardline_100", self.yardline_100, 0, 100)?;
        check_range("defenders_in_box", self.defenders_in_box, 0, 11)?;
        check_range("number_of_pass_rushers", self.number_of_pass_rushers, 0, 11)?;
        if self.posteam.trim().is_empty() {
            return Err("posteam is empty".to_string());
        }
        if self.defteam.trim().is_empty() {
            return Err("defteam is empty".to_string());
        }
        Ok(())
    }
}

/// Explicit "play ended" marker on the play log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEnd {
    pub game_id: String,
    pub play_id: i64,
    pub event_time: DateTime<Utc>,
}

/// One record of the play log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayRecord {
    Play(PlayEvent),
    PlayEnd(PlayEnd),
}

impl PlayRecord {
    pub fn key(&self) -> PlayKey {
        match self {
            PlayRecord::Play(event) => event.key(),
            PlayRecord::PlayEnd(end) => PlayKey::new(end.game_id.clone(), end.play_id),
        }
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        match self {
            PlayRecord::Play(event) => event.event_time,
            PlayRecord::PlayEnd(end) => end.event_time,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            PlayRecord::Play(event) => event.validate(),
            PlayRecord::PlayEnd(end) => check_identity(&end.game_id, end.play_id),
        }
    }
}

/// One player's (or the ball's) sample within a tracking frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingFrame {
    pub game_id: String,
    pub play_id: i64,
    pub frame_id: u32,
    #[serde(alias = "nfl_id")]
    pub player_id: String,
    #[serde(alias = "club")]
    pub team: String,
    #[serde(default)]
    pub position: String,
    pub x: f64,
    pub y: f64,
    #[serde(alias = "s")]
    pub speed: f64,
    #[serde(alias = "a")]
    pub acceleration: f64,
    #[serde(default, alias = "dir")]
    pub direction: f64,
    #[serde(default)]
    pub event: Option<String>,
    pub event_time: DateTime<Utc>,
}

impl TrackingFrame {
    pub fn key(&self) -> PlayKey {
        PlayKey::new(self.game_id.clone(), self.play_id)
    }

    pub fn is_ball(&self) -> bool {
        self.team.eq_ignore_ascii_case(BALL_TEAM)
    }

    pub fn validate(&self) -> Result<(), String> {
        check_identity(&self.game_id, self.play_id)?;
        if self.player_id.trim().is_empty() {
            return Err("player_id is empty".to_string());
        }
        if self.team.trim().is_empty() {
            return Err("team is empty".to_string());
        }
        check_float("x", self.x, 0.0, FIELD_LENGTH, true)?;
        check_float("y", self.y, 0.0, FIELD_WIDTH, true)?;
        check_float("speed", self.speed, 0.0, f64::MAX, true)?;
        if !self.acceleration.is_finite() {
            return Err("acceleration is not finite".to_string());
        }
        check_float("direction", self.direction, 0.0, 360.0, false)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PocketLocation {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    TerminalSignal,
    Watermark,
    StateTimeout,
}

/// Output record: the play event plus derived features. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPlay {
    #[serde(flatten)]
    pub event: PlayEvent,
    pub predicted_play_type: String,
    pub pressure_rate: Option<f64>,
    pub time_to_throw: Option<f64>,
    pub was_pressure: bool,
    pub nearest_defender_dist: Option<f64>,
    pub qb_pocket_location: Option<PocketLocation>,
    pub chaos_score: f64,
    pub epa: f64,
    pub completeness: bool,
    pub closure_reason: ClosureReason,
    pub frame_count: usize,
    pub feature_version: String,
    #[serde(default)]
    pub fingerprint: String,
    pub processed_at: DateTime<Utc>,
}

impl EnrichedPlay {
    pub fn key(&self) -> PlayKey {
        self.event.key()
    }

    /// SHA-256 over everything except `processed_at` and the fingerprint itself.
    pub fn content_fingerprint(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(_) => return String::new(),
        };
        if let Some(map) = value.as_object_mut() {
            map.remove("processed_at");
            map.remove("fingerprint");
        }
        let digest = Sha256::digest(value.to_string().as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn with_fingerprint(mut self) -> Self {
        self.fingerprint = self.content_fingerprint();
        self
    }
}

pub fn decode_play_record(payload: &str) -> Result<PlayRecord, String> {
    let record = serde_json::from_str::<PlayRecord>(payload).map_err(|err| err.to_string())?;
    record.validate()?;
    Ok(record)
}

pub fn decode_frame(payload: &str) -> Result<TrackingFrame, String> {
    let frame = serde_json::from_str::<TrackingFrame>(payload).map_err(|err| err.to_string())?;
    frame.validate()?;
    Ok(frame)
}

fn check_identity(game_id: &str, play_id: i64) -> Result<(), String> {
    if game_id.trim().is_empty() {
        return Err("game_id is empty".to_string());
    }
    if play_id < 0 {
        return Err(format!("play_id {play_id} is negative"));
    }
    Ok(())
}

fn check_range(name: &str, value: i32, min: i32, max: i32) -> Result<(), String> {
    if value < min || value > max {
        return Err(format!("{name}={value} outside [{min}, {max}]"));
    }
    Ok(())
}

fn check_float(name: &str, value: f64, min: f64, max: f64, inclusive_max: bool) -> Result<(), String> {
    if !value.is_finite() {
        return Err(format!("{name} is not finite"));
    }
    let above = if inclusive_max { value > max } else { value >= max };
    if value < min || above {
        return Err(format!("{name}={value} out of range"));
    }
    Ok(())
}

// Upstream feeds send 0/1 integers for flags.
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Bool(flag) => Ok(flag),
        serde_json::Value::Number(num) => Ok(num.as_f64().is_some_and(|n| n != 0.0)),
        serde_json::Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected bool or 0/1, got {other}"
        ))),
    }
}
