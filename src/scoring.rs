//! Scoring collaborator seam.
//!
//! The pipeline treats the scorer as opaque: it hands over a feature vector and
//! takes back prediction fields synchronously.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::features::FeatureSet;
use crate::records::PlayEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub down: i32,
    pub ydstogo: i32,
    pub yardline_100: i32,
    pub quarter: i32,
    pub shotgun: bool,
    pub no_huddle: bool,
    pub defenders_in_box: i32,
    pub number_of_pass_rushers: i32,
    pub pressure_rate: Option<f64>,
    pub time_to_throw: Option<f64>,
    pub nearest_defender_dist: Option<f64>,
    pub chaos_score: f64,
}

impl FeatureVector {
    pub fn new(event: &PlayEvent, features: &FeatureSet) -> Self {
        Self {
            down: event.down,
            ydstogo: event.ydstogo,
            yardline_100: event.yardline_100,
            quarter: event.quarter,
            shotgun: event.shotgun,
            no_huddle: event.no_huddle,
            defenders_in_box: event.defenders_in_box,
            number_of_pass_rushers: event.number_of_pass_rushers,
            pressure_rate: features.pressure_rate,
            time_to_throw: features.time_to_throw,
            nearest_defender_dist: features.nearest_defender_dist,
            chaos_score: features.chaos_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_play_type: String,
    pub epa: f64,
}

impl Prediction {
    pub fn unknown() -> Self {
        Self {
            predicted_play_type: "unknown".to_string(),
            epa: 0.0,
        }
    }
}

pub trait Scorer: Send + Sync {
    fn score(&self, features: &FeatureVector) -> Result<Prediction>;
}

/// Situational rules: expected points from field position and down/distance, and a
/// play-type guess from down/distance/formation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleScorer;

impl Scorer for RuleScorer {
    fn score(&self, features: &FeatureVector) -> Result<Prediction> {
        if !(1..=4).contains(&features.down) {
            return Err(anyhow!("down {} outside 1..=4", features.down));
        }
        Ok(Prediction {
            predicted_play_type: predict_play_type(features).to_string(),
            epa: expected_points(features.down, features.ydstogo, features.yardline_100),
        })
    }
}

pub fn expected_points(down: i32, ydstogo: i32, yardline_100: i32) -> f64 {
    let mut ep = f64::from(100 - yardline_100) * 0.06 - 1.0;
    ep += match down {
        1 => 0.5,
        2 => 0.1,
        3 => -0.4,
        4 => -1.2,
        _ => 0.0,
    };
    if ydstogo <= 3 {
        ep += 0.4;
    } else if ydstogo >= 10 {
        ep -= 0.3;
    }
    // Red zone.
    if yardline_100 <= 20 {
        ep += 1.2;
    }
    if yardline_100 <= 10 {
        ep += 0.8;
    }
    if yardline_100 <= 5 {
        ep += 0.5;
    }
    (ep * 100.0).trunc() / 100.0
}

pub fn predict_play_type(features: &FeatureVector) -> &'static str {
    let (down, ydstogo) = (features.down, features.ydstogo);
    if down == 1 && ydstogo == 10 {
        "run"
    } else if down >= 3 && ydstogo >= 7 {
        "deep_pass"
    } else if down >= 3 && ydstogo <= 3 {
        "short_pass"
    } else if features.shotgun {
        "pass"
    } else {
        "run"
    }
}

#[cfg(test)]
mod tests {
    use super::{FeatureVector, RuleScorer, Scorer, expected_points};

    fn vector(down: i32, ydstogo: i32, yardline_100: i32, shotgun: bool) -> FeatureVector {
        FeatureVector {
            down,
            ydstogo,
            yardline_100,
            quarter: 1,
            shotgun,
            no_huddle: false,
            defenders_in_box: 6,
            number_of_pass_rushers: 4,
            pressure_rate: None,
            time_to_throw: None,
            nearest_defender_dist: None,
            chaos_score: 0.0,
        }
    }

    #[test]
    fn expected_points_follow_field_position_and_down() {
        // 25 * 0.06 - 1.0 + 0.5 - 0.3
        assert!((expected_points(1, 10, 75) - 0.7).abs() < 0.02);
        let goal_line = expected_points(1, 3, 3);
        assert!(goal_line > expected_points(1, 3, 30));
        assert!(expected_points(4, 12, 60) < expected_points(1, 12, 60));
    }

    #[test]
    fn play_type_rules_apply_in_order() {
        let scorer = RuleScorer;
        let cases = [
            (vector(1, 10, 75, true), "run"),
            (vector(3, 8, 50, false), "deep_pass"),
            (vector(4, 2, 40, true), "short_pass"),
            (vector(2, 6, 40, true), "pass"),
            (vector(2, 6, 40, false), "run"),
        ];
        for (features, expected) in cases {
            let prediction = scorer.score(&features).expect("valid down");
            assert_eq!(prediction.predicted_play_type, expected);
        }
    }

    #[test]
    fn invalid_down_is_an_error() {
        assert!(RuleScorer.score(&vector(0, 10, 75, false)).is_err());
    }
}
