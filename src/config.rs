use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

pub const FEATURE_CONFIG_VERSION: &str = "features-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosWeights {
    pub pressure: f64,
    pub density: f64,
    pub accel: f64,
}

impl Default for ChaosWeights {
    fn default() -> Self {
        Self {
            pressure: 0.5,
            density: 0.3,
            accel: 0.2,
        }
    }
}

impl ChaosWeights {
    pub fn total(&self) -> f64 {
        self.pressure + self.density + self.accel
    }
}

/// Product-tunable feature parameters. The `version` is stamped on every emitted
/// play so that a re-derivation can pick the same numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub version: String,
    // Yards.
    pub proximity_threshold: f64,
    pub chaos_weights: ChaosWeights,
    pub max_box_count: f64,
    pub accel_variance_cap: f64,
    pub field_width: f64,
    pub passer_positions: Vec<String>,
    pub rusher_positions: Vec<String>,
    pub snap_events: Vec<String>,
    pub release_events: Vec<String>,
    pub terminal_events: Vec<String>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            version: FEATURE_CONFIG_VERSION.to_string(),
            proximity_threshold: 2.0,
            chaos_weights: ChaosWeights::default(),
            max_box_count: 11.0,
            accel_variance_cap: 25.0,
            field_width: crate::records::FIELD_WIDTH,
            passer_positions: strings(&["QB"]),
            rusher_positions: strings(&["DE", "DT", "NT", "OLB", "EDGE", "DL", "RUSH"]),
            snap_events: strings(&["ball_snap", "snap_direct"]),
            release_events: strings(&["pass_forward", "pass_shovel"]),
            terminal_events: strings(&[
                "tackle",
                "out_of_bounds",
                "touchdown",
                "pass_outcome_incomplete",
                "qb_sack",
                "fumble_offense_recovered",
                "fumble_defense_recovered",
                "safety",
                "play_end",
            ]),
        }
    }
}

impl FeatureConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read feature config {}", path.display()))?;
        let config = serde_json::from_str::<FeatureConfig>(&raw)
            .with_context(|| format!("parse feature config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("serialize feature config")?;
        fs::write(&tmp, json).context("write feature config")?;
        fs::rename(&tmp, path).context("swap feature config")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.chaos_weights;
        if [w.pressure, w.density, w.accel]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(anyhow!("chaos weights must be finite and non-negative"));
        }
        if w.total() <= 0.0 {
            return Err(anyhow!("chaos weights must not all be zero"));
        }
        if !(self.proximity_threshold.is_finite() && self.proximity_threshold > 0.0) {
            return Err(anyhow!("proximity_threshold must be positive"));
        }
        if !(self.max_box_count.is_finite() && self.max_box_count > 0.0) {
            return Err(anyhow!("max_box_count must be positive"));
        }
        if !(self.accel_variance_cap.is_finite() && self.accel_variance_cap > 0.0) {
            return Err(anyhow!("accel_variance_cap must be positive"));
        }
        if !(self.field_width.is_finite() && self.field_width > 0.0) {
            return Err(anyhow!("field_width must be positive"));
        }
        if self.version.trim().is_empty() {
            return Err(anyhow!("feature config version is empty"));
        }
        Ok(())
    }

    pub fn is_passer(&self, position: &str) -> bool {
        contains_ci(&self.passer_positions, position)
    }

    pub fn is_rusher(&self, position: &str) -> bool {
        contains_ci(&self.rusher_positions, position)
    }

    pub fn is_snap_event(&self, event: Option<&str>) -> bool {
        event.is_some_and(|e| contains_ci(&self.snap_events, e))
    }

    pub fn is_release_event(&self, event: Option<&str>) -> bool {
        event.is_some_and(|e| contains_ci(&self.release_events, e))
    }

    pub fn is_terminal_event(&self, event: Option<&str>) -> bool {
        event.is_some_and(|e| contains_ci(&self.terminal_events, e))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub partitions: usize,
    pub poll_max_batch: usize,
    pub poll_timeout: Duration,
    pub out_of_orderness_ms: i64,
    pub grace_ms: i64,
    pub terminal_grace_ms: i64,
    pub idle_timeout_ms: i64,
    pub max_state_age_ms: i64,
    pub max_active_plays: usize,
    pub reorder_max_gap: u32,
    pub closed_retention_ms: i64,
    /// Threads for parallel feature computation; 0 uses the global rayon pool.
    pub feature_threads: usize,
    pub retry: RetryPolicy,
    pub features: FeatureConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            poll_max_batch: 500,
            poll_timeout: Duration::from_millis(200),
            out_of_orderness_ms: 500,
            grace_ms: 1500,
            terminal_grace_ms: 1500,
            idle_timeout_ms: 5000,
            max_state_age_ms: 120_000,
            max_active_plays: 2048,
            reorder_max_gap: 5,
            closed_retention_ms: 60_000,
            feature_threads: 0,
            retry: RetryPolicy::default(),
            features: FeatureConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let grace_ms = env_num::<i64>("GRIDIRON_GRACE_MS")
            .unwrap_or(defaults.grace_ms)
            .max(0);
        let features = match opt_env("GRIDIRON_FEATURE_CONFIG") {
            Some(path) => FeatureConfig::load(Path::new(&path))?,
            None => FeatureConfig::default(),
        };

        let config = Self {
            partitions: env_num::<usize>("GRIDIRON_PARTITIONS")
                .unwrap_or(defaults.partitions)
                .clamp(1, 64),
            poll_max_batch: env_num::<usize>("GRIDIRON_POLL_MAX_BATCH")
                .unwrap_or(defaults.poll_max_batch)
                .clamp(1, 100_000),
            poll_timeout: Duration::from_millis(
                env_num::<u64>("GRIDIRON_POLL_TIMEOUT_MS")
                    .unwrap_or(200)
                    .clamp(1, 60_000),
            ),
            out_of_orderness_ms: env_num::<i64>("GRIDIRON_OUT_OF_ORDER_MS")
                .unwrap_or(defaults.out_of_orderness_ms)
                .max(0),
            grace_ms,
            terminal_grace_ms: env_num::<i64>("GRIDIRON_TERMINAL_GRACE_MS")
                .unwrap_or(grace_ms)
                .max(0),
            idle_timeout_ms: env_num::<i64>("GRIDIRON_IDLE_TIMEOUT_MS")
                .unwrap_or(defaults.idle_timeout_ms)
                .max(1),
            max_state_age_ms: env_num::<i64>("GRIDIRON_MAX_STATE_AGE_MS")
                .unwrap_or(defaults.max_state_age_ms)
                .max(1),
            max_active_plays: env_num::<usize>("GRIDIRON_MAX_ACTIVE_PLAYS")
                .unwrap_or(defaults.max_active_plays)
                .max(1),
            reorder_max_gap: env_num::<u32>("GRIDIRON_REORDER_MAX_GAP")
                .unwrap_or(defaults.reorder_max_gap)
                .min(1_000),
            closed_retention_ms: env_num::<i64>("GRIDIRON_CLOSED_RETENTION_MS")
                .unwrap_or(defaults.closed_retention_ms)
                .max(0),
            feature_threads: env_num::<usize>("GRIDIRON_FEATURE_THREADS")
                .unwrap_or(defaults.feature_threads)
                .min(256),
            retry: RetryPolicy {
                max_attempts: env_num::<u32>("GRIDIRON_RETRY_MAX_ATTEMPTS")
                    .unwrap_or(defaults.retry.max_attempts)
                    .clamp(1, 100),
                base_delay: Duration::from_millis(
                    env_num::<u64>("GRIDIRON_RETRY_BASE_MS").unwrap_or(50),
                ),
                max_delay: Duration::from_millis(
                    env_num::<u64>("GRIDIRON_RETRY_MAX_MS").unwrap_or(2000),
                ),
            },
            features,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(anyhow!("partitions must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        self.features.validate()
    }

    pub fn grace(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.grace_ms)
    }

    pub fn terminal_grace(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.terminal_grace_ms)
    }

    pub fn out_of_orderness(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.out_of_orderness_ms)
    }

    pub fn idle_timeout(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.idle_timeout_ms)
    }

    pub fn max_state_age(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.max_state_age_ms)
    }

    pub fn closed_retention(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.closed_retention_ms)
    }
}

fn opt_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|val| {
        if val.trim().is_empty() {
            None
        } else {
            Some(val)
        }
    })
}

fn env_num<T: FromStr>(key: &str) -> Option<T> {
    opt_env(key).and_then(|val| val.trim().parse::<T>().ok())
}

fn contains_ci(set: &[String], value: &str) -> bool {
    let value = value.trim();
    set.iter().any(|item| item.eq_ignore_ascii_case(value))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ChaosWeights, FeatureConfig, RetryPolicy};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn rejects_all_zero_weights() {
        let config = FeatureConfig {
            chaos_weights: ChaosWeights {
                pressure: 0.0,
                density: 0.0,
                accel: 0.0,
            },
            ..FeatureConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn feature_config_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("features.json");
        let mut config = FeatureConfig::default();
        config.version = "features-v2".to_string();
        config.proximity_threshold = 1.5;
        config.save(&path).expect("save");
        let loaded = FeatureConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn position_and_event_matching_is_case_insensitive() {
        let config = FeatureConfig::default();
        assert!(config.is_passer("qb"));
        assert!(config.is_rusher("Edge"));
        assert!(config.is_release_event(Some("PASS_FORWARD")));
        assert!(!config.is_terminal_event(None));
    }
}
