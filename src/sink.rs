//! Output side: downstream sinks, the retrying emitter, and the side channel for
//! diverted records.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::error::{PipelineError, SinkError};
use crate::records::{EnrichedPlay, PlayKey, PlayRecord, TrackingFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Written,
    /// Same key and fingerprint already present.
    Unchanged,
}

/// Downstream consumer of enriched plays. Publishing must be an upsert by play key.
pub trait Sink: Send {
    fn name(&self) -> &str;
    fn publish(&mut self, play: &EnrichedPlay) -> Result<PublishOutcome, SinkError>;
}

#[derive(Debug, Default)]
struct MemorySinkInner {
    plays: HashMap<PlayKey, EnrichedPlay>,
    publishes: usize,
    writes: usize,
    fail_next: u32,
}

/// In-process upsert store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySinkInner> {
        self.inner.lock().expect("memory sink lock poisoned")
    }

    pub fn get(&self, key: &PlayKey) -> Option<EnrichedPlay> {
        self.lock().plays.get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<EnrichedPlay> {
        let mut plays = self.lock().plays.values().cloned().collect::<Vec<_>>();
        plays.sort_by(|a, b| a.key().cmp(&b.key()));
        plays
    }

    pub fn len(&self) -> usize {
        self.lock().plays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().plays.is_empty()
    }

    pub fn publish_count(&self) -> usize {
        self.lock().publishes
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Makes the next `count` publishes fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn publish(&mut self, play: &EnrichedPlay) -> Result<PublishOutcome, SinkError> {
        let mut inner = self.lock();
        inner.publishes += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        let key = play.key();
        if inner
            .plays
            .get(&key)
            .is_some_and(|existing| existing.fingerprint == play.fingerprint)
        {
            return Ok(PublishOutcome::Unchanged);
        }
        inner.plays.insert(key, play.clone());
        inner.writes += 1;
        Ok(PublishOutcome::Written)
    }
}

/// Durable storage sink, one row per play.
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db {}", path.display()))?;
        // Workers share the file through separate connections.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("set sqlite busy timeout")?;
        init_schema(&conn).context("init enriched_plays schema")?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn load(&self, key: &PlayKey) -> Result<Option<EnrichedPlay>, SinkError> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM enriched_plays WHERE game_id = ?1 AND play_id = ?2",
                params![key.game_id, key.play_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        payload
            .map(|raw| {
                serde_json::from_str::<EnrichedPlay>(&raw)
                    .map_err(|err| SinkError::Storage(format!("decode stored play {key}: {err}")))
            })
            .transpose()
    }

    pub fn count(&self) -> Result<usize, SinkError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM enriched_plays", [], |row| {
                row.get::<_, i64>(0)
            })?;
        Ok(count.max(0) as usize)
    }
}

impl Sink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn publish(&mut self, play: &EnrichedPlay) -> Result<PublishOutcome, SinkError> {
        let payload = serde_json::to_string(play)
            .map_err(|err| SinkError::Storage(format!("encode {}: {err}", play.key())))?;
        let closure_reason = serde_json::to_value(play.closure_reason)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let changed = self.conn.execute(
            r#"
            INSERT INTO enriched_plays (
                game_id, play_id, fingerprint, feature_version, predicted_play_type,
                pressure_rate, chaos_score, epa, completeness, closure_reason,
                processed_at, payload
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(game_id, play_id) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                feature_version = excluded.feature_version,
                predicted_play_type = excluded.predicted_play_type,
                pressure_rate = excluded.pressure_rate,
                chaos_score = excluded.chaos_score,
                epa = excluded.epa,
                completeness = excluded.completeness,
                closure_reason = excluded.closure_reason,
                processed_at = excluded.processed_at,
                payload = excluded.payload
            WHERE enriched_plays.fingerprint <> excluded.fingerprint
            "#,
            params![
                play.event.game_id,
                play.event.play_id,
                play.fingerprint,
                play.feature_version,
                play.predicted_play_type,
                play.pressure_rate,
                play.chaos_score,
                play.epa,
                play.completeness,
                closure_reason,
                play.processed_at.to_rfc3339(),
                payload,
            ],
        )?;
        Ok(if changed == 0 {
            PublishOutcome::Unchanged
        } else {
            PublishOutcome::Written
        })
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS enriched_plays (
            game_id TEXT NOT NULL,
            play_id INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            feature_version TEXT NOT NULL,
            predicted_play_type TEXT NOT NULL,
            pressure_rate REAL,
            chaos_score REAL NOT NULL,
            epa REAL NOT NULL,
            completeness INTEGER NOT NULL,
            closure_reason TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (game_id, play_id)
        );
        CREATE INDEX IF NOT EXISTS idx_enriched_plays_game ON enriched_plays(game_id);
        "#,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Play(Box<EnrichedPlay>),
}

/// Dashboard feed: pushes every publish, in emission order, over a channel.
#[derive(Debug, Clone)]
pub struct FeedSink {
    tx: Sender<FeedUpdate>,
}

impl FeedSink {
    pub fn channel() -> (Self, Receiver<FeedUpdate>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn new(tx: Sender<FeedUpdate>) -> Self {
        Self { tx }
    }
}

impl Sink for FeedSink {
    fn name(&self) -> &str {
        "feed"
    }

    fn publish(&mut self, play: &EnrichedPlay) -> Result<PublishOutcome, SinkError> {
        self.tx
            .send(FeedUpdate::Play(Box::new(play.clone())))
            .map_err(|_| SinkError::ChannelClosed("dashboard feed".to_string()))?;
        Ok(PublishOutcome::Written)
    }
}

/// Publishes to every sink in order; the first failure fails the publish.
pub struct FanoutSink {
    sinks: Vec<Box<dyn Sink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }
}

impl Sink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn publish(&mut self, play: &EnrichedPlay) -> Result<PublishOutcome, SinkError> {
        let mut outcome = PublishOutcome::Unchanged;
        for sink in &mut self.sinks {
            if sink.publish(play)? == PublishOutcome::Written {
                outcome = PublishOutcome::Written;
            }
        }
        Ok(outcome)
    }
}

/// Wraps a sink with bounded retry and exponential backoff.
pub struct SinkEmitter {
    sink: Box<dyn Sink>,
    retry: RetryPolicy,
}

impl SinkEmitter {
    pub fn new(sink: Box<dyn Sink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    pub fn emit(&mut self, play: &EnrichedPlay) -> Result<PublishOutcome, PipelineError> {
        let key = play.key();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sink.publish(play) {
                Ok(outcome) => {
                    if outcome == PublishOutcome::Unchanged {
                        debug!("Sink '{}': {key} unchanged, skipped", self.sink.name());
                    }
                    return Ok(outcome);
                }
                Err(err) if attempt >= self.retry.max_attempts => {
                    return Err(PipelineError::SinkFailure {
                        key,
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Sink '{}': publish {key} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
                        self.sink.name(),
                        self.retry.max_attempts,
                        delay.as_millis()
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }
}

/// A record that left the main path. Delivered at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diverted {
    Malformed {
        stream: String,
        partition: usize,
        offset: u64,
        reason: String,
        payload: String,
    },
    LateFrame {
        reason: String,
        frame: TrackingFrame,
    },
    LateEvent {
        reason: String,
        record: PlayRecord,
    },
    OrphanFrames {
        key: PlayKey,
        reason: String,
        rows: Vec<TrackingFrame>,
    },
}

#[derive(Debug, Clone)]
pub struct SideChannel {
    tx: Sender<Diverted>,
}

impl SideChannel {
    pub fn channel() -> (Self, Receiver<Diverted>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn divert(&self, record: Diverted) {
        if let Err(err) = self.tx.send(record) {
            warn!("Side channel closed; lost diverted record: {:?}", err.0);
        }
    }
}
