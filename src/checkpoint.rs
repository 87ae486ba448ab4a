use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::records::PlayKey;
use crate::store::Tombstone;

const CHECKPOINT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPlay {
    pub key: PlayKey,
    pub closed_at: DateTime<Utc>,
    pub plays_through: Option<u64>,
    pub frames_through: Option<u64>,
}

impl ClosedPlay {
    pub fn new(key: PlayKey, tombstone: Tombstone) -> Self {
        Self {
            key,
            closed_at: tombstone.closed_at,
            plays_through: tombstone.plays_through,
            frames_through: tombstone.frames_through,
        }
    }

    pub fn into_parts(self) -> (PlayKey, Tombstone) {
        let tombstone = Tombstone {
            closed_at: self.closed_at,
            plays_through: self.plays_through,
            frames_through: self.frames_through,
        };
        (self.key, tombstone)
    }
}

/// Worker state that must survive a restart alongside the committed offsets.
///
/// Open plays are not stored: they are rebuilt by replaying from the committed
/// offsets, which never pass a record an open play still needs. The offsets
/// themselves live with the logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub partition: usize,
    pub closed: Vec<ClosedPlay>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(partition: usize, saved_at: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            partition,
            closed: Vec::new(),
            saved_at,
        }
    }
}

pub trait CheckpointStore: Send {
    fn load(&self, partition: usize) -> Result<Option<Checkpoint>, PipelineError>;
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError>;
}

/// One JSON file per worker, swapped in atomically.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, partition: usize) -> PathBuf {
        self.dir.join(format!("worker-{partition}.checkpoint.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, partition: usize) -> Result<Option<Checkpoint>, PipelineError> {
        let path = self.path(partition);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|err| PipelineError::Checkpoint(format!("read {}: {err}", path.display())))?;
        let checkpoint = serde_json::from_str::<Checkpoint>(&raw)
            .map_err(|err| PipelineError::Checkpoint(format!("parse {}: {err}", path.display())))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(PipelineError::Checkpoint(format!(
                "{} has version {}, expected {CHECKPOINT_VERSION}",
                path.display(),
                checkpoint.version
            )));
        }
        Ok(Some(checkpoint))
    }

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        write_atomic(&self.path(checkpoint.partition), checkpoint)
    }
}

fn write_atomic(path: &Path, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| PipelineError::Checkpoint(format!("create {}: {err}", parent.display())))?;
    }
    let json = serde_json::to_string(checkpoint)
        .map_err(|err| PipelineError::Checkpoint(format!("encode: {err}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .map_err(|err| PipelineError::Checkpoint(format!("write {}: {err}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|err| PipelineError::Checkpoint(format!("swap {}: {err}", path.display())))?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    saved: Arc<Mutex<HashMap<usize, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: usize) -> Option<Checkpoint> {
        self.saved
            .lock()
            .expect("checkpoint lock poisoned")
            .get(&partition)
            .cloned()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, partition: usize) -> Result<Option<Checkpoint>, PipelineError> {
        Ok(self.get(partition))
    }

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        self.saved
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(checkpoint.partition, checkpoint.clone());
        Ok(())
    }
}
