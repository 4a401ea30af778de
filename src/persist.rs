//! Persistent state save and restore.
//!
//! Five files under the state-save directory: jobs, nodes, partitions,
//! reservations, and the id counter. Each save writes a sibling shadow file
//! and renames it into place so readers never observe a torn write. Every
//! file carries a magic number and a schema version; a mismatch is an
//! explicit error, never a silent decode.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::state::{JobRecord, NodeRecord, Partition, Reservation};

const STATE_MAGIC: u32 = 0x47524944; // "GRID"
const SCHEMA_VERSION: u16 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    magic: u32,
    version: u16,
    data: T,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsSnapshot {
    pub jobs: Vec<JobRecord>,
    pub next_job_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesSnapshot {
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartsSnapshot {
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResvSnapshot {
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IdSnapshot {
    pub next_job_id: u32,
}

/// Everything the controller can recover at startup. Absent files mean a
/// cold start for that table.
#[derive(Debug, Default)]
pub struct RestoredState {
    pub jobs: Option<JobsSnapshot>,
    pub nodes: Option<NodesSnapshot>,
    pub partitions: Option<PartsSnapshot>,
    pub reservations: Option<ResvSnapshot>,
    pub ids: Option<IdSnapshot>,
}

#[async_trait]
pub trait StateSaver: Send + Sync {
    async fn save_jobs(&self, snap: &JobsSnapshot) -> Result<()>;
    async fn save_nodes(&self, snap: &NodesSnapshot) -> Result<()>;
    async fn save_partitions(&self, snap: &PartsSnapshot) -> Result<()>;
    async fn save_reservations(&self, snap: &ResvSnapshot) -> Result<()>;
    async fn save_ids(&self, snap: &IdSnapshot) -> Result<()>;
    async fn restore_all(&self) -> Result<RestoredState>;
}

/// File-backed saver using shadow-file-plus-rename.
pub struct FileStateSaver {
    dir: PathBuf,
}

impl FileStateSaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn write_file<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let envelope = Envelope {
            magic: STATE_MAGIC,
            version: SCHEMA_VERSION,
            data,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        let target = self.path(name);
        let shadow = self.path(&format!("{name}.new"));
        tokio::fs::write(&shadow, &bytes).await?;
        tokio::fs::rename(&shadow, &target).await?;
        Ok(())
    }

    async fn read_file<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let target = self.path(name);
        let bytes = match tokio::fs::read(&target).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .map_err(|e| SchedError::StateCorrupt(format!("{name}: {e}")))?;
        if envelope.magic != STATE_MAGIC {
            return Err(SchedError::StateCorrupt(format!(
                "{name}: bad magic 0x{:08x}",
                envelope.magic
            )));
        }
        if envelope.version != SCHEMA_VERSION {
            return Err(SchedError::StateCorrupt(format!(
                "{name}: schema version {} wants upgrade to {}",
                envelope.version, SCHEMA_VERSION
            )));
        }
        Ok(Some(envelope.data))
    }
}

#[async_trait]
impl StateSaver for FileStateSaver {
    async fn save_jobs(&self, snap: &JobsSnapshot) -> Result<()> {
        self.write_file("jobs.state", snap).await
    }

    async fn save_nodes(&self, snap: &NodesSnapshot) -> Result<()> {
        self.write_file("nodes.state", snap).await
    }

    async fn save_partitions(&self, snap: &PartsSnapshot) -> Result<()> {
        self.write_file("partitions.state", snap).await
    }

    async fn save_reservations(&self, snap: &ResvSnapshot) -> Result<()> {
        self.write_file("resv.state", snap).await
    }

    async fn save_ids(&self, snap: &IdSnapshot) -> Result<()> {
        self.write_file("job_id.state", snap).await
    }

    async fn restore_all(&self) -> Result<RestoredState> {
        Ok(RestoredState {
            jobs: self.read_file("jobs.state").await?,
            nodes: self.read_file("nodes.state").await?,
            partitions: self.read_file("partitions.state").await?,
            reservations: self.read_file("resv.state").await?,
            ids: self.read_file("job_id.state").await?,
        })
    }
}

/// Convenience wrapper: save failures are infrastructure errors, logged and
/// not propagated to RPC callers.
pub async fn save_jobs_logged(saver: &dyn StateSaver, snap: JobsSnapshot) {
    if let Err(e) = saver.save_jobs(&snap).await {
        tracing::error!(error = %e, "job state save failed");
    }
    if let Err(e) = saver
        .save_ids(&IdSnapshot {
            next_job_id: snap.next_job_id,
        })
        .await
    {
        tracing::error!(error = %e, "id state save failed");
    }
}

pub async fn save_nodes_logged(saver: &dyn StateSaver, snap: NodesSnapshot) {
    if let Err(e) = saver.save_nodes(&snap).await {
        tracing::error!(error = %e, "node state save failed");
    }
}
