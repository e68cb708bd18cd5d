use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Dataset kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Volume => "volume",
            DatasetKind::Snapshot => "snapshot",
        }
    }

    /// Parse from `zfs list -o type` output
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filesystem" => Some(DatasetKind::Filesystem),
            "volume" => Some(DatasetKind::Volume),
            "snapshot" => Some(DatasetKind::Snapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A dataset as reported by the provider
///
/// Numeric properties are bytes. Properties a dataset kind does not carry
/// (e.g. `volsize` on a filesystem) are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetKind,
    pub volsize: u64,
    pub written: u64,
    pub avail: u64,
    pub quota: u64,
}

impl Dataset {
    /// Whether this dataset is a snapshot
    pub fn is_snapshot(&self) -> bool {
        self.kind == DatasetKind::Snapshot
    }
}

/// Creation properties applied to a new dataset
pub type DatasetOptions = BTreeMap<String, String>;

/// Capability interface over the storage substrate
///
/// `ZfsProvider` is the production implementation; `MockProvider` keeps
/// state in memory for development and tests.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    /// Look up a dataset by full name
    async fn get_dataset(&self, name: &str) -> Result<Dataset>;

    /// Create a filesystem dataset, including missing parents
    async fn create_filesystem(&self, name: &str, opts: &DatasetOptions) -> Result<Dataset>;

    /// Create a zvol of the given size in bytes
    async fn create_volume(&self, name: &str, size: u64, opts: &DatasetOptions) -> Result<Dataset>;

    /// List volume datasets under a prefix, recursively
    async fn volumes(&self, prefix: &str) -> Result<Vec<Dataset>>;

    /// List every dataset under a prefix, recursively
    async fn datasets(&self, prefix: &str) -> Result<Vec<Dataset>>;

    /// List snapshots under a prefix, recursively, parents before children
    async fn snapshots(&self, prefix: &str) -> Result<Vec<Dataset>>;

    /// Snapshot a dataset as `<name>@<tag>`, optionally on all descendants
    async fn snapshot(&self, name: &str, tag: &str, recursive: bool) -> Result<Dataset>;

    /// Clone a snapshot into a writable dataset
    ///
    /// Named to avoid resolving against `Clone::clone` on `Arc<dyn _>`.
    async fn clone_snapshot(&self, snapshot: &str, dest: &str, opts: &DatasetOptions)
        -> Result<Dataset>;

    /// Destroy a dataset, optionally with descendants
    async fn destroy(&self, name: &str, recursive: bool) -> Result<()>;

    /// Roll a parent dataset back to a snapshot
    async fn rollback(&self, snapshot: &str, destroy_more_recent: bool) -> Result<()>;

    /// Stream a snapshot's replication payload into a writer
    ///
    /// The writer is driven on a blocking thread and may block.
    async fn send_snapshot(&self, snapshot: &str, writer: Box<dyn Write + Send>) -> Result<()>;

    /// Import a replication payload, producing a dataset whose first
    /// snapshot is the imported one
    async fn receive_snapshot(&self, reader: Box<dyn Read + Send>, dest: &str) -> Result<Dataset>;
}
