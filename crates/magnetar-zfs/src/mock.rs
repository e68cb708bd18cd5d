use crate::error::{Result, ZfsError, ZfsErrorKind};
use crate::provider::{Dataset, DatasetKind, DatasetOptions, DatasetProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tokio::sync::RwLock;
use tracing::debug;

/// Header of the mock replication stream
///
/// Self-describing so `receive_snapshot` can reconstruct the dataset a
/// `send_snapshot` exported, which is all the round-trip tests need.
#[derive(Debug, Serialize, Deserialize)]
struct StreamHeader {
    tag: String,
    volsize: u64,
}

#[derive(Debug, Clone)]
struct MockDataset {
    kind: DatasetKind,
    volsize: u64,
    written: u64,
    avail: u64,
    quota: u64,
    created: u64,
}

#[derive(Default)]
struct MockState {
    datasets: BTreeMap<String, MockDataset>,
    seq: u64,
}

impl MockState {
    fn insert(&mut self, name: &str, kind: DatasetKind, volsize: u64, written: u64) {
        self.seq += 1;
        self.datasets.insert(
            name.to_string(),
            MockDataset {
                kind,
                volsize,
                written,
                avail: 0,
                quota: 0,
                created: self.seq,
            },
        );
    }

    fn view(&self, name: &str) -> Option<Dataset> {
        self.datasets.get(name).map(|d| Dataset {
            name: name.to_string(),
            kind: d.kind,
            volsize: d.volsize,
            written: d.written,
            avail: d.avail,
            quota: d.quota,
        })
    }

    /// Create missing ancestors of a dataset as filesystems
    fn ensure_parents(&mut self, name: &str) {
        let mut path = String::new();
        let parents: Vec<&str> = name.rsplitn(2, '/').collect();
        if parents.len() < 2 {
            return;
        }
        for part in parents[1].split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            if !self.datasets.contains_key(&path) {
                let missing = path.clone();
                self.insert(&missing, DatasetKind::Filesystem, 0, 0);
            }
        }
    }

    /// Descendant datasets of `name` (not snapshots, not `name` itself)
    fn children(&self, name: &str) -> Vec<String> {
        let prefix = format!("{}/", name);
        self.datasets
            .keys()
            .filter(|k| k.starts_with(&prefix) && !k.contains('@'))
            .cloned()
            .collect()
    }

    /// Snapshots whose parent is `name` or a descendant of it
    fn snapshots_under(&self, name: &str) -> Vec<String> {
        let child_prefix = format!("{}/", name);
        let own_prefix = format!("{}@", name);
        self.datasets
            .keys()
            .filter(|k| k.starts_with(&own_prefix) || (k.starts_with(&child_prefix) && k.contains('@')))
            .cloned()
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.matches('@').count() <= 1
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '/' | '@'));
    if valid {
        Ok(())
    } else {
        Err(ZfsError::invalid_name(name))
    }
}

fn split_snapshot(name: &str) -> Result<(&str, &str)> {
    name.split_once('@')
        .ok_or_else(|| ZfsError::invalid_name(name))
}

/// In-memory dataset provider for development and tests
///
/// Tracks datasets, snapshots and their size properties so tests can
/// exercise the full engine without a real ZFS pool.
pub struct MockProvider {
    state: RwLock<MockState>,
}

impl MockProvider {
    /// Create a provider with a pool dataset reporting the given free bytes
    pub fn new(pool: &str, avail: u64) -> Self {
        let mut state = MockState::default();
        state.insert(pool, DatasetKind::Filesystem, 0, 0);
        if let Some(d) = state.datasets.get_mut(pool) {
            d.avail = avail;
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Set the quota property on an existing dataset
    pub async fn set_quota(&self, name: &str, quota: u64) {
        let mut state = self.state.write().await;
        if let Some(d) = state.datasets.get_mut(name) {
            d.quota = quota;
        }
    }

    /// Whether a dataset currently exists
    pub async fn exists(&self, name: &str) -> bool {
        self.state.read().await.datasets.contains_key(name)
    }

    /// All dataset names, for assertions
    pub async fn dataset_names(&self) -> Vec<String> {
        self.state.read().await.datasets.keys().cloned().collect()
    }

    /// Build the byte stream `receive_snapshot` imports, as the remote
    /// image catalog would serve it
    pub fn image_stream(tag: &str, volsize: u64) -> Vec<u8> {
        serde_json::to_vec(&StreamHeader {
            tag: tag.to_string(),
            volsize,
        })
        .unwrap_or_default()
    }
}

#[async_trait]
impl DatasetProvider for MockProvider {
    async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        validate_name(name)?;
        self.state
            .read()
            .await
            .view(name)
            .ok_or_else(|| ZfsError::not_found(name))
    }

    async fn create_filesystem(&self, name: &str, _opts: &DatasetOptions) -> Result<Dataset> {
        validate_name(name)?;
        let mut state = self.state.write().await;
        match state.datasets.get(name) {
            // `zfs create -p` succeeds on an existing filesystem
            Some(d) if d.kind == DatasetKind::Filesystem => {}
            Some(_) => return Err(ZfsError::already_exists(name)),
            None => {
                state.ensure_parents(name);
                state.insert(name, DatasetKind::Filesystem, 0, 0);
                debug!("Mock: created filesystem {}", name);
            }
        }
        Ok(state.view(name).unwrap())
    }

    async fn create_volume(&self, name: &str, size: u64, _opts: &DatasetOptions) -> Result<Dataset> {
        validate_name(name)?;
        let mut state = self.state.write().await;
        if state.datasets.contains_key(name) {
            return Err(ZfsError::already_exists(name));
        }
        state.ensure_parents(name);
        state.insert(name, DatasetKind::Volume, size, 0);
        debug!("Mock: created volume {} ({} bytes)", name, size);
        Ok(state.view(name).unwrap())
    }

    async fn volumes(&self, prefix: &str) -> Result<Vec<Dataset>> {
        validate_name(prefix)?;
        let state = self.state.read().await;
        if !state.datasets.contains_key(prefix) {
            return Err(ZfsError::not_found(prefix));
        }
        let child_prefix = format!("{}/", prefix);
        Ok(state
            .datasets
            .keys()
            .filter(|k| (*k == prefix || k.starts_with(&child_prefix)) && !k.contains('@'))
            .filter(|k| state.datasets[*k].kind == DatasetKind::Volume)
            .map(|k| state.view(k).unwrap())
            .collect())
    }

    async fn datasets(&self, prefix: &str) -> Result<Vec<Dataset>> {
        validate_name(prefix)?;
        let state = self.state.read().await;
        if !state.datasets.contains_key(prefix) {
            return Err(ZfsError::not_found(prefix));
        }
        let child_prefix = format!("{}/", prefix);
        let own_snap = format!("{}@", prefix);
        Ok(state
            .datasets
            .keys()
            .filter(|k| *k == prefix || k.starts_with(&child_prefix) || k.starts_with(&own_snap))
            .map(|k| state.view(k).unwrap())
            .collect())
    }

    async fn snapshots(&self, prefix: &str) -> Result<Vec<Dataset>> {
        validate_name(prefix)?;
        let state = self.state.read().await;
        if !state.datasets.contains_key(prefix) {
            return Err(ZfsError::not_found(prefix));
        }
        let mut names = state.snapshots_under(prefix);
        // zfs list order: parent datasets before children, then creation time
        names.sort_by_key(|n| {
            let (parent, _) = n.split_once('@').unwrap_or((n.as_str(), ""));
            (parent.to_string(), state.datasets[n].created)
        });
        Ok(names.iter().map(|n| state.view(n).unwrap()).collect())
    }

    async fn snapshot(&self, name: &str, tag: &str, recursive: bool) -> Result<Dataset> {
        validate_name(name)?;
        validate_name(tag)?;
        let mut state = self.state.write().await;
        let parent = state
            .datasets
            .get(name)
            .ok_or_else(|| ZfsError::not_found(name))?
            .clone();
        if parent.kind == DatasetKind::Snapshot {
            return Err(ZfsError::invalid_name(name));
        }

        let snap_name = format!("{}@{}", name, tag);
        if state.datasets.contains_key(&snap_name) {
            return Err(ZfsError::already_exists(&snap_name));
        }
        state.insert(&snap_name, DatasetKind::Snapshot, parent.volsize, 1024);

        if recursive {
            for child in state.children(name) {
                let child_snap = format!("{}@{}", child, tag);
                if !state.datasets.contains_key(&child_snap) {
                    let volsize = state.datasets[&child].volsize;
                    state.insert(&child_snap, DatasetKind::Snapshot, volsize, 1024);
                }
            }
        }
        debug!("Mock: created snapshot {} (recursive={})", snap_name, recursive);
        Ok(state.view(&snap_name).unwrap())
    }

    async fn clone_snapshot(
        &self,
        snapshot: &str,
        dest: &str,
        _opts: &DatasetOptions,
    ) -> Result<Dataset> {
        validate_name(snapshot)?;
        validate_name(dest)?;
        let mut state = self.state.write().await;
        let source = state
            .datasets
            .get(snapshot)
            .ok_or_else(|| ZfsError::not_found(snapshot))?
            .clone();
        if source.kind != DatasetKind::Snapshot {
            return Err(ZfsError::new(
                ZfsErrorKind::CommandFailed,
                format!("cannot clone {}: not a snapshot", snapshot),
            ));
        }
        if state.datasets.contains_key(dest) {
            return Err(ZfsError::already_exists(dest));
        }
        state.ensure_parents(dest);
        state.insert(dest, DatasetKind::Volume, source.volsize, 0);
        debug!("Mock: cloned {} to {}", snapshot, dest);
        Ok(state.view(dest).unwrap())
    }

    async fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.write().await;
        if !state.datasets.contains_key(name) {
            return Err(ZfsError::not_found(name));
        }

        if let Ok((parent, tag)) = split_snapshot(name) {
            state.datasets.remove(name);
            if recursive {
                // destroy the same-named snapshot on every descendant
                for child in state.children(parent) {
                    state.datasets.remove(&format!("{}@{}", child, tag));
                }
            }
            debug!("Mock: destroyed snapshot {}", name);
            return Ok(());
        }

        let children = state.children(name);
        let snapshots = state.snapshots_under(name);
        if !recursive && (!children.is_empty() || !snapshots.is_empty()) {
            return Err(ZfsError::new(
                ZfsErrorKind::CommandFailed,
                format!("cannot destroy {}: dataset has children", name),
            ));
        }
        for victim in children.into_iter().chain(snapshots) {
            state.datasets.remove(&victim);
        }
        state.datasets.remove(name);
        debug!("Mock: destroyed dataset {} (recursive={})", name, recursive);
        Ok(())
    }

    async fn rollback(&self, snapshot: &str, destroy_more_recent: bool) -> Result<()> {
        validate_name(snapshot)?;
        let (parent, _) = split_snapshot(snapshot)?;
        let mut state = self.state.write().await;
        let target = state
            .datasets
            .get(snapshot)
            .ok_or_else(|| ZfsError::not_found(snapshot))?
            .clone();

        let own_prefix = format!("{}@", parent);
        let newer: Vec<String> = state
            .datasets
            .iter()
            .filter(|(k, d)| k.starts_with(&own_prefix) && d.created > target.created)
            .map(|(k, _)| k.clone())
            .collect();

        if !newer.is_empty() && !destroy_more_recent {
            return Err(ZfsError::new(
                ZfsErrorKind::CommandFailed,
                format!("cannot rollback to {}: more recent snapshots exist", snapshot),
            ));
        }
        for victim in newer {
            state.datasets.remove(&victim);
        }
        debug!("Mock: rolled back {} to {}", parent, snapshot);
        Ok(())
    }

    async fn send_snapshot(&self, snapshot: &str, mut writer: Box<dyn Write + Send>) -> Result<()> {
        let ds = self.get_dataset(snapshot).await?;
        if ds.kind != DatasetKind::Snapshot {
            return Err(ZfsError::new(
                ZfsErrorKind::CommandFailed,
                format!("cannot send {}: not a snapshot", snapshot),
            ));
        }
        let (_, tag) = split_snapshot(&ds.name)?;
        let payload = Self::image_stream(tag, ds.volsize);
        tokio::task::spawn_blocking(move || -> Result<()> {
            writer.write_all(&payload)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ZfsError::io(format!("send task failed: {}", e)))?
    }

    async fn receive_snapshot(&self, mut reader: Box<dyn Read + Send>, dest: &str) -> Result<Dataset> {
        validate_name(dest)?;
        let payload = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| ZfsError::io(format!("receive task failed: {}", e)))??;

        let header: StreamHeader = serde_json::from_slice(&payload)
            .map_err(|e| ZfsError::io(format!("malformed stream: {}", e)))?;

        let mut state = self.state.write().await;
        if state.datasets.contains_key(dest) {
            return Err(ZfsError::already_exists(dest));
        }
        state.ensure_parents(dest);
        state.insert(dest, DatasetKind::Volume, header.volsize, 0);
        let snap_name = format!("{}@{}", dest, header.tag);
        state.insert(&snap_name, DatasetKind::Snapshot, header.volsize, 1024);
        debug!("Mock: received stream into {} ({})", dest, snap_name);
        Ok(state.view(dest).unwrap())
    }
}
