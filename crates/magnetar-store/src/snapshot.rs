use crate::error::{Result, StoreError};
use crate::store::ImageStore;
use crate::types::Snapshot;
use magnetar_zfs::{Dataset, DatasetKind, ZfsError, ZfsErrorKind};
use regex::Regex;
use std::sync::LazyLock;

/// User-supplied snapshot tag grammar
static VALID_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-:.]+$").expect("tag regex compiles"));

/// Map a provider failure on a snapshot lookup to the API taxonomy
fn snapshot_lookup_error(err: ZfsError, id: &str) -> StoreError {
    match err.kind {
        ZfsErrorKind::NotFound => StoreError::not_found(format!("snapshot not found: {}", id)),
        ZfsErrorKind::InvalidName => StoreError::not_valid(id),
        _ => err.into(),
    }
}

impl ImageStore {
    /// Resolve an API-level snapshot id to a dataset, insisting it is one
    pub(crate) async fn snapshot_dataset(&self, id: &str) -> Result<Dataset> {
        let full = self.pool_path(id);
        let dataset = self
            .provider
            .get_dataset(&full)
            .await
            .map_err(|e| snapshot_lookup_error(e, &full))?;
        if dataset.kind != DatasetKind::Snapshot {
            return Err(StoreError::not_snapshot(dataset.name));
        }
        Ok(dataset)
    }

    /// Snapshots of a parent dataset carrying a given tag, provider order
    async fn snapshots_by_tag(&self, snapshot_name: &str) -> Result<Vec<Dataset>> {
        let (parent, tag) = snapshot_name
            .split_once('@')
            .ok_or_else(|| StoreError::invalid_argument("invalid snapshot name"))?;

        let datasets = self
            .provider
            .snapshots(parent)
            .await
            .map_err(|e| snapshot_lookup_error(e, parent))?;

        let suffix = format!("@{}", tag);
        Ok(datasets
            .into_iter()
            .filter(|ds| ds.name.ends_with(&suffix))
            .collect())
    }

    /// Create snapshot `<pool>/<id>@<dest>`, optionally on all descendants
    ///
    /// Returns every snapshot the operation created: just the one, or the
    /// whole recursive set.
    pub async fn create_snapshot(
        &self,
        id: &str,
        dest: &str,
        recursive: bool,
    ) -> Result<Vec<Snapshot>> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        let full = self.pool_path(id);
        let dataset = self
            .provider
            .get_dataset(&full)
            .await
            .map_err(|e| snapshot_lookup_error(e, &full))?;
        if dataset.kind == DatasetKind::Snapshot {
            return Err(StoreError::invalid_argument(
                "cannot create a snapshot of a snapshot",
            ));
        }

        if dest.is_empty() {
            return Err(StoreError::invalid_argument("need a dest"));
        }
        if !VALID_TAG.is_match(dest) {
            return Err(StoreError::invalid_argument("invalid snapshot dest"));
        }

        let snapshot = self.provider.snapshot(&dataset.name, dest, recursive).await?;

        if recursive {
            let datasets = self.snapshots_by_tag(&snapshot.name).await?;
            Ok(datasets.iter().map(Snapshot::from_dataset).collect())
        } else {
            Ok(vec![Snapshot::from_dataset(&snapshot)])
        }
    }

    /// Get one snapshot by id
    pub async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }
        let dataset = self.snapshot_dataset(id).await?;
        Ok(Snapshot::from_dataset(&dataset))
    }

    /// List snapshots under `<pool>` or `<pool>/<id>`
    pub async fn list_snapshots(&self, id: &str) -> Result<Vec<Snapshot>> {
        let full = self.pool_path(id);
        let datasets = self
            .provider
            .snapshots(&full)
            .await
            .map_err(|e| snapshot_lookup_error(e, &full))?;
        Ok(datasets.iter().map(Snapshot::from_dataset).collect())
    }

    /// Delete a snapshot, optionally with the same-named snapshots of
    /// every descendant; returns the destroyed set
    pub async fn delete_snapshot(&self, id: &str, recursive: bool) -> Result<Vec<Snapshot>> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        let dataset = self.snapshot_dataset(id).await?;

        let snapshots = if recursive {
            let datasets = self.snapshots_by_tag(&dataset.name).await?;
            datasets.iter().map(Snapshot::from_dataset).collect()
        } else {
            vec![Snapshot::from_dataset(&dataset)]
        };

        self.provider.destroy(&dataset.name, recursive).await?;
        Ok(snapshots)
    }

    /// Stream a snapshot's replication payload into `writer`
    ///
    /// The writer is driven on a blocking thread by the provider; it may
    /// block freely.
    pub async fn send_snapshot(
        &self,
        id: &str,
        writer: Box<dyn std::io::Write + Send>,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }
        let dataset = self.snapshot_dataset(id).await?;
        self.provider
            .send_snapshot(&dataset.name, writer)
            .await
            .map_err(Into::into)
    }

    /// Roll the parent dataset back to this snapshot
    pub async fn rollback_snapshot(
        &self,
        id: &str,
        destroy_more_recent: bool,
    ) -> Result<Vec<Snapshot>> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        let dataset = self.snapshot_dataset(id).await?;
        self.provider
            .rollback(&dataset.name, destroy_more_recent)
            .await?;
        Ok(vec![Snapshot::from_dataset(&dataset)])
    }
}
