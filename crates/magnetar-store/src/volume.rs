use crate::error::{Result, StoreError};
use crate::store::ImageStore;
use crate::types::{default_zfs_options, Volume};
use magnetar_zfs::DatasetKind;

impl ImageStore {
    /// List every volume under the pool
    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let datasets = self.provider.volumes(&self.config.zpool).await?;
        Ok(datasets.iter().map(Volume::from_dataset).collect())
    }

    /// Create `<pool>/<id>` as a zvol of `size` MiB
    pub async fn create_volume(&self, id: &str, size: u64) -> Result<Volume> {
        if size == 0 {
            return Err(StoreError::invalid_argument("need a valid size"));
        }
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        let full = self.pool_path(id);
        let dataset = self
            .provider
            .create_volume(&full, size * 1024 * 1024, &default_zfs_options())
            .await?;
        Ok(Volume::from_dataset(&dataset))
    }

    /// Get `<pool>/<id>`, insisting it is a volume
    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        let full = self.pool_path(id);
        let dataset = self.provider.get_dataset(&full).await?;
        if dataset.kind != DatasetKind::Volume {
            return Err(StoreError::not_volume(dataset.name));
        }
        Ok(Volume::from_dataset(&dataset))
    }

    /// Destroy `<pool>/<id>` recursively, returning the removed view
    pub async fn delete_dataset(&self, id: &str) -> Result<Volume> {
        if id.is_empty() {
            return Err(StoreError::invalid_argument("need an id"));
        }

        let full = self.pool_path(id);
        let dataset = self.provider.get_dataset(&full).await?;
        self.provider.destroy(&dataset.name, true).await?;
        Ok(Volume::from_dataset(&dataset))
    }
}
