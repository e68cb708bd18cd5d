use crate::error::{Result, StoreError};
use crate::store::ImageStore;
use crate::types::{device_for_dataset, Guest};
use magnetar_zfs::{DatasetKind, DatasetOptions, ZfsErrorKind};
use tracing::{debug, info};

impl ImageStore {
    /// Free-space estimate for guest disks, in KiB
    ///
    /// Pool `avail` clamped by the pool and `<pool>/guests` quotas, minus
    /// `written` for every snapshot and `volsize` for every volume in the
    /// pool. Filesystems are already rolled into pool usage. Disks are not
    /// over-committed against this number.
    pub async fn space_available(&self) -> Result<u64> {
        let pool = self.provider.get_dataset(&self.config.zpool).await?;
        let mut total = pool.avail;
        if pool.quota != 0 && pool.quota < total {
            total = pool.quota;
        }

        // The guests dataset only exists once a guest disk has been made
        match self.provider.get_dataset(&self.config.guests_dataset()).await {
            Ok(guests) => {
                if guests.quota != 0 && guests.quota < total {
                    total = guests.quota;
                }
            }
            Err(err) if err.kind == ZfsErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        for dataset in self.provider.datasets(&self.config.zpool).await? {
            match dataset.kind {
                DatasetKind::Snapshot => total = total.saturating_sub(dataset.written),
                DatasetKind::Volume => total = total.saturating_sub(dataset.volsize),
                DatasetKind::Filesystem => {}
            }
        }

        Ok(total / 1024)
    }

    /// Pre-flight check for guest creation
    ///
    /// Fills image-sourced disk sizes from the catalog and verifies the
    /// aggregate fits in the pool. Returns the guest with sizes filled.
    pub async fn verify_disks(&self, mut guest: Guest) -> Result<Guest> {
        if guest.id.is_empty() {
            return Err(StoreError::invalid_argument("need a guest id"));
        }
        if guest.disks.is_empty() {
            return Err(StoreError::invalid_argument("need guest disks"));
        }

        let available = self.space_available().await?;

        let mut total: u64 = 0;
        for disk in &mut guest.disks {
            if disk.image.is_empty() && disk.size == 0 {
                return Err(StoreError::invalid_argument(
                    "disk needs an image or a size",
                ));
            }
            if !disk.image.is_empty() {
                let image = self.image_record(&disk.image).await?;
                disk.size = image.size;
            }
            total += disk.size;
        }

        debug!("Guest '{}' wants {} MiB of {} available", guest.id, total, available);
        if total > available {
            return Err(StoreError::NoSpace {
                requested: total,
                available,
            });
        }

        Ok(guest)
    }

    /// Provision every disk of a guest
    ///
    /// Disk datasets are named deterministically
    /// `<pool>/guests/<guestId>/disk-<index>`, so a repeat call finds the
    /// existing datasets and just reports them.
    pub async fn create_guest_disks(&self, guest: Guest) -> Result<Guest> {
        let mut guest = self.verify_disks(guest).await?;

        let guest_dataset = format!("{}/{}", self.config.guests_dataset(), guest.id);
        self.provider
            .create_filesystem(&guest_dataset, &DatasetOptions::new())
            .await?;

        for (index, disk) in guest.disks.iter_mut().enumerate() {
            let dataset = format!("{}/disk-{}", guest_dataset, index);
            disk.volume = dataset.clone();

            match self.provider.get_dataset(&dataset).await {
                Ok(existing) => {
                    debug!("Guest disk {} already exists", existing.name);
                    disk.source = device_for_dataset(&existing.name);
                    continue;
                }
                Err(err) if err.kind == ZfsErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }

            if !disk.image.is_empty() {
                let image = self.image_record(&disk.image).await?;
                let clone = self.cloner.clone_to(&image.snapshot, &dataset).await?;
                disk.source = device_for_dataset(&clone.name);
                info!("Cloned image '{}' into guest disk {}", disk.image, clone.name);
            } else {
                let volume = self
                    .provider
                    .create_volume(
                        &dataset,
                        disk.size * 1024 * 1024,
                        &crate::types::default_zfs_options(),
                    )
                    .await?;
                disk.source = device_for_dataset(&volume.name);
                info!("Created blank guest disk {} ({} MiB)", volume.name, disk.size);
            }
        }

        Ok(guest)
    }

    /// Destroy every disk of a guest
    ///
    /// An unknown guest is a success; the returned guest has no disks.
    pub async fn delete_guests_disks(&self, mut guest: Guest) -> Result<Guest> {
        if guest.id.is_empty() {
            return Err(StoreError::invalid_argument("need a guest id"));
        }

        let guest_dataset = format!("{}/{}", self.config.guests_dataset(), guest.id);
        match self.provider.destroy(&guest_dataset, true).await {
            Ok(()) => info!("Destroyed guest disks under {}", guest_dataset),
            Err(err) if err.kind == ZfsErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        guest.disks.clear();
        Ok(guest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IMAGES_BUCKET;
    use crate::testutil::test_store;
    use crate::types::{Disk, Image, ImageStatus};
    use magnetar_zfs::DatasetProvider;

    const MIB: u64 = 1024 * 1024;

    /// Plant a complete image record with real datasets behind it
    async fn plant_image(fixture: &crate::testutil::TestStore, id: &str, size_mib: u64) {
        let volume = format!("test/images/{}", id);
        fixture
            .provider
            .create_volume(&volume, size_mib * MIB, &DatasetOptions::new())
            .await
            .unwrap();
        fixture
            .provider
            .snapshot(&volume, "base", false)
            .await
            .unwrap();
        let image = Image {
            id: id.to_string(),
            volume: volume.clone(),
            snapshot: format!("{}@base", volume),
            size: size_mib,
            status: ImageStatus::Complete,
        };
        fixture
            .store
            .catalog
            .put_record(IMAGES_BUCKET, id, &image)
            .unwrap();
    }

    fn guest_with_disks(id: &str, disks: Vec<Disk>) -> Guest {
        Guest {
            id: id.to_string(),
            disks,
        }
    }

    fn image_disk(image: &str) -> Disk {
        Disk {
            image: image.to_string(),
            ..Default::default()
        }
    }

    fn sized_disk(size: u64) -> Disk {
        Disk {
            size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_space_available_shrinks_with_volumes() {
        let fixture = test_store(240 * MIB, "127.0.0.1:1").await;

        let before = fixture.store.space_available().await.unwrap();
        assert!(before > 0);

        fixture.store.create_volume("vol", 10).await.unwrap();
        let after = fixture.store.space_available().await.unwrap();
        assert!(after < before);
    }

    #[tokio::test]
    async fn test_space_available_clamped_by_quota() {
        let fixture = test_store(240 * MIB, "127.0.0.1:1").await;
        fixture.provider.set_quota("test", 100 * MIB).await;

        let available = fixture.store.space_available().await.unwrap();
        assert!(available <= 100 * MIB / 1024);
    }

    #[tokio::test]
    async fn test_verify_disks_validation() {
        let fixture = test_store(240 * MIB, "127.0.0.1:1").await;
        plant_image(&fixture, "img-1", 64).await;

        // Missing guest id
        let err = fixture
            .store
            .verify_disks(guest_with_disks("", vec![sized_disk(10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));

        // No disks
        let err = fixture
            .store
            .verify_disks(guest_with_disks("g1", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));

        // A disk with neither image nor size
        let err = fixture
            .store
            .verify_disks(guest_with_disks("g1", vec![Disk::default()]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));

        // Unknown image id
        let err = fixture
            .store
            .verify_disks(guest_with_disks("g1", vec![image_disk("asdf")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        // Far more space than the pool has
        let err = fixture
            .store
            .verify_disks(guest_with_disks("g1", vec![sized_disk(10_000_000_000)]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSpace { .. }));

        // Plain sized disk fits
        let guest = fixture
            .store
            .verify_disks(guest_with_disks("g1", vec![sized_disk(10)]))
            .await
            .unwrap();
        assert_eq!(guest.disks[0].size, 10);

        // Image disk gets its size filled from the record
        let guest = fixture
            .store
            .verify_disks(guest_with_disks("g1", vec![image_disk("img-1")]))
            .await
            .unwrap();
        assert_eq!(guest.disks[0].size, 64);
    }

    #[tokio::test]
    async fn test_create_guest_disks_from_image_is_idempotent() {
        let fixture = test_store(1 << 30, "127.0.0.1:1").await;
        plant_image(&fixture, "img-1", 64).await;

        let request = guest_with_disks("g1", vec![image_disk("img-1")]);

        let guest = fixture
            .store
            .create_guest_disks(request.clone())
            .await
            .unwrap();
        assert_eq!(guest.disks[0].volume, "test/guests/g1/disk-0");
        assert_eq!(guest.disks[0].source, "/dev/zvol/test/guests/g1/disk-0");
        assert!(fixture.provider.exists("test/guests/g1/disk-0").await);

        // Repeat call finds the existing dataset and reports the same disk
        let names_before = fixture.provider.dataset_names().await;
        let again = fixture.store.create_guest_disks(request).await.unwrap();
        assert_eq!(again.disks[0].source, guest.disks[0].source);
        assert_eq!(fixture.provider.dataset_names().await, names_before);
    }

    #[tokio::test]
    async fn test_create_guest_disks_blank_disk() {
        let fixture = test_store(1 << 30, "127.0.0.1:1").await;

        let guest = fixture
            .store
            .create_guest_disks(guest_with_disks("g2", vec![sized_disk(10)]))
            .await
            .unwrap();
        assert_eq!(guest.disks[0].source, "/dev/zvol/test/guests/g2/disk-0");

        let disk = fixture
            .provider
            .get_dataset("test/guests/g2/disk-0")
            .await
            .unwrap();
        assert_eq!(disk.volsize, 10 * MIB);
    }

    #[tokio::test]
    async fn test_delete_guests_disks() {
        let fixture = test_store(1 << 30, "127.0.0.1:1").await;
        plant_image(&fixture, "img-1", 4).await;

        fixture
            .store
            .create_guest_disks(guest_with_disks("g1", vec![image_disk("img-1")]))
            .await
            .unwrap();

        let guest = fixture
            .store
            .delete_guests_disks(guest_with_disks("g1", vec![]))
            .await
            .unwrap();
        assert!(guest.disks.is_empty());
        assert!(!fixture.provider.exists("test/guests/g1").await);
        assert!(!fixture.provider.exists("test/guests/g1/disk-0").await);

        // Unknown guest is a success
        let guest = fixture
            .store
            .delete_guests_disks(guest_with_disks("unknown", vec![]))
            .await
            .unwrap();
        assert!(guest.disks.is_empty());

        // Missing guest id is not
        let err = fixture
            .store
            .delete_guests_disks(guest_with_disks("", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }
}
