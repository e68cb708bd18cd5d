use crate::{CatalogError, Result};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

fn table(bucket: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(bucket)
}

/// Bucketed key-value catalog backed by redb
///
/// Buckets map to redb tables and are created on first write. A read
/// against a bucket that has never been written behaves as an absent key.
pub struct Catalog {
    db: Database,
}

impl Catalog {
    /// Open (or create) a catalog at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening catalog at: {}", path.as_ref().display());
        let db = Database::create(path.as_ref())?;
        Ok(Self { db })
    }

    /// Get a value by bucket and key
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let tbl = match read_txn.open_table(table(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(tbl.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Put a key-value pair, creating the bucket if needed
    pub fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        debug!("Catalog put: {}/{}", bucket, key);
        let write_txn = self.db.begin_write()?;
        {
            let mut tbl = write_txn.open_table(table(bucket))?;
            tbl.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete a key from a bucket
    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        debug!("Catalog delete: {}/{}", bucket, key);
        let write_txn = self.db.begin_write()?;
        {
            match write_txn.open_table(table(bucket)) {
                Ok(mut tbl) => {
                    tbl.remove(key)?;
                }
                Err(redb::TableError::TableDoesNotExist(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Visit every key-value pair in a bucket
    ///
    /// An absent bucket yields nothing. The callback may return an error to
    /// stop the iteration early.
    pub fn for_each<F>(&self, bucket: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> Result<()>,
    {
        let read_txn = self.db.begin_read()?;
        let tbl = match read_txn.open_table(table(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in tbl.iter()? {
            let (key, value) = entry?;
            f(key.value(), value.value())?;
        }
        Ok(())
    }

    /// Get a JSON record by bucket and key
    pub fn get_record<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>> {
        match self.get(bucket, key)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Put a JSON record, creating the bucket if needed
    pub fn put_record<T: Serialize>(&self, bucket: &str, key: &str, record: &T) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.put(bucket, key, &data)
    }

    /// Begin a write transaction
    pub fn begin(&self) -> Result<Txn> {
        let txn = self.db.begin_write()?;
        Ok(Txn {
            txn: Some(txn),
            committed: false,
        })
    }

    /// Close the catalog, flushing any pending state
    pub fn close(self) {
        info!("Catalog closed");
        drop(self.db);
    }
}

/// A write transaction over the catalog
///
/// Sees a consistent snapshot and commits atomically. Dropping an
/// uncommitted transaction aborts it.
pub struct Txn {
    txn: Option<WriteTransaction>,
    committed: bool,
}

impl Txn {
    fn inner(&self) -> Result<&WriteTransaction> {
        self.txn
            .as_ref()
            .ok_or_else(|| CatalogError::transaction_error("transaction already finished"))
    }

    /// Get a value by bucket and key
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tbl = match self.inner()?.open_table(table(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let result = tbl.get(key)?.map(|v| v.value().to_vec());
        Ok(result)
    }

    /// Put a key-value pair, creating the bucket if needed
    pub fn put(&mut self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut tbl = self.inner()?.open_table(table(bucket))?;
        tbl.insert(key, value)?;
        Ok(())
    }

    /// Delete a key from a bucket
    pub fn delete(&mut self, bucket: &str, key: &str) -> Result<()> {
        match self.inner()?.open_table(table(bucket)) {
            Ok(mut tbl) => {
                tbl.remove(key)?;
            }
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| CatalogError::transaction_error("transaction already finished"))?;
        txn.commit()?;
        self.committed = true;
        Ok(())
    }

    /// Abort the transaction, discarding its writes
    pub fn abort(mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| CatalogError::transaction_error("transaction already finished"))?;
        txn.abort()?;
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(txn) = self.txn.take() {
                let _ = txn.abort();
            }
        }
    }
}
