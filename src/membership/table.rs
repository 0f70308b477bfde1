//! The internal membership table.
//!
//! One metadata record (format version, change counter) plus one record per
//! site that is not `Absent`. All writes happen inside caller-owned
//! transactions; only opening the table commits on its own.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::codec::{self, FORMAT_VERSION};
use super::types::{MembershipStatus, SiteAddr};
use crate::error::{CodecError, RosterError, StoreError};
use crate::store::{MembershipStore, TableHandle, TxnId};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TableError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, TableError::Store(StoreError::Deadlock))
    }
}

impl From<TableError> for RosterError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::Store(e) => e.into(),
            TableError::Codec(e) => e.into(),
        }
    }
}

/// Contents of the table as read at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedTable {
    pub change_counter: u32,
    pub sites: Vec<(SiteAddr, MembershipStatus)>,
}

pub struct MembershipTable {
    store: Arc<dyn MembershipStore>,
    name: String,
    handle: Mutex<Option<TableHandle>>,
}

impl MembershipTable {
    pub fn new(store: Arc<dyn MembershipStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            handle: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &dyn MembershipStore {
        self.store.as_ref()
    }

    /// Open the table, creating it with an initial metadata record on first
    /// use. The handle is cached and reused.
    pub fn open(&self) -> Result<TableHandle, TableError> {
        let mut cached = self.handle.lock();
        if let Some(handle) = cached.as_ref() {
            return Ok(handle.clone());
        }

        let txn = self.store.begin_txn()?;
        let result = self.open_in(txn);
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.store.abort(txn);
                return Err(e);
            }
        };
        self.store.commit(txn)?;
        if handle.created {
            info!("Created membership table {}", self.name);
        }
        *cached = Some(handle.clone());
        Ok(handle)
    }

    fn open_in(&self, txn: TxnId) -> Result<TableHandle, TableError> {
        let handle = self.store.open_or_create_table(&self.name, txn)?;
        if handle.created {
            self.store.put(
                &handle,
                &codec::metadata_key(),
                &codec::encode_metadata(FORMAT_VERSION, 0),
                txn,
            )?;
        }
        Ok(handle)
    }

    pub fn close(&self) {
        if let Some(handle) = self.handle.lock().take() {
            self.store.close_table(&handle);
        }
    }

    pub fn write_status(
        &self,
        table: &TableHandle,
        txn: TxnId,
        addr: &SiteAddr,
        status: MembershipStatus,
    ) -> Result<(), TableError> {
        let key = codec::encode_site_key(addr)?;
        self.store.put(table, &key, &codec::encode_status(status), txn)?;
        Ok(())
    }

    pub fn remove_site(&self, table: &TableHandle, txn: TxnId, addr: &SiteAddr) -> Result<(), TableError> {
        let key = codec::encode_site_key(addr)?;
        self.store.delete(table, &key, txn)?;
        Ok(())
    }

    /// Increment the persisted change counter, returning the new value
    pub fn bump_counter(&self, table: &TableHandle, txn: TxnId) -> Result<u32, TableError> {
        let key = codec::metadata_key();
        let counter = match self.store.get(table, &key, Some(txn))? {
            Some(value) => codec::decode_metadata(&value)?.1,
            None => 0,
        };
        let next = counter.wrapping_add(1);
        self.store
            .put(table, &key, &codec::encode_metadata(FORMAT_VERSION, next), txn)?;
        Ok(next)
    }

    /// Read every committed record
    pub fn load(&self) -> Result<LoadedTable, TableError> {
        let table = self.open()?;
        let mut loaded = LoadedTable::default();
        for (key, value) in self.store.scan(&table)? {
            if codec::is_metadata_key(&key) {
                loaded.change_counter = codec::decode_metadata(&value)?.1;
                continue;
            }
            let addr = codec::decode_site_key(&key)?;
            let status = codec::decode_status(&value)?;
            debug!("Loaded membership record {} = {}", addr, status);
            loaded.sites.push((addr, status));
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn table() -> (Arc<MemoryStore>, MembershipTable) {
        let store = Arc::new(MemoryStore::new());
        let table = MembershipTable::new(store.clone(), "__membership");
        (store, table)
    }

    #[test]
    fn test_open_creates_metadata_once() {
        let (store, table) = table();
        let first = table.open().unwrap();
        assert!(first.created);
        let again = table.open().unwrap();
        assert_eq!(first, again);
        assert_eq!(store.transactions_begun(), 1);
        assert_eq!(store.dump("__membership").len(), 1);
    }

    #[test]
    fn test_write_bump_and_load() {
        let (store, table) = table();
        let handle = table.open().unwrap();

        let txn = store.begin_txn().unwrap();
        table
            .write_status(&handle, txn, &SiteAddr::new("a", 1), MembershipStatus::Adding)
            .unwrap();
        assert_eq!(table.bump_counter(&handle, txn).unwrap(), 1);
        assert_eq!(table.bump_counter(&handle, txn).unwrap(), 2);
        store.commit(txn).unwrap();

        let loaded = table.load().unwrap();
        assert_eq!(loaded.change_counter, 2);
        assert_eq!(loaded.sites, vec![(SiteAddr::new("a", 1), MembershipStatus::Adding)]);

        let txn = store.begin_txn().unwrap();
        table.remove_site(&handle, txn, &SiteAddr::new("a", 1)).unwrap();
        store.commit(txn).unwrap();
        assert!(table.load().unwrap().sites.is_empty());
    }

    #[test]
    fn test_deadlock_classification() {
        assert!(TableError::Store(StoreError::Deadlock).is_deadlock());
        assert!(!TableError::Store(StoreError::Io("x".into())).is_deadlock());
    }
}
