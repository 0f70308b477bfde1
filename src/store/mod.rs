//! Transactional Store Interface
//!
//! The membership table lives in a replicated key/value store. This module
//! defines the handful of operations the membership manager relies on:
//! - Transactions (begin/commit/abort)
//! - Table open/create/close
//! - Point reads, scans, puts and deletes

mod memory;

pub use memory::{MemoryStore, StoreOp};

use bytes::Bytes;

use crate::error::StoreError;
use crate::membership::Position;

/// Active transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

/// Open table handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub name: String,
    /// True when this open created the table
    pub created: bool,
}

pub trait MembershipStore: Send + Sync {
    fn begin_txn(&self) -> Result<TxnId, StoreError>;

    fn open_or_create_table(&self, name: &str, txn: TxnId) -> Result<TableHandle, StoreError>;

    fn close_table(&self, table: &TableHandle);

    /// Read a key, seeing the transaction's own writes when `txn` is given
    fn get(&self, table: &TableHandle, key: &[u8], txn: Option<TxnId>) -> Result<Option<Bytes>, StoreError>;

    /// All committed records of a table in key order
    fn scan(&self, table: &TableHandle) -> Result<Vec<(Bytes, Bytes)>, StoreError>;

    fn put(&self, table: &TableHandle, key: &[u8], value: &[u8], txn: TxnId) -> Result<(), StoreError>;

    fn delete(&self, table: &TableHandle, key: &[u8], txn: TxnId) -> Result<(), StoreError>;

    /// Commit and return the replication position of the commit record. A
    /// failed commit leaves the transaction aborted.
    fn commit(&self, txn: TxnId) -> Result<Position, StoreError>;

    fn abort(&self, txn: TxnId) -> Result<(), StoreError>;

    /// Position of the most recent commit
    fn last_commit_position(&self) -> Position;
}
