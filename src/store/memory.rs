use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use super::{MembershipStore, TableHandle, TxnId};
use crate::error::StoreError;
use crate::membership::Position;

/// Store operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Begin,
    Put,
    Delete,
    Commit,
}

#[derive(Debug, Default)]
struct PendingTxn {
    /// (table, key, value); `None` deletes
    writes: Vec<(String, Bytes, Option<Bytes>)>,
    created: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<Bytes, Bytes>>,
    txns: HashMap<u64, PendingTxn>,
    next_txn: u64,
    last_position: u64,
    faults: HashMap<StoreOp, VecDeque<Option<StoreError>>>,
    begun: usize,
    commits: usize,
}

impl Inner {
    fn take_fault(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn txn_mut(&mut self, txn: TxnId) -> Result<&mut PendingTxn, StoreError> {
        self.txns.get_mut(&txn.0).ok_or(StoreError::TxnClosed(txn.0))
    }

    fn check_table(&self, name: &str) -> Result<(), StoreError> {
        if self.tables.contains_key(name) {
            Ok(())
        } else {
            Err(StoreError::NotFound(name.to_string()))
        }
    }
}

/// In-process transactional store.
///
/// Writes are buffered per transaction and applied at commit. Each commit
/// that carries writes advances the replication position by one. Failures can
/// be injected per operation to exercise abort paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` fail with `err`. Faults queue up per operation.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.inner.lock().faults.entry(op).or_default().push_back(Some(err));
    }

    /// Let the next `op` through before any fault queued after it
    pub fn pass_next(&self, op: StoreOp) {
        self.inner.lock().faults.entry(op).or_default().push_back(None);
    }

    pub fn transactions_begun(&self) -> usize {
        self.inner.lock().begun
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().commits
    }

    /// Committed contents of a table
    pub fn dump(&self, name: &str) -> Vec<(Bytes, Bytes)> {
        self.inner
            .lock()
            .tables
            .get(name)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl MembershipStore for MemoryStore {
    fn begin_txn(&self) -> Result<TxnId, StoreError> {
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Begin)?;
        inner.next_txn += 1;
        let id = inner.next_txn;
        inner.txns.insert(id, PendingTxn::default());
        inner.begun += 1;
        Ok(TxnId(id))
    }

    fn open_or_create_table(&self, name: &str, txn: TxnId) -> Result<TableHandle, StoreError> {
        let mut inner = self.inner.lock();
        if inner.tables.contains_key(name) {
            inner.txn_mut(txn)?;
            return Ok(TableHandle {
                name: name.to_string(),
                created: false,
            });
        }
        inner.txn_mut(txn)?.created.push(name.to_string());
        inner.tables.insert(name.to_string(), BTreeMap::new());
        debug!("Created table {}", name);
        Ok(TableHandle {
            name: name.to_string(),
            created: true,
        })
    }

    fn close_table(&self, table: &TableHandle) {
        debug!("Closed table {}", table.name);
    }

    fn get(&self, table: &TableHandle, key: &[u8], txn: Option<TxnId>) -> Result<Option<Bytes>, StoreError> {
        let inner = self.inner.lock();
        inner.check_table(&table.name)?;
        if let Some(txn) = txn {
            let pending = inner.txns.get(&txn.0).ok_or(StoreError::TxnClosed(txn.0))?;
            let own = pending
                .writes
                .iter()
                .rev()
                .find(|(t, k, _)| t == &table.name && k.as_ref() == key);
            if let Some((_, _, value)) = own {
                return Ok(value.clone());
            }
        }
        Ok(inner
            .tables
            .get(&table.name)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn scan(&self, table: &TableHandle) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let inner = self.inner.lock();
        inner.check_table(&table.name)?;
        Ok(inner.tables[&table.name]
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn put(&self, table: &TableHandle, key: &[u8], value: &[u8], txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Put)?;
        inner.check_table(&table.name)?;
        inner.txn_mut(txn)?.writes.push((
            table.name.clone(),
            Bytes::copy_from_slice(key),
            Some(Bytes::copy_from_slice(value)),
        ));
        Ok(())
    }

    fn delete(&self, table: &TableHandle, key: &[u8], txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.take_fault(StoreOp::Delete)?;
        inner.check_table(&table.name)?;
        inner
            .txn_mut(txn)?
            .writes
            .push((table.name.clone(), Bytes::copy_from_slice(key), None));
        Ok(())
    }

    fn commit(&self, txn: TxnId) -> Result<Position, StoreError> {
        let mut inner = self.inner.lock();
        let pending = inner.txns.remove(&txn.0).ok_or(StoreError::TxnClosed(txn.0))?;
        if let Err(e) = inner.take_fault(StoreOp::Commit) {
            for name in &pending.created {
                inner.tables.remove(name);
            }
            return Err(e);
        }

        let wrote = !pending.writes.is_empty();
        for (name, key, value) in pending.writes {
            let table = inner.tables.entry(name).or_default();
            match value {
                Some(value) => {
                    table.insert(key, value);
                }
                None => {
                    table.remove(&key);
                }
            }
        }
        if wrote {
            inner.last_position += 1;
        }
        inner.commits += 1;
        Ok(Position(inner.last_position))
    }

    fn abort(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let pending = inner.txns.remove(&txn.0).ok_or(StoreError::TxnClosed(txn.0))?;
        for name in &pending.created {
            inner.tables.remove(name);
        }
        Ok(())
    }

    fn last_commit_position(&self) -> Position {
        Position(self.inner.lock().last_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(store: &MemoryStore) -> TableHandle {
        let txn = store.begin_txn().unwrap();
        let table = store.open_or_create_table("members", txn).unwrap();
        store.commit(txn).unwrap();
        table
    }

    #[test]
    fn test_commit_applies_writes() {
        let store = MemoryStore::new();
        let table = open(&store);
        assert!(table.created);

        let txn = store.begin_txn().unwrap();
        store.put(&table, b"k1", b"v1", txn).unwrap();
        assert_eq!(store.get(&table, b"k1", Some(txn)).unwrap(), Some(Bytes::from_static(b"v1")));
        assert_eq!(store.get(&table, b"k1", None).unwrap(), None);

        let pos = store.commit(txn).unwrap();
        assert_eq!(pos, Position(1));
        assert_eq!(store.scan(&table).unwrap().len(), 1);

        let txn = store.begin_txn().unwrap();
        store.delete(&table, b"k1", txn).unwrap();
        assert_eq!(store.get(&table, b"k1", Some(txn)).unwrap(), None);
        assert_eq!(store.commit(txn).unwrap(), Position(2));
        assert!(store.dump("members").is_empty());
    }

    #[test]
    fn test_abort_discards_writes() {
        let store = MemoryStore::new();
        let table = open(&store);
        let txn = store.begin_txn().unwrap();
        store.put(&table, b"k", b"v", txn).unwrap();
        store.abort(txn).unwrap();
        assert!(store.dump("members").is_empty());
        assert_eq!(store.last_commit_position(), Position::ZERO);
        assert_eq!(store.commit(txn), Err(StoreError::TxnClosed(txn.0)));
    }

    #[test]
    fn test_injected_commit_failure() {
        let store = MemoryStore::new();
        let table = open(&store);
        store.fail_next(StoreOp::Commit, StoreError::Io("disk full".into()));

        let txn = store.begin_txn().unwrap();
        store.put(&table, b"k", b"v", txn).unwrap();
        assert_eq!(store.commit(txn), Err(StoreError::Io("disk full".into())));
        assert!(store.dump("members").is_empty());

        // fault is consumed
        let txn = store.begin_txn().unwrap();
        store.put(&table, b"k", b"v", txn).unwrap();
        assert!(store.commit(txn).is_ok());
        assert_eq!(store.transactions_begun(), 3);
    }

    #[test]
    fn test_pass_then_fail() {
        let store = MemoryStore::new();
        let table = open(&store);
        store.pass_next(StoreOp::Commit);
        store.fail_next(StoreOp::Commit, StoreError::Deadlock);

        let txn = store.begin_txn().unwrap();
        store.put(&table, b"a", b"1", txn).unwrap();
        assert!(store.commit(txn).is_ok());

        let txn = store.begin_txn().unwrap();
        store.put(&table, b"b", b"2", txn).unwrap();
        assert_eq!(store.commit(txn), Err(StoreError::Deadlock));
        assert_eq!(store.dump("members").len(), 1);
    }

    #[test]
    fn test_aborted_create_drops_table() {
        let store = MemoryStore::new();
        let txn = store.begin_txn().unwrap();
        let table = store.open_or_create_table("t", txn).unwrap();
        store.abort(txn).unwrap();
        assert_eq!(store.scan(&table), Err(StoreError::NotFound("t".into())));
    }
}
