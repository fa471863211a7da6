//! Undoable key-value state.
//!
//! All consensus state lives behind [`KeyValueStore`]. Nested sessions give
//! copy-on-write checkpoints: `begin` opens a session, `undo` discards
//! everything written since, and `squash` folds the session into its parent
//! so the parent's undo still reverts it. The block is one session and each
//! transaction is a nested one, which is how a failed transaction or an
//! abandoned block is discarded atomically.
//!
//! Keys are ordered bytewise, so `scan_prefix` iteration is deterministic.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{ChainError, ChainResult};

/// Storage primitives the execution core consumes.
pub trait KeyValueStore {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>>;

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> ChainResult<()>;

    /// Remove `key`. Returns whether it existed.
    fn erase(&mut self, key: &[u8]) -> ChainResult<bool>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Open a nested session and return its revision.
    fn begin(&mut self) -> u64;

    /// Merge the top session into its parent.
    fn squash(&mut self) -> ChainResult<()>;

    /// Revert and close the top session.
    fn undo(&mut self) -> ChainResult<()>;

    /// Make every session up to and including `revision` permanent.
    fn commit(&mut self, revision: u64);

    /// Revision of the innermost open session (or of the last committed one).
    fn revision(&self) -> u64;

    /// Number of sessions that can still be undone.
    fn undo_depth(&self) -> usize;

    fn contains(&self, key: &[u8]) -> ChainResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Prior values of keys first touched inside one session.
#[derive(Debug, Clone, Default)]
struct UndoState {
    revision: u64,
    /// `None` means the key did not exist before the session.
    old_values: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// In-memory [`KeyValueStore`] with an undo stack.
#[derive(Debug, Clone, Default)]
pub struct UndoStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    stack: VecDeque<UndoState>,
    revision: u64,
}

impl UndoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of the full contents, for state comparison.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.clone()
    }

    fn record_prior(&mut self, key: &[u8]) {
        let Some(top) = self.stack.back_mut() else { return };
        if !top.old_values.contains_key(key) {
            top.old_values.insert(key.to_vec(), self.data.get(key).cloned());
        }
    }
}

impl KeyValueStore for UndoStore {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> ChainResult<()> {
        self.record_prior(&key);
        self.data.insert(key, value);
        Ok(())
    }

    fn erase(&mut self, key: &[u8]) -> ChainResult<bool> {
        if !self.data.contains_key(key) {
            return Ok(false);
        }
        self.record_prior(key);
        self.data.remove(key);
        Ok(true)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn begin(&mut self) -> u64 {
        self.revision += 1;
        self.stack.push_back(UndoState {
            revision: self.revision,
            old_values: BTreeMap::new(),
        });
        self.revision
    }

    fn squash(&mut self) -> ChainResult<()> {
        let top = self
            .stack
            .pop_back()
            .ok_or_else(|| ChainError::Database("squash without an open session".into()))?;
        if let Some(parent) = self.stack.back_mut() {
            for (key, old) in top.old_values {
                parent.old_values.entry(key).or_insert(old);
            }
        }
        self.revision -= 1;
        Ok(())
    }

    fn undo(&mut self) -> ChainResult<()> {
        let top = self
            .stack
            .pop_back()
            .ok_or_else(|| ChainError::Database("undo without an open session".into()))?;
        for (key, old) in top.old_values {
            match old {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        self.revision -= 1;
        Ok(())
    }

    fn commit(&mut self, revision: u64) {
        while self.stack.front().is_some_and(|s| s.revision <= revision) {
            self.stack.pop_front();
        }
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn undo_depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &mut UndoStore, k: &str, v: &str) {
        store.put(k.as_bytes().to_vec(), v.as_bytes().to_vec()).unwrap();
    }

    fn get(store: &UndoStore, k: &str) -> Option<String> {
        store
            .get(k.as_bytes())
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }

    #[test]
    fn test_writes_outside_session_are_permanent() {
        let mut store = UndoStore::new();
        put(&mut store, "a", "1");
        assert!(store.undo().is_err());
        assert_eq!(get(&store, "a").as_deref(), Some("1"));
    }

    #[test]
    fn test_undo_restores_prior_values() {
        let mut store = UndoStore::new();
        put(&mut store, "a", "1");
        put(&mut store, "b", "2");
        store.begin();
        put(&mut store, "a", "changed");
        put(&mut store, "a", "changed twice");
        store.erase(b"b").unwrap();
        put(&mut store, "c", "new");
        store.undo().unwrap();
        assert_eq!(get(&store, "a").as_deref(), Some("1"));
        assert_eq!(get(&store, "b").as_deref(), Some("2"));
        assert_eq!(get(&store, "c"), None);
    }

    #[test]
    fn test_squash_then_parent_undo() {
        let mut store = UndoStore::new();
        put(&mut store, "a", "1");
        let block = store.begin();
        put(&mut store, "b", "block");
        let trx = store.begin();
        assert_eq!(trx, block + 1);
        put(&mut store, "a", "trx");
        store.squash().unwrap();
        assert_eq!(store.revision(), block);
        assert_eq!(get(&store, "a").as_deref(), Some("trx"));
        store.undo().unwrap();
        assert_eq!(get(&store, "a").as_deref(), Some("1"));
        assert_eq!(get(&store, "b"), None);
    }

    #[test]
    fn test_nested_undo_keeps_parent() {
        let mut store = UndoStore::new();
        store.begin();
        put(&mut store, "kept", "x");
        store.begin();
        put(&mut store, "dropped", "y");
        store.undo().unwrap();
        assert_eq!(get(&store, "kept").as_deref(), Some("x"));
        assert_eq!(get(&store, "dropped"), None);
        assert_eq!(store.undo_depth(), 1);
    }

    #[test]
    fn test_commit_drops_history() {
        let mut store = UndoStore::new();
        let r1 = store.begin();
        put(&mut store, "a", "1");
        store.begin();
        put(&mut store, "b", "2");
        store.commit(r1);
        assert_eq!(store.undo_depth(), 1);
        store.undo().unwrap();
        assert_eq!(get(&store, "a").as_deref(), Some("1"));
        assert_eq!(get(&store, "b"), None);
        assert!(store.undo().is_err());
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let mut store = UndoStore::new();
        put(&mut store, "row/2", "b");
        put(&mut store, "row/1", "a");
        put(&mut store, "rox", "z");
        put(&mut store, "ro", "y");
        let rows = store.scan_prefix(b"row/").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"row/1"[..], &b"row/2"[..]]);
    }

    #[test]
    fn test_erase_missing_key() {
        let mut store = UndoStore::new();
        store.begin();
        assert!(!store.erase(b"nothing").unwrap());
        store.undo().unwrap();
        assert!(store.is_empty());
    }
}
