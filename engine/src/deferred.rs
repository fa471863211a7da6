//! Deferred transaction storage.
//!
//! Entries are keyed by `(sender, sender_id)` and indexed a second time by
//! `(delay_until, sequence)`, which is the order they are offered for
//! execution. Scheduling over an existing key replaces the old entry and
//! refunds its payer. The payer holds `packed size + overhead` bytes of RAM
//! for as long as the entry lives.

use meterchain_primitives::codec::{unpack_from, Pack};
use meterchain_primitives::{ChainError, ChainResult, DeferredKey, KeyValueStore, TimestampMs};

use crate::resource_limits::ResourceLimitsLedger;
use crate::tables::{self, get_generated, get_global, put_record, GeneratedTransaction};

/// Take the next enqueue sequence number.
pub(crate) fn next_sequence(store: &mut dyn KeyValueStore) -> ChainResult<u64> {
    let mut global = get_global(store)?;
    global.deferred_sequence += 1;
    put_record(store, tables::GLOBAL_KEY.to_vec(), &global)?;
    Ok(global.deferred_sequence)
}

/// Store `entry`, replacing any entry under the same key. Returns the
/// replaced entry.
pub(crate) fn schedule(
    store: &mut dyn KeyValueStore,
    ledger: &ResourceLimitsLedger,
    entry: GeneratedTransaction,
) -> ChainResult<Option<GeneratedTransaction>> {
    let replaced = remove(store, ledger, &entry.key)?;
    ledger.add_ram_usage(store, entry.payer, entry.billable_size() as i64)?;
    store.put(
        tables::deferred_time_key(entry.delay_until, entry.sequence),
        entry.key.packed(),
    )?;
    tracing::debug!(
        key = %entry.key,
        payer = %entry.payer,
        delay_until = entry.delay_until,
        replaced = replaced.is_some(),
        "scheduled deferred transaction"
    );
    put_record(store, tables::deferred_key(&entry.key), &entry)?;
    Ok(replaced)
}

/// Delete the entry under `key` and refund its payer.
pub(crate) fn remove(
    store: &mut dyn KeyValueStore,
    ledger: &ResourceLimitsLedger,
    key: &DeferredKey,
) -> ChainResult<Option<GeneratedTransaction>> {
    let Some(entry) = get_generated(store, key)? else {
        return Ok(None);
    };
    store.erase(&tables::deferred_key(key))?;
    store.erase(&tables::deferred_time_key(entry.delay_until, entry.sequence))?;
    ledger.add_ram_usage(store, entry.payer, -(entry.billable_size() as i64))?;
    Ok(Some(entry))
}

/// Keys of entries due at `now`, in `(delay_until, sequence)` order.
pub fn due(store: &dyn KeyValueStore, now: TimestampMs) -> ChainResult<Vec<DeferredKey>> {
    let mut keys = Vec::new();
    for (index_key, value) in store.scan_prefix(tables::DEFERRED_TIME_PREFIX)? {
        let at = index_key
            .get(tables::DEFERRED_TIME_PREFIX.len()..tables::DEFERRED_TIME_PREFIX.len() + 8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| ChainError::Database("malformed deferred time index".into()))?;
        if at > now {
            break;
        }
        let key: DeferredKey = unpack_from(&value)
            .map_err(|e| ChainError::Database(format!("corrupt deferred index: {e}")))?;
        keys.push(key);
    }
    Ok(keys)
}

/// Number of stored entries.
pub fn count(store: &dyn KeyValueStore) -> ChainResult<usize> {
    Ok(store.scan_prefix(tables::DEFERRED_KEY_PREFIX)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimitsConfig;
    use meterchain_primitives::{name, UndoStore};

    fn setup() -> (ResourceLimitsLedger, UndoStore) {
        let ledger = ResourceLimitsLedger::new(ResourceLimitsConfig::default());
        let mut store = UndoStore::new();
        ledger.initialize(&mut store).unwrap();
        ledger.initialize_account(&mut store, name("alice")).unwrap();
        ledger.initialize_account(&mut store, name("bob")).unwrap();
        (ledger, store)
    }

    fn entry(store: &mut UndoStore, sender_id: u128, payer: &str, delay_until: u64, body: usize) -> GeneratedTransaction {
        GeneratedTransaction {
            key: DeferredKey::new(name("alice"), sender_id),
            trx_id: [sender_id as u8; 32],
            payer: name(payer),
            published: 0,
            delay_until,
            expiration: delay_until + 1_000,
            sequence: next_sequence(store).unwrap(),
            packed_trx: vec![0; body],
        }
    }

    fn ram(ledger: &ResourceLimitsLedger, store: &UndoStore, account: &str) -> u64 {
        ledger.get_account_usage(store, name(account)).unwrap().ram_usage
    }

    #[test]
    fn test_schedule_bills_payer() {
        let (ledger, mut store) = setup();
        let e = entry(&mut store, 1, "alice", 10, 40);
        schedule(&mut store, &ledger, e).unwrap();
        assert_eq!(ram(&ledger, &store, "alice"), 40 + meterchain_primitives::types::DEFERRED_OVERHEAD_BYTES);
        assert_eq!(count(&store).unwrap(), 1);
    }

    #[test]
    fn test_same_key_replaces_and_refunds() {
        let (ledger, mut store) = setup();
        let first = entry(&mut store, 7, "alice", 10, 40);
        schedule(&mut store, &ledger, first.clone()).unwrap();
        let second = entry(&mut store, 7, "bob", 20, 10);
        let replaced = schedule(&mut store, &ledger, second.clone()).unwrap();
        assert_eq!(replaced, Some(first));
        assert_eq!(count(&store).unwrap(), 1);
        assert_eq!(ram(&ledger, &store, "alice"), 0);
        assert_eq!(ram(&ledger, &store, "bob"), second.billable_size());
        assert_eq!(due(&store, 15).unwrap(), vec![]);
        assert_eq!(due(&store, 20).unwrap(), vec![second.key]);
    }

    #[test]
    fn test_due_orders_by_time_then_sequence() {
        let (ledger, mut store) = setup();
        let a = entry(&mut store, 1, "alice", 30, 1);
        let b = entry(&mut store, 2, "alice", 10, 1);
        let c = entry(&mut store, 3, "alice", 10, 1);
        for e in [a.clone(), b.clone(), c.clone()] {
            schedule(&mut store, &ledger, e).unwrap();
        }
        assert_eq!(due(&store, 100).unwrap(), vec![b.key, c.key, a.key]);
        assert_eq!(due(&store, 10).unwrap(), vec![b.key, c.key]);
    }

    #[test]
    fn test_remove_missing_is_none() {
        let (ledger, mut store) = setup();
        let key = DeferredKey::new(name("alice"), 99);
        assert!(remove(&mut store, &ledger, &key).unwrap().is_none());
        let e = entry(&mut store, 99, "alice", 5, 3);
        schedule(&mut store, &ledger, e).unwrap();
        assert!(remove(&mut store, &ledger, &key).unwrap().is_some());
        assert_eq!(count(&store).unwrap(), 0);
        assert_eq!(ram(&ledger, &store, "alice"), 0);
    }
}
