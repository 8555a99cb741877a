//! Local directory shard
//!
//! `key -> subkey -> (value, expiration)`. The expiration doubles as the
//! write version: a later expiration replaces an earlier one, so a writer
//! refreshing its own subkey always wins over a stale replica.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::id::DhtKey;

/// One stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub expiration: DateTime<Utc>,
}

/// Outcome of a local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Value written (new subkey or newer expiration)
    Stored,
    /// Same value and expiration already present
    Unchanged,
    /// A value with a later expiration is already present
    Superseded,
    /// Expiration is not in the future
    Expired,
}

impl StoreOutcome {
    /// Whether the sender's value is held after the store
    pub fn is_accepted(&self) -> bool {
        matches!(self, StoreOutcome::Stored | StoreOutcome::Unchanged)
    }
}

/// In-memory shard of the directory
#[derive(Debug, Default)]
pub struct LocalStorage {
    entries: HashMap<DhtKey, HashMap<String, StoredValue>>,
}

impl LocalStorage {
    /// Create an empty shard
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a subkey, comparing expirations against `now`
    pub fn store_at(
        &mut self,
        key: DhtKey,
        subkey: String,
        value: Vec<u8>,
        expiration: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreOutcome {
        if expiration <= now {
            return StoreOutcome::Expired;
        }

        let subkeys = self.entries.entry(key).or_default();
        let current = subkeys
            .get(&subkey)
            .map(|existing| (existing.expiration, existing.value == value));

        match current {
            Some((existing, _)) if existing > expiration => StoreOutcome::Superseded,
            Some((existing, true)) if existing == expiration => StoreOutcome::Unchanged,
            _ => {
                subkeys.insert(subkey, StoredValue { value, expiration });
                StoreOutcome::Stored
            }
        }
    }

    /// Store relative to the current time
    pub fn store(
        &mut self,
        key: DhtKey,
        subkey: String,
        value: Vec<u8>,
        expiration: DateTime<Utc>,
    ) -> StoreOutcome {
        self.store_at(key, subkey, value, expiration, Utc::now())
    }

    /// Live entries under `key` as of `now`
    pub fn get_at(&self, key: &DhtKey, now: DateTime<Utc>) -> HashMap<String, StoredValue> {
        self.entries
            .get(key)
            .map(|subkeys| {
                subkeys
                    .iter()
                    .filter(|(_, v)| v.expiration > now)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live entries under `key`
    pub fn get(&self, key: &DhtKey) -> HashMap<String, StoredValue> {
        self.get_at(key, Utc::now())
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for subkeys in self.entries.values_mut() {
            let before = subkeys.len();
            subkeys.retain(|_, v| v.expiration > now);
            removed += before - subkeys.len();
        }
        self.entries.retain(|_, subkeys| !subkeys.is_empty());
        removed
    }

    /// Drop entries expired as of now
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// Number of stored subkeys, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    /// Whether the shard holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> DhtKey {
        DhtKey::from_name("run_progress")
    }

    #[test]
    fn test_store_and_get() {
        let mut shard = LocalStorage::new();
        let now = Utc::now();
        let exp = now + Duration::seconds(60);

        assert_eq!(
            shard.store_at(key(), "a".into(), b"1".to_vec(), exp, now),
            StoreOutcome::Stored
        );
        let got = shard.get_at(&key(), now);
        assert_eq!(got["a"].value, b"1");
    }

    #[test]
    fn test_rejects_past_expiration() {
        let mut shard = LocalStorage::new();
        let now = Utc::now();
        let outcome = shard.store_at(key(), "a".into(), vec![], now - Duration::seconds(1), now);
        assert_eq!(outcome, StoreOutcome::Expired);
        assert!(!outcome.is_accepted());
        assert!(shard.get_at(&key(), now).is_empty());
    }

    #[test]
    fn test_newer_expiration_wins() {
        let mut shard = LocalStorage::new();
        let now = Utc::now();
        let older = now + Duration::seconds(10);
        let newer = now + Duration::seconds(20);

        shard.store_at(key(), "a".into(), b"new".to_vec(), newer, now);
        assert_eq!(
            shard.store_at(key(), "a".into(), b"old".to_vec(), older, now),
            StoreOutcome::Superseded
        );
        assert_eq!(shard.get_at(&key(), now)["a"].value, b"new");

        assert_eq!(
            shard.store_at(key(), "a".into(), b"newer".to_vec(), newer + Duration::seconds(1), now),
            StoreOutcome::Stored
        );
        assert_eq!(shard.get_at(&key(), now)["a"].value, b"newer");
    }

    #[test]
    fn test_repeat_store_is_idempotent() {
        let mut shard = LocalStorage::new();
        let now = Utc::now();
        let exp = now + Duration::seconds(10);

        shard.store_at(key(), "a".into(), b"x".to_vec(), exp, now);
        assert_eq!(
            shard.store_at(key(), "a".into(), b"x".to_vec(), exp, now),
            StoreOutcome::Unchanged
        );
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_subkeys_do_not_overwrite_each_other() {
        let mut shard = LocalStorage::new();
        let now = Utc::now();
        let exp = now + Duration::seconds(10);

        shard.store_at(key(), "peer-a".into(), b"a".to_vec(), exp, now);
        shard.store_at(key(), "peer-b".into(), b"b".to_vec(), exp, now);
        assert_eq!(shard.get_at(&key(), now).len(), 2);
    }

    #[test]
    fn test_expired_entries_hidden_before_purge() {
        let mut shard = LocalStorage::new();
        let now = Utc::now();
        shard.store_at(key(), "a".into(), b"1".to_vec(), now + Duration::seconds(5), now);
        shard.store_at(key(), "b".into(), b"2".to_vec(), now + Duration::seconds(50), now);

        let later = now + Duration::seconds(10);
        let live = shard.get_at(&key(), later);
        assert_eq!(live.len(), 1);
        assert!(live.contains_key("b"));

        // Physically still present until purged
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.purge_expired_at(later), 1);
        assert_eq!(shard.len(), 1);
    }
}
