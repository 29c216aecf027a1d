//! Local value store with multi-writer conflict resolution and anti-flood quotas.

mod bag;
mod host_filter;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::common::{Id, ValueEntity};
use crate::Result;

use bag::ValueBag;
pub use host_filter::{BanList, HostFilter, MAX_BANNED_HOSTS};

/// Default for [DatabaseSettings::max_keys_per_address].
pub const DEFAULT_MAX_KEYS_PER_ADDRESS: usize = 5;
/// Default for [DatabaseSettings::ban_threshold].
pub const DEFAULT_BAN_THRESHOLD: usize = 150;
/// Default for [DatabaseSettings::max_keys].
pub const DEFAULT_MAX_KEYS: usize = 50_000;
/// Default for [DatabaseSettings::max_values_per_key].
pub const DEFAULT_MAX_VALUES_PER_KEY: usize = 5;
/// Default for [DatabaseSettings::request_load_smoothing_factor].
pub const DEFAULT_REQUEST_LOAD_SMOOTHING_FACTOR: f32 = 0.25;
/// Default for [DatabaseSettings::request_load_nulling_delay].
pub const DEFAULT_REQUEST_LOAD_NULLING_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
/// Limits of the [ValueStore].
pub struct DatabaseSettings {
    /// Number of distinct primary keys a single host may own before
    /// its stores of new keys are rejected.
    ///
    /// Defaults to [DEFAULT_MAX_KEYS_PER_ADDRESS]
    pub max_keys_per_address: usize,
    /// Once the owned keys plus rejected attempts of a host exceed this
    /// number, the host is banned through the [HostFilter].
    ///
    /// Defaults to [DEFAULT_BAN_THRESHOLD]
    pub ban_threshold: usize,
    /// Maximum number of primary keys in the store.
    ///
    /// Defaults to [DEFAULT_MAX_KEYS]
    pub max_keys: usize,
    /// Maximum number of entities (secondary keys) under one primary key.
    ///
    /// When full, a store from a non-firewalled creator evicts the oldest
    /// entity of a firewalled creator.
    ///
    /// Defaults to [DEFAULT_MAX_VALUES_PER_KEY]
    pub max_values_per_key: usize,
    /// Weight of the newest sample in the request load average.
    ///
    /// Defaults to [DEFAULT_REQUEST_LOAD_SMOOTHING_FACTOR]
    pub request_load_smoothing_factor: f32,
    /// Requests further apart than this reset the request load.
    ///
    /// Defaults to [DEFAULT_REQUEST_LOAD_NULLING_DELAY]
    pub request_load_nulling_delay: Duration,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            max_keys_per_address: DEFAULT_MAX_KEYS_PER_ADDRESS,
            ban_threshold: DEFAULT_BAN_THRESHOLD,
            max_keys: DEFAULT_MAX_KEYS,
            max_values_per_key: DEFAULT_MAX_VALUES_PER_KEY,
            request_load_smoothing_factor: DEFAULT_REQUEST_LOAD_SMOOTHING_FACTOR,
            request_load_nulling_delay: DEFAULT_REQUEST_LOAD_NULLING_DELAY,
        }
    }
}

#[derive(Debug)]
/// Thread safe store of [ValueEntity]s keyed by (primary key, secondary key).
///
/// Precedence between entities of the same pair follows their [crate::Origin]:
/// an incoming entity replaces (or deletes, when empty) the existing one iff its
/// origin is at least as strong.
///
/// Every operation runs behind a single lock.
pub struct ValueStore {
    settings: DatabaseSettings,
    filter: Arc<dyn HostFilter>,
    inner: Mutex<Inner>,
}

impl ValueStore {
    pub fn new(settings: DatabaseSettings, filter: Arc<dyn HostFilter>) -> Self {
        Self {
            settings,
            filter,
            inner: Mutex::new(Inner::default()),
        }
    }

    // === Getters ===

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    /// Number of primary keys.
    pub fn key_count(&self) -> usize {
        self.lock().key_count
    }

    /// Number of entities across all keys.
    pub fn value_count(&self) -> usize {
        self.lock().value_count
    }

    // === Public Methods ===

    /// Stores the entity, returns `true` if it was accepted.
    ///
    /// An entity with an empty value deletes the existing entity instead,
    /// under the same precedence rules.
    pub fn store(&self, entity: ValueEntity) -> bool {
        let (accepted, ban) = self.lock().store(entity, &self.settings, true);

        if let Some(address) = ban {
            self.filter.ban(address);
        }

        accepted
    }

    /// Returns the entities stored under `primary_key`, keyed by secondary key.
    pub fn get(&self, primary_key: &Id) -> HashMap<Id, ValueEntity> {
        self.lock()
            .bags
            .get(primary_key)
            .map(|bag| {
                bag.entities()
                    .map(|entity| (*entity.secondary_key(), entity.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, primary_key: &Id, secondary_key: &Id) -> bool {
        self.lock()
            .bags
            .get(primary_key)
            .is_some_and(|bag| bag.get(secondary_key).is_some())
    }

    /// Removes the entity regardless of its origin.
    pub fn remove(&self, primary_key: &Id, secondary_key: &Id) -> Option<ValueEntity> {
        self.lock().remove(primary_key, secondary_key)
    }

    /// Returns a copy of every stored entity.
    pub fn values(&self) -> Vec<ValueEntity> {
        self.lock()
            .bags
            .values()
            .flat_map(|bag| bag.entities().cloned())
            .collect()
    }

    pub fn clear(&self) {
        *self.lock() = Inner::default();
    }

    /// Returns the request load of `primary_key`, registering a new request first
    /// if `increment` is `true`.
    ///
    /// Unknown keys have no load.
    pub fn request_load(&self, primary_key: &Id, increment: bool) -> f32 {
        let mut inner = self.lock();

        let Some(bag) = inner.bags.get_mut(primary_key) else {
            return 0.0;
        };

        if increment {
            bag.increment_request_load(
                Instant::now(),
                self.settings.request_load_smoothing_factor,
                self.settings.request_load_nulling_delay,
            )
        } else {
            bag.request_load()
        }
    }

    /// Serializes every stored entity to bencode.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = Snapshot {
            entities: self.values(),
        };

        Ok(serde_bencode::to_bytes(&snapshot)?)
    }

    /// Stores every entity of a [Self::snapshot], returns how many were accepted.
    ///
    /// Precedence and size limits apply, per address quotas do not.
    pub fn restore(&self, bytes: &[u8]) -> Result<usize> {
        let snapshot: Snapshot = serde_bencode::from_bytes(bytes)?;

        let mut inner = self.lock();
        let restored = snapshot
            .entities
            .into_iter()
            .filter(|entity| !entity.is_empty())
            .filter(|entity| inner.store(entity.clone(), &self.settings, false).0)
            .count();

        debug!(restored, "Restored value store snapshot");

        Ok(restored)
    }

    // === Private Methods ===

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn assert_counters(&self) {
        let inner = self.lock();

        assert_eq!(inner.key_count, inner.bags.len());
        assert_eq!(
            inner.value_count,
            inner.bags.values().map(|bag| bag.len()).sum::<usize>()
        );
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entities: Vec<ValueEntity>,
}

#[derive(Debug, Default)]
/// Keys owned by, and stores rejected from, one host.
struct HostQuota {
    /// Primary key -> number of entities created by this host under it.
    keys: HashMap<Id, usize>,
    rejected: usize,
    banned: bool,
}

#[derive(Debug, Default)]
struct Inner {
    bags: HashMap<Id, ValueBag>,
    key_count: usize,
    value_count: usize,
    hosts: HashMap<IpAddr, HostQuota>,
}

impl Inner {
    /// Returns whether the entity was accepted, and an address to ban if any.
    fn store(
        &mut self,
        entity: ValueEntity,
        settings: &DatabaseSettings,
        check_flood: bool,
    ) -> (bool, Option<SocketAddr>) {
        let primary_key = *entity.primary_key();
        let secondary_key = *entity.secondary_key();

        let existing = self
            .bags
            .get(&primary_key)
            .and_then(|bag| bag.get(&secondary_key))
            .map(|existing| existing.origin());

        if let Some(existing) = existing {
            if entity.origin() < existing {
                trace!(
                    ?primary_key,
                    ?existing,
                    incoming = ?entity.origin(),
                    "Rejected store with weaker origin"
                );
                return (false, None);
            }
        }

        if entity.is_empty() {
            return (
                existing.is_some() && self.remove(&primary_key, &secondary_key).is_some(),
                None,
            );
        }

        if check_flood && !entity.is_local() {
            if let Some(ban) = self.check_flood(&entity, settings) {
                return (false, ban);
            }
        }

        if !self.bags.contains_key(&primary_key) && self.key_count >= settings.max_keys {
            debug!(?primary_key, "Value store is full");
            return (false, None);
        }

        if existing.is_none() {
            let bag_len = self.bags.get(&primary_key).map_or(0, |bag| bag.len());

            if bag_len >= settings.max_values_per_key {
                let evict = if entity.creator().is_firewalled() {
                    None
                } else {
                    self.bags
                        .get(&primary_key)
                        .and_then(|bag| bag.oldest_firewalled())
                };

                match evict {
                    Some(evict) => {
                        trace!(?primary_key, ?evict, "Evicting firewalled value");
                        self.remove(&primary_key, &evict);
                    }
                    None => {
                        trace!(?primary_key, "Too many values for key");
                        return (false, None);
                    }
                }
            }
        }

        self.insert(entity);

        (true, None)
    }

    /// Returns `Some` if the creator's host is over its quota for new keys,
    /// with the address to ban once it is also over the ban threshold.
    fn check_flood(
        &mut self,
        entity: &ValueEntity,
        settings: &DatabaseSettings,
    ) -> Option<Option<SocketAddr>> {
        let address = entity.creator().address();

        let within_quota = self.hosts.get(&address.ip()).map_or(true, |host| {
            host.keys.contains_key(entity.primary_key())
                || host.keys.len() < settings.max_keys_per_address
        });

        if within_quota && settings.max_keys_per_address > 0 {
            return None;
        }

        let host = self.hosts.entry(address.ip()).or_default();
        host.rejected += 1;

        debug!(
            ?address,
            owned = host.keys.len(),
            rejected = host.rejected,
            "Rejected store over the per address quota"
        );

        if !host.banned && host.keys.len() + host.rejected > settings.ban_threshold {
            host.banned = true;
            return Some(Some(address));
        }

        Some(None)
    }

    fn insert(&mut self, entity: ValueEntity) {
        let primary_key = *entity.primary_key();

        self.track(&entity);

        let bag = self.bags.entry(primary_key).or_insert_with(|| {
            self.key_count += 1;
            ValueBag::default()
        });

        match bag.insert(entity) {
            Some(replaced) => self.untrack(&replaced),
            None => self.value_count += 1,
        }
    }

    fn remove(&mut self, primary_key: &Id, secondary_key: &Id) -> Option<ValueEntity> {
        let bag = self.bags.get_mut(primary_key)?;
        let removed = bag.remove(secondary_key)?;

        self.value_count -= 1;

        if bag.is_empty() {
            self.bags.remove(primary_key);
            self.key_count -= 1;
        }

        self.untrack(&removed);

        Some(removed)
    }

    fn track(&mut self, entity: &ValueEntity) {
        if entity.is_local() {
            return;
        }

        *self
            .hosts
            .entry(entity.creator().address().ip())
            .or_default()
            .keys
            .entry(*entity.primary_key())
            .or_default() += 1;
    }

    fn untrack(&mut self, entity: &ValueEntity) {
        if entity.is_local() {
            return;
        }

        let ip = entity.creator().address().ip();

        let Some(host) = self.hosts.get_mut(&ip) else {
            return;
        };

        if let Some(count) = host.keys.get_mut(entity.primary_key()) {
            *count -= 1;
            if *count == 0 {
                host.keys.remove(entity.primary_key());
            }
        }

        if host.keys.is_empty() && host.rejected == 0 {
            self.hosts.remove(&ip);
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use crate::common::{Contact, Value, FIREWALLED_FLAG};

    use super::*;

    fn new_store() -> (ValueStore, Arc<BanList>) {
        store_with(DatabaseSettings::default())
    }

    fn store_with(settings: DatabaseSettings) -> (ValueStore, Arc<BanList>) {
        let filter = Arc::new(BanList::default());

        (ValueStore::new(settings, filter.clone()), filter)
    }

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn payload(entity: &ValueEntity) -> &[u8] {
        &entity.value().payload
    }

    struct Fixture {
        key: Id,
        creator: Contact,
        relay: Contact,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                key: Id::random(),
                creator: Contact::random(address(4000)),
                relay: Contact::random(SocketAddr::from(([10, 0, 0, 2], 4000))),
            }
        }

        fn local(&self, value: &'static str) -> ValueEntity {
            ValueEntity::local(self.key, self.creator.clone(), Value::text(value))
        }

        fn direct(&self, value: &'static str) -> ValueEntity {
            ValueEntity::remote(
                self.key,
                self.creator.clone(),
                self.creator.clone(),
                Value::text(value),
            )
        }

        fn indirect(&self, value: &'static str) -> ValueEntity {
            ValueEntity::remote(
                self.key,
                self.creator.clone(),
                self.relay.clone(),
                Value::text(value),
            )
        }

        fn stored(&self, store: &ValueStore) -> Option<ValueEntity> {
            store.get(&self.key).remove(self.creator.id())
        }
    }

    #[test]
    fn local_is_never_replaced_by_remote() {
        let (store, _) = new_store();
        let f = Fixture::new();

        assert!(store.store(f.local("local")));
        assert!(!store.store(f.direct("direct")));
        assert!(!store.store(f.indirect("indirect")));

        assert_eq!(payload(&f.stored(&store).unwrap()), b"local");

        assert!(store.store(f.local("local again")));
        assert_eq!(payload(&f.stored(&store).unwrap()), b"local again");
        store.assert_counters();
    }

    #[test]
    fn direct_indirect_direct() {
        let (store, _) = new_store();
        let f = Fixture::new();

        assert!(store.store(f.direct("Mojito")));
        assert_eq!(payload(&f.stored(&store).unwrap()), b"Mojito");

        assert!(!store.store(f.indirect("Tough")));
        assert_eq!(payload(&f.stored(&store).unwrap()), b"Mojito");

        assert!(store.store(f.direct("Tonic")));
        assert_eq!(payload(&f.stored(&store).unwrap()), b"Tonic");

        assert_eq!(store.key_count(), 1);
        assert_eq!(store.value_count(), 1);
    }

    #[test]
    fn precedence_table() {
        use Origin::*;

        use crate::common::Origin;

        let cases = [
            (Local, Local, true),
            (Local, Direct, false),
            (Local, Indirect, false),
            (Direct, Local, true),
            (Direct, Direct, true),
            (Direct, Indirect, false),
            (Indirect, Local, true),
            (Indirect, Direct, true),
            (Indirect, Indirect, true),
        ];

        for (existing, incoming, replaced) in cases {
            let (store, _) = new_store();
            let f = Fixture::new();

            let entity = |origin, value| match origin {
                Local => f.local(value),
                Direct => f.direct(value),
                Indirect => f.indirect(value),
            };

            assert!(store.store(entity(existing, "existing")));
            assert_eq!(
                store.store(entity(incoming, "incoming")),
                replaced,
                "{existing:?} -> {incoming:?}"
            );

            let expected: &[u8] = if replaced { b"incoming" } else { b"existing" };
            assert_eq!(payload(&f.stored(&store).unwrap()), expected);
        }
    }

    #[test]
    fn delete_with_empty_value() {
        let (store, _) = new_store();
        let f = Fixture::new();

        assert!(store.store(f.direct("Hello World")));
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.value_count(), 1);

        assert!(store.store(f.direct("")));
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.value_count(), 0);
        assert!(store.get(&f.key).is_empty());

        let other = Fixture::new();
        assert!(store.store(other.direct("Still here")));

        assert!(!store.store(other.indirect("")));
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.value_count(), 1);
        assert_eq!(payload(&other.stored(&store).unwrap()), b"Still here");
        store.assert_counters();
    }

    #[test]
    fn delete_missing_entity() {
        let (store, _) = new_store();
        let f = Fixture::new();

        assert!(!store.store(f.direct("")));
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn secondary_keys_are_independent() {
        let (store, _) = new_store();
        let a = Fixture::new();
        let b = Fixture {
            key: a.key,
            ..Fixture::new()
        };

        assert!(store.store(a.local("a")));
        assert!(store.store(b.indirect("b")));

        assert_eq!(store.key_count(), 1);
        assert_eq!(store.value_count(), 2);

        assert!(store.store(b.direct("")));
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.value_count(), 1);
        assert!(store.contains(&a.key, a.creator.id()));
        store.assert_counters();
    }

    #[test]
    fn flooding() {
        let (store, filter) = store_with(DatabaseSettings {
            max_keys_per_address: 5,
            ban_threshold: 10,
            ..Default::default()
        });

        let creator = Contact::random(address(4000));
        let flood = |store: &ValueStore| {
            store.store(ValueEntity::remote(
                Id::random(),
                creator.clone(),
                creator.clone(),
                Value::text("flood"),
            ))
        };

        for _ in 0..5 {
            assert!(flood(&store));
        }
        assert_eq!(store.key_count(), 5);

        for _ in 0..5 {
            assert!(!flood(&store));
            assert_eq!(store.key_count(), 5);
            assert_eq!(store.value_count(), 5);
        }
        assert!(!filter.is_banned(&creator.address().ip()));

        assert!(!flood(&store));
        assert!(filter.is_banned(&creator.address().ip()));
        store.assert_counters();
    }

    #[test]
    fn quota_does_not_block_owned_keys() {
        let (store, _) = store_with(DatabaseSettings {
            max_keys_per_address: 1,
            ..Default::default()
        });
        let f = Fixture::new();

        assert!(store.store(f.direct("first")));
        assert!(store.store(f.direct("second")));
        assert!(store.store(f.direct("")));

        // The key was released
        let other = Fixture {
            creator: f.creator.clone(),
            ..Fixture::new()
        };
        assert!(store.store(other.direct("third")));
    }

    #[test]
    fn local_stores_bypass_quota() {
        let (store, _) = store_with(DatabaseSettings {
            max_keys_per_address: 1,
            ban_threshold: 1,
            ..Default::default()
        });
        let creator = Contact::random(address(4000));

        for _ in 0..10 {
            assert!(store.store(ValueEntity::local(
                Id::random(),
                creator.clone(),
                Value::text("mine")
            )));
        }

        assert_eq!(store.key_count(), 10);
    }

    #[test]
    fn max_keys() {
        let (store, _) = store_with(DatabaseSettings {
            max_keys: 2,
            ..Default::default()
        });
        let creator = Contact::random(address(4000));

        let keys = [Id::random(), Id::random(), Id::random()];
        let accepted: Vec<bool> = keys
            .iter()
            .map(|key| store.store(ValueEntity::local(*key, creator.clone(), Value::text("v"))))
            .collect();

        assert_eq!(accepted, vec![true, true, false]);
    }

    #[test]
    fn replace_firewalled_value() {
        const MAX_VALUES_PER_KEY: usize = 5;

        let (store, _) = store_with(DatabaseSettings {
            max_values_per_key: MAX_VALUES_PER_KEY,
            max_keys_per_address: usize::MAX,
            ..Default::default()
        });
        let key = Id::random();

        let firewalled: Vec<ValueEntity> = (0..2 * MAX_VALUES_PER_KEY)
            .map(|i| {
                let creator =
                    Contact::random(address(6000 + i as u16)).with_flags(FIREWALLED_FLAG);
                ValueEntity::remote(key, creator.clone(), creator, Value::text("firewalled"))
            })
            .collect();

        for (i, entity) in firewalled.iter().enumerate() {
            assert_eq!(store.store(entity.clone()), i < MAX_VALUES_PER_KEY);
        }
        assert_eq!(store.value_count(), MAX_VALUES_PER_KEY);

        let open = Contact::random(address(7000));
        assert!(store.store(ValueEntity::remote(
            key,
            open.clone(),
            open.clone(),
            Value::text("open")
        )));

        let stored = store.get(&key);
        assert_eq!(stored.len(), MAX_VALUES_PER_KEY);
        assert!(stored.contains_key(open.id()));
        // The oldest firewalled value was evicted
        assert!(!stored.contains_key(firewalled[0].secondary_key()));
        store.assert_counters();
    }

    #[test]
    fn remove_is_unconditional() {
        let (store, _) = new_store();
        let f = Fixture::new();

        store.store(f.local("local"));

        let removed = store.remove(&f.key, f.creator.id()).unwrap();
        assert!(removed.is_local());
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.value_count(), 0);
    }

    #[test]
    fn request_load_of_unknown_key() {
        let (store, _) = new_store();

        assert_eq!(store.request_load(&Id::random(), true), 0.0);
    }

    #[test]
    fn request_load() {
        let (store, _) = new_store();
        let f = Fixture::new();

        store.store(f.local("Hello World"));

        assert_eq!(store.request_load(&f.key, true), 0.0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(store.request_load(&f.key, true) > 0.0);
    }

    #[test]
    fn snapshot_restore() {
        let (store, _) = new_store();
        let a = Fixture::new();
        let b = Fixture::new();

        store.store(a.local("a"));
        store.store(b.indirect("b"));

        let snapshot = store.snapshot().unwrap();

        let (restored, _) = new_store();
        assert_eq!(restored.restore(&snapshot).unwrap(), 2);

        assert_eq!(restored.key_count(), 2);
        assert_eq!(restored.value_count(), 2);
        assert_eq!(a.stored(&restored), a.stored(&store));
        assert_eq!(b.stored(&restored).unwrap().origin(), b.indirect("b").origin());
    }

    #[test]
    fn concurrent_stores_keep_counters_consistent() {
        use rayon::prelude::*;

        let (store, _) = store_with(DatabaseSettings {
            max_keys_per_address: usize::MAX,
            ..Default::default()
        });
        let keys: Vec<Id> = (0..16).map(|_| Id::random()).collect();

        (0..1000).into_par_iter().for_each(|i| {
            let creator = Contact::random(address(i as u16));
            let key = keys[i % keys.len()];
            let value = if i % 3 == 0 { "" } else { "value" };

            store.store(ValueEntity::remote(key, creator.clone(), creator, Value::text(value)));
        });

        store.assert_counters();
    }
}
