//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::common::{Contact, ContactEntry, Id};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// Consecutive failures after which a contact is removed.
pub const MAX_CONTACT_FAILURES: u32 = 3;
/// A bucket that was not looked up for this long needs a refresh.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Routing table consumed by the lookup and bootstrap machinery.
pub trait RouteTable: Debug + Send + Sync {
    /// Id of the local node, distances are measured from it.
    fn local_id(&self) -> Id;

    /// Switches to a new local id, re-adding every contact under it.
    fn rebuild(&self, local_id: Id);

    /// Adds or refreshes a contact, returns `true` if it is in the table afterwards.
    fn add(&self, contact: Contact) -> bool;

    fn remove(&self, id: &Id);

    /// Records an unanswered request to this contact.
    fn handle_failure(&self, id: &Id);

    /// Up to `count` contacts, closest to `target` first.
    fn closest(&self, target: &Id, count: usize) -> Vec<Contact>;

    /// Every contact, most recently seen first.
    fn contacts(&self) -> Vec<Contact>;

    /// Random ids, one per bucket that needs a refresh lookup.
    ///
    /// With `all` every non-empty bucket is included, otherwise only stale ones.
    fn refresh_ids(&self, all: bool) -> Vec<Id>;

    /// Marks the bucket `target` falls in as just refreshed.
    fn mark_refreshed(&self, target: &Id);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
/// Default [RouteTable], buckets keyed by log distance to the local id.
pub struct KademliaTable {
    k: usize,
    table: Mutex<Table>,
}

#[derive(Debug)]
struct Table {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl KademliaTable {
    /// Create a new [KademliaTable] with a given id and bucket size.
    pub fn new(id: Id, k: usize) -> Self {
        KademliaTable {
            k: k.max(1),
            table: Mutex::new(Table {
                id,
                buckets: BTreeMap::new(),
            }),
        }
    }

    // === Private Methods ===

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Table {
    fn add(&mut self, contact: Contact, k: usize) -> bool {
        let distance = self.id.log_distance(contact.id());

        if distance == 0 || contact.is_firewalled() {
            // Neither self, nor nodes that can't be reached.
            return false;
        }

        // A contact may change its id, but not share an address with another one.
        for bucket in self.buckets.values_mut() {
            bucket.entries.retain(|e| {
                e.contact.address() != contact.address() || e.contact.id() == contact.id()
            });
        }

        self.buckets.entry(distance).or_default().add(contact, k)
    }
}

impl RouteTable for KademliaTable {
    fn local_id(&self) -> Id {
        self.table().id
    }

    fn rebuild(&self, local_id: Id) {
        let mut table = self.table();

        let mut entries: Vec<ContactEntry> = std::mem::take(&mut table.buckets)
            .into_values()
            .flat_map(|bucket| bucket.entries)
            .collect();
        // Least recently seen first, so the most recent ones end up last in their buckets.
        entries.sort_by(|a, b| a.last_seen.cmp(&b.last_seen));

        table.id = local_id;
        for entry in entries {
            table.add(entry.contact, self.k);
        }
    }

    fn add(&self, contact: Contact) -> bool {
        self.table().add(contact, self.k)
    }

    fn remove(&self, id: &Id) {
        let mut table = self.table();
        let distance = table.id.log_distance(id);

        if let Some(bucket) = table.buckets.get_mut(&distance) {
            bucket.entries.retain(|e| e.contact.id() != id);
        }
    }

    fn handle_failure(&self, id: &Id) {
        let mut table = self.table();
        let distance = table.id.log_distance(id);

        if let Some(bucket) = table.buckets.get_mut(&distance) {
            if let Some(entry) = bucket.entries.iter_mut().find(|e| e.contact.id() == id) {
                entry.failures += 1;
            }

            bucket.entries.retain(|e| e.failures < MAX_CONTACT_FAILURES);
        }
    }

    fn closest(&self, target: &Id, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .table()
            .buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter().map(|e| e.contact.clone()))
            .collect();

        contacts.sort_by_key(|contact| target.distance(contact.id()));
        contacts.truncate(count);

        contacts
    }

    fn contacts(&self) -> Vec<Contact> {
        let mut entries: Vec<ContactEntry> = self
            .table()
            .buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter().cloned())
            .collect();

        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        entries.into_iter().map(|e| e.contact).collect()
    }

    fn refresh_ids(&self, all: bool) -> Vec<Id> {
        let table = self.table();

        table
            .buckets
            .iter()
            .filter(|(_, bucket)| !bucket.entries.is_empty())
            .filter(|(_, bucket)| {
                all || bucket
                    .last_refreshed
                    .map_or(true, |at| at.elapsed() >= BUCKET_REFRESH_INTERVAL)
            })
            .map(|(distance, _)| table.id.random_at_log_distance(*distance))
            .collect()
    }

    fn mark_refreshed(&self, target: &Id) {
        let mut table = self.table();
        let distance = table.id.log_distance(target);

        if let Some(bucket) = table.buckets.get_mut(&distance) {
            bucket.last_refreshed = Some(Instant::now());
        }
    }

    fn len(&self) -> usize {
        self.table()
            .buckets
            .values()
            .map(|bucket| bucket.entries.len())
            .sum()
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Default)]
struct KBucket {
    /// Sorted by the least recently seen.
    entries: Vec<ContactEntry>,
    last_refreshed: Option<Instant>,
}

impl KBucket {
    fn add(&mut self, incoming: Contact, k: usize) -> bool {
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.contact.id() == incoming.id())
        {
            // Seen again, move it to the end with a clean record.
            self.entries.remove(index);
            self.entries.push(ContactEntry::new(incoming));

            true
        } else if self.entries.len() < k {
            self.entries.push(ContactEntry::new(incoming));

            true
        } else if let Some(index) = self.entries.iter().position(|e| e.failures > 0) {
            // Replace an unresponsive contact.
            self.entries.remove(index);
            self.entries.push(ContactEntry::new(incoming));

            true
        } else {
            false
        }
    }
}
