//! All entities stored under one primary key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{Id, ValueEntity};

/// Requests closer together than this are treated as this far apart.
const MIN_REQUEST_INTERVAL: f32 = 0.01;

#[derive(Debug)]
pub(crate) struct Stored {
    /// Insertion order within the bag, lower is older.
    pub(crate) seq: u64,
    pub(crate) entity: ValueEntity,
}

#[derive(Debug, Default)]
/// Entities keyed by secondary key, plus the request load of this primary key.
pub(crate) struct ValueBag {
    entities: HashMap<Id, Stored>,
    next_seq: u64,
    request_load: f32,
    last_request: Option<Instant>,
}

impl ValueBag {
    // === Getters ===

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, secondary_key: &Id) -> Option<&ValueEntity> {
        self.entities.get(secondary_key).map(|s| &s.entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &ValueEntity> {
        self.entities.values().map(|s| &s.entity)
    }

    pub fn request_load(&self) -> f32 {
        self.request_load
    }

    // === Public Methods ===

    /// Inserts or replaces the entity, returning the replaced one.
    pub fn insert(&mut self, entity: ValueEntity) -> Option<ValueEntity> {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entities
            .insert(*entity.secondary_key(), Stored { seq, entity })
            .map(|s| s.entity)
    }

    pub fn remove(&mut self, secondary_key: &Id) -> Option<ValueEntity> {
        self.entities.remove(secondary_key).map(|s| s.entity)
    }

    /// The secondary key of the oldest entity whose creator is firewalled.
    ///
    /// Locally created entities are never candidates.
    pub fn oldest_firewalled(&self) -> Option<Id> {
        self.entities
            .iter()
            .filter(|(_, s)| s.entity.creator().is_firewalled() && !s.entity.is_local())
            .min_by_key(|(_, s)| s.seq)
            .map(|(key, _)| *key)
    }

    /// Registers a request at `now` and returns the updated load.
    ///
    /// The load is an exponentially smoothed rate of requests per second.
    /// The first request returns 0, and so does any request arriving more than
    /// `nulling_delay` after the previous one.
    pub fn increment_request_load(
        &mut self,
        now: Instant,
        smoothing_factor: f32,
        nulling_delay: Duration,
    ) -> f32 {
        let Some(last) = self.last_request.replace(now) else {
            return 0.0;
        };

        let delay = now.saturating_duration_since(last);
        if delay >= nulling_delay {
            self.request_load = 0.0;
            return 0.0;
        }

        let delay = delay.as_secs_f32().max(MIN_REQUEST_INTERVAL);

        self.request_load =
            (smoothing_factor * (1.0 / delay) + (1.0 - smoothing_factor) * self.request_load)
                .max(0.0);

        self.request_load
    }

    #[cfg(test)]
    pub(crate) fn set_last_request(&mut self, instant: Instant) {
        self.last_request = Some(instant);
    }
}
