//! Counters describing the traffic of a node, and network size estimation.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::common::{Contact, Id};
use crate::routing::MAX_BUCKET_SIZE_K;

/// Remote estimates averaged into [SizeEstimator::size], older ones are dropped.
pub const MAX_REMOTE_SIZES: usize = 10;
/// Age after which the local estimate is recomputed.
pub const LOCAL_ESTIMATE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
/// Sent, succeeded and failed requests of one kind.
pub struct RequestCounters {
    sent: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
}

impl RequestCounters {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn ok(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Display for RequestCounters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} ok={} failed={}",
            self.sent(),
            self.ok(),
            self.failed()
        )
    }
}

#[derive(Debug, Default)]
/// Network statistics of a node, shared by every component.
pub struct NetworkStatistics {
    pub pings: RequestCounters,
    pub lookups: RequestCounters,
    pub find_values: RequestCounters,
    pub stores: RequestCounters,
    pub bootstrap_ping_failures: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub filtered_messages: AtomicU64,
    /// Responses matching no outstanding request.
    pub late_responses: AtomicU64,
    pub timeouts: AtomicU64,
}

impl NetworkStatistics {
    pub(crate) fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl Display for NetworkStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "pings: {}", self.pings)?;
        writeln!(f, "lookups: {}", self.lookups)?;
        writeln!(f, "find values: {}", self.find_values)?;
        writeln!(f, "stores: {}", self.stores)?;
        writeln!(
            f,
            "bootstrap ping failures: {}",
            Self::get(&self.bootstrap_ping_failures)
        )?;
        writeln!(
            f,
            "messages: sent={} received={} malformed={} filtered={} late={}",
            Self::get(&self.messages_sent),
            Self::get(&self.messages_received),
            Self::get(&self.malformed_messages),
            Self::get(&self.filtered_messages),
            Self::get(&self.late_responses),
        )?;
        write!(f, "timeouts: {}", Self::get(&self.timeouts))
    }
}

#[derive(Debug, Default)]
/// Estimates how many nodes the network has.
///
/// The local estimate measures how densely the contacts closest to the local
/// id fill the key space. Estimates reported by other nodes in their ping
/// responses are averaged in.
pub struct SizeEstimator {
    estimates: Mutex<Estimates>,
}

#[derive(Debug, Default)]
struct Estimates {
    local: Option<(u64, Instant)>,
    remote: VecDeque<u64>,
}

impl SizeEstimator {
    // === Getters ===

    /// The average of the local estimate and the recent remote ones, at least 1.
    pub fn size(&self) -> u64 {
        let estimates = self.estimates();

        let local = estimates.local.map_or(1, |(size, _)| size);
        let count = estimates.remote.len() as u64 + 1;
        let sum = estimates
            .remote
            .iter()
            .fold(local, |sum, size| sum.saturating_add(*size));

        (sum / count).max(1)
    }

    /// Returns `true` if the local estimate is missing or older than [LOCAL_ESTIMATE_INTERVAL].
    pub fn is_stale(&self) -> bool {
        self.estimates()
            .local
            .map_or(true, |(_, at)| at.elapsed() >= LOCAL_ESTIMATE_INTERVAL)
    }

    // === Public Methods ===

    /// Averages in the estimate of another node, zero is ignored.
    pub fn add_estimated_remote_size(&self, size: u64) {
        if size == 0 {
            return;
        }

        let mut estimates = self.estimates();

        estimates.remote.push_back(size);
        while estimates.remote.len() > MAX_REMOTE_SIZES {
            estimates.remote.pop_front();
        }
    }

    /// Recomputes the local estimate from the contacts closest to `local_id`,
    /// and returns it.
    pub fn update_estimated_size(&self, local_id: &Id, contacts: &[Contact]) -> u64 {
        let size = estimate(local_id, contacts);
        self.estimates().local = Some((size, Instant::now()));

        size
    }

    /// Forgets the local estimate, remote ones are kept.
    pub fn reset_local(&self) {
        self.estimates().local = None;
    }

    // === Private Methods ===

    fn estimates(&self) -> MutexGuard<'_, Estimates> {
        self.estimates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Network size as seen from `target`, counting the node at `target`.
///
/// The `i`th closest contact at distance `d_i` suggests `i * d_max / d_i`
/// nodes, the estimate averages that over the [MAX_BUCKET_SIZE_K] closest ones.
pub fn estimate(target: &Id, contacts: &[Contact]) -> u64 {
    let mut distances: Vec<Id> = contacts
        .iter()
        .map(|contact| target.distance(contact.id()))
        .filter(|distance| !distance.is_zero())
        .collect();

    distances.sort();
    distances.dedup();
    distances.truncate(MAX_BUCKET_SIZE_K);

    if distances.is_empty() {
        return 1;
    }

    let sum = distances
        .iter()
        .enumerate()
        .fold(0u128, |sum, (i, distance)| {
            // The upper 128 bits, rounded up.
            let mut high = [0u8; 16];
            high.copy_from_slice(&distance.as_bytes()[..16]);
            let distance = u128::from_be_bytes(high).saturating_add(1);

            let count = i as u128 + 1;
            sum.saturating_add((u128::MAX / distance).saturating_mul(count))
        });

    let size = sum / distances.len() as u128;

    u64::try_from(size).unwrap_or(u64::MAX).saturating_add(1)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::net::SocketAddr;

    use super::*;

    fn contact(id: Id) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 4000)))
    }

    /// Estimate of a node in a network of `size` random nodes.
    fn simulate(size: usize) -> u64 {
        let ids: BTreeSet<Id> = (0..size).map(|_| Id::random()).collect();
        let local = Id::random();

        let mut closest: Vec<Contact> = ids.iter().copied().map(contact).collect();
        closest.sort_by_key(|contact| local.distance(contact.id()));
        closest.truncate(MAX_BUCKET_SIZE_K);

        estimate(&local, &closest)
    }

    #[test]
    fn alone() {
        assert_eq!(estimate(&Id::random(), &[]), 1);

        let local = Id::random();
        assert_eq!(estimate(&local, &[contact(local)]), 1);
    }

    #[test]
    fn local_estimate_is_close() {
        let acceptable_margin = 0.6;

        for size in [500, 5_000, 50_000] {
            let mut estimates: Vec<u64> = (0..11).map(|_| simulate(size)).collect();
            estimates.sort();
            let estimate = estimates[estimates.len() / 2] as f64;

            let margin = (estimate - size as f64).abs() / size as f64;
            assert!(margin <= acceptable_margin, "{size} estimated as {estimate}");
        }
    }

    #[test]
    fn remote_sizes_are_averaged_in() {
        let estimator = SizeEstimator::default();
        assert!(estimator.is_stale());
        assert_eq!(estimator.size(), 1);

        let local = Id::random();
        let far = contact(local.invert());
        // The inverted id is the furthest, one other node at most
        assert_eq!(estimator.update_estimated_size(&local, &[far]), 2);
        assert!(!estimator.is_stale());

        estimator.add_estimated_remote_size(0);
        assert_eq!(estimator.size(), 2);

        estimator.add_estimated_remote_size(100);
        assert_eq!(estimator.size(), 51);

        estimator.reset_local();
        assert!(estimator.is_stale());
        assert_eq!(estimator.size(), 50);
    }

    #[test]
    fn old_remote_sizes_are_dropped() {
        let estimator = SizeEstimator::default();

        estimator.add_estimated_remote_size(1_000_000);
        for _ in 0..MAX_REMOTE_SIZES {
            estimator.add_estimated_remote_size(10);
        }

        // (1 + 10 * 10) / 11
        assert_eq!(estimator.size(), 9);
    }
}
