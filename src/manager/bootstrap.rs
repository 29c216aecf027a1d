//! Joining the network: first contact, self lookup and id collision check,
//! then bucket refresh.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{LookupManager, PingManager};
use crate::common::{Contact, Id};
use crate::concurrent::OnComplete;
use crate::context::Context;
use crate::handler::{LookupResult, PingResult};
use crate::statistics::NetworkStatistics;
use crate::DhtError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Looking for a first node that answers a ping.
    PhaseZero,
    /// Looking up our own id.
    PhaseOne,
    /// Refreshing buckets.
    PhaseTwo,
    Terminal,
}

/// Hears about the progress of a bootstrap.
///
/// Callbacks run on executor threads, or on the thread calling
/// [Bootstrapper::bootstrap] when nothing could be done asynchronously.
pub trait BootstrapListener: Send + Sync {
    /// The self lookup finished, successful or not.
    fn phase_one_complete(&self, _elapsed: Duration) {}

    /// Bootstrapping is over, after [Self::phase_one_complete].
    fn phase_two_complete(&self, _found_new_nodes: bool, _elapsed: Duration) {}

    /// No node answered, bootstrapping is over.
    fn no_bootstrap_host(&self, _failed_hosts: Vec<SocketAddr>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// [BootstrapListener] callbacks as values, for channels.
pub enum BootstrapEvent {
    PhaseOneComplete(Duration),
    PhaseTwoComplete {
        found_new_nodes: bool,
        elapsed: Duration,
    },
    NoBootstrapHost(Vec<SocketAddr>),
}

impl BootstrapListener for flume::Sender<BootstrapEvent> {
    fn phase_one_complete(&self, elapsed: Duration) {
        let _ = self.send(BootstrapEvent::PhaseOneComplete(elapsed));
    }

    fn phase_two_complete(&self, found_new_nodes: bool, elapsed: Duration) {
        let _ = self.send(BootstrapEvent::PhaseTwoComplete {
            found_new_nodes,
            elapsed,
        });
    }

    fn no_bootstrap_host(&self, failed_hosts: Vec<SocketAddr>) {
        let _ = self.send(BootstrapEvent::NoBootstrapHost(failed_hosts));
    }
}

#[derive(Debug, Default)]
struct State {
    /// Incremented by every bootstrap, callbacks of older ones are ignored.
    generation: u64,
    phase: Option<BootstrapPhase>,
    started: Option<Instant>,
    bootstrapping: bool,
    bootstrapped: bool,
    candidates: VecDeque<SocketAddr>,
    /// Whether the routing table contacts were added to the candidates.
    fell_back: bool,
    failures: usize,
    failed_hosts: Vec<SocketAddr>,
    pending: HashSet<Id>,
    found_new_nodes: bool,
    /// Collision pings still running.
    collision_pings: usize,
    collided: bool,
    /// Held while the collisions it found are checked.
    self_lookup: Option<LookupResult>,
}

impl State {
    fn elapsed(&self) -> Duration {
        self.started
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }
}

struct Shared {
    context: Arc<Context>,
    ping: Arc<PingManager>,
    lookup: Arc<LookupManager>,
    refresh_all_buckets: bool,
    state: Mutex<State>,
}

/// One running bootstrap, as seen by the callbacks of its futures.
#[derive(Clone)]
struct Attempt {
    shared: Arc<Shared>,
    generation: u64,
    listener: Arc<dyn BootstrapListener>,
}

#[derive(Clone)]
/// Drives bootstraps through [BootstrapPhase]s.
///
/// Phases only move forward. Starting a new bootstrap abandons the running one,
/// its listener hears nothing more.
pub struct Bootstrapper {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("phase", &self.phase())
            .finish()
    }
}

impl Bootstrapper {
    pub fn new(context: Arc<Context>, ping: Arc<PingManager>, lookup: Arc<LookupManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                refresh_all_buckets: context.config().refresh_all_buckets,
                context,
                ping,
                lookup,
                state: Mutex::new(State::default()),
            }),
        }
    }

    // === Getters ===

    /// `None` until the first bootstrap starts.
    pub fn phase(&self) -> Option<BootstrapPhase> {
        self.shared.state().phase
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.shared.state().bootstrapping
    }

    /// Returns `true` once a bootstrap reached its self lookup successfully.
    pub fn is_bootstrapped(&self) -> bool {
        self.shared.state().bootstrapped
    }

    /// Time since the last bootstrap started, `None` if none did.
    pub fn time(&self) -> Option<Duration> {
        self.shared.state().started.map(|started| started.elapsed())
    }

    // === Public Methods ===

    /// Starts bootstrapping from `hosts`, tried in order, then from the
    /// routing table's contacts, most recently seen first.
    pub fn bootstrap(&self, hosts: Vec<SocketAddr>, listener: Arc<dyn BootstrapListener>) {
        let local_address = self.shared.context.local_address();

        let generation = {
            let mut state = self.shared.state();
            let generation = state.generation + 1;
            let bootstrapped = state.bootstrapped;

            *state = State {
                generation,
                phase: Some(BootstrapPhase::PhaseZero),
                started: Some(Instant::now()),
                bootstrapping: true,
                bootstrapped,
                candidates: hosts
                    .into_iter()
                    .filter(|host| *host != local_address)
                    .collect(),
                ..State::default()
            };

            generation
        };

        info!(generation, "Bootstrapping");

        Attempt {
            shared: self.shared.clone(),
            generation,
            listener,
        }
        .ping_next();
    }

    /// Abandons the running bootstrap, if any.
    pub fn cancel(&self) {
        let mut state = self.shared.state();

        if state.bootstrapping {
            state.generation += 1;
            state.bootstrapping = false;
            state.phase = Some(BootstrapPhase::Terminal);

            debug!("Bootstrap cancelled");
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Attempt {
    /// Locks the state, `None` if a newer bootstrap took over.
    fn state(&self) -> Option<MutexGuard<'_, State>> {
        let state = self.shared.state();

        (state.generation == self.generation).then_some(state)
    }

    // === Phase zero ===

    fn ping_next(&self) {
        let fall_back = {
            let Some(state) = self.state() else {
                return;
            };

            state.candidates.is_empty() && !state.fell_back
        };

        let known = fall_back.then(|| self.shared.context.route_table().contacts());

        let address = {
            let Some(mut state) = self.state() else {
                return;
            };

            if let Some(known) = known {
                if !state.fell_back {
                    state.fell_back = true;

                    let addresses: Vec<_> = known
                        .iter()
                        .map(|contact| contact.address())
                        .filter(|address| !state.failed_hosts.contains(address))
                        .collect();
                    state.candidates.extend(addresses);
                }
            }

            if state.failures >= self.shared.context.config().max_bootstrap_failures {
                debug!(failures = state.failures, "Too many failed bootstrap pings");
                None
            } else {
                state.candidates.pop_front()
            }
        };

        let Some(address) = address else {
            self.no_bootstrap_host();
            return;
        };

        let attempt = self.clone();
        self.shared
            .ping
            .ping(address)
            .add_listener(OnComplete::new(move |result: Result<PingResult, DhtError>| {
                match result {
                    Ok(pong) => attempt.phase_one(pong),
                    Err(error) => attempt.ping_failed(address, error),
                }
            }));
    }

    fn ping_failed(&self, address: SocketAddr, error: DhtError) {
        {
            let Some(mut state) = self.state() else {
                return;
            };

            state.failures += 1;
            state.failed_hosts.push(address);
        }

        NetworkStatistics::increment(&self.shared.context.statistics().bootstrap_ping_failures);
        debug!(?address, ?error, "Bootstrap ping failed");

        self.ping_next();
    }

    fn no_bootstrap_host(&self) {
        let failed_hosts = {
            let Some(mut state) = self.state() else {
                return;
            };

            state.phase = Some(BootstrapPhase::Terminal);
            state.bootstrapping = false;

            std::mem::take(&mut state.failed_hosts)
        };

        info!(failed = failed_hosts.len(), "No bootstrap host");
        self.listener.no_bootstrap_host(failed_hosts);
    }

    // === Phase one ===

    fn phase_one(&self, pong: PingResult) {
        {
            let Some(mut state) = self.state() else {
                return;
            };

            if state.phase != Some(BootstrapPhase::PhaseZero) {
                return;
            }
            state.phase = Some(BootstrapPhase::PhaseOne);
        }

        debug!(contact = ?pong.contact, "Found a bootstrap host");

        self.find_nearest();
    }

    /// Looks up the local id.
    fn find_nearest(&self) {
        let local_id = self.shared.context.local_id();
        let attempt = self.clone();

        self.shared
            .lookup
            .lookup(local_id)
            .add_listener(OnComplete::new(move |result: Result<LookupResult, DhtError>| {
                attempt.self_lookup_complete(result)
            }));
    }

    fn self_lookup_complete(&self, result: Result<LookupResult, DhtError>) {
        match result {
            Ok(lookup) if !lookup.collisions.is_empty() => self.check_collisions(lookup),
            result => self.phase_one_complete(result),
        }
    }

    /// Pings every node handed out with our id, pretending to be someone else.
    ///
    /// If any of them answers, the id is taken: the local id changes and the
    /// self lookup starts over.
    fn check_collisions(&self, lookup: LookupResult) {
        let local = self.shared.context.local_contact();
        let sender = Contact::collision_ping_sender(&local);
        let collisions = lookup.collisions.clone();

        {
            let Some(mut state) = self.state() else {
                return;
            };

            state.collision_pings = collisions.len();
            state.collided = false;
            state.self_lookup = Some(lookup);
        }

        warn!(id = %local.id(), count = collisions.len(), "Nodes handed out with our id");

        for contact in collisions {
            let attempt = self.clone();
            let local_id = *local.id();

            match self.shared.ping.collision_ping(&contact, sender.clone()) {
                Ok(future) => {
                    future.add_listener(OnComplete::new(move |result: Result<PingResult, DhtError>| {
                        let collides = matches!(&result, Ok(pong) if *pong.contact.id() == local_id);
                        attempt.collision_checked(collides)
                    }))
                }
                Err(error) => {
                    debug!(?error, address = ?contact.address(), "Collision ping not sent");
                    self.collision_checked(false)
                }
            }
        }
    }

    fn collision_checked(&self, collides: bool) {
        let lookup = {
            let Some(mut state) = self.state() else {
                return;
            };

            state.collided |= collides;
            state.collision_pings = state.collision_pings.saturating_sub(1);

            if state.collision_pings > 0 {
                return;
            }

            if state.collided {
                state.self_lookup = None;
                None
            } else {
                state.self_lookup.take()
            }
        };

        match lookup {
            Some(lookup) => {
                debug!("Nobody answered the collision pings, keeping our id");
                self.phase_one_complete(Ok(lookup))
            }
            None => {
                let id = self.shared.context.change_local_id();
                warn!(%id, "Our id is taken, starting over with a new one");

                self.find_nearest()
            }
        }
    }

    fn phase_one_complete(&self, result: Result<LookupResult, DhtError>) {
        let elapsed = {
            let Some(state) = self.state() else {
                return;
            };

            state.elapsed()
        };

        info!(?elapsed, "Bootstrap phase one complete");
        self.listener.phase_one_complete(elapsed);

        match result {
            Ok(lookup) if !lookup.is_empty() => self.phase_two(),
            Ok(_) => {
                debug!("Nobody answered the self lookup");
                self.finish(false)
            }
            Err(error) => {
                debug!(?error, "Self lookup failed");
                self.finish(false)
            }
        }
    }

    // === Phase two ===

    fn phase_two(&self) {
        let ids: HashSet<Id> = self
            .shared
            .context
            .route_table()
            .refresh_ids(self.shared.refresh_all_buckets)
            .into_iter()
            .collect();

        {
            let Some(mut state) = self.state() else {
                return;
            };

            state.phase = Some(BootstrapPhase::PhaseTwo);
            state.bootstrapped = true;
            state.pending = ids.clone();
        }

        if ids.is_empty() {
            self.finish(false);
            return;
        }

        debug!(buckets = ids.len(), "Refreshing buckets");

        for id in ids {
            let attempt = self.clone();

            self.shared
                .lookup
                .lookup(id)
                .add_listener(OnComplete::new(move |result: Result<LookupResult, DhtError>| {
                    attempt.refreshed(id, result)
                }));
        }
    }

    fn refreshed(&self, id: Id, result: Result<LookupResult, DhtError>) {
        let found_new_nodes = {
            let Some(mut state) = self.state() else {
                return;
            };

            if !state.pending.remove(&id) {
                warn!(%id, "Bucket refresh completed twice");
                return;
            }

            if let Ok(lookup) = &result {
                state.found_new_nodes |= lookup.found_new_nodes();
            }

            if !state.pending.is_empty() {
                return;
            }

            state.found_new_nodes
        };

        self.finish(found_new_nodes);
    }

    fn finish(&self, found_new_nodes: bool) {
        let elapsed = {
            let Some(mut state) = self.state() else {
                return;
            };

            state.phase = Some(BootstrapPhase::Terminal);
            state.bootstrapping = false;

            state.elapsed()
        };

        info!(found_new_nodes, ?elapsed, "Bootstrap complete");
        self.listener.phase_two_complete(found_new_nodes, elapsed);
    }
}
