//! Iterative FIND_NODE / FIND_VALUE lookup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{RecvTimeoutError, Sender};
use tracing::{debug, trace};

use super::LookupResult;
use crate::common::{Contact, Id, ValueType};
use crate::context::Context;
use crate::io::Reply;
use crate::messages::{
    FindNodeRequest, FindNodeResponse, FindValueRequest, FindValueResponse, Message, MessageBody,
    MessageId,
};
use crate::DhtError;

/// Extra time to wait for a reply after the request timeout, in case the
/// dispatcher's timer is late.
pub(crate) const REPLY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupKind {
    FindNode,
    /// Stops at the first node returning values.
    FindValue,
}

#[derive(Debug)]
pub(crate) struct LookupOutcome {
    pub(crate) result: LookupResult,
    /// The first node that answered with values, and its answer.
    pub(crate) values: Option<(Contact, FindValueResponse)>,
}

/// State of one lookup, driven to completion by [Lookup::run] on the calling thread.
///
/// Candidates and responders are ordered by their distance to the target.
/// Every contact is queried at most once, with at most `alpha` requests in flight.
pub(crate) struct Lookup<'a> {
    context: &'a Context,
    target: Id,
    count: usize,
    kind: LookupKind,
    started: Instant,
    /// Routing table content when the lookup started.
    known: HashSet<Id>,
    candidates: BTreeMap<Id, Contact>,
    queried: HashSet<Id>,
    responders: BTreeMap<Id, Contact>,
    tokens: HashMap<Id, Bytes>,
    in_flight: HashMap<MessageId, Contact>,
    failures: usize,
    /// Other nodes handed out with the local id.
    collisions: HashMap<SocketAddr, Contact>,
}

impl<'a> Lookup<'a> {
    pub(crate) fn new(context: &'a Context, target: Id, count: usize, kind: LookupKind) -> Self {
        let known = context
            .route_table()
            .contacts()
            .iter()
            .map(|contact| *contact.id())
            .collect();

        Self {
            context,
            target,
            count: count.max(1),
            kind,
            started: Instant::now(),
            known,
            candidates: BTreeMap::new(),
            queried: HashSet::new(),
            responders: BTreeMap::new(),
            tokens: HashMap::new(),
            in_flight: HashMap::new(),
            failures: 0,
            collisions: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self) -> Result<LookupOutcome, DhtError> {
        for contact in self.context.route_table().closest(&self.target, self.count) {
            self.add_candidate(contact);
        }

        if self.candidates.is_empty() {
            return Err(DhtError::NoContacts);
        }

        let (sender, replies) = flume::unbounded();
        let alpha = self.context.config().alpha.max(1);
        let patience = self.context.dispatcher().request_timeout() + REPLY_GRACE;

        loop {
            while self.in_flight.len() < alpha {
                let Some(contact) = self.next_candidate() else {
                    break;
                };

                self.query(contact, &sender);
            }

            if self.in_flight.is_empty() {
                break;
            }

            match replies.recv_timeout(patience) {
                Ok(reply) => {
                    if let Some(values) = self.handle_reply(reply) {
                        return Ok(self.finish(Some(values)));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    for (_, contact) in std::mem::take(&mut self.in_flight) {
                        self.fail(&contact);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DhtError::Shutdown),
            }
        }

        Ok(self.finish(None))
    }

    // === Private Methods ===

    fn add_candidate(&mut self, contact: Contact) {
        let id = *contact.id();

        if id == self.context.local_id() {
            if contact.address() != self.context.local_address() && !contact.is_firewalled() {
                self.collisions.insert(contact.address(), contact);
            }

            return;
        }

        if contact.is_firewalled() || self.queried.contains(&id) {
            return;
        }

        self.candidates
            .entry(id.distance(&self.target))
            .or_insert(contact);
    }

    /// Closest unqueried candidate, `None` once `count` nodes closer than it answered.
    fn next_candidate(&mut self) -> Option<Contact> {
        let (distance, _) = self.candidates.first_key_value()?;

        if let Some(furthest) = self.responders.keys().nth(self.count - 1) {
            if distance >= furthest {
                return None;
            }
        }

        self.candidates.pop_first().map(|(_, contact)| contact)
    }

    fn query(&mut self, contact: Contact, sender: &Sender<Reply>) {
        self.queried.insert(*contact.id());

        let body = match self.kind {
            LookupKind::FindNode => MessageBody::FindNodeRequest(FindNodeRequest {
                lookup_id: self.target,
            }),
            LookupKind::FindValue => MessageBody::FindValueRequest(FindValueRequest {
                key: self.target,
                secondary_keys: Vec::new(),
                value_type: ValueType::ANY,
            }),
        };

        let request = Message::request(self.context.local_contact(), body);

        match self
            .context
            .dispatcher()
            .send_request(contact.address(), &request, sender.clone())
        {
            Ok(id) => {
                self.in_flight.insert(id, contact);
            }
            Err(error) => {
                debug!(?error, to = ?contact.address(), "Lookup request not sent");
                self.fail(&contact);
            }
        }
    }

    fn handle_reply(&mut self, reply: Reply) -> Option<(Contact, FindValueResponse)> {
        let contact = self.in_flight.remove(&reply.id)?;

        let message = match reply.result {
            Ok(message) => message,
            Err(error) => {
                trace!(?error, target = %self.target, "Lookup request failed");
                self.fail(&contact);

                return None;
            }
        };

        if message.sender().id() != contact.id() {
            debug!(
                expected = %contact.id(),
                got = %message.sender().id(),
                address = ?contact.address(),
                "Node changed its id"
            );
            self.fail(&contact);

            return None;
        }

        let responder = message.sender().clone().with_address(contact.address());

        match message.into_body() {
            MessageBody::FindNodeResponse(FindNodeResponse { token, contacts }) => {
                self.tokens.insert(*responder.id(), token);
                self.add_responder(responder);

                for contact in contacts {
                    self.add_candidate(contact);
                }
            }
            MessageBody::FindValueResponse(response) if self.kind == LookupKind::FindValue => {
                self.add_responder(responder.clone());

                return Some((responder, response));
            }
            other => {
                debug!(opcode = ?other.opcode(), from = ?contact.address(), "Unexpected lookup response");
                self.fail(&contact);
            }
        }

        None
    }

    fn add_responder(&mut self, responder: Contact) {
        self.responders
            .insert(responder.id().distance(&self.target), responder);
    }

    fn fail(&mut self, contact: &Contact) {
        self.failures += 1;
        self.context.route_table().handle_failure(contact.id());
    }

    fn finish(self, values: Option<(Contact, FindValueResponse)>) -> LookupOutcome {
        self.context.route_table().mark_refreshed(&self.target);

        let path: Vec<Contact> = self
            .responders
            .into_values()
            .take(self.count)
            .collect();

        let found_new_nodes = path.iter().any(|contact| !self.known.contains(contact.id()));

        let mut tokens = self.tokens;
        tokens.retain(|id, _| path.iter().any(|contact| contact.id() == id));

        let elapsed = self.started.elapsed();

        debug!(
            target = %self.target,
            kind = ?self.kind,
            responders = path.len(),
            queried = self.queried.len(),
            failures = self.failures,
            collisions = self.collisions.len(),
            ?elapsed,
            "Lookup done"
        );

        LookupOutcome {
            result: LookupResult {
                lookup_id: self.target,
                path,
                tokens,
                failures: self.failures,
                elapsed,
                collisions: self.collisions.into_values().collect(),
                found_new_nodes,
            },
            values,
        }
    }
}
