//! Default handlers, talking to other nodes through the [crate::io::Dispatcher].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use super::lookup::{Lookup, LookupKind, REPLY_GRACE};
use super::{HandlerFactory, LookupResult, PingResult, ResponseHandler, StoreResult, ValueResult};
use crate::common::{Contact, Id, ValueEntity};
use crate::context::Context;
use crate::messages::{Message, MessageBody, StoreRequest, StoreStatusCode};
use crate::DhtError;

#[derive(Debug, Default, Clone, Copy)]
/// [HandlerFactory] running every operation over the network.
pub struct NetworkHandlers;

impl HandlerFactory for NetworkHandlers {
    fn ping(
        &self,
        context: &Arc<Context>,
        to: SocketAddr,
        sender: Contact,
    ) -> Box<dyn ResponseHandler<PingResult>> {
        let context = context.clone();

        Box::new(move || ping(&context, to, sender))
    }

    fn lookup(
        &self,
        context: &Arc<Context>,
        lookup_id: Id,
        count: usize,
    ) -> Box<dyn ResponseHandler<LookupResult>> {
        let context = context.clone();

        Box::new(move || {
            Lookup::new(&context, lookup_id, count, LookupKind::FindNode)
                .run()
                .map(|outcome| outcome.result)
        })
    }

    fn find_value(&self, context: &Arc<Context>, key: Id) -> Box<dyn ResponseHandler<ValueResult>> {
        let context = context.clone();

        Box::new(move || find_value(&context, key))
    }

    fn store(
        &self,
        context: &Arc<Context>,
        entity: ValueEntity,
    ) -> Box<dyn ResponseHandler<StoreResult>> {
        let context = context.clone();

        Box::new(move || store(&context, entity))
    }
}

fn ping(context: &Context, to: SocketAddr, sender: Contact) -> Result<PingResult, DhtError> {
    let (replies_tx, replies) = flume::bounded(1);
    let request = Message::request(sender, MessageBody::PingRequest);

    context.dispatcher().send_request(to, &request, replies_tx)?;

    let patience = context.dispatcher().request_timeout() + REPLY_GRACE;
    let reply = replies
        .recv_timeout(patience)
        .map_err(|_| DhtError::Timeout {
            operation: "ping",
            address: to,
            elapsed: patience,
        })?;

    let message = reply.result?;

    match message.body() {
        MessageBody::PingResponse(response) => {
            context
                .size_estimator()
                .add_estimated_remote_size(response.estimated_size.into());

            Ok(PingResult {
                contact: message.sender().clone().with_address(to),
                external_address: response.external_address,
                estimated_size: response.estimated_size,
                round_trip: reply.round_trip,
            })
        }
        other => Err(DhtError::UnexpectedResponse {
            address: to,
            reason: format!("expected a ping response, got {:?}", other.opcode()),
        }),
    }
}

fn find_value(context: &Context, key: Id) -> Result<ValueResult, DhtError> {
    let outcome = Lookup::new(context, key, context.config().k, LookupKind::FindValue).run()?;

    let (entities, request_load) = match outcome.values {
        Some((from, response)) => {
            trace!(%key, from = ?from.address(), count = response.entities.len(), "Found values");
            (response.entities, response.request_load)
        }
        None => (Vec::new(), 0.0),
    };

    Ok(ValueResult {
        key,
        entities,
        request_load,
        path: outcome.result.path,
        elapsed: outcome.result.elapsed,
    })
}

/// Looks up the closest nodes, then sends them the entity along with their tokens.
fn store(context: &Context, entity: ValueEntity) -> Result<StoreResult, DhtError> {
    let primary_key = *entity.primary_key();
    let secondary_key = *entity.secondary_key();

    let LookupResult { path, tokens, .. } =
        Lookup::new(context, primary_key, context.config().k, LookupKind::FindNode)
            .run()?
            .result;

    let request_load = context.database().request_load(&primary_key, false);
    let (replies_tx, replies) = flume::unbounded();

    let mut pending = HashMap::new();
    let mut locations = Vec::new();
    let mut failures = Vec::new();

    for contact in path {
        let Some(token) = tokens.get(contact.id()) else {
            failures.push(contact);
            continue;
        };

        let request = Message::request(
            context.local_contact(),
            MessageBody::StoreRequest(StoreRequest {
                token: token.clone(),
                request_load,
                entities: vec![entity.clone()],
            }),
        );

        match context
            .dispatcher()
            .send_request(contact.address(), &request, replies_tx.clone())
        {
            Ok(id) => {
                pending.insert(id, contact);
            }
            Err(error) => {
                debug!(?error, to = ?contact.address(), "Store request not sent");
                failures.push(contact);
            }
        }
    }

    let patience = context.dispatcher().request_timeout() + REPLY_GRACE;

    while !pending.is_empty() {
        let Ok(reply) = replies.recv_timeout(patience) else {
            failures.extend(pending.drain().map(|(_, contact)| contact));
            break;
        };

        let Some(contact) = pending.remove(&reply.id) else {
            continue;
        };

        let stored = match reply.result {
            Ok(message) => match message.body() {
                MessageBody::StoreResponse(response) => response.statuses.iter().any(|status| {
                    status.primary_key == primary_key
                        && status.secondary_key == secondary_key
                        && status.code == StoreStatusCode::Succeeded
                }),
                _ => false,
            },
            Err(_) => false,
        };

        if stored {
            locations.push(contact);
        } else {
            failures.push(contact);
        }
    }

    debug!(
        %primary_key,
        stored = locations.len(),
        failed = failures.len(),
        "Store done"
    );

    Ok(StoreResult {
        entity,
        locations,
        failures,
    })
}
