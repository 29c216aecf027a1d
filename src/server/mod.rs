//! Answers requests from other nodes.

pub mod tokens;

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, trace};

use crate::common::Contact;
use crate::context::Context;
use crate::messages::{
    FindNodeRequest, FindNodeResponse, FindValueRequest, FindValueResponse, Message,
    MessageBody, MessageId, PingResponse, StatsKind, StatsResponse, StoreRequest, StoreResponse,
    StoreStatus, StoreStatusCode,
};
use crate::routing::RouteTable;

use tokens::Tokens;

/// Most entities a single find-value response carries.
pub const MAX_VALUES_PER_RESPONSE: usize = u8::MAX as usize;
/// Longer statistics texts are cut.
pub const MAX_STATS_LEN: usize = 60_000;

#[derive(Debug)]
/// Default request handling: routing table for node lookups,
/// [crate::ValueStore] for values.
pub struct Server {
    tokens: Mutex<Tokens>,
    /// Recent responses by requester and request id.
    responses: Mutex<LruCache<(SocketAddr, MessageId), Arc<Message>>>,
}

impl Server {
    pub fn new(response_cache_size: usize) -> Self {
        Self {
            tokens: Mutex::new(Tokens::new()),
            responses: Mutex::new(LruCache::new(
                NonZeroUsize::new(response_cache_size).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    // === Public Methods ===

    /// Returns the response to send back, `None` for anything that is not a request.
    ///
    /// A retransmitted request gets the very same response instance again,
    /// so its encoding is reused.
    pub fn handle_request(
        &self,
        context: &Context,
        from: SocketAddr,
        request: &Message,
    ) -> Option<Arc<Message>> {
        if !request.is_request() {
            return None;
        }

        let cache_key = (from, request.id());

        if let Some(cached) = self.responses().get(&cache_key) {
            trace!(?from, id = ?request.id(), "Answering retransmitted request");
            return Some(cached.clone());
        }

        let body = match request.body() {
            MessageBody::PingRequest => MessageBody::PingResponse(PingResponse {
                external_address: from,
                estimated_size: u32::try_from(context.estimated_size()).unwrap_or(u32::MAX),
            }),
            MessageBody::FindNodeRequest(FindNodeRequest { lookup_id }) => {
                self.find_node_response(context, from, lookup_id)
            }
            MessageBody::FindValueRequest(find) => self.find_value_response(context, from, find),
            MessageBody::StoreRequest(store) => {
                self.store_response(context, from, request.sender(), store)
            }
            MessageBody::StatsRequest(kind) => MessageBody::StatsResponse(StatsResponse {
                statistics: stats(context, *kind),
            }),
            _ => return None,
        };

        let response = Arc::new(Message::response(
            request,
            context.local_contact(),
            body,
        ));

        self.responses().put(cache_key, response.clone());

        Some(response)
    }

    // === Private Methods ===

    fn find_node_response(
        &self,
        context: &Context,
        from: SocketAddr,
        lookup_id: &crate::Id,
    ) -> MessageBody {
        MessageBody::FindNodeResponse(FindNodeResponse {
            token: Bytes::copy_from_slice(&self.tokens().generate_token(from)),
            contacts: context
                .route_table()
                .closest(lookup_id, context.config().k),
        })
    }

    fn find_value_response(
        &self,
        context: &Context,
        from: SocketAddr,
        request: &FindValueRequest,
    ) -> MessageBody {
        let database = context.database();

        let entities: Vec<_> = database
            .get(&request.key)
            .into_values()
            .filter(|entity| request.value_type.matches(&entity.value().value_type))
            .filter(|entity| {
                request.secondary_keys.is_empty()
                    || request.secondary_keys.contains(entity.secondary_key())
            })
            .take(MAX_VALUES_PER_RESPONSE)
            .collect();

        if entities.is_empty() {
            return self.find_node_response(context, from, &request.key);
        }

        MessageBody::FindValueResponse(FindValueResponse {
            request_load: database.request_load(&request.key, true),
            entities,
        })
    }

    fn store_response(
        &self,
        context: &Context,
        from: SocketAddr,
        sender: &Contact,
        request: &StoreRequest,
    ) -> MessageBody {
        let valid_token = {
            let mut tokens = self.tokens();
            if tokens.should_update() {
                tokens.rotate();
            }

            tokens.validate(from, &request.token)
        };

        if !valid_token {
            debug!(?from, sender = ?sender.id(), "Store request with an invalid token");
        }

        let statuses = request
            .entities
            .iter()
            .map(|entity| {
                let stored = valid_token && context.database().store(entity.clone());

                StoreStatus {
                    primary_key: *entity.primary_key(),
                    secondary_key: *entity.secondary_key(),
                    code: if stored {
                        StoreStatusCode::Succeeded
                    } else {
                        StoreStatusCode::Failed
                    },
                }
            })
            .collect();

        MessageBody::StoreResponse(StoreResponse { statuses })
    }

    fn tokens(&self) -> MutexGuard<'_, Tokens> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn responses(&self) -> MutexGuard<'_, LruCache<(SocketAddr, MessageId), Arc<Message>>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stats(context: &Context, kind: StatsKind) -> String {
    let mut text = match kind {
        StatsKind::Statistics => context.statistics().to_string(),
        StatsKind::Database => format!(
            "keys: {}\nvalues: {}",
            context.database().key_count(),
            context.database().value_count()
        ),
        StatsKind::RouteTable => context
            .route_table()
            .contacts()
            .iter()
            .map(|contact| format!("{} {}", contact.id(), contact.address()))
            .collect::<Vec<_>>()
            .join("\n"),
    };

    if text.len() > MAX_STATS_LEN {
        let mut end = MAX_STATS_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }

    text
}
