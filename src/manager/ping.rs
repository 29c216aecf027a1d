use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use super::FutureManager;
use crate::common::Contact;
use crate::concurrent::DhtFuture;
use crate::context::Context;
use crate::handler::{HandlerFactory, PingResult};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PingKind {
    Regular,
    /// Sent as [Contact::collision_ping_sender], to find nodes using our id.
    CollisionPing,
}

#[derive(Debug)]
/// Pings, one per address and [PingKind] at a time.
pub struct PingManager {
    context: Arc<Context>,
    handlers: Arc<dyn HandlerFactory>,
    futures: FutureManager<(SocketAddr, PingKind), PingResult>,
}

impl PingManager {
    pub fn new(context: Arc<Context>, handlers: Arc<dyn HandlerFactory>) -> Self {
        Self {
            futures: FutureManager::new(
                "ping",
                context.executor().clone(),
                context.statistics().clone(),
                |statistics| &statistics.pings,
            ),
            context,
            handlers,
        }
    }

    pub fn futures(&self) -> &FutureManager<(SocketAddr, PingKind), PingResult> {
        &self.futures
    }

    pub fn ping(&self, address: SocketAddr) -> DhtFuture<PingResult> {
        let sender = self.context.local_contact();

        self.futures.request((address, PingKind::Regular), || {
            self.handlers.ping(&self.context, address, sender)
        })
    }

    pub fn ping_contact(&self, contact: &Contact) -> DhtFuture<PingResult> {
        self.ping(contact.address())
    }

    /// Pings `target` pretending to be `sender`, which must be a collision
    /// ping sender for the local id.
    ///
    /// A node answering with our own id is using it too.
    pub fn collision_ping(&self, target: &Contact, sender: Contact) -> Result<DhtFuture<PingResult>> {
        let local = self.context.local_contact();

        if !sender.is_collision_ping_sender(local.id()) {
            return Err(Error::InvalidCollisionPing(
                "sender is not a collision ping sender for the local id",
            ));
        }

        if target.address() == local.address() {
            return Err(Error::InvalidCollisionPing("target is the local node"));
        }

        debug!(target = ?target.address(), "Collision ping");
        let address = target.address();

        Ok(self
            .futures
            .request((address, PingKind::CollisionPing), || {
                self.handlers.ping(&self.context, address, sender)
            }))
    }
}
