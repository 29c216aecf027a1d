//! Sends messages and routes responses back to whoever is waiting for them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, trace};

use super::receipts::{Receipt, Receipts};
use super::{Reply, Transport};
use crate::messages::{Message, MessageId};
use crate::statistics::NetworkStatistics;
use crate::DhtError;

/// How often the timer thread looks for expired receipts.
pub const TIMER_TICK: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    receipts: Mutex<Receipts>,
    request_timeout: Duration,
    statistics: Arc<NetworkStatistics>,
}

impl Dispatcher {
    /// Creates a dispatcher and starts its timer thread.
    ///
    /// The thread exits once the dispatcher is dropped.
    pub fn new(
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
        statistics: Arc<NetworkStatistics>,
    ) -> std::io::Result<Arc<Dispatcher>> {
        let dispatcher = Arc::new(Dispatcher {
            transport,
            receipts: Mutex::new(Receipts::default()),
            request_timeout,
            statistics,
        });

        let weak = Arc::downgrade(&dispatcher);
        thread::Builder::new()
            .name("kadnode-timer".to_string())
            .spawn(move || run_timer(weak))?;

        Ok(dispatcher)
    }

    // === Getters ===

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn local_address(&self) -> SocketAddr {
        self.transport.local_address()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of requests still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.receipts().len()
    }

    // === Public Methods ===

    /// Sends a request, the response or the timeout is delivered to `replies`.
    pub fn send_request(
        &self,
        to: SocketAddr,
        request: &Message,
        replies: Sender<Reply>,
    ) -> Result<MessageId, DhtError> {
        let bytes = request.to_bytes().map_err(|error| DhtError::Send {
            address: to,
            reason: error.to_string(),
        })?;

        let id = request.id();
        let sent_at = Instant::now();

        // Registered before sending, the response may arrive before send_to returns.
        self.receipts().insert(
            id,
            Receipt {
                to,
                opcode: request.opcode(),
                sent_at,
                deadline: sent_at + self.request_timeout,
                replies,
            },
        );

        if let Err(error) = self.transport.send_to(to, &bytes) {
            self.receipts().cancel(&id);
            debug!(?to, ?error, "Failed to send request");

            return Err(DhtError::Send {
                address: to,
                reason: error.to_string(),
            });
        }

        NetworkStatistics::increment(&self.statistics.messages_sent);
        trace!(context = "request", ?to, opcode = ?request.opcode(), ?id);

        Ok(id)
    }

    /// Sends a response, reusing the message's cached bytes.
    pub fn send_response(&self, to: SocketAddr, response: &Message) {
        self.send(to, response, "response");
    }

    /// Sends a request without waiting for its response, which is dropped
    /// as a late one when it arrives.
    pub fn send_unanswered(&self, to: SocketAddr, request: &Message) {
        self.send(to, request, "unanswered");
    }

    /// Delivers a response to its request, returns `false` if nobody waits for it.
    pub fn handle_response(&self, from: SocketAddr, response: Message) -> bool {
        let Some(receipt) = self.receipts().remove(&response.id(), &from) else {
            NetworkStatistics::increment(&self.statistics.late_responses);
            trace!(?from, id = ?response.id(), "Response to unknown or expired request");

            return false;
        };

        let _ = receipt.replies.send(Reply {
            id: response.id(),
            to: receipt.to,
            round_trip: receipt.sent_at.elapsed(),
            result: Ok(response),
        });

        true
    }

    /// Fails every request whose deadline passed.
    pub fn expire(&self, now: Instant) {
        let expired = self.receipts().expire(now);

        for (id, receipt) in expired {
            NetworkStatistics::increment(&self.statistics.timeouts);

            let elapsed = now.saturating_duration_since(receipt.sent_at);
            trace!(?id, to = ?receipt.to, ?elapsed, "Request timed out");

            let _ = receipt.replies.send(Reply {
                id,
                to: receipt.to,
                round_trip: elapsed,
                result: Err(DhtError::Timeout {
                    operation: receipt.opcode.operation(),
                    address: receipt.to,
                    elapsed,
                }),
            });
        }
    }

    // === Private Methods ===

    fn receipts(&self) -> MutexGuard<'_, Receipts> {
        self.receipts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, to: SocketAddr, message: &Message, context: &'static str) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(?to, ?error, context, "Failed to encode message");
                return;
            }
        };

        match self.transport.send_to(to, &bytes) {
            Ok(()) => {
                NetworkStatistics::increment(&self.statistics.messages_sent);
                trace!(context, ?to, opcode = ?message.opcode());
            }
            Err(error) => debug!(?to, ?error, context, "Failed to send message"),
        }
    }
}

fn run_timer(dispatcher: Weak<Dispatcher>) {
    loop {
        thread::sleep(TIMER_TICK);

        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };

        dispatcher.expire(Instant::now());
    }
}
