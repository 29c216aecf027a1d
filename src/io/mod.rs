//! Datagram transport and request/response correlation.

mod dispatcher;
mod receipts;
mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;

use crate::messages::{Message, MessageId};
use crate::DhtError;

pub use dispatcher::{Dispatcher, TIMER_TICK};
pub use udp::{UdpTransport, READ_TIMEOUT};

/// Sends datagrams, received ones are handed to [crate::Context::handle_datagram].
pub trait Transport: Debug + Send + Sync {
    fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> std::io::Result<()>;

    fn local_address(&self) -> SocketAddr;
}

#[derive(Debug)]
/// Outcome of one request sent through the [Dispatcher].
pub struct Reply {
    pub id: MessageId,
    pub to: SocketAddr,
    pub round_trip: Duration,
    pub result: Result<Message, DhtError>,
}
