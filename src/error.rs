//! Main Crate Error

use std::net::SocketAddr;
use std::time::Duration;

use crate::messages::DecodeError;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// A datagram that could not be decoded into a DHT message.
    ///
    /// Recoverable: the datagram is dropped and nothing else is affected.
    #[error("Malformed message from {from}: {source}")]
    MalformedMessage {
        /// Where the datagram came from.
        from: SocketAddr,
        /// What was wrong with it.
        #[source]
        source: DecodeError,
    },

    /// Indicates that the bytes are not a valid 160 bits Id.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// A collision ping was built with a sender or target that can never be valid.
    ///
    /// This is a programming error, the ping is never sent.
    #[error("Invalid collision ping: {0}")]
    InvalidCollisionPing(&'static str),

    /// A field does not fit in its length prefix on the wire.
    #[error("{field} is too large to encode ({len} > {max})")]
    MessageTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Errors related to encoding or decoding value store snapshots.
    #[error("Failed to (de)serialize snapshot: {0}")]
    Snapshot(#[from] serde_bencode::Error),
}

/// Failure of an outstanding operation, delivered to [crate::DhtFutureListener::handle_exception]
/// and returned from [crate::DhtFuture::get].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// No response arrived before the request deadline.
    #[error("{operation} request to {address} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        address: SocketAddr,
        elapsed: Duration,
    },

    /// The remote node answered with something other than what we asked for.
    #[error("Unexpected response from {address}: {reason}")]
    UnexpectedResponse {
        address: SocketAddr,
        reason: String,
    },

    /// The request could not be handed to the transport.
    #[error("Failed to send to {address}: {reason}")]
    Send { address: SocketAddr, reason: String },

    /// There was nobody to ask.
    #[error("No contacts to query")]
    NoContacts,

    /// The executor was shut down before the operation could run.
    #[error("Executor was shutdown")]
    Shutdown,

    /// The response handler panicked.
    #[error("Response handler panicked: {0}")]
    Panicked(String),

    /// Only returned by [crate::DhtFuture::get], listeners never see it.
    #[error("Operation was cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
