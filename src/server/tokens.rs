//! Manage tokens (query keys) for remote client IPs.

use crc::{Crc, CRC_32_ISCSI};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
pub const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Secrets are rotated this often, tokens stay valid for two intervals.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Tokens generator.
///
/// A node hands a token out in find-node responses, and only accepts
/// store requests presenting a token it generated for the same IP.
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator.
    pub fn new() -> Self {
        Tokens {
            prev_secret: rand::random(),
            curr_secret: rand::random(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret needs to be updated after an interval.
    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was generated with the current or previous secret.
    pub fn validate(&self, address: SocketAddr, token: &[u8]) -> bool {
        let prev = generate(address.ip(), &self.prev_secret);
        let curr = generate(address.ip(), &self.curr_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = rand::random();

        self.last_updated = Instant::now();
    }

    /// Generates a new token for a remote peer.
    pub fn generate_token(&self, address: SocketAddr) -> [u8; TOKEN_SIZE] {
        generate(address.ip(), &self.curr_secret)
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn generate(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(secret);

    digest.finalize().to_be_bytes()
}
