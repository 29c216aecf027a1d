//! Hosts that are not welcome anymore.

use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use crate::messages::Message;

/// Maximum number of banned hosts remembered by [BanList].
pub const MAX_BANNED_HOSTS: usize = 1024;

/// Decides which incoming messages are accepted at all.
pub trait HostFilter: Debug + Send + Sync {
    /// Returns `true` if the message should be processed.
    fn allow(&self, message: &Message) -> bool;

    /// Refuse every future message from this address.
    fn ban(&self, address: SocketAddr);
}

#[derive(Debug)]
/// Default [HostFilter] banning by IP address.
///
/// The oldest ban is forgotten once [MAX_BANNED_HOSTS] (or the configured capacity) is reached.
pub struct BanList {
    banned: Mutex<LruCache<IpAddr, ()>>,
}

impl BanList {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            banned: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned
            .lock()
            .map(|banned| banned.contains(ip))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.banned.lock().map(|banned| banned.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new(MAX_BANNED_HOSTS)
    }
}

impl HostFilter for BanList {
    fn allow(&self, message: &Message) -> bool {
        let address = message.source().unwrap_or(message.sender().address());

        !self.is_banned(&address.ip())
    }

    fn ban(&self, address: SocketAddr) {
        debug!(?address, "Banning host");

        if let Ok(mut banned) = self.banned.lock() {
            banned.put(address.ip(), ());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ban_by_ip() {
        let filter = BanList::default();

        filter.ban("10.0.0.1:4000".parse().unwrap());

        assert!(filter.is_banned(&"10.0.0.1".parse().unwrap()));
        assert!(!filter.is_banned(&"10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn forgets_oldest() {
        let filter = BanList::new(2);

        filter.ban("10.0.0.1:1".parse().unwrap());
        filter.ban("10.0.0.2:1".parse().unwrap());
        filter.ban("10.0.0.3:1".parse().unwrap());

        assert_eq!(filter.len(), 2);
        assert!(!filter.is_banned(&"10.0.0.1".parse().unwrap()));
    }
}
