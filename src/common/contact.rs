//! Remote (or local) node identity as seen on the wire.

use std::fmt::{self, Debug, Display, Formatter};
use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::Id;

/// The contact can not receive unsolicited traffic.
pub const FIREWALLED_FLAG: u8 = 0x01;
/// The contact announced that it is leaving the network.
pub const SHUTDOWN_FLAG: u8 = 0x02;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
/// Four character vendor code.
pub struct Vendor(pub [u8; 4]);

impl Vendor {
    pub const UNKNOWN: Vendor = Vendor([0; 4]);
    pub const KADNODE: Vendor = Vendor(*b"KADN");
}

impl Debug for Vendor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Vendor({})", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
/// Two part version, one byte each on the wire.
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Node's identity and how to reach it.
pub struct Contact {
    id: Id,
    address: SocketAddr,
    vendor: Vendor,
    version: Version,
    instance_id: u8,
    flags: u8,
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("firewalled", &self.is_firewalled())
            .finish()
    }
}

impl Contact {
    /// Creates a contact with no vendor information and no flags.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            vendor: Vendor::UNKNOWN,
            version: Version::default(),
            instance_id: 0,
            flags: 0,
        }
    }

    /// Creates a contact with a random Id, useful for testing.
    pub fn random(address: SocketAddr) -> Contact {
        Contact::new(Id::random(), address)
    }

    /// The fake sender used to check for an Id collision with `local`.
    ///
    /// Its Id is the local Id inverted, and it is marked as firewalled so that
    /// the remote never adds it to its routing table.
    pub fn collision_ping_sender(local: &Contact) -> Contact {
        Contact {
            id: local.id.invert(),
            flags: local.flags | FIREWALLED_FLAG,
            ..local.clone()
        }
    }

    // === Options ===

    pub fn with_vendor(mut self, vendor: Vendor, version: Version) -> Self {
        self.vendor = vendor;
        self.version = version;
        self
    }

    pub fn with_instance_id(mut self, instance_id: u8) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_firewalled(&self) -> bool {
        self.flags & FIREWALLED_FLAG != 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.flags & SHUTDOWN_FLAG != 0
    }

    // === Public Methods ===

    /// Returns `true` if this contact is a valid collision ping sender for `local_id`.
    pub fn is_collision_ping_sender(&self, local_id: &Id) -> bool {
        self.id == local_id.invert() && self.is_firewalled()
    }

    /// Returns `true` if both contacts share the same IP address.
    pub fn same_ip(&self, other: &Contact) -> bool {
        self.address.ip() == other.address.ip()
    }
}

#[derive(Debug, Clone)]
/// A [Contact] with the bookkeeping a routing table needs.
pub struct ContactEntry {
    pub contact: Contact,
    pub last_seen: Instant,
    pub failures: u32,
}

impl ContactEntry {
    pub fn new(contact: Contact) -> Self {
        Self {
            contact,
            last_seen: Instant::now(),
            failures: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn collision_ping_sender() {
        let local = Contact::random("127.0.0.1:4000".parse().unwrap());
        let sender = Contact::collision_ping_sender(&local);

        assert!(sender.is_collision_ping_sender(local.id()));
        assert_eq!(sender.address(), local.address());

        // Not firewalled
        let not_firewalled = sender.clone().with_flags(0);
        assert!(!not_firewalled.is_collision_ping_sender(local.id()));

        // Wrong id
        assert!(!local.is_collision_ping_sender(local.id()));
    }

    #[test]
    fn flags() {
        let contact = Contact::random("127.0.0.1:4000".parse().unwrap())
            .with_flags(FIREWALLED_FLAG | SHUTDOWN_FLAG);

        assert!(contact.is_firewalled());
        assert!(contact.is_shutdown());
    }
}
