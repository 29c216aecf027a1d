//! Kademlia node Id or a lookup target
use rand::Rng;
use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The all-zero Id, also the distance between an Id and itself.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Create an Id from the SHA-1 hash of some data, used for content keys.
    pub fn from_data<T: AsRef<[u8]>>(data: T) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data.as_ref());

        Id(hasher.digest().bytes())
    }

    /// XOR distance between this Id and `other`.
    ///
    /// The result compares as an unsigned big-endian integer, it is
    /// symmetric and [Id::ZERO] only for equal Ids.
    pub fn distance(&self, other: &Id) -> Id {
        let mut xor = [0; ID_SIZE];
        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(xor)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn log_distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Returns a random Id at exactly `log_distance` from this Id.
    ///
    /// Used to pick a lookup target inside a specific bucket.
    /// A `log_distance` of 0 returns this Id.
    pub fn random_at_log_distance(&self, log_distance: u8) -> Id {
        let log_distance = log_distance.min(MAX_DISTANCE);
        if log_distance == 0 {
            return *self;
        }

        let random = Id::random();
        let mut bytes = self.0;

        // Index of the first bit that differs, counted from the most significant bit.
        let flip = (MAX_DISTANCE - log_distance) as usize;

        for bit in flip..(MAX_DISTANCE as usize) {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);

            let value = if bit == flip {
                !self.0[byte] & mask
            } else {
                random.0[byte] & mask
            };

            bytes[byte] = (bytes[byte] & !mask) | value;
        }

        Id(bytes)
    }

    /// Flip every bit of this Id.
    pub fn invert(&self) -> Id {
        let mut bytes = self.0;
        for byte in bytes.iter_mut() {
            *byte = !*byte;
        }

        Id(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Id, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;

        Id::from_bytes(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}
