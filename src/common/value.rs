//! Values and the entities that carry them through the network.

use std::fmt::{self, Debug, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Contact, Id, Version};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Four character code describing the payload of a [Value].
pub struct ValueType(pub [u8; 4]);

impl ValueType {
    /// Matches every value type in a find-value request.
    pub const ANY: ValueType = ValueType(*b"****");
    pub const BINARY: ValueType = ValueType(*b"BINA");
    pub const TEXT: ValueType = ValueType(*b"TEXT");
    pub const TEST: ValueType = ValueType(*b"TEST");

    /// Returns `true` if `other` is accepted by this (possibly [Self::ANY]) type.
    pub fn matches(&self, other: &ValueType) -> bool {
        self == &ValueType::ANY || self == other
    }
}

impl Debug for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A typed, versioned payload.
///
/// An empty payload is a request to delete.
pub struct Value {
    pub value_type: ValueType,
    pub version: Version,
    pub payload: Bytes,
}

impl Value {
    pub fn new(value_type: ValueType, version: Version, payload: impl Into<Bytes>) -> Self {
        Self {
            value_type,
            version,
            payload: payload.into(),
        }
    }

    /// Shorthand for a [ValueType::TEXT] value with version `0.0`.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(ValueType::TEXT, Version::default(), payload)
    }

    /// An empty value, which removes the existing value when stored.
    pub fn empty(value_type: ValueType) -> Self {
        Self::new(value_type, Version::default(), Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Value({:?} {:?} {} bytes)",
            self.value_type,
            self.version,
            self.payload.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// How an entity reached the local store.
///
/// Ordered by precedence, an incoming entity may replace an existing one
/// for the same (primary, secondary) pair iff `incoming >= existing`.
pub enum Origin {
    /// Stored on behalf of its creator by another node.
    Indirect,
    /// Stored by its creator.
    Direct,
    /// Created by this node.
    Local,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A [Value] bound to a key, together with who created and who sent it.
pub struct ValueEntity {
    primary_key: Id,
    secondary_key: Id,
    value: Value,
    origin: Origin,
    creator: Contact,
    sender: Contact,
}

impl ValueEntity {
    /// Creates an entity created by the local node.
    pub fn local(primary_key: Id, creator: Contact, value: Value) -> Self {
        Self {
            primary_key,
            secondary_key: *creator.id(),
            value,
            origin: Origin::Local,
            sender: creator.clone(),
            creator,
        }
    }

    /// Creates an entity received from `sender`.
    ///
    /// The origin is [Origin::Direct] iff the creator is the sender.
    pub fn remote(primary_key: Id, creator: Contact, sender: Contact, value: Value) -> Self {
        let origin = if creator.id() == sender.id() {
            Origin::Direct
        } else {
            Origin::Indirect
        };

        Self {
            primary_key,
            secondary_key: *creator.id(),
            value,
            origin,
            creator,
            sender,
        }
    }

    // === Getters ===

    pub fn primary_key(&self) -> &Id {
        &self.primary_key
    }

    pub fn secondary_key(&self) -> &Id {
        &self.secondary_key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn creator(&self) -> &Contact {
        &self.creator
    }

    pub fn sender(&self) -> &Contact {
        &self.sender
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn is_direct(&self) -> bool {
        self.origin == Origin::Direct
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl Debug for ValueEntity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueEntity")
            .field("primary_key", &self.primary_key)
            .field("secondary_key", &self.secondary_key)
            .field("origin", &self.origin)
            .field("value", &self.value)
            .finish()
    }
}
