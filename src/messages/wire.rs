//! Primitive readers and writers for the binary message format.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::{Contact, Id, Value, ValueEntity, ValueType, Vendor, Version, ID_SIZE};
use crate::{Error, Result};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Reasons a datagram could not be decoded.
pub enum DecodeError {
    #[error("Unexpected end of message while reading {0}")]
    Truncated(&'static str),

    #[error("Invalid function code {0:#04x}")]
    InvalidFunction(u8),

    #[error("Unknown opcode {0:#04x}")]
    UnknownOpCode(u8),

    #[error("Invalid address length {0}")]
    InvalidAddressLength(u8),

    #[error("Payload length {declared} does not match the {actual} bytes received")]
    PayloadLength { declared: usize, actual: usize },

    #[error("Invalid UTF-8 text")]
    InvalidUtf8,

    #[error("Invalid {field} {value:#04x}")]
    InvalidValue { field: &'static str, value: u8 },
}

/// Bounds checked cursor over a received datagram.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated(field));
        }

        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;

        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N, field)?);

        Ok(array)
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    pub fn u32_le(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    pub fn f32(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        Ok(f32::from_be_bytes(self.array(field)?))
    }

    pub fn id(&mut self, field: &'static str) -> Result<Id, DecodeError> {
        Ok(Id(self.array::<ID_SIZE>(field)?))
    }

    pub fn version(&mut self) -> Result<Version, DecodeError> {
        let [major, minor] = self.array("version")?;

        Ok(Version::new(major, minor))
    }

    pub fn vendor(&mut self) -> Result<Vendor, DecodeError> {
        Ok(Vendor(self.array("vendor")?))
    }

    pub fn address(&mut self) -> Result<SocketAddr, DecodeError> {
        let ip: IpAddr = match self.u8("address length")? {
            4 => Ipv4Addr::from(self.array::<4>("address")?).into(),
            16 => Ipv6Addr::from(self.array::<16>("address")?).into(),
            len => return Err(DecodeError::InvalidAddressLength(len)),
        };

        Ok(SocketAddr::new(ip, self.u16("port")?))
    }

    /// Token or any other u8 length prefixed bytes.
    pub fn short_bytes(&mut self, field: &'static str) -> Result<Bytes, DecodeError> {
        let len = self.u8(field)? as usize;

        Ok(Bytes::copy_from_slice(self.take(len, field)?))
    }

    /// Contact as it appears in node lists: vendor, version, id and address.
    pub fn contact(&mut self) -> Result<Contact, DecodeError> {
        let vendor = self.vendor()?;
        let version = self.version()?;
        let id = self.id("contact id")?;
        let address = self.address()?;

        Ok(Contact::new(id, address).with_vendor(vendor, version))
    }

    pub fn contacts(&mut self) -> Result<Vec<Contact>, DecodeError> {
        let count = self.u8("contacts count")?;
        (0..count).map(|_| self.contact()).collect()
    }

    /// Reads an entity received from `sender`.
    ///
    /// If the creator is the sender, the sender's full contact (with its flags)
    /// is used as the creator.
    pub fn entity(&mut self, sender: &Contact) -> Result<ValueEntity, DecodeError> {
        let creator = self.contact()?;
        let primary_key = self.id("primary key")?;
        let value_type = ValueType(self.array("value type")?);
        let version = self.version()?;
        let len = self.u16("value length")? as usize;
        let payload = Bytes::copy_from_slice(self.take(len, "value")?);

        let creator = if creator.id() == sender.id() {
            sender.clone()
        } else {
            creator
        };

        Ok(ValueEntity::remote(
            primary_key,
            creator,
            sender.clone(),
            Value::new(value_type, version, payload),
        ))
    }

    pub fn entities(&mut self, sender: &Contact) -> Result<Vec<ValueEntity>, DecodeError> {
        let count = self.u8("entities count")?;
        (0..count).map(|_| self.entity(sender)).collect()
    }
}

// === Writers ===

pub(crate) fn put_address(buf: &mut BytesMut, address: &SocketAddr) {
    match address.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(16);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(address.port());
}

pub(crate) fn put_version(buf: &mut BytesMut, version: Version) {
    buf.put_u8(version.major);
    buf.put_u8(version.minor);
}

pub(crate) fn put_contact(buf: &mut BytesMut, contact: &Contact) {
    buf.put_slice(&contact.vendor().0);
    put_version(buf, contact.version());
    buf.put_slice(contact.id().as_bytes());
    put_address(buf, &contact.address());
}

pub(crate) fn put_short_bytes(buf: &mut BytesMut, field: &'static str, bytes: &[u8]) -> Result<()> {
    buf.put_u8(u8_len(field, bytes.len())?);
    buf.put_slice(bytes);

    Ok(())
}

pub(crate) fn put_entity(buf: &mut BytesMut, entity: &ValueEntity) -> Result<()> {
    let value = entity.value();

    put_contact(buf, entity.creator());
    buf.put_slice(entity.primary_key().as_bytes());
    buf.put_slice(&value.value_type.0);
    put_version(buf, value.version);

    let len = u16::try_from(value.payload.len()).map_err(|_| Error::MessageTooLarge {
        field: "value",
        len: value.payload.len(),
        max: u16::MAX as usize,
    })?;
    buf.put_u16(len);
    buf.put_slice(&value.payload);

    Ok(())
}

/// Checks that a list or byte string fits in a one byte length prefix.
pub(crate) fn u8_len(field: &'static str, len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| Error::MessageTooLarge {
        field,
        len,
        max: u8::MAX as usize,
    })
}
