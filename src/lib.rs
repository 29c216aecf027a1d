#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod config;
mod context;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;
pub mod concurrent;
pub mod db;
mod dht;
pub mod handler;
pub mod io;
pub mod manager;
pub mod messages;
pub mod routing;
pub mod server;
pub mod statistics;

pub use crate::common::{
    Contact, ContactEntry, Id, Origin, Value, ValueEntity, ValueType, Vendor, Version, ID_SIZE,
    FIREWALLED_FLAG, MAX_DISTANCE, SHUTDOWN_FLAG,
};
pub use bytes::Bytes;
pub use concurrent::{DhtFuture, DhtFutureListener, Outcome};
pub use config::*;
pub use context::Context;
pub use db::{DatabaseSettings, ValueStore};
pub use dht::{Dht, DhtBuilder, Testnet};
pub use error::{DhtError, Error, Result};
