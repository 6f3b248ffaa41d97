#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod messenger;
pub mod node;
pub mod rpc;
pub mod transport;

pub use crate::common::{
    now_millis, AddOutcome, Address, Bucket, Contact, ContactList, Id, MemoryStorage,
    RoutingEvent, RoutingTable, Storage, StorageError, StorageItem, ID_BITS, ID_SIZE,
    MAX_BUCKET_SIZE_K, MAX_VALUES,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtWasShutdown, Testnet};
pub use error::{Error, Result};
pub use node::{FindValueOutcome, Info, JoinError, KademliaNode, NodeEvent};
