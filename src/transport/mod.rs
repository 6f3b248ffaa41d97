//! Byte transports carrying encoded messages between nodes.

mod memory;
mod udp;

use std::fmt::Debug;
use std::io;

use bytes::Bytes;

use crate::common::Address;
use crate::messenger::Packet;

pub use memory::MemoryTransport;
pub use udp::{UdpTransport, MAX_THREAD_BLOCK_DURATION};

/// Moves encoded packets to and from other nodes.
pub trait Transport: Debug + Send {
    /// Send `packet` to its receiver. Delivery is best effort.
    fn write(&mut self, packet: &Packet) -> io::Result<()>;

    /// Next received buffer, or `None` if nothing arrived within the poll interval.
    fn read(&mut self) -> io::Result<Option<Bytes>>;

    /// The address other nodes can reach this transport at.
    fn local_address(&self) -> Address;
}
