//! In process transport, for tests and simulations.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};

use crate::common::Address;
use crate::messenger::Packet;

use super::{Transport, MAX_THREAD_BLOCK_DURATION};

static ENDPOINTS: OnceLock<Mutex<HashMap<String, Sender<Bytes>>>> = OnceLock::new();
static NEXT_ENDPOINT: AtomicUsize = AtomicUsize::new(0);

fn endpoints() -> io::Result<std::sync::MutexGuard<'static, HashMap<String, Sender<Bytes>>>> {
    ENDPOINTS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .map_err(|_| io::Error::other("memory transport registry poisoned"))
}

#[derive(Debug)]
/// [Transport] delivering packets through channels inside this process.
///
/// Packets sent to an address nobody is bound to are silently lost, like UDP.
pub struct MemoryTransport {
    address: Address,
    receiver: Receiver<Bytes>,
    poll_interval: Duration,
}

impl MemoryTransport {
    /// Bind a new endpoint with a unique `memory-N` hostname.
    pub fn bind() -> io::Result<Self> {
        let hostname = format!("memory-{}", NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed));
        let address = Address::new(hostname, 0);

        let (sender, receiver) = flume::unbounded();
        endpoints()?.insert(address.to_string(), sender);

        Ok(Self {
            address,
            receiver,
            poll_interval: MAX_THREAD_BLOCK_DURATION,
        })
    }

    /// Change how long [Transport::read] blocks, [Duration::ZERO] makes it non-blocking.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Ok(mut endpoints) = endpoints() {
            endpoints.remove(&self.address.to_string());
        }
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, packet: &Packet) -> io::Result<()> {
        if let Some(endpoint) = endpoints()?.get(&packet.receiver.address().to_string()) {
            let _ = endpoint.send(packet.buffer.clone());
        }

        Ok(())
    }

    fn read(&mut self) -> io::Result<Option<Bytes>> {
        if self.poll_interval.is_zero() {
            return Ok(self.receiver.try_recv().ok());
        }

        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(buffer) => Ok(Some(buffer)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::other(
                "memory transport endpoint was unregistered",
            )),
        }
    }

    fn local_address(&self) -> Address {
        self.address.clone()
    }
}

#[cfg(test)]
mod test {
    use crate::common::{Contact, Id};

    use super::*;

    fn packet(to: &MemoryTransport, buffer: &'static [u8]) -> Packet {
        Packet {
            id: "1".into(),
            buffer: Bytes::from_static(buffer),
            receiver: Contact::new(Id::random(), to.local_address()),
        }
    }

    #[test]
    fn send_and_receive() {
        let mut a = MemoryTransport::bind().unwrap();
        let mut b = MemoryTransport::bind()
            .unwrap()
            .with_poll_interval(Duration::ZERO);

        assert_ne!(a.local_address(), b.local_address());

        a.write(&packet(&b, b"hello")).unwrap();

        assert_eq!(b.read().unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(b.read().unwrap(), None);
    }

    #[test]
    fn packets_to_the_void() {
        let mut a = MemoryTransport::bind().unwrap();
        let b = MemoryTransport::bind().unwrap();
        let lost = packet(&b, b"lost");
        drop(b);

        assert!(a.write(&lost).is_ok());
    }
}
