//! Dht node.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use serde_json::Value;
use tracing::info;

use crate::common::{Address, Contact, Id, MemoryStorage, Storage, StorageError};
use crate::node::actor::{Actor, ActorMessage};
use crate::node::{FindValueOutcome, Info, JoinError, KademliaNode, NodeEvent};
use crate::rpc::Config;
use crate::transport::{Transport, UdpTransport};
use crate::Result;

#[derive(Debug, Clone)]
/// Kadnode Dht node.
///
/// A handle to a [KademliaNode] running in its own thread. Cheap to clone,
/// the node shuts down once every handle is dropped.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default)]
/// A builder for [Dht] nodes.
pub struct DhtBuilder {
    config: Config,
    id: Option<Id>,
    bind: Option<SocketAddr>,
    address: Option<Address>,
    storage: Option<Box<dyn Storage>>,
    transport: Option<Box<dyn Transport>>,
}

impl DhtBuilder {
    /// Set this node's [Id], defaults to a random one.
    pub fn id(&mut self, id: Id) -> &mut Self {
        self.id = Some(id);

        self
    }

    /// Set the address the UDP transport binds to.
    ///
    /// Defaults to `0.0.0.0:0`, any interface on a random port.
    pub fn bind(&mut self, address: SocketAddr) -> &mut Self {
        self.bind = Some(address);

        self
    }

    /// Set the UDP port to bind to, on every interface.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.bind = Some(SocketAddr::from(([0, 0, 0, 0], port)));

        self
    }

    /// Advertise `address` to other nodes instead of the transport's local address.
    pub fn address(&mut self, address: Address) -> &mut Self {
        self.address = Some(address);

        self
    }

    /// Use a custom [Storage] engine, defaults to a [MemoryStorage].
    pub fn storage(&mut self, storage: impl Storage + 'static) -> &mut Self {
        self.storage = Some(Box::new(storage));

        self
    }

    /// Use a custom [Transport] instead of binding a UDP socket.
    pub fn transport(&mut self, transport: impl Transport + 'static) -> &mut Self {
        self.transport = Some(Box::new(transport));

        self
    }

    /// Replace every protocol setting at once.
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;

        self
    }

    /// Number of contacts queried in parallel, see [Config::alpha].
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.config.alpha = alpha;

        self
    }

    /// Bucket size, see [Config::k].
    pub fn k(&mut self, k: usize) -> &mut Self {
        self.config.k = k;

        self
    }

    /// See [Config::refresh_interval].
    pub fn refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.refresh_interval = interval;

        self
    }

    /// See [Config::replicate_interval].
    pub fn replicate_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.replicate_interval = interval;

        self
    }

    /// See [Config::republish_interval].
    pub fn republish_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.republish_interval = interval;

        self
    }

    /// See [Config::expire_after].
    pub fn expire_after(&mut self, duration: Duration) -> &mut Self {
        self.config.expire_after = duration;

        self
    }

    /// Set requests timeout, see [Config::response_timeout].
    pub fn response_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.response_timeout = timeout;

        self
    }

    /// See [Config::ping_throttle].
    pub fn ping_throttle(&mut self, throttle: Duration) -> &mut Self {
        self.config.ping_throttle = throttle;

        self
    }

    /// Create a Dht node, listening right away.
    pub fn build(&mut self) -> Result<Dht> {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => {
                let bind = self
                    .bind
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

                Box::new(UdpTransport::bind(bind)?)
            }
        };

        let storage = self
            .storage
            .take()
            .unwrap_or_else(|| Box::new(MemoryStorage::default()));

        let mut node = KademliaNode::new(
            self.id.unwrap_or_else(Id::random),
            transport,
            storage,
            self.config.clone(),
        );

        if let Some(address) = self.address.clone() {
            node = node.with_address(address);
        }

        node.listen();

        Dht::spawn(node)
    }
}

impl Dht {
    /// Create a new DHT node with default settings on a random UDP port.
    pub fn new() -> Result<Self> {
        Dht::builder().build()
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Run an already configured [KademliaNode] in its own thread.
    pub fn spawn(node: KademliaNode) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("kadnode-actor".to_string())
            .spawn(move || Actor::new(node, receiver).run())?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        self.request(ActorMessage::Info)
    }

    /// The contact other nodes can join through.
    pub fn contact(&self) -> Result<Contact, DhtWasShutdown> {
        let info = self.info()?;

        Ok(Contact::new(*info.id(), info.address().clone()))
    }

    /// Snapshot of the contacts in the routing table.
    pub fn routing_table(&self) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.request(ActorMessage::RoutingTable)
    }

    /// Turn this node's routing table to a list of bootstrapping contacts,
    /// in `idHex@hostname:port` form.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        self.request(ActorMessage::ToBootstrap)
    }

    /// Receive [NodeEvent]s.
    pub fn subscribe(&self) -> Result<Receiver<NodeEvent>, DhtWasShutdown> {
        self.request(ActorMessage::Subscribe)
    }

    // === Public Methods ===

    /// Join the network through `bootstrap`, blocking until the routing
    /// table is populated.
    pub fn join(&self, bootstrap: Contact) -> Result<(), JoinError> {
        self.request(|sender| ActorMessage::Join(bootstrap, sender))?
    }

    /// Insert `contact` into the routing table without any liveness check.
    ///
    /// Returns `false` if its bucket is full.
    pub fn add_contact(&self, contact: Contact) -> Result<bool, DhtWasShutdown> {
        self.request(|sender| ActorMessage::AddContact(contact, sender))
    }

    /// Send a PING to `contact`, returning the round trip time, or `None`
    /// if it failed to respond.
    pub fn ping(&self, contact: Contact) -> Result<Option<Duration>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::Ping(contact, sender))
    }

    /// Lookup the `k` closest responding contacts to `key`.
    pub fn find_node(&self, key: Id) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindNode(key, sender))
    }

    /// Lookup the item stored under `key`, or the closest contacts to it.
    pub fn find_value(&self, key: Id) -> Result<FindValueOutcome, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindValue(key, sender))
    }

    /// Store `value` under `key` at the closest contacts, and locally.
    ///
    /// Returns the number of contacts that stored it.
    pub fn store(&self, key: Id, value: Value) -> Result<usize, DhtWasShutdown> {
        self.request(|sender| ActorMessage::Store(key, value, sender))
    }

    /// Republish and replicate due items, returning how many were stored again.
    pub fn replicate(&self) -> Result<usize, DhtWasShutdown> {
        self.request(ActorMessage::Replicate)
    }

    /// Delete expired items, returning how many.
    pub fn expire(&self) -> Result<Result<usize, StorageError>, DhtWasShutdown> {
        self.request(ActorMessage::Expire)
    }

    /// Refresh stale buckets from `start_index` on.
    pub fn refresh(&self, start_index: usize) -> Result<(), DhtWasShutdown> {
        self.request(|sender| ActorMessage::Refresh(start_index, sender))
    }

    /// Shutdown the actor thread loop, blocking until the transport is released.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    // === Private Methods ===

    pub(crate) fn request<T>(
        &self,
        message: impl FnOnce(Sender<T>) -> ActorMessage,
    ) -> Result<T, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<T>(1);

        self.0.send(message(sender)).map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
#[error("The Dht was shutdown")]
/// The actor thread of a [Dht] is no longer running.
pub struct DhtWasShutdown;

impl From<DhtWasShutdown> for JoinError {
    fn from(_: DhtWasShutdown) -> Self {
        JoinError::Shutdown
    }
}

/// Create a testnet of Dht nodes to run tests against instead of the real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes on localhost: the first one knows every other
    /// node, then every other node joins through it.
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_builder(count, |_| {})
    }

    /// Like [Self::new], customizing every node's builder with `configure`.
    pub fn with_builder(count: usize, configure: impl Fn(&mut DhtBuilder)) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);

        for _ in 0..count {
            let mut builder = Dht::builder();
            builder.bind(SocketAddr::from(([127, 0, 0, 1], 0)));
            configure(&mut builder);

            nodes.push(builder.build()?);
        }

        let Some((seed, others)) = nodes.split_first() else {
            return Ok(Testnet {
                bootstrap: vec![],
                nodes,
            });
        };

        let seed_contact = seed.contact().map_err(shutdown_error)?;

        for node in others {
            seed.add_contact(node.contact().map_err(shutdown_error)?)
                .map_err(shutdown_error)?;
        }

        thread::scope(|scope| {
            for node in others {
                let bootstrap = seed_contact.clone();

                scope.spawn(move || {
                    if let Err(error) = node.join(bootstrap) {
                        info!(context = "testnet", ?error, "Node failed to join");
                    }
                });
            }
        });

        let bootstrap = vec![seed_contact.to_string()];

        Ok(Testnet { bootstrap, nodes })
    }

    /// Resolve the bootstrap strings back into contacts.
    pub fn bootstrap_contacts(&self) -> Vec<Contact> {
        self.bootstrap
            .iter()
            .filter_map(|contact| contact.parse().ok())
            .collect()
    }
}

fn shutdown_error(error: DhtWasShutdown) -> crate::Error {
    std::io::Error::other(error).into()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn shutdown() {
        let mut dht = Dht::new().unwrap();
        let clone = dht.clone();

        dht.shutdown();

        assert_eq!(clone.info().unwrap_err(), DhtWasShutdown);
        assert_eq!(clone.join(Contact::random()), Err(JoinError::Shutdown));
    }

    #[test]
    fn info() {
        let id = Id::random();
        let dht = Dht::builder()
            .id(id)
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build()
            .unwrap();

        let info = dht.info().unwrap();

        assert_eq!(info.id(), &id);
        assert_eq!(info.address().hostname, "127.0.0.1");
        assert_eq!(info.routing_table_size(), 0);
        assert_eq!(info.stored_items(), 0);
    }

    #[test]
    fn advertised_address() {
        let dht = Dht::builder()
            .address(Address::new("example.com", 6881))
            .build()
            .unwrap();

        assert_eq!(dht.contact().unwrap().address().to_string(), "example.com:6881");
    }

    #[test]
    fn join_unreachable_bootstrap() {
        let dht = Dht::builder()
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .response_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let events = dht.subscribe().unwrap();

        let nowhere = Contact::new(Id::random(), Address::new("127.0.0.1", 1));

        assert_eq!(dht.join(nowhere), Err(JoinError::NoPeers));
        assert!(matches!(events.try_recv(), Ok(NodeEvent::Error(_))));
    }

    #[test]
    fn testnet_store_find_value() {
        let testnet = Testnet::new(5).unwrap();

        let key = Id::random();
        let stored = testnet.nodes[1].store(key, json!("Hello World!")).unwrap();

        assert!(stored > 0);

        match testnet.nodes[4].find_value(key).unwrap() {
            FindValueOutcome::Value { item, .. } => {
                assert_eq!(item.value, json!("Hello World!"));
            }
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[test]
    fn local_storage_is_shared() {
        let storage = MemoryStorage::default();
        let dht = Dht::builder()
            .storage(storage.clone())
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build()
            .unwrap();

        let key = Id::random();
        assert_eq!(dht.store(key, json!(42)).unwrap(), 0);

        assert_eq!(storage.get(&key).unwrap().unwrap().value, json!(42));
        assert_eq!(dht.info().unwrap().stored_items(), 1);
    }
}
