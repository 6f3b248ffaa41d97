//! Kademlia node: protocol rules, iterative lookups, storage maintenance and
//! probe-before-evict admission of contacts, on top of the generic [Rpc] engine.

pub(crate) mod actor;
mod info;
pub mod iterative_query;
mod maintenance;
pub mod rules;

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use crate::common::{
    now_millis, Address, Bucket, Contact, Id, RoutingTable, Storage, StorageError, StorageItem,
};
use crate::rpc::{Config, Rpc, RpcError};
use crate::transport::Transport;

use iterative_query::{IterativeQuery, Step};
use maintenance::Maintenance;
use rules::{FIND_NODE, FIND_VALUE, PING, STORE};

pub use info::Info;

/// Handler of a call made by a [KademliaNode], resumed with the node itself.
pub type Continuation = Box<dyn FnOnce(&mut KademliaNode, Result<Value, RpcError>) + Send>;

/// Completion of an asynchronous [KademliaNode] operation.
pub type Done<T> = Box<dyn FnOnce(&mut KademliaNode, T) + Send>;

type Task = Box<dyn FnOnce(&mut KademliaNode) + Send>;

#[derive(Debug, Clone, PartialEq)]
/// Events broadcast to [KademliaNode::subscribe] receivers.
pub enum NodeEvent {
    /// [KademliaNode::join] populated the routing table.
    Joined,
    Error(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum JoinError {
    #[error("Could not bootstrap the routing table, no contact responded")]
    NoPeers,

    #[error("Dht was shutdown before joining")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
/// Outcome of [KademliaNode::iterative_find_value].
pub enum FindValueOutcome {
    /// Some node had an item stored under the key.
    Value { item: StorageItem, from: Contact },
    /// Nobody had the value, these are the closest contacts to the key.
    Contacts(Vec<Contact>),
}

impl FindValueOutcome {
    pub fn item(&self) -> Option<&StorageItem> {
        match self {
            FindValueOutcome::Value { item, .. } => Some(item),
            FindValueOutcome::Contacts(_) => None,
        }
    }

    pub fn into_contacts(self) -> Vec<Contact> {
        match self {
            FindValueOutcome::Value { .. } => Vec::new(),
            FindValueOutcome::Contacts(contacts) => contacts,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PingRecord {
    at: Instant,
    responded: bool,
}

struct Lookup {
    method: &'static str,
    query: IterativeQuery,
    done: Done<FindValueOutcome>,
}

struct StoreFanout {
    key: Id,
    item: StorageItem,
    targets: VecDeque<Contact>,
    inflight: usize,
    stored: usize,
    done: Done<usize>,
}

/// A Kademlia node, driven by calling [Self::tick] in a loop.
///
/// Operations complete asynchronously: their [Done] continuation runs inside a
/// later [Self::tick], or immediately if no network round trip is needed.
pub struct KademliaNode {
    rpc: Rpc<Continuation>,
    config: Config,

    /// Last lookup time per bucket index.
    lookups: HashMap<usize, Instant>,
    /// Last liveness probe of bucket heads.
    pings: HashMap<Id, PingRecord>,

    admissions: VecDeque<Contact>,
    probing: bool,

    lookups_inflight: HashMap<u64, Lookup>,
    stores_inflight: HashMap<u64, StoreFanout>,
    next_operation: u64,
    /// Next steps of multi step operations, run in order by [Self::tick].
    deferred: VecDeque<Task>,

    maintenance: Maintenance,
    observers: Vec<Sender<NodeEvent>>,
}

impl KademliaNode {
    pub fn new(
        id: Id,
        transport: Box<dyn Transport>,
        storage: Box<dyn Storage>,
        config: Config,
    ) -> Self {
        let mut rpc = Rpc::new(id, transport, storage, &config);
        rpc.set_admit_senders(false);

        Self {
            rpc,
            maintenance: Maintenance::new(config.refresh_interval, config.replicate_interval),
            config,

            lookups: HashMap::new(),
            pings: HashMap::new(),

            admissions: VecDeque::new(),
            probing: false,

            lookups_inflight: HashMap::new(),
            stores_inflight: HashMap::new(),
            next_operation: 0,
            deferred: VecDeque::new(),

            observers: Vec::new(),
        }
    }

    // === Options ===

    /// Advertise `address` instead of the transport's local address.
    pub fn with_address(mut self, address: Address) -> Self {
        self.rpc = self.rpc.with_address(address);
        self
    }

    // === Getters ===

    /// Returns this node's [Id]
    pub fn id(&self) -> &Id {
        self.rpc.id()
    }

    pub fn contact(&self) -> &Contact {
        self.rpc.contact()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        self.rpc.routing_table()
    }

    pub fn rpc(&self) -> &Rpc<Continuation> {
        &self.rpc
    }

    /// The underlying engine, to register middlewares or messenger stages.
    pub fn rpc_mut(&mut self) -> &mut Rpc<Continuation> {
        &mut self.rpc
    }

    /// Returns a summary of this node's state.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Register the protocol rules and the default error handlers, and enable
    /// the periodic maintenance.
    pub fn listen(&mut self) {
        if self.rpc.is_listening() {
            return;
        }

        let k = self.config.k;

        self.rpc.use_middleware(PING, rules::ping);
        self.rpc.use_middleware(STORE, rules::store);
        self.rpc.use_middleware(FIND_NODE, rules::find_node(k));
        self.rpc.use_middleware(FIND_VALUE, rules::find_value(k));

        self.rpc.listen();
    }

    /// Hand this node to an extension, which may add middlewares, messenger
    /// stages, or subscribe to events.
    pub fn plugin<T>(&mut self, plugin: impl FnOnce(&mut KademliaNode) -> T) -> T {
        plugin(self)
    }

    /// Receive [NodeEvent]s.
    pub fn subscribe(&mut self) -> Receiver<NodeEvent> {
        let (sender, receiver) = flume::unbounded();
        self.observers.push(sender);

        receiver
    }

    /// Call `method` on `target`, see [Rpc::send].
    pub fn send(&mut self, method: &str, params: Value, target: &Contact, continuation: Continuation) {
        self.rpc.send(method, params, target, continuation);
    }

    /// Advance the node by one step: process incoming messages, resume
    /// operations waiting on them, and run due maintenance.
    pub fn tick(&mut self) {
        let report = self.rpc.tick();

        for sender in report.senders {
            self.update_contact(sender);
        }

        for (continuation, result) in report.resolved {
            continuation(self, result);
        }

        while let Some(task) = self.deferred.pop_front() {
            task(self);
        }

        self.periodic_maintenance();
    }

    /// Send a PING to `contact`, resolving to the round trip time.
    pub fn ping(&mut self, contact: &Contact, done: Done<Result<Duration, RpcError>>) {
        let start = Instant::now();

        self.send(
            PING,
            json!([]),
            contact,
            Box::new(move |node, result| done(node, result.map(|_| start.elapsed()))),
        );
    }

    /// Offer `contact` to the routing table.
    ///
    /// Contacts are admitted one at a time. If the contact's bucket is full, its
    /// head is probed with a PING first, unless it responded to one recently, and
    /// replaced by `contact` only if it fails to respond.
    pub fn update_contact(&mut self, contact: Contact) {
        if contact.id() == self.id() {
            return;
        }

        self.admissions.push_back(contact);
        self.drain_admissions();
    }

    /// Lookup the `k` closest contacts to `key` that respond.
    pub fn iterative_find_node(&mut self, key: Id, done: Done<Vec<Contact>>) {
        self.iterative_find(
            FIND_NODE,
            key,
            Box::new(move |node, outcome: FindValueOutcome| done(node, outcome.into_contacts())),
        );
    }

    /// Lookup the item stored under `key`, falling back to the `k` closest
    /// contacts to `key` if nobody has it.
    ///
    /// When found, a copy is stored at the closest contact that responded without it.
    pub fn iterative_find_value(&mut self, key: Id, done: Done<FindValueOutcome>) {
        self.iterative_find(FIND_VALUE, key, done);
    }

    /// Store `value` at the `k` closest contacts to `key`, then locally.
    ///
    /// A value shaped like a [StorageItem] keeps its publisher, anything else is
    /// published by this node. Resolves to the number of contacts that stored it.
    pub fn iterative_store(&mut self, key: Id, value: Value, done: Done<usize>) {
        let item = StorageItem::from_value(value, *self.id());

        self.store_item(key, item, done);
    }

    /// Republish items this node published that are older than
    /// [Config::republish_interval], and replicate items from other publishers
    /// older than [Config::replicate_interval], one at a time.
    ///
    /// Resolves to the number of items stored again, in a later [Self::tick].
    pub fn replicate(&mut self, done: Done<usize>) {
        let now = now_millis();
        let id = *self.id();

        let entries = match self.rpc.storage().entries() {
            Ok(entries) => entries,
            Err(error) => {
                warn!(context = "replicate", ?error, "Failed to read storage");
                done(self, 0);
                return;
            }
        };

        let due: VecDeque<(Id, StorageItem)> = entries
            .into_iter()
            .filter(|(_, item)| {
                let interval = if item.publisher == id {
                    self.config.republish_interval
                } else {
                    self.config.replicate_interval
                };

                item.age(now) >= interval
            })
            .collect();

        debug!(context = "replicate", due = due.len(), "Replicating items");

        self.replicate_next(due, 0, done);
    }

    /// Delete items older than [Config::expire_after], returning how many.
    pub fn expire(&mut self) -> Result<usize, StorageError> {
        self.expire_at(now_millis())
    }

    /// Run a lookup for a random id in every bucket, starting at `start_index`,
    /// that had no lookup within [Config::refresh_interval].
    pub fn refresh(&mut self, start_index: usize, done: Done<()>) {
        let stale = (start_index..self.rpc.routing_table().buckets().len()).find(|index| {
            self.lookups
                .get(index)
                .map_or(true, |at| at.elapsed() >= self.config.refresh_interval)
        });

        let Some(index) = stale else {
            done(self, ());
            return;
        };

        let key = self.id().random_in_bucket(index);
        trace!(context = "refresh", index, "Refreshing bucket");

        self.iterative_find_node(
            key,
            Box::new(move |node, _| node.defer(move |node| node.refresh(index + 1, done))),
        );
    }

    /// Insert `bootstrap` into the routing table, lookup this node's own id,
    /// then refresh every bucket further than the closest neighbor.
    ///
    /// Fails if the routing table is still empty after the lookup.
    pub fn join(&mut self, bootstrap: Contact, done: Done<Result<(), JoinError>>) {
        info!(context = "join", bootstrap = %bootstrap, "Joining");

        self.rpc.routing_table_mut().add_contact(bootstrap);

        let id = *self.id();

        self.iterative_find_node(
            id,
            Box::new(move |node, _| {
                if node.routing_table().is_empty() {
                    error!(context = "join", "Could not bootstrap the routing table");

                    let error = JoinError::NoPeers;
                    node.emit(NodeEvent::Error(error.to_string()));
                    done(node, Err(error));
                    return;
                }

                let start = node.routing_table().closest_bucket() + 1;

                node.refresh(
                    start,
                    Box::new(move |node, ()| {
                        info!(
                            context = "join",
                            table_size = node.routing_table().size(),
                            "Joined"
                        );

                        node.emit(NodeEvent::Joined);
                        done(node, Ok(()));
                    }),
                );
            }),
        );
    }

    // === Private Methods ===

    fn emit(&mut self, event: NodeEvent) {
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }

    /// Run `task` in the current or next [Self::tick] instead of growing the stack
    /// when the previous step resolved synchronously.
    fn defer(&mut self, task: impl FnOnce(&mut KademliaNode) + Send + 'static) {
        self.deferred.push_back(Box::new(task));
    }

    fn next_operation(&mut self) -> u64 {
        self.next_operation = self.next_operation.wrapping_add(1);
        self.next_operation
    }

    fn periodic_maintenance(&mut self) {
        if !self.rpc.is_listening() {
            return;
        }

        let decisions = self.maintenance.decisions();

        if decisions.should_refresh {
            self.refresh(0, Box::new(|_, ()| {}));
        }

        if decisions.should_replicate {
            self.replicate(Box::new(|node, replicated| {
                debug!(context = "maintenance", replicated, "Replicated items");

                match node.expire() {
                    Ok(expired) => debug!(context = "maintenance", expired, "Expired items"),
                    Err(error) => warn!(context = "maintenance", ?error, "Failed to expire items"),
                }
            }));
        }
    }

    fn drain_admissions(&mut self) {
        while !self.probing {
            let Some(contact) = self.admissions.pop_front() else {
                return;
            };

            let Some(outcome) = self.rpc.routing_table_mut().add_contact(contact.clone()) else {
                continue;
            };

            if outcome.contact_index.is_some() {
                continue;
            }

            let Some(head) = self
                .rpc
                .routing_table()
                .bucket(outcome.bucket_index)
                .and_then(Bucket::head)
                .cloned()
            else {
                continue;
            };

            if let Some(record) = self.pings.get(head.id()) {
                if record.responded && record.at.elapsed() < self.config.ping_throttle {
                    continue;
                }
            }

            trace!(context = "admission", head = %head, candidate = %contact, "Probing bucket head");

            let target = head.clone();

            self.probing = true;
            self.ping(
                &target,
                Box::new(move |node, result| node.finish_probe(head, contact, result.is_ok())),
            );
        }
    }

    fn finish_probe(&mut self, head: Contact, candidate: Contact, responded: bool) {
        self.pings.insert(
            *head.id(),
            PingRecord {
                at: Instant::now(),
                responded,
            },
        );

        if !responded {
            debug!(context = "admission", head = %head, candidate = %candidate, "Evicting unresponsive bucket head");

            let routing_table = self.rpc.routing_table_mut();
            routing_table.remove_contact(head.id());
            routing_table.add_contact(candidate);
        }

        self.probing = false;
        self.drain_admissions();
    }

    fn iterative_find(&mut self, method: &'static str, key: Id, done: Done<FindValueOutcome>) {
        let candidates = self
            .rpc
            .routing_table()
            .closest_contacts_to_key(&key, self.config.alpha);

        let bucket_index = self.id().bucket_index(&key);
        self.lookups.insert(bucket_index, Instant::now());

        let mut query = IterativeQuery::new(key, candidates, self.config.alpha, self.config.k);
        let step = query.start();

        let id = self.next_operation();
        self.lookups_inflight
            .insert(id, Lookup { method, query, done });

        self.advance_lookup(id, step);
    }

    fn advance_lookup(&mut self, id: u64, step: Step) {
        match step {
            Step::Wait => {}
            Step::Round { selection, .. } => {
                let Some(lookup) = self.lookups_inflight.get(&id) else {
                    return;
                };
                let method = lookup.method;
                let params = json!([lookup.query.key()]);

                for contact in selection {
                    let target = contact.clone();

                    self.send(
                        method,
                        params.clone(),
                        &contact,
                        Box::new(move |node, result| node.on_lookup_response(id, target, result)),
                    );
                }
            }
            Step::Finish(contacts) => {
                if let Some(lookup) = self.lookups_inflight.remove(&id) {
                    debug!(
                        context = "iterative_query",
                        method = lookup.method,
                        key = ?lookup.query.key(),
                        closest = contacts.len(),
                        "Lookup done"
                    );

                    (lookup.done)(self, FindValueOutcome::Contacts(contacts));
                }
            }
        }
    }

    fn on_lookup_response(&mut self, id: u64, from: Contact, result: Result<Value, RpcError>) {
        let own_id = *self.id();

        // Responses to a lookup that already finished resolve into nothing.
        let Some(lookup) = self.lookups_inflight.get_mut(&id) else {
            return;
        };

        let value = match result {
            Ok(value) => value,
            Err(error) => {
                trace!(context = "iterative_query", from = %from, ?error, "Lookup request failed");

                let step = lookup.query.on_error();
                self.advance_lookup(id, step);
                return;
            }
        };

        let entries = match value {
            Value::Array(entries) => entries,
            value => {
                if lookup.method == FIND_VALUE {
                    if let Ok(item) = serde_json::from_value::<StorageItem>(value) {
                        self.found_value(id, from, item);
                        return;
                    }
                }

                debug!(context = "iterative_query", from = %from, "Invalid lookup response");

                let step = lookup.query.on_error();
                self.advance_lookup(id, step);
                return;
            }
        };

        let contacts = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<Contact>(entry).ok())
            .filter(|contact| contact.id() != &own_id)
            .collect();

        let (added, step) = lookup.query.on_response(&from, contacts);

        for contact in added {
            self.update_contact(contact);
        }

        self.advance_lookup(id, step);
    }

    fn found_value(&mut self, id: u64, from: Contact, item: StorageItem) {
        let Some(mut lookup) = self.lookups_inflight.remove(&id) else {
            return;
        };

        lookup.query.responded(&from);
        let key = *lookup.query.key();

        debug!(context = "iterative_query", ?key, from = %from, "Found value");

        if let Some(target) = lookup.query.closest_active_except(from.id()) {
            self.send(STORE, json!([key, item]), &target, Box::new(|_, _| {}));
        }

        (lookup.done)(self, FindValueOutcome::Value { item, from });
    }

    fn store_item(&mut self, key: Id, item: StorageItem, done: Done<usize>) {
        self.iterative_find_node(
            key,
            Box::new(move |node, contacts| {
                let id = node.next_operation();

                node.stores_inflight.insert(
                    id,
                    StoreFanout {
                        key,
                        item,
                        targets: contacts.into(),
                        inflight: 0,
                        stored: 0,
                        done,
                    },
                );

                node.pump_stores(id);
            }),
        );
    }

    /// Keep up to `alpha` STORE calls of a fanout in flight, and finish it with
    /// a local copy once every target answered.
    fn pump_stores(&mut self, id: u64) {
        loop {
            let Some(fanout) = self.stores_inflight.get_mut(&id) else {
                return;
            };

            if fanout.inflight >= self.config.alpha {
                return;
            }

            let Some(target) = fanout.targets.pop_front() else {
                break;
            };

            fanout.inflight += 1;
            let params = json!([fanout.key, fanout.item]);

            self.send(
                STORE,
                params,
                &target,
                Box::new(move |node, result| {
                    if let Some(fanout) = node.stores_inflight.get_mut(&id) {
                        fanout.inflight -= 1;

                        if result.is_ok() {
                            fanout.stored += 1;
                        }
                    }

                    node.pump_stores(id);
                }),
            );
        }

        if self
            .stores_inflight
            .get(&id)
            .is_some_and(|fanout| fanout.inflight == 0)
        {
            if let Some(fanout) = self.stores_inflight.remove(&id) {
                if let Err(error) = self.rpc.storage_mut().put(fanout.key, fanout.item) {
                    warn!(context = "iterative_store", ?error, "Failed to store local copy");
                }

                debug!(context = "iterative_store", key = ?fanout.key, stored = fanout.stored, "Stored");

                (fanout.done)(self, fanout.stored);
            }
        }
    }

    fn replicate_next(&mut self, mut due: VecDeque<(Id, StorageItem)>, count: usize, done: Done<usize>) {
        let Some((key, item)) = due.pop_front() else {
            done(self, count);
            return;
        };

        self.store_item(
            key,
            item.refreshed(),
            Box::new(move |node, _| {
                node.defer(move |node| node.replicate_next(due, count + 1, done))
            }),
        );
    }

    fn expire_at(&mut self, now: u64) -> Result<usize, StorageError> {
        let storage = self.rpc.storage_mut();
        let mut expired = 0;

        for (key, item) in storage.entries()? {
            if item.age(now) >= self.config.expire_after {
                storage.del(&key)?;
                expired += 1;
            }
        }

        Ok(expired)
    }
}

impl Debug for KademliaNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KademliaNode")
            .field("rpc", &self.rpc)
            .field("config", &self.config)
            .field("lookups_inflight", &self.lookups_inflight.len())
            .field("stores_inflight", &self.stores_inflight.len())
            .field("admissions", &self.admissions.len())
            .finish()
    }
}
