use std::time::Duration;

use flume::{Receiver, Sender, TryRecvError};
use serde_json::Value;
use tracing::{debug, info};

use crate::common::{Contact, Id, StorageError};

use super::{FindValueOutcome, Info, JoinError, KademliaNode, NodeEvent};

#[derive(Debug)]
/// Owns a [KademliaNode] inside the Dht thread loop.
pub(crate) struct Actor {
    node: KademliaNode,
    receiver: Receiver<ActorMessage>,
}

impl Actor {
    pub fn new(node: KademliaNode, receiver: Receiver<ActorMessage>) -> Self {
        info!(context = "actor", contact = %node.contact(), "Kadnode listening");

        Self { node, receiver }
    }

    /// Tick the node until every handle is dropped or shutdown is requested.
    pub fn run(mut self) {
        let shutdown = loop {
            match self.receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => break Some(sender),
                Ok(message) => self.handle(message),
                Err(TryRecvError::Disconnected) => break None,
                Err(TryRecvError::Empty) => {}
            }

            self.node.tick();
        };

        debug!(context = "actor", "Kadnode actor thread was shutdown");

        // Release the transport before confirming the shutdown.
        drop(self);

        if let Some(sender) = shutdown {
            let _ = sender.send(());
        }
    }

    fn handle(&mut self, message: ActorMessage) {
        let node = &mut self.node;

        match message {
            ActorMessage::Info(sender) => {
                let _ = sender.send(node.info());
            }
            ActorMessage::Join(bootstrap, sender) => node.join(
                bootstrap,
                Box::new(move |_, result| {
                    let _ = sender.send(result);
                }),
            ),
            ActorMessage::FindNode(key, sender) => node.iterative_find_node(
                key,
                Box::new(move |_, contacts| {
                    let _ = sender.send(contacts);
                }),
            ),
            ActorMessage::FindValue(key, sender) => node.iterative_find_value(
                key,
                Box::new(move |_, outcome| {
                    let _ = sender.send(outcome);
                }),
            ),
            ActorMessage::Store(key, value, sender) => node.iterative_store(
                key,
                value,
                Box::new(move |_, stored| {
                    let _ = sender.send(stored);
                }),
            ),
            ActorMessage::Ping(contact, sender) => node.ping(
                &contact,
                Box::new(move |_, result| {
                    let _ = sender.send(result.ok());
                }),
            ),
            ActorMessage::Replicate(sender) => node.replicate(Box::new(move |_, replicated| {
                let _ = sender.send(replicated);
            })),
            ActorMessage::Expire(sender) => {
                let _ = sender.send(node.expire());
            }
            ActorMessage::Refresh(start_index, sender) => node.refresh(
                start_index,
                Box::new(move |_, ()| {
                    let _ = sender.send(());
                }),
            ),
            ActorMessage::AddContact(contact, sender) => {
                let added = node
                    .rpc_mut()
                    .routing_table_mut()
                    .add_contact(contact)
                    .is_some_and(|outcome| outcome.contact_index.is_some());

                let _ = sender.send(added);
            }
            ActorMessage::RoutingTable(sender) => {
                let _ = sender.send(node.routing_table().contacts());
            }
            ActorMessage::ToBootstrap(sender) => {
                let _ = sender.send(node.routing_table().to_bootstrap());
            }
            ActorMessage::Subscribe(sender) => {
                let _ = sender.send(node.subscribe());
            }
            ActorMessage::Shutdown(sender) => {
                let _ = sender.send(());
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Join(Contact, Sender<Result<(), JoinError>>),
    FindNode(Id, Sender<Vec<Contact>>),
    FindValue(Id, Sender<FindValueOutcome>),
    Store(Id, Value, Sender<usize>),
    Ping(Contact, Sender<Option<Duration>>),
    Replicate(Sender<usize>),
    Expire(Sender<Result<usize, StorageError>>),
    Refresh(usize, Sender<()>),
    AddContact(Contact, Sender<bool>),
    RoutingTable(Sender<Vec<Contact>>),
    ToBootstrap(Sender<Vec<String>>),
    Subscribe(Sender<Receiver<NodeEvent>>),
    Shutdown(Sender<()>),
}
