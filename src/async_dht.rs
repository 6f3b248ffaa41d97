//! AsyncDht node.

use std::time::Duration;

use flume::{Receiver, Sender};
use serde_json::Value;

use crate::common::{Contact, Id, StorageError};
use crate::dht::{Dht, DhtWasShutdown};
use crate::node::actor::ActorMessage;
use crate::node::{FindValueOutcome, Info, JoinError, NodeEvent};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        self.request(ActorMessage::Info).await
    }

    /// The contact other nodes can join through.
    pub async fn contact(&self) -> Result<Contact, DhtWasShutdown> {
        let info = self.info().await?;

        Ok(Contact::new(*info.id(), info.address().clone()))
    }

    /// Snapshot of the contacts in the routing table.
    pub async fn routing_table(&self) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.request(ActorMessage::RoutingTable).await
    }

    /// Turn this node's routing table to a list of bootstraping contacts.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        self.request(ActorMessage::ToBootstrap).await
    }

    /// Receive [NodeEvent]s.
    pub async fn subscribe(&self) -> Result<Receiver<NodeEvent>, DhtWasShutdown> {
        self.request(ActorMessage::Subscribe).await
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Join the network through `bootstrap`.
    pub async fn join(&self, bootstrap: Contact) -> Result<(), JoinError> {
        self.request(|sender| ActorMessage::Join(bootstrap, sender))
            .await?
    }

    /// See [Dht::add_contact].
    pub async fn add_contact(&self, contact: Contact) -> Result<bool, DhtWasShutdown> {
        self.request(|sender| ActorMessage::AddContact(contact, sender))
            .await
    }

    /// See [Dht::ping].
    pub async fn ping(&self, contact: Contact) -> Result<Option<Duration>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::Ping(contact, sender))
            .await
    }

    /// See [Dht::find_node].
    pub async fn find_node(&self, key: Id) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindNode(key, sender))
            .await
    }

    /// See [Dht::find_value].
    pub async fn find_value(&self, key: Id) -> Result<FindValueOutcome, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindValue(key, sender))
            .await
    }

    /// See [Dht::store].
    pub async fn store(&self, key: Id, value: Value) -> Result<usize, DhtWasShutdown> {
        self.request(|sender| ActorMessage::Store(key, value, sender))
            .await
    }

    /// See [Dht::replicate].
    pub async fn replicate(&self) -> Result<usize, DhtWasShutdown> {
        self.request(ActorMessage::Replicate).await
    }

    /// See [Dht::expire].
    pub async fn expire(&self) -> Result<Result<usize, StorageError>, DhtWasShutdown> {
        self.request(ActorMessage::Expire).await
    }

    /// See [Dht::refresh].
    pub async fn refresh(&self, start_index: usize) -> Result<(), DhtWasShutdown> {
        self.request(|sender| ActorMessage::Refresh(start_index, sender))
            .await
    }

    // === Private Methods ===

    async fn request<T>(
        &self,
        message: impl FnOnce(Sender<T>) -> ActorMessage,
    ) -> Result<T, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<T>(1);

        self.0 .0.send(message(sender)).map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }
}

#[cfg(test)]
mod test {
    use futures::executor::block_on;
    use serde_json::json;

    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let mut a = Dht::new().unwrap().as_async();
            let b = a.clone();

            a.shutdown().await;

            assert_eq!(b.info().await.unwrap_err(), DhtWasShutdown);
        }

        block_on(test());
    }

    #[test]
    fn join_and_find_value() {
        async fn test() {
            let testnet = Testnet::new(4).unwrap();

            let a = Dht::builder()
                .bind(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .build()
                .unwrap()
                .as_async();

            let seed = testnet.bootstrap_contacts().remove(0);
            a.join(seed).await.unwrap();

            assert!(a.info().await.unwrap().routing_table_size() >= 4);

            let key = Id::random();
            let stored = testnet.nodes[2].store(key, json!([1, 2, 3])).unwrap();
            assert!(stored > 0);

            let outcome = a.find_value(key).await.unwrap();
            assert_eq!(outcome.item().map(|item| &item.value), Some(&json!([1, 2, 3])));
        }

        block_on(test());
    }
}
