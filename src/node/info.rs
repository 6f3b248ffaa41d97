use crate::common::{Address, Id};

use super::KademliaNode;

/// Information and statistics about this Kademlia node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    address: Address,
    routing_table_size: usize,
    pending_calls: usize,
    stored_items: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Address other nodes reach this node at.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Number of contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending_calls
    }

    /// Number of items in local storage, zero if the storage failed to report.
    pub fn stored_items(&self) -> usize {
        self.stored_items
    }
}

impl From<&KademliaNode> for Info {
    fn from(node: &KademliaNode) -> Self {
        Self {
            id: *node.id(),
            address: node.contact().address().clone(),
            routing_table_size: node.routing_table().size(),
            pending_calls: node.rpc().pending_len(),
            stored_items: node.rpc().storage().len().unwrap_or_default(),
        }
    }
}
