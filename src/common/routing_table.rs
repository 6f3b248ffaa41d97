//! Kademlia routing table

use flume::{Receiver, Sender};

use crate::common::{Bucket, Contact, Id, ID_BITS, MAX_BUCKET_SIZE_K};

/// Changes to the membership of a [RoutingTable].
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingEvent {
    Added(Contact),
    Removed(Contact),
}

/// Where [RoutingTable::add_contact] put, or tried to put, a contact.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub bucket_index: usize,
    /// Position inside the bucket, `None` if the bucket was full.
    pub contact_index: Option<usize>,
    pub contact: Contact,
}

#[derive(Debug)]
/// Kademlia routing table, one [Bucket] per bit of the [Id] space.
pub struct RoutingTable {
    id: Id,
    buckets: Vec<Bucket>,
    observers: Vec<Sender<RoutingEvent>>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and a bucket size of [MAX_BUCKET_SIZE_K].
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, MAX_BUCKET_SIZE_K)
    }

    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            buckets: (0..ID_BITS).map(|_| Bucket::with_capacity(k)).collect(),
            observers: Vec::new(),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    // === Public Methods ===

    /// Subscribe to [RoutingEvent]s.
    pub fn subscribe(&mut self) -> Receiver<RoutingEvent> {
        let (sender, receiver) = flume::unbounded();
        self.observers.push(sender);

        receiver
    }

    /// Insert or refresh a contact in its bucket, see [Bucket::set].
    ///
    /// Returns `None` for this node's own id, which is never stored.
    pub fn add_contact(&mut self, contact: Contact) -> Option<AddOutcome> {
        if contact.id() == &self.id {
            return None;
        }

        let bucket_index = self.id.bucket_index(contact.id());
        let contact_index = self.buckets[bucket_index].set(contact.clone());

        if contact_index.is_some() {
            self.emit(RoutingEvent::Added(contact.clone()));
        }

        Some(AddOutcome {
            bucket_index,
            contact_index,
            contact,
        })
    }

    /// Remove a contact from this routing table.
    pub fn remove_contact(&mut self, id: &Id) -> Option<Contact> {
        let bucket_index = self.id.bucket_index(id);
        let removed = self.buckets[bucket_index].remove(id)?;

        self.emit(RoutingEvent::Removed(removed.clone()));

        Some(removed)
    }

    pub fn get_contact(&self, id: &Id) -> Option<&Contact> {
        self.buckets[self.id.bucket_index(id)].get(id)
    }

    /// Position of `id` inside its bucket.
    pub fn index_of(&self, id: &Id) -> Option<usize> {
        self.buckets[self.id.bucket_index(id)].index_of(id)
    }

    /// Return up to `n` contacts closest to `key`, in XOR order, never including `key`.
    ///
    /// Starts at the bucket `key` falls in, then everything closer to this node than
    /// that bucket, then the buckets further away one at a time.
    pub fn closest_contacts_to_key(&self, key: &Id, n: usize) -> Vec<Contact> {
        let index = self.id.bucket_index(key);

        let mut result = self.buckets[index].closest_to_key(key, n);

        if result.len() < n {
            let mut lower: Vec<Contact> = self.buckets[..index]
                .iter()
                .flat_map(|bucket| bucket.iter())
                .filter(|c| c.id() != key)
                .cloned()
                .collect();
            lower.sort_by_cached_key(|c| c.id().xor(key));

            result.extend(lower.into_iter().take(n - result.len()));
        }

        for bucket in &self.buckets[index + 1..] {
            if result.len() >= n {
                break;
            }

            let remaining = n - result.len();
            result.extend(bucket.closest_to_key(key, remaining));
        }

        result
    }

    /// Index of the closest non empty bucket, or the last bucket if the table is empty.
    pub fn closest_bucket(&self) -> usize {
        self.buckets
            .iter()
            .position(|bucket| !bucket.is_empty())
            .unwrap_or(ID_BITS - 1)
    }

    /// Export an owned vector of contacts from this routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    /// Turn this routing table to a list of bootstrapping contacts.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .map(|contact| contact.to_string())
            .collect()
    }

    // === Private Methods ===

    fn emit(&mut self, event: RoutingEvent) {
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        self.get_contact(id).is_some()
    }
}
