//! Bounded, ordered collection of contacts sharing a distance prefix.

use std::slice::Iter;

use crate::common::{Contact, Id};

/// K = the default maximum size of a bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Contacts are ordered by how recently they were confirmed: new contacts enter
/// at the head, contacts seen again move to the tail.
///
/// When the bucket is full, the head is the one to probe before evicting.
#[derive(Debug, Clone)]
pub struct Bucket {
    contacts: Vec<Contact>,
    capacity: usize,
}

impl Bucket {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUCKET_SIZE_K)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Bucket {
            contacts: Vec::with_capacity(capacity),
            capacity,
        }
    }

    // === Getters ===

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn head(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub fn tail(&self) -> Option<&Contact> {
        self.contacts.last()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Insert or refresh a contact, returning its resulting index.
    ///
    /// - A known id is replaced by `contact` and moved to the tail.
    /// - An unknown id becomes the head if there is room.
    /// - An unknown id is rejected with `None` if the bucket is full.
    pub fn set(&mut self, contact: Contact) -> Option<usize> {
        if let Some(index) = self.index_of(contact.id()) {
            self.contacts.remove(index);
            self.contacts.push(contact);

            Some(self.contacts.len() - 1)
        } else if self.contacts.len() < self.capacity {
            self.contacts.insert(0, contact);

            Some(0)
        } else {
            None
        }
    }

    pub fn index_of(&self, id: &Id) -> Option<usize> {
        self.contacts.iter().position(|c| c.id() == id)
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id() == id)
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.index_of(id)?;

        Some(self.contacts.remove(index))
    }

    /// Contacts sorted by XOR distance to `key`, excluding `key` itself.
    pub fn closest_to_key(&self, key: &Id, limit: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .contacts
            .iter()
            .filter(|c| c.id() != key)
            .cloned()
            .collect();

        contacts.sort_by_cached_key(|c| c.id().xor(key));
        contacts.truncate(limit);

        contacts
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &Id) -> bool {
        self.index_of(id).is_some()
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use crate::common::Address;

    use super::*;

    fn entry(i: usize) -> Contact {
        let id = Id::from_str(&format!("{:040}", i)).unwrap();

        Contact::new(id, Address::new("127.0.0.1", 8080))
    }

    fn filled() -> (Bucket, Vec<Contact>) {
        let mut bucket = Bucket::new();
        let entries: Vec<Contact> = (0..MAX_BUCKET_SIZE_K).map(entry).collect();

        for contact in &entries {
            bucket.set(contact.clone());
        }

        (bucket, entries)
    }

    #[test]
    fn new_contacts_enter_at_the_head() {
        let mut bucket = Bucket::new();

        assert_eq!(bucket.set(entry(0)), Some(0));
        assert_eq!(bucket.set(entry(1)), Some(0));

        assert_eq!(bucket.head().unwrap().id(), entry(1).id());
        assert_eq!(bucket.index_of(entry(0).id()), Some(1));
    }

    #[test]
    fn should_not_add_more_than_k() {
        let (mut bucket, entries) = filled();

        assert!(bucket.is_full());
        assert_eq!(bucket.set(Contact::random()), None);
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE_K);

        for contact in entries {
            assert!(bucket.contains(contact.id()));
        }
    }

    #[test]
    fn known_contacts_move_to_the_tail() {
        let (mut bucket, entries) = filled();

        assert_eq!(bucket.set(entries[4].clone()), Some(19));

        assert_eq!(bucket.index_of(entries[6].id()), Some(13));
        assert_eq!(bucket.index_of(entries[4].id()), Some(19));
        assert_eq!(bucket.index_of(entries[19].id()), Some(0));

        assert_eq!(bucket.head().unwrap().id(), entries[19].id());
        assert_eq!(bucket.tail().unwrap().id(), entries[4].id());
    }

    #[test]
    fn replaces_contact_information() {
        let mut bucket = Bucket::new();
        let contact = entry(1);
        let moved = Contact::new(*contact.id(), Address::new("10.0.0.1", 1));

        bucket.set(contact);
        bucket.set(entry(2));
        bucket.set(moved.clone());

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.tail(), Some(&moved));
    }

    #[test]
    fn remove() {
        let (mut bucket, entries) = filled();

        assert_eq!(bucket.remove(entries[3].id()), Some(entries[3].clone()));
        assert_eq!(bucket.remove(entries[3].id()), None);
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE_K - 1);
        assert!(!bucket.is_full());
    }

    #[test]
    fn closest_to_key() {
        let (bucket, _) = filled();
        let key = Id::from_str(&format!("{:040}", 10)).unwrap();

        let closest: Vec<String> = bucket
            .closest_to_key(&key, MAX_BUCKET_SIZE_K)
            .iter()
            .map(|c| c.id().to_string()[38..].to_string())
            .collect();

        assert_eq!(
            closest,
            [
                "11", "12", "13", "14", "15", "16", "17", "18", "19", "00", "01", "02", "03",
                "04", "05", "06", "07", "08", "09"
            ]
        );

        assert_eq!(bucket.closest_to_key(&key, 3).len(), 3);
    }
}
