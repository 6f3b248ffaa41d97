//! Shortlist of candidates for a single iterative lookup.

use std::collections::HashSet;

use crate::common::{Contact, Id};

/// Candidates sorted by XOR distance to a lookup key, with the set of
/// contacts already queried and the set of those that answered.
#[derive(Debug, Clone)]
pub struct ContactList {
    key: Id,
    contacts: Vec<Contact>,
    contacted: HashSet<Id>,
    active: HashSet<Id>,
}

impl ContactList {
    pub fn new(key: Id, contacts: impl IntoIterator<Item = Contact>) -> Self {
        let mut list = Self {
            key,
            contacts: Vec::with_capacity(200),
            contacted: HashSet::new(),
            active: HashSet::new(),
        };

        list.add(contacts);

        list
    }

    // === Getters ===

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// The candidate closest to the key.
    pub fn closest(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Candidates that responded, closest first.
    pub fn active(&self) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| self.active.contains(c.id()))
            .cloned()
            .collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Candidates not queried yet, closest first.
    pub fn uncontacted(&self) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| !self.contacted.contains(c.id()))
            .cloned()
            .collect()
    }

    // === Public Methods ===

    /// Merge candidates in distance order, returning the ones that were not known yet.
    pub fn add(&mut self, contacts: impl IntoIterator<Item = Contact>) -> Vec<Contact> {
        let mut added = Vec::new();

        for contact in contacts {
            let seek = contact.id().xor(&self.key);

            if let Err(pos) = self.contacts.binary_search_by(|probe| {
                if probe.id() == contact.id() {
                    std::cmp::Ordering::Equal
                } else {
                    probe.id().xor(&self.key).cmp(&seek)
                }
            }) {
                self.contacts.insert(pos, contact.clone());
                added.push(contact);
            }
        }

        added
    }

    pub fn contacted(&mut self, contact: &Contact) {
        self.contacted.insert(*contact.id());
    }

    pub fn responded(&mut self, contact: &Contact) {
        self.contacted.insert(*contact.id());
        self.active.insert(*contact.id());
    }
}
