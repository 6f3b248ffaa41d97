//! Convergence logic of iterative lookups, free of any IO.

use tracing::trace;

use crate::common::{Contact, ContactList, Id};

#[derive(Debug, Clone, PartialEq)]
/// What the owner of an [IterativeQuery] should do next.
pub enum Step {
    /// Responses of the current round are still outstanding.
    Wait,
    /// Send the lookup request to every contact of `selection`.
    Round {
        selection: Vec<Contact>,
        /// `false` for the final round confirming that no closer contact exists.
        continue_lookup: bool,
    },
    /// The lookup converged on these contacts, closest first.
    Finish(Vec<Contact>),
}

/// An iterative process of sending a request to the closest known contacts to
/// a key, `alpha` at a time, merging the contacts they return, and repeating
/// until a round fails to find a closer contact.
#[derive(Debug)]
pub struct IterativeQuery {
    shortlist: ContactList,
    /// Closest candidate as of the start of the current round.
    closest: Option<Id>,
    alpha: usize,
    k: usize,
    inflight: usize,
    continue_lookup: bool,
}

impl IterativeQuery {
    pub fn new(key: Id, candidates: Vec<Contact>, alpha: usize, k: usize) -> Self {
        let shortlist = ContactList::new(key, candidates);
        let closest = shortlist.closest().map(|contact| *contact.id());

        trace!(context = "iterative_query", ?key, candidates = shortlist.len(), "New Query");

        Self {
            shortlist,
            closest,
            alpha,
            k,
            inflight: 0,
            continue_lookup: true,
        }
    }

    // === Getters ===

    pub fn key(&self) -> &Id {
        self.shortlist.key()
    }

    pub fn shortlist(&self) -> &ContactList {
        &self.shortlist
    }

    /// Up to `k` contacts that responded, closest first.
    pub fn result(&self) -> Vec<Contact> {
        let mut active = self.shortlist.active();
        active.truncate(self.k);
        active
    }

    /// Closest contact that responded, other than `id`.
    pub fn closest_active_except(&self, id: &Id) -> Option<Contact> {
        self.shortlist
            .active()
            .into_iter()
            .find(|contact| contact.id() != id)
    }

    // === Public Methods ===

    /// First round, querying the `alpha` closest candidates.
    pub fn start(&mut self) -> Step {
        let selection = self.select(self.alpha);

        self.round(selection, true)
    }

    /// Record a successful response carrying `contacts`, returning the ones that
    /// were not candidates yet, and what to do next.
    pub fn on_response(&mut self, from: &Contact, contacts: Vec<Contact>) -> (Vec<Contact>, Step) {
        self.shortlist.responded(from);
        let added = self.shortlist.add(contacts);

        (added, self.settle())
    }

    /// Record that `from` responded, without settling its request.
    pub fn responded(&mut self, from: &Contact) {
        self.shortlist.responded(from);
    }

    /// Record a failed request, the contact is not retried in this lookup.
    pub fn on_error(&mut self) -> Step {
        self.settle()
    }

    // === Private Methods ===

    fn settle(&mut self) -> Step {
        self.inflight = self.inflight.saturating_sub(1);

        if self.inflight > 0 {
            return Step::Wait;
        }

        self.next_round()
    }

    fn next_round(&mut self) -> Step {
        let closest = self.shortlist.closest().map(|contact| *contact.id());
        let improved = closest != self.closest;

        if self.shortlist.active_len() >= self.k || (!improved && !self.continue_lookup) {
            return Step::Finish(self.result());
        }

        if !improved {
            let selection = self.select(self.k);

            return self.round(selection, false);
        }

        self.closest = closest;
        let selection = self.select(self.alpha);

        self.round(selection, true)
    }

    fn select(&self, limit: usize) -> Vec<Contact> {
        let mut selection = self.shortlist.uncontacted();
        selection.truncate(limit);
        selection
    }

    fn round(&mut self, selection: Vec<Contact>, continue_lookup: bool) -> Step {
        if selection.is_empty() {
            return Step::Finish(self.result());
        }

        for contact in &selection {
            self.shortlist.contacted(contact);
        }

        self.inflight = selection.len();
        self.continue_lookup = continue_lookup;

        Step::Round {
            selection,
            continue_lookup,
        }
    }
}
