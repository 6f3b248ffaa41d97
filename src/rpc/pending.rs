use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, Instant};

use crate::common::Contact;

/// An outstanding call waiting for its response.
pub struct PendingCall<H> {
    pub handler: H,
    pub target: Contact,
    pub sent_at: Instant,
}

impl<H> Debug for PendingCall<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("target", &self.target)
            .field("sent_at", &self.sent_at)
            .finish()
    }
}

/// Outstanding calls by message id.
pub struct PendingCalls<H> {
    calls: HashMap<String, PendingCall<H>>,
    timeout: Duration,
}

impl<H> PendingCalls<H> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            calls: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Add a new pending call O(1) amortized
    pub fn add(&mut self, id: String, target: Contact, handler: H) {
        self.calls.insert(
            id,
            PendingCall {
                handler,
                target,
                sent_at: Instant::now(),
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }

    /// Remove the pending call with this id, if any O(1) amortized
    pub fn remove(&mut self, id: &str) -> Option<PendingCall<H>> {
        self.calls.remove(id)
    }

    /// Remove and return every call that was sent at least `timeout` before `now`.
    pub fn expired_at(&mut self, now: Instant) -> Vec<PendingCall<H>> {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| now.saturating_duration_since(call.sent_at) >= self.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.calls.remove(id))
            .collect()
    }
}

impl<H> Debug for PendingCalls<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCalls")
            .field("len", &self.calls.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_remove() {
        let mut pending = PendingCalls::new(Duration::from_secs(10));
        let target = Contact::random();

        pending.add("a".into(), target.clone(), 1);

        assert!(pending.contains("a"));
        assert_eq!(pending.len(), 1);

        let call = pending.remove("a").unwrap();
        assert_eq!(call.handler, 1);
        assert_eq!(call.target, target);

        assert!(pending.remove("a").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn expired() {
        let timeout = Duration::from_secs(10);
        let mut pending = PendingCalls::new(timeout);

        pending.add("a".into(), Contact::random(), 1);
        pending.add("b".into(), Contact::random(), 2);

        assert!(pending.expired_at(Instant::now()).is_empty());

        let mut expired: Vec<i32> = pending
            .expired_at(Instant::now() + timeout)
            .into_iter()
            .map(|call| call.handler)
            .collect();
        expired.sort();

        assert_eq!(expired, vec![1, 2]);
        assert!(pending.is_empty());
    }
}
