//! Tracked processes: external programs whose pty output the broker shows.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use protocol::Registration;

use crate::pty::PtyPair;
use crate::session::{SessionId, SessionOrigin, TrackedId};

/// One registered external process.
#[derive(Debug)]
pub struct TrackedProcess {
    pub id: TrackedId,
    pub identity: String,
    pub pid: i32,
    pub pid_as_string: String,
    pub label: String,
    pub description: String,
    /// Owned until the entry is removed; dropping it closes both halves.
    pub pty_pair: Option<PtyPair>,
    pub associated_sessions: BTreeSet<SessionId>,
    pub registered_at: SystemTime,
}

impl TrackedProcess {
    pub fn new(id: TrackedId, registration: Registration, pty_pair: PtyPair) -> Self {
        Self {
            id,
            identity: registration.identity,
            pid: registration.pid,
            pid_as_string: registration.pid_as_string,
            label: registration.label,
            description: registration.description,
            pty_pair: Some(pty_pair),
            associated_sessions: BTreeSet::new(),
            registered_at: SystemTime::now(),
        }
    }

    /// Origin record stamped on every session created for this process.
    pub fn origin(&self) -> SessionOrigin {
        SessionOrigin::Tracked {
            tracked_id: self.id,
            identity: self.identity.clone(),
            pid: self.pid,
        }
    }
}

#[derive(Debug, Default)]
pub struct TrackedRegistry {
    entries: BTreeMap<TrackedId, TrackedProcess>,
    next_id: u64,
}

impl TrackedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new entry and return its freshly assigned id.
    pub fn insert(&mut self, registration: Registration, pty_pair: PtyPair) -> TrackedId {
        self.next_id += 1;
        let id = TrackedId(self.next_id);
        self.entries
            .insert(id, TrackedProcess::new(id, registration, pty_pair));
        id
    }

    pub fn get(&self, id: TrackedId) -> Option<&TrackedProcess> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: TrackedId) -> Option<&mut TrackedProcess> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: TrackedId) -> Option<TrackedProcess> {
        self.entries.remove(&id)
    }

    pub fn associate(&mut self, id: TrackedId, session: SessionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.associated_sessions.insert(session);
        }
    }

    /// Forget `session` wherever it is associated.
    pub fn dissociate(&mut self, session: SessionId) {
        for entry in self.entries.values_mut() {
            entry.associated_sessions.remove(&session);
        }
    }

    /// `(id, pid)` of every entry, in registration order.
    pub fn snapshot(&self) -> Vec<(TrackedId, i32)> {
        self.entries.values().map(|e| (e.id, e.pid)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedProcess> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(pid: i32) -> Registration {
        Registration::new("com.example.app", pid)
    }

    #[test]
    fn test_ids_increase() {
        let mut registry = TrackedRegistry::new();
        let a = registry.insert(registration(10), PtyPair::open(80, 24).unwrap());
        let b = registry.insert(registration(11), PtyPair::open(80, 24).unwrap());
        assert!(b > a);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot(), vec![(a, 10), (b, 11)]);
    }

    #[test]
    fn test_ids_not_reused_after_removal() {
        let mut registry = TrackedRegistry::new();
        let a = registry.insert(registration(10), PtyPair::open(80, 24).unwrap());
        registry.remove(a);
        let b = registry.insert(registration(10), PtyPair::open(80, 24).unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_association() {
        let mut registry = TrackedRegistry::new();
        let id = registry.insert(registration(10), PtyPair::open(80, 24).unwrap());
        registry.associate(id, SessionId(1));
        registry.associate(id, SessionId(2));
        registry.dissociate(SessionId(1));

        let entry = registry.get(id).unwrap();
        assert_eq!(
            entry.associated_sessions.iter().copied().collect::<Vec<_>>(),
            vec![SessionId(2)]
        );
        assert_eq!(entry.origin().tracked_id(), Some(id));
        assert_eq!(entry.origin().identity(), Some("com.example.app"));
    }

    #[test]
    fn test_entry_copies_registration() {
        let mut reg = registration(4321);
        reg.label = "App".into();
        reg.description = "an app".into();
        let mut registry = TrackedRegistry::new();
        let id = registry.insert(reg, PtyPair::open(80, 24).unwrap());

        let entry = registry.get(id).unwrap();
        assert_eq!(entry.pid, 4321);
        assert_eq!(entry.pid_as_string, "4321");
        assert_eq!(entry.label, "App");
        assert!(entry.pty_pair.is_some());
    }
}
