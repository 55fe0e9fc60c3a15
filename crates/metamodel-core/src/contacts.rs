//! Bounded FIFO of an agent's known contacts.

use crate::substrate::DistributedId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ordered contact list, oldest first.
///
/// The list itself is unbounded; the maintainer enforces the capacity and keeps
/// one outgoing `CONTACT` edge per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactList(VecDeque<DistributedId>);

impl ContactList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &DistributedId) -> bool {
        self.0.contains(id)
    }

    /// Oldest contact.
    #[must_use]
    pub fn front(&self) -> Option<DistributedId> {
        self.0.front().copied()
    }

    pub fn push_back(&mut self, id: DistributedId) {
        self.0.push_back(id);
    }

    pub fn pop_front(&mut self) -> Option<DistributedId> {
        self.0.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = DistributedId> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<DistributedId> {
        self.iter().collect()
    }
}

impl FromIterator<DistributedId> for ContactList {
    fn from_iter<I: IntoIterator<Item = DistributedId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
