//! Per-account record of messages that were already announced.

use crate::message::Uid;
use std::collections::BTreeSet;

/// Snapshot of the unseen identifiers already handled.
///
/// The cache is rebuilt after every unseen-check cycle from the server's
/// current unseen set, so identifiers that stop being unseen are forgotten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupCache {
    seen: BTreeSet<Uid>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.seen.contains(&uid)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    /// Splits `unseen` into identifiers still to be handled (in ascending
    /// order) and a fresh snapshot holding the ones already handled.
    pub fn partition(&self, unseen: &[Uid]) -> (Vec<Uid>, DedupCache) {
        let mut pending = Vec::new();
        let mut carried = DedupCache::new();
        for &uid in unseen {
            if self.contains(uid) {
                carried.insert(uid);
            } else {
                pending.push(uid);
            }
        }
        pending.sort_unstable();
        pending.dedup();
        (pending, carried)
    }

    pub fn insert(&mut self, uid: Uid) {
        self.seen.insert(uid);
    }

    /// Replaces the contents with `snapshot`.
    pub fn replace(&mut self, snapshot: DedupCache) {
        *self = snapshot;
    }

    pub fn iter(&self) -> impl Iterator<Item = Uid> + '_ {
        self.seen.iter().copied()
    }
}

impl FromIterator<Uid> for DedupCache {
    fn from_iter<I: IntoIterator<Item = Uid>>(iter: I) -> Self {
        Self {
            seen: iter.into_iter().collect(),
        }
    }
}
