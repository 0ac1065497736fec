//! Per-class service trees: the ordered collections at the heart of the
//! B-WF2Q+ scheduler.
//!
//! Each scheduling node keeps, per priority class, an *active* set of
//! entities with pending work and an *idle* set of expired entities kept
//! around so that a reactivation can resume from the old finish time.
//! Both are ordered maps keyed by `(finish, start, seq)`: smallest virtual
//! finish first, ties broken by smaller start and then insertion order. A
//! start-ordered twin index over the active set supplies the minimum start
//! time in O(log N), which is what the virtual-time jump needs; it replaces
//! the subtree-minimum augmentation of the original rb-tree.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{EntityId, VirtTime};

/// Position of an entity inside a service tree.
pub(crate) type TreeKey = (VirtTime, VirtTime, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeKind {
    Active,
    Idle,
}

#[derive(Debug, Default)]
pub(crate) struct ServiceTree {
    active: BTreeMap<TreeKey, EntityId>,
    /// (start, seq) twin index over `active`.
    active_by_start: BTreeSet<(VirtTime, u64)>,
    idle: BTreeMap<TreeKey, EntityId>,
    /// System virtual time of this tree.
    pub vtime: VirtTime,
    /// Sum of the weights of all entities counted on this tree.
    pub wsum: u64,
    seq: u64,
}

impl ServiceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn idle_is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    pub fn active_insert(&mut self, start: VirtTime, finish: VirtTime, id: EntityId) -> TreeKey {
        self.seq += 1;
        let key = (finish, start, self.seq);
        self.active.insert(key, id);
        self.active_by_start.insert((start, self.seq));
        key
    }

    pub fn active_extract(&mut self, key: TreeKey) {
        let removed = self.active.remove(&key);
        debug_assert!(removed.is_some(), "active_extract of absent key");
        self.active_by_start.remove(&(key.1, key.2));
    }

    pub fn idle_insert(&mut self, start: VirtTime, finish: VirtTime, id: EntityId) -> TreeKey {
        self.seq += 1;
        let key = (finish, start, self.seq);
        self.idle.insert(key, id);
        key
    }

    pub fn idle_extract(&mut self, key: TreeKey) {
        let removed = self.idle.remove(&key);
        debug_assert!(removed.is_some(), "idle_extract of absent key");
    }

    /// Minimum virtual start time over the active set.
    pub fn min_active_start(&self) -> Option<VirtTime> {
        self.active_by_start.iter().next().map(|&(start, _)| start)
    }

    /// Virtual time the tree would jump to before the next selection:
    /// the current vtime, pushed up to the minimum active start if every
    /// active entity is still ineligible.
    pub fn vtime_jump(&self) -> VirtTime {
        match self.min_active_start() {
            Some(min_start) if min_start > self.vtime => min_start,
            _ => self.vtime,
        }
    }

    /// The eligible entity with the smallest virtual finish time, i.e. the
    /// first active entry whose start does not exceed `vtime`.
    pub fn first_eligible(&self, vtime: VirtTime) -> Option<(TreeKey, EntityId)> {
        self.active
            .iter()
            .find(|((_, start, _), _)| *start <= vtime)
            .map(|(&key, &id)| (key, id))
    }

    /// Idle entity with the smallest finish time.
    pub fn first_idle(&self) -> Option<(TreeKey, EntityId)> {
        self.idle.iter().next().map(|(&k, &id)| (k, id))
    }

    /// Idle entity with the largest finish time.
    pub fn last_idle(&self) -> Option<(TreeKey, EntityId)> {
        self.idle.iter().next_back().map(|(&k, &id)| (k, id))
    }

    /// All active entries in tree order.
    pub fn active_entries(&self) -> impl Iterator<Item = (&TreeKey, &EntityId)> {
        self.active.iter()
    }

    #[cfg(test)]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueId;

    fn q(n: u64) -> EntityId {
        EntityId::Queue(QueueId(n))
    }

    #[test]
    fn test_first_eligible_skips_future_starts() {
        let mut st = ServiceTree::new();
        // Smallest finish, but not eligible yet.
        st.active_insert(100, 200, q(1));
        st.active_insert(10, 500, q(2));
        let (_, id) = st.first_eligible(50).unwrap();
        assert_eq!(id, q(2));
        // Once vtime catches up, the smaller finish wins.
        let (_, id) = st.first_eligible(100).unwrap();
        assert_eq!(id, q(1));
    }

    #[test]
    fn test_vtime_jump_to_min_start() {
        let mut st = ServiceTree::new();
        st.active_insert(300, 400, q(1));
        st.active_insert(250, 600, q(2));
        st.vtime = 100;
        assert_eq!(st.vtime_jump(), 250);
        st.vtime = 270;
        assert_eq!(st.vtime_jump(), 270);
    }

    #[test]
    fn test_ties_broken_by_start_then_insertion() {
        let mut st = ServiceTree::new();
        st.active_insert(50, 100, q(1));
        st.active_insert(40, 100, q(2));
        let (_, id) = st.first_eligible(60).unwrap();
        assert_eq!(id, q(2), "equal finish resolves to smaller start");

        let mut st = ServiceTree::new();
        st.active_insert(40, 100, q(1));
        st.active_insert(40, 100, q(2));
        let (_, id) = st.first_eligible(60).unwrap();
        assert_eq!(id, q(1), "full ties resolve to insertion order");
    }

    #[test]
    fn test_extract_maintains_start_index() {
        let mut st = ServiceTree::new();
        let k1 = st.active_insert(10, 100, q(1));
        st.active_insert(20, 200, q(2));
        assert_eq!(st.min_active_start(), Some(10));
        st.active_extract(k1);
        assert_eq!(st.min_active_start(), Some(20));
    }

    #[test]
    fn test_idle_ordering() {
        let mut st = ServiceTree::new();
        st.idle_insert(0, 300, q(1));
        st.idle_insert(0, 100, q(2));
        st.idle_insert(0, 200, q(3));
        assert_eq!(st.first_idle().unwrap().1, q(2));
        assert_eq!(st.last_idle().unwrap().1, q(1));
    }
}
