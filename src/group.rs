//! Scheduling nodes (groups) and their per-node scheduler state.

use std::collections::BTreeMap;

use crate::service_tree::ServiceTree;
use crate::types::{EntityId, GroupId, QueueId, Sector, Weight, NR_IOPRIO_LEVELS, NR_IO_CLASSES};
use crate::wf2q::Entity;

/// Scheduler state of one node: one service tree per priority class plus
/// the in-service bookkeeping for the node's children.
#[derive(Debug)]
pub(crate) struct SchedData {
    pub trees: [ServiceTree; NR_IO_CLASSES],
    /// Child entity currently being served, extracted from its tree.
    pub in_service: Option<EntityId>,
    /// Child entity that would be served next, cached for the preemption
    /// check on activations.
    pub next_in_service: Option<EntityId>,
}

impl SchedData {
    pub fn new() -> Self {
        SchedData {
            trees: [ServiceTree::new(), ServiceTree::new(), ServiceTree::new()],
            in_service: None,
            next_in_service: None,
        }
    }
}

/// An inner node of the scheduling hierarchy. Queues of the node's
/// processes are children of this node; child groups hang below it through
/// their own entities. The root group is permanent and has no entity.
#[derive(Debug)]
pub(crate) struct Group {
    pub id: GroupId,
    pub parent: Option<GroupId>,
    /// The group's own schedulable identity within its parent; `None` for
    /// the root group, which is never scheduled itself.
    pub entity: Option<Entity>,
    pub sched: SchedData,

    /// Queues of this node keyed by the sector of their next request, for
    /// cooperator lookup. A queue whose next-request sector collides with
    /// an existing key is simply left out.
    pub pos_tree: BTreeMap<Sector, QueueId>,

    /// Shared async queues: one slot per priority level for the RT and BE
    /// classes, so async requests of equal priority coalesce.
    pub async_queues: [[Option<QueueId>; NR_IOPRIO_LEVELS]; 2],
    pub async_idle_queue: Option<QueueId>,
}

impl Group {
    pub fn new_root(id: GroupId) -> Self {
        Group {
            id,
            parent: None,
            entity: None,
            sched: SchedData::new(),
            pos_tree: BTreeMap::new(),
            async_queues: [[None; NR_IOPRIO_LEVELS]; 2],
            async_idle_queue: None,
        }
    }

    pub fn new_child(id: GroupId, parent: GroupId, weight: Weight) -> Self {
        Group {
            id,
            parent: Some(parent),
            entity: Some(Entity::new(parent, crate::types::IoClass::Be, weight)),
            sched: SchedData::new(),
            pos_tree: BTreeMap::new(),
            async_queues: [[None; NR_IOPRIO_LEVELS]; 2],
            async_idle_queue: None,
        }
    }

    /// All async slots of the node, for teardown and end-of-raising sweeps.
    pub fn async_slots(&self) -> Vec<QueueId> {
        let mut out = Vec::new();
        for row in &self.async_queues {
            for q in row.iter().flatten() {
                out.push(*q);
            }
        }
        if let Some(q) = self.async_idle_queue {
            out.push(q);
        }
        out
    }
}
