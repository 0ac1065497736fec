//! The hierarchical B-WF2Q+ engine.
//!
//! Entities (leaf queues and inner groups) are scheduled within their parent
//! node by virtual finish time, among those whose virtual start time does
//! not exceed the node's virtual time. Selection descends the hierarchy
//! priority-class-first until a leaf queue is reached. Budgets are expressed
//! in sectors; a weight-raised entity consumes virtual time more slowly in
//! proportion to its raised weight.
//!
//! All state lives in the id-keyed arenas owned by [`Scheduler`]; the
//! methods here are the only writers of entity timestamps and of the
//! per-node service trees.

use log::warn;

use crate::scheduler::Scheduler;
use crate::service_tree::{TreeKey, TreeKind};
use crate::types::{
    EntityId, GroupId, IoClass, QueueId, TimeNs, VirtTime, Weight, MAX_WEIGHT, MIN_WEIGHT,
    NSEC_PER_MSEC, NR_IO_CLASSES,
};

/// Fixed-point shift for virtual-time deltas.
pub(crate) const SERVICE_SHIFT: u32 = 22;

/// The idle class is served at least once per this interval even while
/// higher classes stay backlogged.
pub(crate) const CLASS_IDLE_TIMEOUT: TimeNs = 200 * NSEC_PER_MSEC;

/// Virtual-time cost of `service` sectors at `weight` (an entity weight or
/// a tree's weight sum).
pub(crate) fn vt_delta(service: u64, weight: u64) -> VirtTime {
    (service << SERVICE_SHIFT) / weight.max(1)
}

/// Scheduling state shared by queues and groups.
#[derive(Debug, Clone)]
pub(crate) struct Entity {
    /// Node whose service trees this entity is scheduled on.
    pub parent: GroupId,
    pub ioprio_class: IoClass,
    pub new_ioprio_class: IoClass,

    /// Effective weight: `orig_weight` times the raising coefficient.
    pub weight: Weight,
    pub orig_weight: Weight,
    pub new_weight: Weight,
    /// A weight or class change is pending and applies on next activation.
    pub prio_changed: bool,

    pub start: VirtTime,
    pub finish: VirtTime,
    /// Sectors this entity may consume during the current activation.
    pub budget: u64,
    /// Sectors charged so far during the current activation.
    pub service: u64,

    /// The entity holds a reference on a service tree (active or idle).
    pub on_st: bool,
    pub tree: Option<(TreeKind, TreeKey)>,
    /// Weight this entity is counted under in its weight-counter tree.
    pub weight_counter: Option<Weight>,
}

impl Entity {
    pub fn new(parent: GroupId, class: IoClass, weight: Weight) -> Self {
        Entity {
            parent,
            ioprio_class: class,
            new_ioprio_class: class,
            weight,
            orig_weight: weight,
            new_weight: weight,
            prio_changed: true,
            start: 0,
            finish: 0,
            budget: 0,
            service: 0,
            on_st: false,
            tree: None,
            weight_counter: None,
        }
    }
}

impl Scheduler {
    pub(crate) fn entity(&self, e: EntityId) -> &Entity {
        match e {
            EntityId::Queue(q) => &self.queues[&q].entity,
            EntityId::Group(g) => self.groups[&g]
                .entity
                .as_ref()
                .expect("root group has no schedulable entity"),
        }
    }

    pub(crate) fn entity_mut(&mut self, e: EntityId) -> &mut Entity {
        match e {
            EntityId::Queue(q) => &mut self.queues.get_mut(&q).unwrap().entity,
            EntityId::Group(g) => self
                .groups
                .get_mut(&g)
                .unwrap()
                .entity
                .as_mut()
                .expect("root group has no schedulable entity"),
        }
    }

    /// The entity scheduling `e`'s parent node, if that node is not the root.
    pub(crate) fn parent_entity(&self, e: EntityId) -> Option<EntityId> {
        let g = self.entity(e).parent;
        if g == self.root_group {
            None
        } else {
            Some(EntityId::Group(g))
        }
    }

    /// (node, class) locating the service tree `e` belongs to.
    fn st_loc(&self, e: EntityId) -> (GroupId, IoClass) {
        let ent = self.entity(e);
        (ent.parent, ent.ioprio_class)
    }

    pub(crate) fn st(&self, g: GroupId, class: IoClass) -> &crate::service_tree::ServiceTree {
        &self.groups[&g].sched.trees[class.index()]
    }

    pub(crate) fn st_mut(
        &mut self,
        g: GroupId,
        class: IoClass,
    ) -> &mut crate::service_tree::ServiceTree {
        &mut self.groups.get_mut(&g).unwrap().sched.trees[class.index()]
    }

    fn calc_finish(&mut self, e: EntityId, amount: u64) {
        let ent = self.entity_mut(e);
        ent.finish = ent.start + vt_delta(amount, ent.weight as u64);
    }

    // ---- tree insertion/extraction with list and counter bookkeeping ----

    fn active_insert(&mut self, e: EntityId) {
        let (g, class) = self.st_loc(e);
        let (start, finish) = {
            let ent = self.entity(e);
            (ent.start, ent.finish)
        };
        let key = self.st_mut(g, class).active_insert(start, finish, e);
        self.entity_mut(e).tree = Some((TreeKind::Active, key));
        match e {
            EntityId::Queue(q) => {
                self.active_list.insert(q);
            }
            EntityId::Group(_) => self.weights_tree_add(e),
        }
    }

    pub(crate) fn active_extract(&mut self, e: EntityId) {
        let (g, class) = self.st_loc(e);
        let key = match self.entity(e).tree {
            Some((TreeKind::Active, key)) => key,
            other => {
                warn!("active_extract: entity {e:?} not on active tree ({other:?})");
                return;
            }
        };
        self.st_mut(g, class).active_extract(key);
        self.entity_mut(e).tree = None;
        match e {
            EntityId::Queue(q) => {
                self.active_list.remove(&q);
            }
            EntityId::Group(_) => self.weights_tree_remove(e),
        }
    }

    fn idle_insert(&mut self, e: EntityId) {
        let (g, class) = self.st_loc(e);
        let (start, finish) = {
            let ent = self.entity(e);
            (ent.start, ent.finish)
        };
        let key = self.st_mut(g, class).idle_insert(start, finish, e);
        self.entity_mut(e).tree = Some((TreeKind::Idle, key));
        if let EntityId::Queue(q) = e {
            self.idle_list.insert(q);
        }
    }

    fn idle_extract(&mut self, e: EntityId) {
        let (g, class) = self.st_loc(e);
        let key = match self.entity(e).tree {
            Some((TreeKind::Idle, key)) => key,
            other => {
                warn!("idle_extract: entity {e:?} not on idle tree ({other:?})");
                return;
            }
        };
        self.st_mut(g, class).idle_extract(key);
        self.entity_mut(e).tree = None;
        if let EntityId::Queue(q) = e {
            self.idle_list.remove(&q);
        }
    }

    /// Drop the service-tree reference of an entity that is on no tree.
    fn forget_entity(&mut self, e: EntityId) {
        let (g, class) = self.st_loc(e);
        let weight = self.entity(e).weight;
        debug_assert!(self.entity(e).tree.is_none());
        self.entity_mut(e).on_st = false;
        let st = self.st_mut(g, class);
        st.wsum = st.wsum.saturating_sub(weight as u64);
        if let EntityId::Queue(q) = e {
            self.put_queue(q);
        }
    }

    fn put_idle_entity(&mut self, e: EntityId) {
        self.idle_extract(e);
        self.forget_entity(e);
    }

    /// Garbage-collect idle entities whose finish time fell behind the
    /// tree's virtual time; with an empty active tree the virtual time is
    /// first pushed past the whole idle set.
    fn forget_idle(&mut self, g: GroupId, class: IoClass) {
        let (active_empty, last_idle, first_idle, vtime) = {
            let st = self.st(g, class);
            (
                st.active_is_empty(),
                st.last_idle(),
                st.first_idle(),
                st.vtime,
            )
        };

        if active_empty {
            if let Some(((finish, _, _), _)) = last_idle {
                // Nothing active and the whole idle tree is in the past:
                // walk the virtual time just beyond it, so every idle
                // entity becomes forgettable.
                if finish <= vtime {
                    self.st_mut(g, class).vtime = finish + 1;
                }
            }
        }

        let vtime = self.st(g, class).vtime;
        if let Some(((finish, _, _), id)) = first_idle {
            if finish <= vtime {
                self.put_idle_entity(id);
            }
        }
    }

    // ---- weight counters ----

    pub(crate) fn weights_tree_add(&mut self, e: EntityId) {
        if self.entity(e).weight_counter.is_some() {
            return;
        }
        let w = self.entity(e).weight;
        let counters = match e {
            EntityId::Queue(_) => &mut self.queue_weights,
            EntityId::Group(_) => &mut self.group_weights,
        };
        *counters.entry(w).or_insert(0) += 1;
        self.entity_mut(e).weight_counter = Some(w);
    }

    pub(crate) fn weights_tree_remove(&mut self, e: EntityId) {
        let Some(w) = self.entity(e).weight_counter else {
            return;
        };
        let counters = match e {
            EntityId::Queue(_) => &mut self.queue_weights,
            EntityId::Group(_) => &mut self.group_weights,
        };
        match counters.get_mut(&w) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                counters.remove(&w);
            }
            None => warn!("weight counter missing for weight {w}"),
        }
        self.entity_mut(e).weight_counter = None;
    }

    /// True when all busy queues and all active groups share one weight, so
    /// every queue must receive the same share of the throughput.
    pub(crate) fn symmetric_scenario(&self) -> bool {
        self.queue_weights.len() < 2 && self.group_weights.len() < 2
    }

    // ---- weight/priority changes ----

    /// Apply a pending weight or class change; returns the location of the
    /// (possibly different) service tree the entity now belongs to.
    pub(crate) fn update_weight_prio(&mut self, e: EntityId) -> (GroupId, IoClass) {
        let old_loc = self.st_loc(e);
        if !self.entity(e).prio_changed {
            return old_loc;
        }

        let prev_weight = self.entity(e).weight;
        {
            let st = self.st_mut(old_loc.0, old_loc.1);
            st.wsum = st.wsum.saturating_sub(prev_weight as u64);
        }

        {
            let ent = self.entity_mut(e);
            if ent.new_weight != ent.orig_weight {
                ent.orig_weight = ent.new_weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
            }
            ent.ioprio_class = ent.new_ioprio_class;
            ent.prio_changed = false;
        }

        let wr_coeff = match e {
            EntityId::Queue(q) => self.queues[&q].wr_coeff,
            EntityId::Group(_) => 1,
        };
        let new_weight = self.entity(e).orig_weight * wr_coeff;

        if prev_weight != new_weight {
            self.weights_tree_remove(e);
        }
        self.entity_mut(e).weight = new_weight;
        // Weight-raised queues are deliberately kept out of the counters:
        // raising is transient and would defeat the symmetry detection.
        if prev_weight != new_weight && wr_coeff == 1 {
            if let EntityId::Queue(q) = e {
                if self.queues[&q].busy && self.queues[&q].dispatched == 0 {
                    self.weights_tree_add(e);
                }
            }
        }

        let new_loc = self.st_loc(e);
        {
            let st = self.st_mut(new_loc.0, new_loc.1);
            st.wsum += new_weight as u64;
        }
        if new_loc != old_loc {
            let vtime = self.st(new_loc.0, new_loc.1).vtime;
            self.entity_mut(e).start = vtime;
        }
        new_loc
    }

    // ---- activation ----

    fn do_activate_entity(&mut self, e: EntityId, non_blocking_wait_rq: bool) {
        let parent = self.entity(e).parent;
        let mut backshifted = false;

        if self.groups[&parent].sched.in_service == Some(e) {
            // Requeueing the in-service entity: charge only the service it
            // actually received, then chain the next slot to it.
            debug_assert!(self.entity(e).tree.is_none());
            let service = self.entity(e).service;
            self.calc_finish(e, service);
            let ent = self.entity_mut(e);
            ent.start = ent.finish;
            self.groups.get_mut(&parent).unwrap().sched.in_service = None;
        } else if matches!(self.entity(e).tree, Some((TreeKind::Active, _))) {
            // Requeue due to a change below: keep the old start time.
            self.active_extract(e);
        } else {
            let loc = self.st_loc(e);
            let st_vtime = self.st(loc.0, loc.1).vtime;
            let finish = self.entity(e).finish;

            // A queue that was idling for a request which then arrived in
            // time resumes from its old finish time, recovering the
            // service hole instead of being timestamped as newly arrived.
            let min_vstart = if non_blocking_wait_rq && finish > st_vtime {
                backshifted = true;
                finish
            } else {
                st_vtime
            };

            match self.entity(e).tree {
                Some((TreeKind::Idle, _)) => {
                    self.idle_extract(e);
                    let ent = self.entity_mut(e);
                    ent.start = min_vstart.max(ent.finish);
                }
                None => {
                    let weight = self.entity(e).weight;
                    self.entity_mut(e).start = min_vstart;
                    self.st_mut(loc.0, loc.1).wsum += weight as u64;
                    if let EntityId::Queue(q) = e {
                        self.queues.get_mut(&q).unwrap().refs += 1;
                    }
                    self.entity_mut(e).on_st = true;
                }
                Some((TreeKind::Active, _)) => unreachable!(),
            }
        }

        let new_loc = self.update_weight_prio(e);
        let budget = self.entity(e).budget;
        self.calc_finish(e, budget);

        // Bound the drift between back-shifted timestamps and the system
        // virtual time; a raised queue keeps proportionally more of its
        // back-shift.
        if backshifted {
            let vtime = self.st(new_loc.0, new_loc.1).vtime;
            let finish = self.entity(e).finish;
            if vtime > finish {
                let mut delta = vtime - finish;
                if let EntityId::Queue(q) = e {
                    delta /= self.queues[&q].wr_coeff as u64;
                }
                let ent = self.entity_mut(e);
                ent.start += delta;
                ent.finish += delta;
            }
        }

        self.active_insert(e);
    }

    /// Activate a queue's entity and propagate up the hierarchy as long as
    /// the next-in-service choice of each traversed node changes.
    pub(crate) fn activate_entity_chain(&mut self, q: QueueId, non_blocking_wait_rq: bool) {
        let mut e = EntityId::Queue(q);
        loop {
            self.do_activate_entity(e, non_blocking_wait_rq);
            let parent = self.entity(e).parent;
            if !self.update_next_in_service(parent) {
                break;
            }
            match self.parent_entity(e) {
                Some(pe) => e = pe,
                None => break,
            }
        }
    }

    // ---- deactivation ----

    /// Returns whether the parent node's next-in-service was recomputed.
    pub(crate) fn do_deactivate_entity(&mut self, e: EntityId, requeue: bool) -> bool {
        let parent = self.entity(e).parent;
        let was_in_service = self.groups[&parent].sched.in_service == Some(e);

        if !self.entity(e).on_st {
            return false;
        }
        debug_assert!(!(was_in_service && self.entity(e).tree.is_some()));

        if was_in_service {
            let service = self.entity(e).service;
            self.calc_finish(e, service);
            self.groups.get_mut(&parent).unwrap().sched.in_service = None;
        } else {
            match self.entity(e).tree {
                Some((TreeKind::Active, _)) => self.active_extract(e),
                Some((TreeKind::Idle, _)) => self.idle_extract(e),
                None => {}
            }
        }

        let mut ret = false;
        if was_in_service || self.groups[&parent].sched.next_in_service == Some(e) {
            ret = self.update_next_in_service(parent);
        }

        let (g, class) = self.st_loc(e);
        let vtime = self.st(g, class).vtime;
        if !requeue || self.entity(e).finish <= vtime {
            self.forget_entity(e);
        } else {
            self.idle_insert(e);
        }
        ret
    }

    /// Deactivate a queue's entity, propagating the dequeue through any
    /// parents it leaves empty and requeueing the ones still backlogged.
    pub(crate) fn deactivate_entity_chain(&mut self, q: QueueId, requeue: bool) {
        let mut e = EntityId::Queue(q);
        let mut requeue = requeue;
        loop {
            let parent = self.entity(e).parent;
            if !self.do_deactivate_entity(e, requeue) {
                // The parent node is being served; its timestamps get
                // rebuilt at its own expiration.
                return;
            }

            if self.groups[&parent].sched.next_in_service.is_some() {
                // The parent stays backlogged: refresh the budgets and
                // timestamps on the path to the root.
                let Some(mut up) = self.parent_entity(e) else {
                    return;
                };
                loop {
                    self.do_activate_entity(up, false);
                    let p = self.entity(up).parent;
                    if !self.update_next_in_service(p) {
                        break;
                    }
                    match self.parent_entity(up) {
                        Some(x) => up = x,
                        None => break,
                    }
                }
                return;
            }

            // The parent went empty: propagate the dequeue.
            requeue = true;
            match self.parent_entity(e) {
                Some(pe) => e = pe,
                None => return,
            }
        }
    }

    // ---- next-in-service maintenance ----

    /// Recompute the cached next-in-service child of a node. A node whose
    /// in-service child is still being served is left alone.
    fn update_next_in_service(&mut self, g: GroupId) -> bool {
        if self.groups[&g].sched.in_service.is_some() {
            return false;
        }
        let next = self.lookup_next_entity(g, false, None);
        self.groups.get_mut(&g).unwrap().sched.next_in_service = next;
        if let Some(n) = next {
            self.mirror_budget_to_group_entity(g, n);
        }
        true
    }

    /// A group's own entity always carries the budget of the child that
    /// would be served next, so ancestors see correct finish times.
    fn mirror_budget_to_group_entity(&mut self, g: GroupId, next: EntityId) {
        let budget = self.entity(next).budget;
        if let Some(ent) = self.groups.get_mut(&g).unwrap().entity.as_mut() {
            ent.budget = budget;
        }
    }

    /// Necessary (not sufficient) preemption test used on activations.
    pub(crate) fn next_queue_may_preempt(&self) -> bool {
        let sd = &self.groups[&self.root_group].sched;
        sd.next_in_service != sd.in_service
    }

    // ---- selection ----

    /// Update the virtual time of one tree and return its eligible entity
    /// with the smallest finish time.
    fn lookup_next_in_class(&mut self, g: GroupId, class: IoClass, force: bool) -> Option<EntityId> {
        if self.st(g, class).active_is_empty() {
            return None;
        }

        let jump = self.st(g, class).vtime_jump();
        if jump > self.st(g, class).vtime {
            self.st_mut(g, class).vtime = jump;
            self.forget_idle(g, class);
        }

        let vtime = self.st(g, class).vtime;
        let found = self.st(g, class).first_eligible(vtime);
        debug_assert!(
            found.is_some(),
            "vtime caught up with min start, an eligible entity must exist"
        );
        let (_, e) = found?;

        // When the idle class is being served out of band, ancestors must
        // see its budget instead of the regularly chosen child's.
        if force && self.groups[&g].sched.next_in_service != Some(e) {
            let mut cur = e;
            loop {
                let parent = self.entity(cur).parent;
                self.mirror_budget_to_group_entity(parent, cur);
                match self.parent_entity(cur) {
                    Some(p) => cur = p,
                    None => break,
                }
            }
        }
        Some(e)
    }

    /// Pick the next child of node `g`, classes in strict RT → BE → IDLE
    /// order, except that a starving idle class is served first once per
    /// [`CLASS_IDLE_TIMEOUT`]. With `extract` the chosen entity leaves its
    /// tree and becomes the node's in-service child.
    fn lookup_next_entity(
        &mut self,
        g: GroupId,
        extract: bool,
        now: Option<TimeNs>,
    ) -> Option<EntityId> {
        let mut start_class = 0;
        if let Some(now) = now {
            if now.saturating_sub(self.class_idle_last_service) > CLASS_IDLE_TIMEOUT
                && !self.st(g, IoClass::Idle).active_is_empty()
            {
                if let Some(e) = self.lookup_next_in_class(g, IoClass::Idle, true) {
                    self.class_idle_last_service = now;
                    self.groups.get_mut(&g).unwrap().sched.next_in_service = Some(e);
                    start_class = IoClass::Idle.index();
                }
            }
        }

        for ci in start_class..NR_IO_CLASSES {
            let class = IoClass::from_index(ci);
            if let Some(e) = self.lookup_next_in_class(g, class, false) {
                if extract {
                    self.active_extract(e);
                    let sd = &mut self.groups.get_mut(&g).unwrap().sched;
                    sd.in_service = Some(e);
                    sd.next_in_service = None;
                }
                return Some(e);
            }
        }
        None
    }

    /// Descend the hierarchy and return the leaf queue to serve next,
    /// marking the whole path in-service and resetting service counters.
    pub(crate) fn get_next_queue(&mut self, now: TimeNs) -> Option<QueueId> {
        if self.busy_queues == 0 {
            return None;
        }
        let mut g = self.root_group;
        loop {
            let Some(e) = self.lookup_next_entity(g, true, Some(now)) else {
                warn!("no schedulable entity under node {g:?} despite busy queues");
                return None;
            };
            self.entity_mut(e).service = 0;
            match e {
                EntityId::Queue(q) => return Some(q),
                EntityId::Group(child) => g = child,
            }
        }
    }

    // ---- service accounting ----

    /// Charge `served` sectors to a queue and all its ancestors, advancing
    /// each traversed tree's virtual time.
    pub(crate) fn entity_served(&mut self, q: QueueId, served: u64) {
        let mut e = EntityId::Queue(q);
        loop {
            let (g, class) = self.st_loc(e);
            {
                let ent = self.entity_mut(e);
                ent.service += served;
                debug_assert!(
                    ent.service <= ent.budget,
                    "service {} above budget {}",
                    ent.service,
                    ent.budget
                );
            }
            let wsum = self.st(g, class).wsum;
            self.st_mut(g, class).vtime += vt_delta(served, wsum);
            self.forget_idle(g, class);
            match self.parent_entity(e) {
                Some(pe) => e = pe,
                None => break,
            }
        }
    }

    /// Charge a slow or timed-out queue for its slice duration instead of
    /// its served sectors, translated through the configured time budget.
    pub(crate) fn charge_time(&mut self, q: QueueId, delta_ms: u64) {
        let timeout_ms = self.tunables.timeout_sync;
        let service = self.queues[&q].entity.service;
        let mut to_charge = service;
        if delta_ms > 0 && delta_ms < timeout_ms {
            to_charge = self.max_budget() * delta_ms / timeout_ms;
        }
        to_charge = to_charge.max(service);

        {
            let ent = self.entity_mut(EntityId::Queue(q));
            if to_charge > ent.budget {
                ent.budget = to_charge;
            }
        }
        self.entity_served(q, to_charge - service);
    }
}
