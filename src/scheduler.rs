//! The per-device scheduler: queue lifecycle, dispatching, idling,
//! expiration and budget feedback, tying together the B-WF2Q+ engine, the
//! burst detector, the cooperator merger and the peak-rate estimator.
//!
//! The struct is a plain `&mut self` state machine: the embedder's
//! per-device lock is the serialization boundary, every public entry point
//! runs to completion without blocking, and the only asynchronous re-entry
//! is the idling timer, modeled as an armed deadline the embedder fires.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Result};
use log::{debug, trace, warn};

use crate::group::Group;
use crate::ioctx::{sample_valid, IoContext};
use crate::queue::Queue;
use crate::rate::{PeakRateEstimator, DEFAULT_MAX_BUDGET, MIN_TT_NS, SEEK_THR};
use crate::request::{choose_req, sdist, BioSpec, IoPos, IoRequest, RequestSpec};
use crate::tunables::Tunables;
use crate::types::{
    distant_future, ioprio_to_weight, DeviceSpeed, EntityId, ExpirationReason, GroupId, IoClass,
    MayQueue, MergeDecision, MergeKind, Pid, QueueId, RequestId, TimeNs, Weight, NSEC_PER_MSEC,
    NSEC_PER_SEC,
};

/// Async queues are charged their sectors multiplied by this factor, so
/// sync I/O keeps effective priority over writeback.
const ASYNC_CHARGE_FACTOR: u64 = 10;

/// The budgets-assigned EWMA must pass this mark before the auto-tuned max
/// budget is trusted over the default.
const STATS_MIN_BUDGETS: u64 = 194;

/// Driver depths above this, sustained over a sampling window, reveal an
/// internally queueing (command-queueing) device.
const HW_QUEUE_THRESHOLD: u32 = 4;
const HW_QUEUE_SAMPLES: u32 = 32;

/// Arrivals within the think-time bound needed to deem a queue IO-bound.
const REQUESTS_WITHIN_TIMER: u32 = 120;

/// Extra multiplier on `wr_coeff` for soft real-time raising.
const SOFTRT_WEIGHT_FACTOR: u32 = 100;

/// Slack added on top of `slice_idle` in the soft-rt next-start filter, to
/// absorb coarse or stalling clocks.
const SOFT_RT_FILTER_SLACK: TimeNs = 16 * NSEC_PER_MSEC;

/// Device description and limits handed to [`Scheduler::new`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tunables: Tunables,
    /// Non-rotational (flash) device.
    pub nonrot: bool,
    /// Queue allocations beyond this bound fall back to the OOM queue.
    pub max_queues: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tunables: Tunables::default(),
            nonrot: false,
            max_queues: usize::MAX,
        }
    }
}

/// Snapshot of one queue's externally observable state.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pid: Pid,
    pub busy: bool,
    pub sync: bool,
    pub wr_coeff: u32,
    pub wr_cur_max_time: TimeNs,
    pub in_large_burst: bool,
    pub in_burst_list: bool,
    pub coop: bool,
    pub split_coop: bool,
    pub io_bound: bool,
    pub idle_window: bool,
    pub seeky: bool,
    pub dispatched: u32,
    pub queued: u32,
    pub weight: Weight,
    pub orig_weight: Weight,
    pub budget: u64,
    pub service: u64,
}

pub struct Scheduler {
    pub(crate) tunables: Tunables,
    pub(crate) nonrot: bool,
    max_queues: usize,

    pub(crate) queues: HashMap<QueueId, Queue>,
    pub(crate) groups: HashMap<GroupId, Group>,
    pub(crate) requests: HashMap<RequestId, IoRequest>,
    pub(crate) ioctxs: HashMap<Pid, IoContext>,
    next_queue_id: u64,
    next_group_id: u64,
    next_request_id: u64,

    pub(crate) root_group: GroupId,
    pub(crate) oom_queue: QueueId,
    /// Node each process's queues are created under; root by default.
    process_groups: HashMap<Pid, GroupId>,

    pub(crate) in_service_queue: Option<QueueId>,
    pub(crate) in_service_bic: Option<Pid>,

    pub(crate) active_list: BTreeSet<QueueId>,
    pub(crate) idle_list: BTreeSet<QueueId>,

    pub(crate) busy_queues: u32,
    pub(crate) wr_busy_queues: u32,
    queued: u32,
    rq_in_driver: u32,

    pub(crate) queue_weights: BTreeMap<Weight, u32>,
    pub(crate) group_weights: BTreeMap<Weight, u32>,

    pub(crate) burst_list: Vec<QueueId>,
    pub(crate) burst_size: usize,
    pub(crate) large_burst: bool,
    pub(crate) last_ins_in_burst: TimeNs,
    pub(crate) burst_parent: Option<GroupId>,

    pub(crate) rate: PeakRateEstimator,
    /// EWMA tracking how many budgets have been assigned; gates trust in
    /// the auto-tuned max budget.
    budgets_assigned: u64,

    /// -1 unknown (treated as tagged), 0 no, 1 yes.
    hw_tag_state: i8,
    hw_tag_samples: u32,
    max_rq_in_driver: u32,

    last_budget_start: TimeNs,
    pub(crate) last_idling_start: TimeNs,
    pub(crate) class_idle_last_service: TimeNs,

    idle_timer: Option<TimeNs>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        if config.max_queues == 0 {
            bail!("max_queues must allow at least the OOM queue");
        }
        let tunables = config.tunables.clamp();

        let root_group = GroupId(0);
        let mut groups = HashMap::new();
        groups.insert(root_group, Group::new_root(root_group));

        let rate = PeakRateEstimator::new(config.nonrot, tunables.timeout_sync, tunables.max_budget);

        let mut sched = Scheduler {
            tunables,
            nonrot: config.nonrot,
            max_queues: config.max_queues,
            queues: HashMap::new(),
            groups,
            requests: HashMap::new(),
            ioctxs: HashMap::new(),
            next_queue_id: 0,
            next_group_id: 1,
            next_request_id: 0,
            root_group,
            oom_queue: QueueId(0),
            process_groups: HashMap::new(),
            in_service_queue: None,
            in_service_bic: None,
            active_list: BTreeSet::new(),
            idle_list: BTreeSet::new(),
            busy_queues: 0,
            wr_busy_queues: 0,
            queued: 0,
            rq_in_driver: 0,
            queue_weights: BTreeMap::new(),
            group_weights: BTreeMap::new(),
            burst_list: Vec::new(),
            burst_size: 0,
            large_burst: false,
            last_ins_in_burst: 0,
            burst_parent: None,
            rate,
            budgets_assigned: 0,
            hw_tag_state: -1,
            hw_tag_samples: 0,
            max_rq_in_driver: 0,
            last_budget_start: 0,
            last_idling_start: 0,
            class_idle_last_service: 0,
            idle_timer: None,
        };

        // The permanent fallback queue for failed allocations. Its priority
        // is pinned here once; later priority changes deliberately skip it.
        let oom_id = sched.alloc_queue_id();
        let mut oom = Queue::new(
            oom_id,
            Pid(1),
            root_group,
            IoClass::Be,
            crate::types::DEFAULT_IOPRIO_LEVEL,
            false,
            0,
            (2 * DEFAULT_MAX_BUDGET) / 3,
        );
        oom.refs = 1;
        // The OOM queue never takes part in bursts.
        oom.just_created = false;
        sched.queues.insert(oom_id, oom);
        sched.oom_queue = oom_id;

        Ok(sched)
    }

    fn alloc_queue_id(&mut self) -> QueueId {
        let id = QueueId(self.next_queue_id);
        self.next_queue_id += 1;
        id
    }

    // ---- budget limits ----

    /// The budget cap currently in force: the auto-tuned value once enough
    /// budgets have been assigned, the default before that, always the
    /// user's value if pinned.
    pub fn max_budget(&self) -> u64 {
        if self.tunables.max_budget > 0 {
            return self.tunables.max_budget;
        }
        if self.budgets_assigned < STATS_MIN_BUDGETS {
            DEFAULT_MAX_BUDGET
        } else {
            self.rate.dyn_max_budget
        }
    }

    fn min_budget(&self) -> u64 {
        (self.max_budget() / 32).max(1)
    }

    /// Sectors to charge for serving `rq` from `q`: the raw size for sync
    /// or raised queues, amplified for plain async queues (doubly so while
    /// raised queues are waiting).
    fn serv_to_charge(&self, rq: RequestId, q: QueueId) -> u64 {
        let sectors = self.requests[&rq].nr_sectors;
        let queue = &self.queues[&q];
        if queue.sync || queue.wr_coeff > 1 {
            return sectors;
        }
        if self.wr_busy_queues == 0 {
            sectors * ASYNC_CHARGE_FACTOR
        } else {
            sectors * 2 * ASYNC_CHARGE_FACTOR
        }
    }

    fn hw_tag(&self) -> bool {
        self.hw_tag_state != 0
    }

    // ---- queue allocation and release ----

    fn async_slot(&self, g: GroupId, class: IoClass, level: u8) -> Option<QueueId> {
        let group = &self.groups[&g];
        match class {
            IoClass::Rt => group.async_queues[0][level as usize],
            IoClass::Be => group.async_queues[1][level as usize],
            IoClass::Idle => group.async_idle_queue,
        }
    }

    fn set_async_slot(&mut self, g: GroupId, class: IoClass, level: u8, q: QueueId) {
        let group = self.groups.get_mut(&g).unwrap();
        match class {
            IoClass::Rt => group.async_queues[0][level as usize] = Some(q),
            IoClass::Be => group.async_queues[1][level as usize] = Some(q),
            IoClass::Idle => group.async_idle_queue = Some(q),
        }
    }

    /// Look up or create the queue for `(pid, sync)` I/O. Async queues of
    /// equal priority share one queue per node. A failed allocation (the
    /// queue cap here, memory pressure in the original) yields the OOM
    /// queue. Returns the queue with one reference taken for the caller.
    fn get_queue(&mut self, now: TimeNs, pid: Pid, sync: bool, class: IoClass, level: u8) -> QueueId {
        let g = self.process_groups.get(&pid).copied().unwrap_or(self.root_group);

        let slot_empty = if !sync {
            if let Some(q) = self.async_slot(g, class, level) {
                self.queues.get_mut(&q).unwrap().refs += 1;
                return q;
            }
            true
        } else {
            false
        };

        let q = if self.queues.len() < self.max_queues {
            let id = self.alloc_queue_id();
            let initial_budget = (2 * self.max_budget()) / 3;
            let queue = Queue::new(id, pid, g, class, level, sync, now, initial_budget);
            self.queues.insert(id, queue);
            trace!("allocated queue {id:?} for pid {pid:?} (sync {sync})");
            id
        } else {
            debug!("queue cap reached, using OOM queue for pid {pid:?}");
            self.oom_queue
        };

        if slot_empty && q != self.oom_queue {
            // The async slot itself pins the queue until scheduler or group
            // teardown.
            self.queues.get_mut(&q).unwrap().refs += 1;
            self.set_async_slot(g, class, level, q);
        }

        self.queues.get_mut(&q).unwrap().refs += 1;
        q
    }

    /// Drop one reference; the last one frees the queue.
    pub(crate) fn put_queue(&mut self, q: QueueId) {
        let queue = self.queues.get_mut(&q).unwrap();
        debug_assert!(queue.refs > 0);
        queue.refs -= 1;
        if queue.refs > 0 {
            return;
        }

        debug_assert!(queue.sort_list.is_empty());
        debug_assert!(!queue.busy);
        debug_assert!(self.in_service_queue != Some(q));

        // Being destroyed does not shrink the burst: the queue was still
        // created within it.
        if queue.in_burst_list {
            queue.in_burst_list = false;
            self.burst_list.retain(|&item| item != q);
        }
        if let Some(key) = queue.pos_key.take() {
            let parent = queue.entity.parent;
            let tree = &mut self.groups.get_mut(&parent).unwrap().pos_tree;
            if tree.get(&key) == Some(&q) {
                tree.remove(&key);
            }
        }
        trace!("freeing queue {q:?}");
        self.queues.remove(&q);
    }

    /// Release a process's hold on a queue at io-context exit.
    fn exit_queue(&mut self, now: TimeNs, q: QueueId) {
        if self.in_service_queue == Some(q) {
            self.expire_body(now, q);
        }
        self.put_cooperator(q);
        self.put_queue(q);
    }

    // ---- priority updates ----

    fn set_next_ioprio_data(&mut self, q: QueueId, class: IoClass, level: u8) {
        let queue = self.queues.get_mut(&q).unwrap();
        queue.new_ioprio = level;
        queue.entity.new_ioprio_class = class;
        queue.entity.new_weight = ioprio_to_weight(level);
        queue.entity.prio_changed = true;
        if class == IoClass::Idle {
            queue.idle_window = false;
        }
    }

    fn check_ioprio_change(&mut self, now: TimeNs, pid: Pid, prio: crate::types::IoPrio) {
        {
            let Some(ctx) = self.ioctxs.get_mut(&pid) else {
                return;
            };
            if ctx.ioprio == prio {
                return;
            }
            ctx.ioprio = prio;
        }
        let (class, level) = prio.resolve();

        // The async queue is shared per priority: drop this process's hold
        // and take the queue matching the new priority.
        let old_async = self.ioctxs.get_mut(&pid).unwrap().async_queue.take();
        if let Some(aq) = old_async {
            self.put_queue(aq);
            let nq = self.get_queue(now, pid, false, class, level);
            self.ioctxs.get_mut(&pid).unwrap().async_queue = Some(nq);
        }

        if let Some(sq) = self.ioctxs[&pid].sync_queue {
            // The OOM queue's priority is fixed at init and stays put.
            if sq != self.oom_queue {
                self.set_next_ioprio_data(sq, class, level);
            }
        }
    }

    // ---- groups ----

    /// Create a scheduling node under `parent` (the root when `None`).
    pub fn add_group(&mut self, parent: Option<GroupId>, weight: Weight) -> Result<GroupId> {
        let parent = parent.unwrap_or(self.root_group);
        if !self.groups.contains_key(&parent) {
            bail!("parent group {parent:?} does not exist");
        }
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        let weight = weight.clamp(crate::types::MIN_WEIGHT, crate::types::MAX_WEIGHT);
        self.groups.insert(id, Group::new_child(id, parent, weight));
        Ok(id)
    }

    /// Tear down an empty scheduling node, ending the raising periods of
    /// its shared async queues and releasing them.
    pub fn remove_group(&mut self, now: TimeNs, g: GroupId) -> Result<()> {
        if g == self.root_group {
            bail!("the root group is permanent");
        }
        if !self.groups.contains_key(&g) {
            bail!("group {g:?} does not exist");
        }
        let has_busy_children = self
            .queues
            .values()
            .any(|q| q.entity.parent == g && (q.busy || q.dispatched > 0));
        let has_child_groups = self.groups.values().any(|c| c.parent == Some(g));
        if has_busy_children || has_child_groups {
            bail!("group {g:?} still has active children");
        }

        for q in self.groups[&g].async_slots() {
            self.end_wr(q);
            self.exit_queue(now, q);
        }
        let group = self.groups.get_mut(&g).unwrap();
        group.async_queues = [[None; crate::types::NR_IOPRIO_LEVELS]; 2];
        group.async_idle_queue = None;

        // Reap queues still parked on this node's idle trees; their tree
        // reference is the last thing keeping them alive.
        let parked: Vec<crate::types::QueueId> = self
            .queues
            .iter()
            .filter(|(_, q)| q.entity.parent == g && q.entity.on_st)
            .map(|(&id, _)| id)
            .collect();
        for q in parked {
            self.deactivate_entity_chain(q, false);
        }

        // The group's own entity may still be parked on its parent's idle
        // tree; pull it off before the group goes away.
        let on_st = self.groups[&g]
            .entity
            .as_ref()
            .map(|ent| ent.on_st)
            .unwrap_or(false);
        if on_st {
            self.do_deactivate_entity(EntityId::Group(g), false);
        }
        self.groups.remove(&g);
        Ok(())
    }

    /// Attach a process to a scheduling node; its future queues are created
    /// there. Existing queues keep their node.
    pub fn set_process_group(&mut self, pid: Pid, g: GroupId) -> Result<()> {
        if !self.groups.contains_key(&g) {
            bail!("group {g:?} does not exist");
        }
        self.process_groups.insert(pid, g);
        Ok(())
    }

    // ---- busy transitions ----

    fn activate_queue(&mut self, q: QueueId) {
        let nbw = self.queues[&q].non_blocking_wait_rq;
        self.activate_entity_chain(q, nbw);
        self.queues.get_mut(&q).unwrap().non_blocking_wait_rq = false;
    }

    fn add_busy(&mut self, q: QueueId) {
        debug_assert!(!self.queues[&q].busy);
        debug_assert!(self.in_service_queue != Some(q));

        self.activate_queue(q);

        let (dispatched, wr_coeff) = {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.busy = true;
            (queue.dispatched, queue.wr_coeff)
        };
        self.busy_queues += 1;

        if dispatched == 0 && wr_coeff == 1 {
            self.weights_tree_add(EntityId::Queue(q));
        }
        if wr_coeff > 1 {
            self.wr_busy_queues += 1;
        }
    }

    fn del_busy(&mut self, q: QueueId, requeue: bool) {
        debug_assert!(self.queues[&q].busy);
        debug_assert!(self.queues[&q].sort_list.is_empty());
        debug_assert!(self.in_service_queue != Some(q));

        let (dispatched, wr_coeff) = {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.busy = false;
            (queue.dispatched, queue.wr_coeff)
        };
        self.busy_queues -= 1;

        if dispatched == 0 {
            self.weights_tree_remove(EntityId::Queue(q));
        }
        if wr_coeff > 1 {
            self.wr_busy_queues -= 1;
        }

        self.deactivate_entity_chain(q, requeue);
    }

    // ---- request insertion ----

    /// Allocate the per-request state, attach the request to the right
    /// queue (allocating, splitting or merging queues as needed), and run
    /// the arrival-side heuristics. The spec of the inserted request must
    /// outlive the call only as sectors; the scheduler owns it afterwards.
    pub fn insert_request(&mut self, now: TimeNs, spec: RequestSpec) -> RequestId {
        let (class, level) = spec.prio.resolve();
        self.ioctxs
            .entry(spec.pid)
            .or_insert_with(|| IoContext::new(spec.pid, spec.prio, now));
        self.check_ioprio_change(now, spec.pid, spec.prio);

        // The set_request half: find the queue this request is charged to.
        let mut split = false;
        let mut q = self.ioctxs[&spec.pid].queue(spec.sync);
        if let Some(cur) = q {
            // A shared queue gone seeky is broken back apart.
            if self.queues[&cur].coop && self.queues[&cur].split_coop {
                if self.queues[&cur].in_large_burst {
                    self.ioctxs.get_mut(&spec.pid).unwrap().saved_in_large_burst = true;
                }
                q = self.split_queue(spec.pid, cur);
                split = true;
            }
        }
        let q = match q {
            Some(q) if q != self.oom_queue => q,
            stale => {
                if let Some(old) = stale {
                    self.put_queue(old);
                }
                let nq = self.get_queue(now, spec.pid, spec.sync, class, level);
                if split && spec.sync && nq != self.oom_queue {
                    self.restore_burst_state_after_split(now, nq, spec.pid);
                }
                nq
            }
        };

        {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.allocated[spec.sync as usize] += 1;
            queue.refs += 1;
        }
        self.ioctxs.get_mut(&spec.pid).unwrap().set_queue(spec.sync, Some(q));

        if q != self.oom_queue && self.queues[&q].process_refs() == 1 {
            self.queues.get_mut(&q).unwrap().bic = Some(spec.pid);
            if split {
                self.resume_queue_state(q, spec.pid);
            }
        }
        if self.queues[&q].just_created {
            self.handle_burst(now, q);
        }

        // The insert half proper.
        let rq = RequestId(self.next_request_id);
        self.next_request_id += 1;
        self.requests.insert(
            rq,
            IoRequest {
                id: rq,
                queue: q,
                pid: spec.pid,
                sector: spec.sector,
                nr_sectors: spec.nr_sectors.max(1),
                sync: spec.sync,
                meta: spec.meta,
                fifo_deadline: now + self.tunables.fifo_expire_ns(spec.sync),
                dispatched: false,
            },
        );

        // Early cooperator merge: requests of nearby processes flow into
        // one queue while they stay sequential.
        let mut q = q;
        if let Some(mut new_q) = self.setup_cooperator(now, q, Some(IoPos::Request(spec.sector))) {
            if self.ioctxs[&spec.pid].sync_queue != Some(q) {
                if let Some(redirected) = self.ioctxs[&spec.pid].sync_queue {
                    new_q = redirected;
                }
            }
            let dir = spec.sync as usize;
            self.queues.get_mut(&new_q).unwrap().allocated[dir] += 1;
            self.queues.get_mut(&new_q).unwrap().refs += 1;
            {
                let queue = self.queues.get_mut(&q).unwrap();
                queue.allocated[dir] -= 1;
                queue.just_created = false;
            }
            self.put_queue(q);
            if self.ioctxs[&spec.pid].sync_queue == Some(q) {
                self.merge_queues(spec.pid, q, new_q);
            }
            self.requests.get_mut(&rq).unwrap().queue = new_q;
            q = new_q;
        }

        self.add_request(now, rq);
        self.queues.get_mut(&q).unwrap().fifo.push_back(rq);
        self.rq_enqueued(now, q, rq);
        rq
    }

    /// Burst-list membership survives a split according to the state saved
    /// at merge time.
    fn restore_burst_state_after_split(&mut self, now: TimeNs, q: QueueId, pid: Pid) {
        let (was_in_burst_list, saved_in_large_burst) = {
            let ctx = &self.ioctxs[&pid];
            (ctx.was_in_burst_list, ctx.saved_in_large_burst)
        };
        let large_burst = self.large_burst;
        {
            let queue = self.queues.get_mut(&q).unwrap();
            if (was_in_burst_list && large_burst) || saved_in_large_burst {
                queue.in_large_burst = true;
            } else {
                queue.in_large_burst = false;
                if was_in_burst_list {
                    queue.in_burst_list = true;
                }
            }
            queue.split_time = now;
        }
        if self.queues[&q].in_burst_list {
            self.burst_list.push(q);
        }
    }

    fn add_request(&mut self, now: TimeNs, rq: RequestId) {
        let q = self.requests[&rq].queue;
        let sync = self.requests[&rq].sync;
        let old_wr_coeff = self.queues[&q].wr_coeff;

        {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.queued[sync as usize] += 1;
        }
        self.queued += 1;
        let sector = self.requests[&rq].sector;
        self.queues
            .get_mut(&q)
            .unwrap()
            .sort_list
            .insert((sector, rq));

        // Is the new request a better next-to-serve candidate?
        let prev = self.queues[&q].next_rq;
        let chosen = choose_req(
            prev.and_then(|p| self.requests.get(&p)),
            self.requests.get(&rq),
            self.rate.last_position(),
            self.tunables.back_seek_max_sectors(),
            self.tunables.back_seek_penalty,
        )
        .map(|r| r.id);
        self.queues.get_mut(&q).unwrap().next_rq = chosen;
        if prev != chosen {
            self.pos_tree_add_move(q);
        }

        let mut interactive = false;
        if !self.queues[&q].busy {
            interactive = self.handle_idle_busy_switch(now, q, old_wr_coeff, rq);
        } else {
            // An async queue whose requests arrive far apart deserves
            // raising too: writeback serving an interactive task.
            if self.tunables.low_latency
                && old_wr_coeff == 1
                && !sync
                && now
                    > self.queues[&q].last_wr_start_finish
                        + self.tunables.wr_min_inter_arr_async * NSEC_PER_MSEC
            {
                let dur = self.rate.wr_duration(self.tunables.wr_max_time);
                let queue = self.queues.get_mut(&q).unwrap();
                queue.wr_coeff = self.tunables.wr_coeff;
                queue.wr_cur_max_time = dur;
                queue.entity.prio_changed = true;
                self.wr_busy_queues += 1;
            }
            if prev != chosen {
                self.updated_next_req(q);
            }
        }

        // For non-raised queues this records the arrival time of the last
        // request; for newly raised ones, the start of the raising period.
        // An interactive arrival restarts the period even mid-raising.
        if self.tunables.low_latency
            && (old_wr_coeff == 1 || self.queues[&q].wr_coeff == 1 || interactive)
        {
            self.queues.get_mut(&q).unwrap().last_wr_start_finish = now;
        }
    }

    /// Make sure a backlogged queue's budget covers its (possibly grown)
    /// first request, reactivating it with updated timestamps if so.
    fn updated_next_req(&mut self, q: QueueId) {
        if self.in_service_queue == Some(q) || !self.queues[&q].busy {
            // Budgets must not change once the entity has been selected.
            return;
        }
        let Some(next_rq) = self.queues[&q].next_rq else {
            return;
        };
        let new_budget = self.queues[&q]
            .max_budget
            .max(self.serv_to_charge(next_rq, q));
        if self.queues[&q].entity.budget != new_budget {
            self.queues.get_mut(&q).unwrap().entity.budget = new_budget;
            trace!("queue {q:?}: next-request budget {new_budget}");
            self.activate_queue(q);
        }
    }

    fn idle_for_long_time(&self, now: TimeNs, q: QueueId) -> bool {
        let queue = &self.queues[&q];
        queue.dispatched == 0
            && now
                > queue
                    .budget_timeout
                    .saturating_add(self.tunables.wr_min_idle_time * NSEC_PER_MSEC)
    }

    /// Update the budget of a queue switching from idle to busy, and say
    /// whether the in-service queue should be preempted for it. A queue
    /// whose awaited request arrived in time resumes from its remaining
    /// budget so it can recover its service hole.
    fn update_budget_for_activation(
        &mut self,
        q: QueueId,
        arrived_in_time: bool,
        wr_or_deserves_wr: bool,
    ) -> bool {
        if self.queues[&q].non_blocking_wait_rq && arrived_in_time {
            // Keep the flag: activation reads it to back-shift timestamps.
            let left = self.queues[&q].budget_left();
            let cap = self.queues[&q].max_budget;
            self.queues.get_mut(&q).unwrap().entity.budget = left.min(cap);
            return true;
        }

        let next_rq = self.queues[&q].next_rq.expect("busy switch without a request");
        let budget = self.queues[&q].max_budget.max(self.serv_to_charge(next_rq, q));
        let queue = self.queues.get_mut(&q).unwrap();
        queue.entity.budget = budget;
        queue.non_blocking_wait_rq = false;
        wr_or_deserves_wr
    }

    #[allow(clippy::too_many_arguments)]
    fn update_wr_on_rq_arrival(
        &mut self,
        now: TimeNs,
        q: QueueId,
        old_wr_coeff: u32,
        wr_or_deserves_wr: bool,
        interactive: bool,
        in_burst: bool,
        soft_rt: bool,
    ) {
        let wr_rt_max_ns = self.tunables.wr_rt_max_time * NSEC_PER_MSEC;
        if old_wr_coeff == 1 && wr_or_deserves_wr {
            let (coeff, dur) = if interactive {
                (
                    self.tunables.wr_coeff,
                    self.rate.wr_duration(self.tunables.wr_max_time),
                )
            } else {
                (
                    self.tunables.wr_coeff * SOFTRT_WEIGHT_FACTOR,
                    wr_rt_max_ns,
                )
            };
            let min_budget = self.min_budget();
            let queue = self.queues.get_mut(&q).unwrap();
            queue.wr_coeff = coeff;
            queue.wr_cur_max_time = dur;
            // Keep the budget close to the backlog of a raised queue:
            // latency matters here, throughput does not.
            queue.entity.budget = queue.entity.budget.min(2 * min_budget);
            debug!(
                "queue {q:?}: weight raising starts, coeff {coeff}, {}ms",
                dur / NSEC_PER_MSEC
            );
        } else if old_wr_coeff > 1 {
            if interactive {
                let dur = self.rate.wr_duration(self.tunables.wr_max_time);
                let queue = self.queues.get_mut(&q).unwrap();
                queue.wr_coeff = self.tunables.wr_coeff;
                queue.wr_cur_max_time = dur;
            } else if in_burst {
                self.queues.get_mut(&q).unwrap().wr_coeff = 1;
            } else if soft_rt {
                // Re-charge the remaining raising time with the soft-rt
                // window when that does not shorten it; the queue keeps its
                // guarantees across the transition from interactive to
                // soft real-time.
                let queue = &self.queues[&q];
                if queue.last_wr_start_finish + queue.wr_cur_max_time < now + wr_rt_max_ns {
                    let coeff = self.tunables.wr_coeff * SOFTRT_WEIGHT_FACTOR;
                    let queue = self.queues.get_mut(&q).unwrap();
                    queue.last_wr_start_finish = now;
                    queue.wr_cur_max_time = wr_rt_max_ns;
                    queue.wr_coeff = coeff;
                }
            }
        }
    }

    /// Returns whether the arrival classified the queue as interactive.
    fn handle_idle_busy_switch(
        &mut self,
        now: TimeNs,
        q: QueueId,
        old_wr_coeff: u32,
        rq: RequestId,
    ) -> bool {
        let pid = self.requests[&rq].pid;
        let idle_for_long_time = self.idle_for_long_time(now, q);
        let arrived_in_time = self
            .ioctxs
            .get(&pid)
            .map(|ctx| now <= ctx.ttime.last_end_request + self.tunables.slice_idle * 3)
            .unwrap_or(false);

        let in_burst = self.queues[&q].in_large_burst;
        let soft_rt = self.tunables.wr_max_softrt_rate > 0
            && !in_burst
            && now > self.queues[&q].soft_rt_next_start;
        let interactive = !in_burst && idle_for_long_time;
        let wr_or_deserves_wr = self.tunables.low_latency
            && (self.queues[&q].wr_coeff > 1
                || (self.queues[&q].sync
                    && self.queues[&q].bic.is_some()
                    && (interactive || soft_rt)));

        let wants_to_preempt = self.update_budget_for_activation(q, arrived_in_time, wr_or_deserves_wr);

        // A queue that stayed quiet for very long has finished its part of
        // the burst I/O; it no longer needs burst treatment.
        if !self.queues[&q].just_created
            && idle_for_long_time
            && now > self.queues[&q].budget_timeout.saturating_add(10 * NSEC_PER_SEC)
        {
            let queue = self.queues.get_mut(&q).unwrap();
            if queue.in_burst_list {
                queue.in_burst_list = false;
                self.burst_list.retain(|&item| item != q);
            }
            self.queues.get_mut(&q).unwrap().in_large_burst = false;
        }

        self.queues.get_mut(&q).unwrap().just_created = false;

        if !self.queues[&q].io_bound {
            let queue = self.queues.get_mut(&q).unwrap();
            if arrived_in_time {
                queue.requests_within_timer += 1;
                if queue.requests_within_timer >= REQUESTS_WITHIN_TIMER {
                    queue.io_bound = true;
                }
            } else {
                queue.requests_within_timer = 0;
            }
        }

        if self.tunables.low_latency {
            let split_gate = self.queues[&q]
                .split_time
                .saturating_add(self.tunables.wr_min_idle_time * NSEC_PER_MSEC);
            if now > split_gate {
                self.update_wr_on_rq_arrival(
                    now,
                    q,
                    old_wr_coeff,
                    wr_or_deserves_wr,
                    interactive,
                    in_burst,
                    soft_rt,
                );
                if old_wr_coeff != self.queues[&q].wr_coeff {
                    self.queues.get_mut(&q).unwrap().entity.prio_changed = true;
                }
            }
        }

        {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.last_idle_bklogged = now;
            queue.service_from_backlogged = 0;
            queue.softrt_update = false;
        }

        self.add_busy(q);

        // Expire the in-service queue only when preemption may actually be
        // needed for guarantees; the test is a cheap necessary condition,
        // not a full timestamp comparison.
        if let Some(in_serv) = self.in_service_queue {
            if wants_to_preempt
                && self.queues[&in_serv].wr_coeff < self.queues[&q].wr_coeff
                && self.next_queue_may_preempt()
            {
                debug_assert_ne!(in_serv, q);
                self.expire(now, in_serv, false, ExpirationReason::Preempted);
            }
        }
        interactive
    }

    // ---- arrival-side heuristics ----

    fn update_idle_window(&mut self, now: TimeNs, q: QueueId, pid: Pid) {
        if !self.queues[&q].sync || self.queues[&q].class_idle() {
            return;
        }
        // Right after a split the restored statistics say nothing yet.
        let split_gate = self.queues[&q]
            .split_time
            .saturating_add(self.tunables.wr_min_idle_time * NSEC_PER_MSEC);
        if now <= split_gate {
            return;
        }

        let mut enable = self.queues[&q].idle_window;
        let ctx = self.ioctxs.get(&pid);
        let seeky = self.queues[&q].seeky();
        let wr_coeff = self.queues[&q].wr_coeff;

        if ctx.is_none()
            || self.tunables.slice_idle == 0
            || (self.hw_tag() && seeky && wr_coeff == 1)
        {
            enable = false;
        } else if let Some(ctx) = ctx {
            if sample_valid(ctx.ttime.samples) {
                enable = !(ctx.ttime.mean > self.tunables.slice_idle && wr_coeff == 1);
            }
        }
        self.queues.get_mut(&q).unwrap().idle_window = enable;
    }

    fn rq_enqueued(&mut self, now: TimeNs, q: QueueId, rq: RequestId) {
        let (pid, sector, nr_sectors, sync, meta) = {
            let r = &self.requests[&rq];
            (r.pid, r.sector, r.nr_sectors, r.sync, r.meta)
        };

        if meta {
            self.queues.get_mut(&q).unwrap().meta_pending += 1;
        }

        let slice_idle = self.tunables.slice_idle;
        if let Some(ctx) = self.ioctxs.get_mut(&pid) {
            ctx.ttime.update(now, slice_idle);
        }

        {
            let last_pos = self.queues[&q].last_request_pos;
            let was_seek = sdist(last_pos, sector) > SEEK_THR;
            self.queues.get_mut(&q).unwrap().push_seek_sample(was_seek);
        }

        if self.queues[&q].entity.service > self.max_budget() / 8 || !self.queues[&q].seeky() {
            self.update_idle_window(now, q, pid);
        }

        self.queues.get_mut(&q).unwrap().last_request_pos = sector + nr_sectors;

        if self.in_service_queue == Some(q) && self.queues[&q].wait_request {
            let small_req =
                self.queues[&q].queued[sync as usize] == 1 && nr_sectors < 32;
            let budget_timeout = now >= self.queues[&q].budget_timeout;

            // Keep idling for a lone small request unless the slice is
            // over anyway: larger merged requests may still show up.
            if small_req && !budget_timeout {
                return;
            }

            self.queues.get_mut(&q).unwrap().wait_request = false;
            self.idle_timer = None;

            // The queue is not empty anymore, so a budget-timeout
            // expiration here cannot misalign its timestamps.
            if budget_timeout {
                self.expire(now, q, false, ExpirationReason::BudgetTimeout);
            }
        }
    }

    // ---- request removal and merging ----

    fn find_next_rq(&self, q: QueueId, last: RequestId) -> Option<RequestId> {
        let last_req = &self.requests[&last];
        let key = (last_req.sector, last);
        let queue = &self.queues[&q];

        let prev = queue.sort_list.range(..key).next_back().map(|&(_, r)| r);
        let mut next = queue
            .sort_list
            .range((
                std::ops::Bound::Excluded(key),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|&(_, r)| r);
        if next.is_none() {
            // Wrap to the lowest sector, the elevator going back to the
            // start of the queue.
            next = queue
                .sort_list
                .iter()
                .next()
                .map(|&(_, r)| r)
                .filter(|&r| r != last);
        }

        choose_req(
            next.and_then(|r| self.requests.get(&r)),
            prev.and_then(|r| self.requests.get(&r)),
            last_req.sector,
            self.tunables.back_seek_max_sectors(),
            self.tunables.back_seek_penalty,
        )
        .map(|r| r.id)
    }

    /// Detach a request from its queue's FIFO and sort list. The request
    /// object itself stays in the arena until released or completed.
    fn remove_request(&mut self, rq: RequestId) {
        let (q, sector, sync, meta) = {
            let r = &self.requests[&rq];
            (r.queue, r.sector, r.sync, r.meta)
        };

        if self.queues[&q].next_rq == Some(rq) {
            let next = self.find_next_rq(q, rq);
            self.queues.get_mut(&q).unwrap().next_rq = next;
            self.updated_next_req(q);
        }

        {
            let queue = self.queues.get_mut(&q).unwrap();
            queue.fifo.retain(|&r| r != rq);
            debug_assert!(queue.queued[sync as usize] > 0);
            queue.queued[sync as usize] -= 1;
            queue.sort_list.remove(&(sector, rq));
            if meta {
                queue.meta_pending = queue.meta_pending.saturating_sub(1);
            }
        }
        self.queued -= 1;

        if self.queues[&q].sort_list.is_empty() {
            if self.queues[&q].busy && self.in_service_queue != Some(q) {
                self.del_busy(q, true);
                // The queue emptied outside service: its service and
                // budget no longer describe a completed slice, so reset
                // them to keep reactivation consistent.
                let queue = self.queues.get_mut(&q).unwrap();
                queue.entity.budget = 0;
                queue.entity.service = 0;
            }
            if let Some(key) = self.queues.get_mut(&q).unwrap().pos_key.take() {
                let parent = self.queues[&q].entity.parent;
                let tree = &mut self.groups.get_mut(&parent).unwrap().pos_tree;
                if tree.get(&key) == Some(&q) {
                    tree.remove(&key);
                }
            }
        }
    }

    /// Look for a queued request of `pid` the bio can grow.
    pub fn find_merge(&self, pid: Pid, bio: BioSpec) -> MergeDecision {
        let Some(q) = self.ioctxs.get(&pid).and_then(|ctx| ctx.queue(bio.sync)) else {
            return MergeDecision::None;
        };
        let queue = &self.queues[&q];

        // Front merge: a request starting exactly where the bio ends.
        let end = bio.end_sector();
        if let Some(&(_, rid)) = queue
            .sort_list
            .range((end, RequestId(0))..(end, RequestId(u64::MAX)))
            .next()
        {
            return MergeDecision::Front(rid);
        }
        // Back merge: a request ending exactly where the bio starts.
        if let Some(&(_, rid)) = queue.sort_list.range(..(bio.sector, RequestId(0))).next_back() {
            if self.requests[&rid].end_sector() == bio.sector {
                return MergeDecision::Back(rid);
            }
        }
        MergeDecision::None
    }

    /// Fold a bio into a request found by [`find_merge`] and re-sort.
    pub fn merged_request(&mut self, _now: TimeNs, rq: RequestId, kind: MergeKind, bio: BioSpec) {
        let q = self.requests[&rq].queue;
        match kind {
            MergeKind::Back => {
                self.requests.get_mut(&rq).unwrap().nr_sectors += bio.nr_sectors;
            }
            MergeKind::Front => {
                let old_sector = {
                    let r = self.requests.get_mut(&rq).unwrap();
                    let old = r.sector;
                    r.sector = bio.sector;
                    r.nr_sectors += bio.nr_sectors;
                    old
                };
                // Reposition in the sort list and re-pick next_rq.
                {
                    let queue = self.queues.get_mut(&q).unwrap();
                    queue.sort_list.remove(&(old_sector, rq));
                    queue.sort_list.insert((bio.sector, rq));
                }
                let prev = self.queues[&q].next_rq;
                let chosen = choose_req(
                    prev.and_then(|p| self.requests.get(&p)),
                    self.requests.get(&rq),
                    self.rate.last_position(),
                    self.tunables.back_seek_max_sectors(),
                    self.tunables.back_seek_penalty,
                )
                .map(|r| r.id);
                self.queues.get_mut(&q).unwrap().next_rq = chosen;
                if prev != chosen {
                    self.updated_next_req(q);
                    self.pos_tree_add_move(q);
                }
            }
        }
    }

    /// Fold request `next` into `rq` after the block layer merged them;
    /// `rq` inherits the earlier FIFO deadline.
    pub fn merged_requests(&mut self, _now: TimeNs, rq: RequestId, next: RequestId) {
        let q = self.requests[&rq].queue;
        let next_q = self.requests[&next].queue;

        if q == next_q
            && self.queues[&q].fifo.contains(&rq)
            && self.requests[&next].fifo_deadline < self.requests[&rq].fifo_deadline
        {
            // Take over the position and deadline of the absorbed request;
            // `next` leaves the FIFO here, so its own removal below only
            // touches the sort list and counters.
            let queue = self.queues.get_mut(&q).unwrap();
            queue.fifo.retain(|&r| r != rq);
            if let Some(pos) = queue.fifo.iter().position(|&r| r == next) {
                queue.fifo[pos] = rq;
            }
            let deadline = self.requests[&next].fifo_deadline;
            self.requests.get_mut(&rq).unwrap().fifo_deadline = deadline;
        }

        if self.queues[&next_q].next_rq == Some(next) {
            self.queues.get_mut(&next_q).unwrap().next_rq = Some(rq);
        }

        self.remove_request(next);
        self.release_request(next);
    }

    /// May this bio be merged into `rq`? Sync bios never join async
    /// requests, and the answer doubles as the early cooperator-merge
    /// trigger: the bio's queue may get redirected before deciding.
    pub fn allow_merge(&mut self, now: TimeNs, pid: Pid, rq: RequestId, bio: BioSpec) -> bool {
        if bio.sync && !self.requests[&rq].sync {
            return false;
        }
        let Some(mut q) = self.ioctxs.get(&pid).and_then(|ctx| ctx.queue(bio.sync)) else {
            return false;
        };

        if let Some(new_q) = self.setup_cooperator(now, q, Some(IoPos::Bio(bio.sector))) {
            if self.ioctxs[&pid].sync_queue == Some(q) {
                self.merge_queues(pid, q, new_q);
            }
            q = new_q;
        }

        q == self.requests[&rq].queue
    }

    /// `Must` exactly when the in-service queue is idling for the request
    /// this allocation would produce.
    pub fn may_queue(&mut self, pid: Pid, sync: bool) -> MayQueue {
        let Some(q) = self.ioctxs.get(&pid).and_then(|ctx| ctx.queue(sync)) else {
            return MayQueue::May;
        };
        let queue = self.queues.get_mut(&q).unwrap();
        if queue.wait_request && queue.must_alloc {
            queue.must_alloc = false;
            return MayQueue::Must;
        }
        MayQueue::May
    }

    // ---- selection, idling, dispatching ----

    fn budget_timeout_expired(&self, now: TimeNs, q: QueueId) -> bool {
        now >= self.queues[&q].budget_timeout
    }

    /// Expiring for budget timeout is safe only if the queue is not
    /// actively waiting for a request, or got so little service that the
    /// timestamp misalignment cannot matter.
    fn may_expire_for_budget_timeout(&self, now: TimeNs, q: QueueId) -> bool {
        let queue = &self.queues[&q];
        (!queue.wait_request || queue.budget_left() >= queue.entity.budget / 3)
            && self.budget_timeout_expired(now, q)
    }

    /// Whether the device should idle for this queue when it runs empty.
    /// Idling boosts throughput on non-queueing or rotational hardware fed
    /// sequential I/O, and is required for service guarantees whenever the
    /// scenario is asymmetric; it is wasted on large-burst queues.
    fn may_idle(&self, q: QueueId) -> bool {
        if self.tunables.strict_guarantees {
            return true;
        }
        let queue = &self.queues[&q];

        let idling_boosts_thr =
            !self.hw_tag() || (!self.nonrot && queue.io_bound && queue.idle_window);
        // With raised queues waiting, idling a non-raised queue would hand
        // the device exactly the requests that starve them.
        let idling_boosts_thr_without_issues = idling_boosts_thr && self.wr_busy_queues == 0;

        let asymmetric = queue.wr_coeff > 1 || !self.symmetric_scenario();
        let idling_needed_for_guarantees = asymmetric && !queue.in_large_burst;

        queue.sync && (idling_boosts_thr_without_issues || idling_needed_for_guarantees)
    }

    fn must_idle(&self, q: QueueId) -> bool {
        self.queues[&q].sort_list.is_empty()
            && self.tunables.slice_idle != 0
            && self.may_idle(q)
    }

    fn arm_slice_timer(&mut self, now: TimeNs) {
        let Some(q) = self.in_service_queue else {
            return;
        };
        debug_assert!(self.queues[&q].sort_list.is_empty());

        // No owner process left: nothing will send the awaited request.
        let Some(pid) = self.in_service_bic else {
            return;
        };
        if !self.ioctxs.contains_key(&pid) {
            return;
        }

        self.queues.get_mut(&q).unwrap().wait_request = true;

        // Seeky queues get only a token window, unless raising or an
        // asymmetric scenario demands the full one.
        let mut sl = self.tunables.slice_idle;
        if self.queues[&q].seeky() && self.queues[&q].wr_coeff == 1 && self.symmetric_scenario() {
            sl = sl.min(MIN_TT_NS);
        }

        self.last_idling_start = now;
        self.idle_timer = Some(now + sl);
        trace!("idling {}us for queue {q:?}", sl / 1000);
    }

    /// Deadline of the armed idling window, if any.
    pub fn idle_timer_deadline(&self) -> Option<TimeNs> {
        self.idle_timer
    }

    /// Fire the idling timer. A callback that lost the race against a
    /// cancelling expiration finds the timer disarmed and exits harmlessly;
    /// one racing a queue change re-checks the in-service identity.
    pub fn on_idle_timer(&mut self, now: TimeNs) {
        if self.idle_timer.is_none() {
            return;
        }
        self.idle_timer = None;

        let Some(q) = self.in_service_queue else {
            return;
        };
        self.queues.get_mut(&q).unwrap().wait_request = false;

        let reason = if self.budget_timeout_expired(now, q) {
            ExpirationReason::BudgetTimeout
        } else if self.queues[&q].queued[0] == 0 && self.queues[&q].queued[1] == 0 {
            ExpirationReason::TooIdle
        } else {
            // A request arrived during idling without disarming the timer.
            return;
        };
        self.expire(now, q, true, reason);
    }

    fn set_budget_timeout(&mut self, now: TimeNs, q: QueueId) {
        let wr_rt_max_ns = self.tunables.wr_rt_max_time * NSEC_PER_MSEC;
        let queue = &self.queues[&q];
        // Seeky processes effectively run on a time slice; raised queues
        // get it scaled by their raising factor, soft-rt ones excepted.
        let timeout_coeff = if queue.wr_cur_max_time == wr_rt_max_ns {
            1
        } else {
            (queue.entity.weight / queue.entity.orig_weight.max(1)).max(1) as u64
        };
        self.last_budget_start = now;
        self.queues.get_mut(&q).unwrap().budget_timeout =
            now + self.tunables.timeout_ns() * timeout_coeff;
    }

    fn set_in_service_queue(&mut self, now: TimeNs, q: Option<QueueId>) {
        if let Some(q) = q {
            debug_assert!(self.in_service_queue != Some(q));
            {
                let queue = self.queues.get_mut(&q).unwrap();
                queue.must_alloc = true;
                queue.fifo_checked = false;
            }
            self.budgets_assigned = (self.budgets_assigned * 7 + 256) / 8;

            // Soft-rt queues are not greedy: service delays would eat
            // their whole short raising window, so shift its start forward
            // by the time the queue was left unserved.
            let wr_rt_max_ns = self.tunables.wr_rt_max_time * NSEC_PER_MSEC;
            let queue = &self.queues[&q];
            if queue.wr_coeff > 1
                && queue.wr_cur_max_time == wr_rt_max_ns
                && now > queue.budget_timeout
            {
                let shift = now - self.queues[&q].budget_timeout;
                self.queues.get_mut(&q).unwrap().last_wr_start_finish += shift;
            }

            self.set_budget_timeout(now, q);
            trace!(
                "in-service queue {q:?}, budget {}",
                self.queues[&q].entity.budget
            );
        }
        self.in_service_queue = q;
    }

    /// Select the queue to serve: keep the in-service one while it has
    /// budget and requests (or a reason to wait), else expire it and pick
    /// the next by virtual finish time.
    fn select_queue(&mut self, now: TimeNs) -> Option<QueueId> {
        if let Some(q) = self.in_service_queue {
            let mut reason = ExpirationReason::BudgetTimeout;
            let mut expire_now = false;

            if self.may_expire_for_budget_timeout(now, q)
                && self.idle_timer.is_none()
                && !self.must_idle(q)
            {
                expire_now = true;
            } else if let Some(next_rq) = self.queues[&q].next_rq {
                if self.serv_to_charge(next_rq, q) > self.queues[&q].budget_left() {
                    reason = ExpirationReason::BudgetExhausted;
                    expire_now = true;
                } else {
                    // A request may have arrived during idling without
                    // being big enough to disarm the timer; the block
                    // layer has unplugged meanwhile, so stop idling now.
                    if self.queues[&q].wait_request {
                        self.queues.get_mut(&q).unwrap().wait_request = false;
                        self.idle_timer = None;
                    }
                    return Some(q);
                }
            } else if self.idle_timer.is_some()
                || (self.queues[&q].dispatched > 0 && self.may_idle(q))
            {
                // Empty, but idling (or entitled to idle after the
                // outstanding completions): keep the device for it.
                return None;
            } else {
                reason = ExpirationReason::NoMoreRequests;
                expire_now = true;
            }

            if expire_now {
                self.expire(now, q, false, reason);
            }
        }

        let next = self.get_next_queue(now);
        self.set_in_service_queue(now, next);
        next
    }

    /// Return the FIFO head if its deadline has passed; checked once per
    /// slice.
    fn check_fifo(&mut self, now: TimeNs, q: QueueId) -> Option<RequestId> {
        if self.queues[&q].fifo_checked {
            return None;
        }
        self.queues.get_mut(&q).unwrap().fifo_checked = true;
        let &front = self.queues[&q].fifo.front()?;
        if self.requests[&front].fifo_deadline <= now {
            Some(front)
        } else {
            None
        }
    }

    /// Move a request out of its queue's internal lists towards the driver
    /// dispatch list, charging the peak-rate estimator.
    fn dispatch_insert(&mut self, now: TimeNs, rq: RequestId) {
        let (q, sector, nr_sectors) = {
            let r = &self.requests[&rq];
            (r.queue, r.sector, r.nr_sectors)
        };
        self.queues.get_mut(&q).unwrap().dispatched += 1;
        self.rate.on_dispatch(now, sector, nr_sectors, self.rq_in_driver);
        self.remove_request(rq);
        self.requests.get_mut(&rq).unwrap().dispatched = true;
    }

    /// End weight raising when its period ran out (or the queue joined a
    /// large burst), and push any pending weight change onto the entity
    /// right away: the inflated timestamps make the queue leave the device
    /// sooner for other raised queues.
    fn update_wr_data(&mut self, now: TimeNs, q: QueueId) {
        if self.queues[&q].wr_coeff > 1 {
            let queue = &self.queues[&q];
            if queue.in_large_burst
                || now >= queue.last_wr_start_finish + queue.wr_cur_max_time
            {
                self.queues.get_mut(&q).unwrap().last_wr_start_finish = now;
                debug!("queue {q:?}: weight raising ends");
                self.end_wr(q);
            }
        }
        let entity = &self.queues[&q].entity;
        if (entity.weight > entity.orig_weight) != (self.queues[&q].wr_coeff > 1) {
            self.apply_pending_weight_change(q);
        }
    }

    /// Apply a pending weight change to an off-tree (in-service) entity.
    fn apply_pending_weight_change(&mut self, q: QueueId) {
        // Reuse the activation-path weight update; the entity is not on a
        // tree, so only its weight and the weight sums move.
        self.update_weight_prio(EntityId::Queue(q));
    }

    fn end_wr(&mut self, q: QueueId) {
        let queue = self.queues.get_mut(&q).unwrap();
        if queue.busy && queue.wr_coeff > 1 {
            self.wr_busy_queues -= 1;
        }
        let queue = self.queues.get_mut(&q).unwrap();
        queue.wr_coeff = 1;
        queue.wr_cur_max_time = 0;
        queue.entity.prio_changed = true;
    }

    /// Force-end weight raising everywhere (busy, idle and async queues).
    fn end_wr_all(&mut self) {
        let ids: Vec<QueueId> = self
            .active_list
            .iter()
            .chain(self.idle_list.iter())
            .copied()
            .collect();
        for q in ids {
            if self.queues.contains_key(&q) {
                self.end_wr(q);
            }
        }
        let slots: Vec<QueueId> = self
            .groups
            .values()
            .flat_map(|g| g.async_slots())
            .collect();
        for q in slots {
            self.end_wr(q);
        }
    }

    /// Toggle low-latency mode; disabling it ends all raising at once.
    pub fn set_low_latency(&mut self, enable: bool) {
        let was = self.tunables.low_latency;
        self.tunables.low_latency = enable;
        if was && !enable {
            self.end_wr_all();
        }
    }

    /// Dispatch up to one request. With `force`, bypass budgets and idling
    /// and drain whatever is queued (device removal, scheduler switch);
    /// repeated forced calls empty the scheduler completely.
    pub fn dispatch(&mut self, now: TimeNs, force: bool) -> Option<RequestId> {
        if force {
            return self.forced_dispatch(now);
        }
        if self.busy_queues == 0 {
            return None;
        }
        // Strict guarantees are only enforceable serving one request at a
        // time: an internally queueing device reorders at will.
        if self.tunables.strict_guarantees && self.rq_in_driver > 0 {
            return None;
        }

        let q = self.select_queue(now)?;
        debug_assert!(!self.queues[&q].wait_request);
        self.dispatch_request(now, q)
    }

    fn dispatch_request(&mut self, now: TimeNs, q: QueueId) -> Option<RequestId> {
        // Prefer an expired FIFO head over sector order.
        let rq = match self.check_fifo(now, q) {
            Some(rq) => rq,
            None => self.queues[&q].next_rq?,
        };

        let charge = self.serv_to_charge(rq, q);
        if charge > self.queues[&q].budget_left() {
            // Budgets are dimensioned for the sector-ordered next request;
            // a FIFO pick may overshoot. Expire and make sure the next
            // activation covers it.
            self.queues.get_mut(&q).unwrap().next_rq = Some(rq);
            self.expire(now, q, false, ExpirationReason::BudgetExhausted);
            return None;
        }

        let pid = self.requests[&rq].pid;
        self.entity_served(q, charge);
        self.dispatch_insert(now, rq);
        self.update_wr_data(now, q);

        trace!(
            "dispatched {} sectors from queue {q:?}, budget left {}",
            self.requests[&rq].nr_sectors,
            self.queues[&q].budget_left()
        );

        if self.in_service_bic.is_none() {
            self.in_service_bic = Some(pid);
        }

        // The idle class never keeps the device while others wait.
        if self.busy_queues > 1 && self.queues[&q].class_idle() {
            self.expire(now, q, false, ExpirationReason::BudgetExhausted);
        }
        Some(rq)
    }

    /// One step of the forced drain: expire the in-service queue, then feed
    /// out the next pending request of any active queue, resetting budgets
    /// as queues empty.
    fn forced_dispatch(&mut self, now: TimeNs) -> Option<RequestId> {
        if let Some(q) = self.in_service_queue {
            self.expire_body(now, q);
        }

        let candidates: Vec<QueueId> = self.active_list.iter().copied().collect();
        for q in candidates {
            if let Some(rq) = self.queues[&q].next_rq {
                self.dispatch_insert(now, rq);
                let max_budget = self.max_budget();
                if let Some(queue) = self.queues.get_mut(&q) {
                    queue.max_budget = max_budget;
                }
                return Some(rq);
            }
        }
        None
    }

    // ---- expiration ----

    /// A queue is slow when it could not reach half the device rate over a
    /// meaningful interval; too-short intervals fall back to seekiness.
    fn is_slow(
        &self,
        now: TimeNs,
        q: QueueId,
        compensate: bool,
    ) -> (bool, u64) {
        let queue = &self.queues[&q];
        if !queue.sync {
            return (false, 0);
        }
        let mut slow = queue.seeky();

        let end = if compensate {
            self.last_idling_start
        } else {
            now
        };
        let delta_us = end.saturating_sub(self.last_budget_start) / 1_000;

        if delta_us < 1_000 {
            // Unrealistically short: charge at least one think-time (flash)
            // or one idle window (rotational).
            let delta_ms = if self.nonrot {
                MIN_TT_NS / NSEC_PER_MSEC
            } else {
                self.tunables.slice_idle / NSEC_PER_MSEC
            };
            return (slow, delta_ms);
        }

        if delta_us > 20_000 {
            // Only long intervals filter rate spikes reliably. The half-
            // budget bar also spares processes stuck in slow disk zones.
            slow = queue.entity.service < self.max_budget() / 2;
        }
        (slow, delta_us / 1_000)
    }

    /// Earliest instant a new batch may arrive at without pushing the
    /// queue's measured bandwidth above the soft real-time ceiling; filters
    /// greedy processes via the idling-window slack.
    fn softrt_next_start(&self, now: TimeNs, q: QueueId) -> TimeNs {
        let queue = &self.queues[&q];
        let bw_term = queue.last_idle_bklogged.saturating_add(
            queue.service_from_backlogged * NSEC_PER_SEC
                / self.tunables.wr_max_softrt_rate.max(1),
        );
        let filter_term = now + self.tunables.slice_idle + SOFT_RT_FILTER_SLACK;
        bw_term.max(filter_term)
    }

    /// Budget feedback at expiration (see the reason-specific rules).
    fn recalc_budget(&mut self, q: QueueId, reason: ExpirationReason) {
        let min_budget = self.min_budget();
        let dyn_max = self.rate.dyn_max_budget;
        let queue = &self.queues[&q];

        let mut budget = if queue.wr_coeff == 1 {
            queue.max_budget
        } else {
            // Raised queues run on a small constant budget: latency is the
            // goal, with just enough room to limit expirations.
            2 * min_budget
        };

        if queue.sync && queue.wr_coeff == 1 {
            match reason {
                ExpirationReason::TooIdle => {
                    if queue.dispatched > 0 {
                        // Completions still outstanding may be what the
                        // process is waiting on; treat like a timeout.
                        budget = (budget * 2).min(dyn_max);
                    } else if budget > 5 * min_budget {
                        // The batch fit in less than the budget: shrink it
                        // and bet the process behaves the same next time.
                        budget -= 4 * min_budget;
                    } else {
                        budget = min_budget;
                    }
                }
                ExpirationReason::BudgetTimeout => {
                    // Maybe not seeky after all (slow zones, ZBR): allow
                    // more room before the next timeout.
                    budget = (budget * 2).min(dyn_max);
                }
                ExpirationReason::BudgetExhausted => {
                    // Neither timeout nor idling hit: a well-behaved,
                    // short-thinktime process. Feed it.
                    budget = (budget * 4).min(dyn_max);
                }
                ExpirationReason::NoMoreRequests => {
                    // Keep the budget tight around the actual demand, or
                    // frequent reactivations with oversized budgets would
                    // misalign timestamps in this queue's favor.
                    budget = queue.entity.service.max(min_budget);
                }
                ExpirationReason::Preempted => return,
            }
        } else if !queue.sync {
            // Async queues always get the maximum: their dispatch rate is
            // already limited by the charge factor.
            budget = dyn_max;
        }

        self.queues.get_mut(&q).unwrap().max_budget = budget;

        if self.budgets_assigned >= STATS_MIN_BUDGETS && self.tunables.max_budget == 0 {
            let cap = self.rate.dyn_max_budget;
            let queue = self.queues.get_mut(&q).unwrap();
            queue.max_budget = queue.max_budget.min(cap);
        }

        // With backlog remaining the new budget applies immediately and
        // must cover the next request; the finish time is rebuilt from it
        // right after, in the expiration proper.
        if let Some(next_rq) = self.queues[&q].next_rq {
            let budget = self.queues[&q]
                .max_budget
                .max(self.serv_to_charge(next_rq, q));
            self.queues.get_mut(&q).unwrap().entity.budget = budget;
        }
    }

    /// Release the device: disarm the idling timer and drop the process
    /// hold. The per-node in-service marks stay put: the requeue and
    /// deactivation paths that follow read them to rebuild timestamps, and
    /// clear them level by level as they go.
    fn reset_in_service(&mut self) {
        let Some(q) = self.in_service_queue.take() else {
            return;
        };
        self.in_service_bic = None;
        self.queues.get_mut(&q).unwrap().wait_request = false;
        self.idle_timer = None;
    }

    /// The expiration proper: detach from the device and either requeue
    /// (backlog remains) or park the entity.
    fn expire_body(&mut self, now: TimeNs, q: QueueId) {
        debug_assert_eq!(self.in_service_queue, Some(q));
        self.reset_in_service();

        // Cooperators that drifted apart are split on the next allocation.
        if self.queues[&q].coop && self.queues[&q].seeky() {
            self.queues.get_mut(&q).unwrap().split_coop = true;
        }

        if self.queues[&q].sort_list.is_empty() {
            if self.queues[&q].dispatched == 0 {
                // Reuse budget_timeout as the went-quiet marker for the
                // weight-raising heuristics.
                self.queues.get_mut(&q).unwrap().budget_timeout = now;
            }
            self.del_busy(q, true);
        } else {
            self.activate_queue(q);
            self.pos_tree_add_move(q);
        }
    }

    /// Expire the in-service queue: charge it (time-scaled when slow),
    /// compute the soft-rt predictor, apply the budget feedback, and leave
    /// it ready for reactivation.
    fn expire(&mut self, now: TimeNs, q: QueueId, compensate: bool, reason: ExpirationReason) {
        debug_assert_eq!(self.in_service_queue, Some(q));

        let (slow, delta_ms) = self.is_slow(now, q, compensate);

        // Record real service before any time-charging inflates it: the
        // soft-rt bandwidth estimate needs the true number.
        {
            let service = self.queues[&q].entity.service;
            self.queues.get_mut(&q).unwrap().service_from_backlogged += service;
        }

        // Slow or timed-out queues are charged their slice duration rather
        // than their meager service: sector fairness would reward seeking.
        let charge_by_time = self.queues[&q].wr_coeff == 1
            && (slow
                || (reason == ExpirationReason::BudgetTimeout
                    && self.queues[&q].budget_left() >= self.queues[&q].entity.budget / 3));
        if charge_by_time {
            self.charge_time(q, delta_ms);
        }

        if reason == ExpirationReason::TooIdle
            && self.queues[&q].entity.service <= 2 * self.queues[&q].entity.budget / 10
        {
            self.queues.get_mut(&q).unwrap().io_bound = false;
        }

        if self.tunables.low_latency && self.queues[&q].wr_coeff == 1 {
            self.queues.get_mut(&q).unwrap().last_wr_start_finish = now;
        }

        if self.tunables.low_latency
            && self.tunables.wr_max_softrt_rate > 0
            && self.queues[&q].sort_list.is_empty()
        {
            // An emptied queue with nothing in flight has just ended an
            // isochronous batch: compute the soft-rt next-start now. With
            // requests still outstanding the pattern is not decided yet,
            // so park the predictor at infinity and let the last
            // completion redo it.
            if self.queues[&q].dispatched == 0 {
                let next_start = self.softrt_next_start(now, q);
                self.queues.get_mut(&q).unwrap().soft_rt_next_start = next_start;
            } else {
                let queue = self.queues.get_mut(&q).unwrap();
                queue.soft_rt_next_start = distant_future(now);
                queue.softrt_update = true;
            }
        }

        debug!(
            "expire queue {q:?}: {:?}, slow {slow}, service {}",
            reason, self.queues[&q].entity.service
        );

        self.recalc_budget(q, reason);
        self.expire_body(now, q);

        // A queue leaving with no backlog for a reason other than budget
        // consumption is waiting for its next request; if that arrives in
        // time, timestamps will be back-shifted to recover the idle hole.
        // The queue may already be gone if its last reference dropped with
        // the deactivation.
        if let Some(queue) = self.queues.get_mut(&q) {
            if !queue.busy
                && reason != ExpirationReason::BudgetTimeout
                && reason != ExpirationReason::BudgetExhausted
            {
                queue.non_blocking_wait_rq = true;
            }
        }
    }

    // ---- driver-side accounting and completion ----

    /// The driver took the request from the dispatch list.
    pub fn activate_request(&mut self, _rq: RequestId) {
        self.rq_in_driver += 1;
    }

    /// The driver handed the request back (requeue).
    pub fn deactivate_request(&mut self, _rq: RequestId) {
        debug_assert!(self.rq_in_driver > 0);
        self.rq_in_driver = self.rq_in_driver.saturating_sub(1);
    }

    fn update_hw_tag(&mut self) {
        self.max_rq_in_driver = self.max_rq_in_driver.max(self.rq_in_driver);
        if self.hw_tag_state == 1 {
            return;
        }
        // Only windows with enough outstanding work can reveal queueing.
        if self.rq_in_driver + self.queued < HW_QUEUE_THRESHOLD {
            return;
        }
        if self.hw_tag_samples < HW_QUEUE_SAMPLES {
            self.hw_tag_samples += 1;
            return;
        }
        self.hw_tag_state = (self.max_rq_in_driver > HW_QUEUE_THRESHOLD) as i8;
        self.max_rq_in_driver = 0;
        self.hw_tag_samples = 0;
    }

    /// A request completed in the device. Updates the estimators, computes
    /// the pending soft-rt predictor if this was the last completion of a
    /// batch, and decides whether to idle or expire the in-service queue.
    pub fn completed_request(&mut self, now: TimeNs, rq: RequestId) {
        let Some(req) = self.requests.get(&rq) else {
            warn!("completion for unknown request {rq:?}");
            return;
        };
        debug_assert!(req.dispatched, "completed request was never dispatched");
        let q = req.queue;
        let pid = req.pid;

        self.update_hw_tag();

        debug_assert!(self.rq_in_driver > 0);
        self.rq_in_driver = self.rq_in_driver.saturating_sub(1);
        {
            let queue = self.queues.get_mut(&q).unwrap();
            debug_assert!(queue.dispatched > 0);
            queue.dispatched -= 1;
        }

        if self.queues[&q].dispatched == 0 && !self.queues[&q].busy {
            // Quiet-time marker (see the budget_timeout overload) and the
            // end of this queue's contribution to the weight counters.
            self.queues.get_mut(&q).unwrap().budget_timeout = now;
            self.weights_tree_remove(EntityId::Queue(q));
        }

        if let Some(ctx) = self.ioctxs.get_mut(&pid) {
            ctx.ttime.last_end_request = now;
        }

        self.rate.on_completion(now);

        // The delayed isochrony check: the queue expired with requests in
        // flight, and this was the last of them.
        if self.queues[&q].softrt_update
            && self.queues[&q].dispatched == 0
            && self.queues[&q].sort_list.is_empty()
        {
            let next_start = self.softrt_next_start(now, q);
            self.queues.get_mut(&q).unwrap().soft_rt_next_start = next_start;
        }

        if self.in_service_queue == Some(q) {
            if self.queues[&q].dispatched == 0 && self.must_idle(q) {
                self.arm_slice_timer(now);
            } else if self.may_expire_for_budget_timeout(now, q) {
                self.expire(now, q, false, ExpirationReason::BudgetTimeout);
            } else if self.queues[&q].sort_list.is_empty()
                && (self.queues[&q].dispatched == 0 || !self.may_idle(q))
            {
                self.expire(now, q, false, ExpirationReason::NoMoreRequests);
            }
        }

        self.release_request(rq);
    }

    /// Release a request that will never be dispatched (or just completed).
    pub fn put_request(&mut self, rq: RequestId) {
        let Some(req) = self.requests.get(&rq) else {
            return;
        };
        if !req.dispatched {
            self.remove_request(rq);
        }
        self.release_request(rq);
    }

    fn release_request(&mut self, rq: RequestId) {
        let Some(req) = self.requests.remove(&rq) else {
            return;
        };
        let queue = self.queues.get_mut(&req.queue).unwrap();
        debug_assert!(queue.allocated[req.sync as usize] > 0);
        queue.allocated[req.sync as usize] -= 1;
        self.put_queue(req.queue);
    }

    /// The io-context exit hook: the process is gone; its queues lose their
    /// process references and any pending merges are unwound.
    pub fn exit_process(&mut self, now: TimeNs, pid: Pid) {
        let Some(ctx) = self.ioctxs.remove(&pid) else {
            return;
        };
        if self.in_service_bic == Some(pid) {
            self.in_service_bic = None;
        }
        if let Some(aq) = ctx.async_queue {
            self.exit_queue(now, aq);
        }
        if let Some(sq) = ctx.sync_queue {
            self.exit_queue(now, sq);
        }
        self.process_groups.remove(&pid);
    }

    // ---- introspection ----

    pub fn busy_queues(&self) -> u32 {
        self.busy_queues
    }

    pub fn wr_busy_queues(&self) -> u32 {
        self.wr_busy_queues
    }

    pub fn rq_in_driver(&self) -> u32 {
        self.rq_in_driver
    }

    pub fn nr_queued(&self) -> u32 {
        self.queued
    }

    /// Estimated peak rate, sectors/usec left-shifted by the rate shift.
    pub fn peak_rate(&self) -> u64 {
        self.rate.peak_rate
    }

    pub fn device_speed(&self) -> DeviceSpeed {
        self.rate.device_speed
    }

    pub fn sync_queue(&self, pid: Pid) -> Option<QueueId> {
        self.ioctxs.get(&pid).and_then(|ctx| ctx.sync_queue)
    }

    pub fn async_queue(&self, pid: Pid) -> Option<QueueId> {
        self.ioctxs.get(&pid).and_then(|ctx| ctx.async_queue)
    }

    pub fn queue_stats(&self, q: QueueId) -> Option<QueueStats> {
        let queue = self.queues.get(&q)?;
        Some(QueueStats {
            pid: queue.pid,
            busy: queue.busy,
            sync: queue.sync,
            wr_coeff: queue.wr_coeff,
            wr_cur_max_time: queue.wr_cur_max_time,
            in_large_burst: queue.in_large_burst,
            in_burst_list: queue.in_burst_list,
            coop: queue.coop,
            split_coop: queue.split_coop,
            io_bound: queue.io_bound,
            idle_window: queue.idle_window,
            seeky: queue.seeky(),
            dispatched: queue.dispatched,
            queued: queue.queued[0] + queue.queued[1],
            weight: queue.entity.weight,
            orig_weight: queue.entity.orig_weight,
            budget: queue.entity.budget,
            service: queue.entity.service,
        })
    }

    /// Assert the cross-cutting consistency properties. Called by tests
    /// after scheduler events; cheap enough to sprinkle liberally.
    pub fn check_invariants(&self) {
        let mut busy = 0u32;
        let mut wr_busy = 0u32;
        let mut service_sum = 0u64;
        let mut budget_sum = 0u64;
        for queue in self.queues.values() {
            if queue.busy {
                busy += 1;
                if queue.wr_coeff > 1 {
                    wr_busy += 1;
                }
                service_sum += queue.entity.service;
                budget_sum += queue.entity.budget;
            }
        }
        assert_eq!(busy, self.busy_queues, "busy_queues counter drifted");
        assert_eq!(
            wr_busy, self.wr_busy_queues,
            "wr_busy_queues does not match raised busy queues"
        );
        assert!(
            service_sum <= budget_sum,
            "aggregate service {service_sum} exceeds aggregate budget {budget_sum}"
        );

        for &q in &self.burst_list {
            assert_eq!(
                Some(self.queues[&q].entity.parent),
                self.burst_parent,
                "burst list entry under a different parent"
            );
        }

        for group in self.groups.values() {
            for tree in &group.sched.trees {
                for (&(finish, start, _), &e) in tree.active_entries() {
                    let ent = self.entity(e);
                    // Group entities mirror their next child's budget
                    // without re-deriving finish times, so only leaves are
                    // held to the exact relation.
                    if matches!(e, EntityId::Queue(_)) {
                        assert_eq!(
                            finish,
                            start + crate::wf2q::vt_delta(ent.budget, ent.weight as u64),
                            "active entity finish time inconsistent with budget/weight"
                        );
                    }
                    if let Some(counted) = ent.weight_counter {
                        assert_eq!(
                            counted, ent.weight,
                            "weight counter slot does not match entity weight"
                        );
                    }
                }
            }
        }

        // Drained means both driver and queue counters at zero together.
        if self.requests.is_empty() {
            assert_eq!(self.queued, 0);
        }
    }
}
